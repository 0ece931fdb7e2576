//! Scoped acquisition of reusable channels, envelopes, and buffers (spec
//! §4.1). No object pooled here crosses a request boundary: whoever
//! acquires it is responsible for releasing it before the terminal envelope
//! reaches the transport.

mod buffer;
mod pool;
mod reply_channel;

pub use buffer::ByteBuffer;
pub use pool::{Pool, Poolable};
pub use reply_channel::ReplyChannel;
