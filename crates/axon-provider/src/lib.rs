//! The provider adapter seam (spec §4.2) and key selection (spec §4.3):
//! translating between the canonical request/response shape the router and
//! worker pool speak and whatever dialect a given vendor's API actually
//! uses, plus choosing which credential serves a given provider+model pair.

pub mod adapter;
pub mod adapters;
pub mod envelope;
pub mod key_selector;

pub use adapter::{AdapterError, CapabilitySet, ModelDescriptor, ProviderAdapter};
pub use envelope::{
    CanonicalPayload, CanonicalResponse, ChatMessage, FallbackTarget, RequestEnvelope,
    RequestKind, RequestOverrides, ResponseEnvelope, Role, StreamChunk, ToolCall, ToolDefinition,
    Usage,
};
pub use key_selector::{KeyRecord, KeySelector, SelectError, UnavailableReason};
