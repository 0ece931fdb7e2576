use bytes::BytesMut;

use crate::Poolable;

/// A reusable byte buffer. Capacity is kept (not shrunk) across releases so
/// that steady-state traffic doesn't keep re-allocating; only the written
/// length is reset.
#[derive(Default)]
pub struct ByteBuffer {
    inner: BytesMut,
}

impl ByteBuffer {
    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.inner
    }

    pub fn as_ref(&self) -> &BytesMut {
        &self.inner
    }
}

impl Poolable for ByteBuffer {
    fn reset(&mut self) {
        self.inner.clear();
    }
}
