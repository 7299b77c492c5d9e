//! Byte buffers that move across the worker boundary.

use bytes::Bytes;

/// A byte buffer handed to (or returned from) the worker by move.
///
/// Deliberately not `Clone`: once a `TransferBuffer` is passed to a bridge
/// call the sender no longer has it, so reading it after transfer does not
/// compile. Backed by [`Bytes`], so buffers received from the network (axum,
/// reqwest) enter the worker without being copied.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TransferBuffer(Bytes);

impl TransferBuffer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Copies only if the underlying storage is shared or was not a `Vec`.
    pub fn into_vec(self) -> Vec<u8> {
        Vec::from(self.0)
    }

    /// Convert into a shareable [`Bytes`] without copying.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for TransferBuffer {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<TransferBuffer> for Vec<u8> {
    fn from(buffer: TransferBuffer) -> Self {
        buffer.into_vec()
    }
}

impl From<TransferBuffer> for Bytes {
    fn from(buffer: TransferBuffer) -> Self {
        buffer.into_bytes()
    }
}

impl AsRef<[u8]> for TransferBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
