use bytes::Bytes;
use std::fmt;

/// A binary payload whose ownership moves across the transfer boundary.
///
/// The buffer is deliberately not `Clone`: handing it to a recipient moves it,
/// and the consuming accessors take `self`, so a sender cannot read a buffer
/// after giving it away.
pub struct TransferBuffer {
    bytes: Bytes,
}

impl TransferBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(data),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        Vec::from(self.bytes)
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Bytes> for TransferBuffer {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_moves_without_copy() {
        let data = vec![1u8, 2, 3, 4];
        let ptr = data.as_ptr();

        let buffer = TransferBuffer::new(data);
        assert_eq!(buffer.len(), 4);

        let bytes = buffer.into_bytes();
        assert_eq!(bytes.as_ptr(), ptr);
        assert_eq!(&bytes[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_debug_hides_payload() {
        let buffer = TransferBuffer::from(vec![0u8; 16]);
        assert_eq!(format!("{:?}", buffer), "TransferBuffer { len: 16 }");
    }
}
