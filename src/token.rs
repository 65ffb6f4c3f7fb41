/// Token identifier - matches the C type from llama.cpp
pub type TokenId = i32;

/// Reassembles UTF-8 text from token pieces
///
/// A single character may be split across several tokens. Bytes are held back
/// until they form complete characters; a sequence that can never become valid
/// is released lossily so the buffer cannot stall.
#[derive(Debug, Default)]
pub struct PieceBuffer {
    pending: Vec<u8>,
}

impl PieceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a piece and take every complete character buffered so far
    pub fn push(&mut self, piece: &[u8]) -> String {
        self.pending.extend_from_slice(piece);

        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                // incomplete tail, keep it for the next piece
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    /// Whether bytes are waiting for the rest of a character
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut buffer = PieceBuffer::new();
        assert_eq!(buffer.push(b"He"), "He");
        assert_eq!(buffer.push(b"llo"), "llo");
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_split_multibyte_character() {
        // "é" is 0xC3 0xA9, "猫" is 0xE7 0x8C 0xAB
        let mut buffer = PieceBuffer::new();
        assert_eq!(buffer.push(&[b'a', 0xC3]), "a");
        assert!(buffer.has_pending());
        assert_eq!(buffer.push(&[0xA9]), "é");

        assert_eq!(buffer.push(&[0xE7]), "");
        assert_eq!(buffer.push(&[0x8C]), "");
        assert_eq!(buffer.push(&[0xAB, b'!']), "猫!");
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_invalid_sequence_does_not_stall() {
        let mut buffer = PieceBuffer::new();
        let text = buffer.push(&[0xFF, b'x']);
        assert!(text.ends_with('x'));
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_clear_drops_pending_bytes() {
        let mut buffer = PieceBuffer::new();
        buffer.push(&[0xE7, 0x8C]);
        buffer.clear();
        assert_eq!(buffer.push(b"ok"), "ok");
    }
}
