//! Byte-level tokenizer.

use ctxkeeper_core::{BackendError, Token, Tokenizer};

/// End-of-sequence token id, one past the byte range.
pub const END_OF_SEQUENCE: Token = 256;

/// Vocabulary size: every byte plus end-of-sequence.
pub const VOCAB_SIZE: usize = 257;

/// Maps each UTF-8 byte of the input to its own token.
///
/// Multi-byte characters therefore span several tokens, which makes this a
/// convenient driver for the streaming decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, BackendError> {
        Ok(text.bytes().map(Token::from).collect())
    }

    fn token_to_piece(&self, token: Token) -> Vec<u8> {
        match u8::try_from(token) {
            Ok(byte) => vec![byte],
            Err(_) => Vec::new(),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == END_OF_SEQUENCE
    }

    fn end_of_generation_token(&self) -> Token {
        END_OF_SEQUENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_bytes() {
        let tokens = ByteTokenizer.tokenize("hé").unwrap();
        assert_eq!(tokens, vec![0x68, 0xC3, 0xA9]);
    }

    #[test]
    fn test_pieces() {
        assert_eq!(ByteTokenizer.token_to_piece(0x41), b"A");
        assert!(ByteTokenizer.token_to_piece(END_OF_SEQUENCE).is_empty());
        assert!(ByteTokenizer.token_to_piece(-3).is_empty());
        assert!(ByteTokenizer.is_end_of_generation(END_OF_SEQUENCE));
    }
}
