//! Outbound message encoding
//!
//! A typed line is either structured numeric input (`0x48 0x65 8b1010`) or
//! free text. The choice is made per message from its leading characters, so
//! both styles work at the same prompt without a mode switch.

use super::literal::{self, Encoded};

/// Grouping characters users may put inside numbers (`0x12_34`, `0b1010-1010`)
const GROUPING_CHARS: [char; 2] = ['_', '-'];

/// Maximum digits in the bit-count prefix that selects structured mode
const MAX_PREFIX_DIGITS: usize = 3;

/// Transmit encoder
pub struct TransmitEncoder;

impl TransmitEncoder {
    /// Encode a message into the bytes to put on the wire
    ///
    /// Grouping characters are only stripped for the structured check and
    /// numeric encoding; plain text goes out exactly as typed.
    ///
    /// An empty `bytes` result means nothing could be encoded and must be
    /// reported as a send failure by the caller.
    pub fn encode(message: &str) -> Encoded {
        let stripped: String = message.chars().filter(|c| !GROUPING_CHARS.contains(c)).collect();

        if Self::is_structured(&stripped) {
            literal::encode_tokens(stripped.split_whitespace())
        } else {
            Encoded {
                bytes: ascii_bytes(message),
                warnings: Vec::new(),
            }
        }
    }

    /// Check whether a message starts with `<1-3 digits><x|b|d>`
    pub fn is_structured(message: &str) -> bool {
        let digits = message.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || digits > MAX_PREFIX_DIGITS {
            return false;
        }
        matches!(
            message[digits..].chars().next().map(|c| c.to_ascii_lowercase()),
            Some('x' | 'b' | 'd')
        )
    }
}

/// ASCII bytes of a string, `?` for anything outside 7-bit ASCII
fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}
