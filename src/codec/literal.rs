//! Numeric literal encoding
//!
//! Turns mixed-radix tokens such as `0x48`, `12b101`, `4x0F` or `255` into
//! bit strings and packs a sequence of them into bytes.
//!
//! Token shape: `<count><marker><digits>` where `count` is 0-3 decimal digits
//! giving the exact number of bits the token occupies (0 = round up to whole
//! bytes) and `marker` is `x` (hex), `b` (binary) or `d` (decimal). A token made
//! only of digits is a decimal value with count 0.

use std::fmt;

use thiserror::Error;

/// Maximum number of digits in the bit-count prefix
const MAX_COUNT_DIGITS: usize = 3;

/// Recoverable problems found while encoding literals
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiteralWarning {
    #[error("word \"{0}\" has unknown format")]
    UnknownFormat(String),

    #[error("word \"{0}\" has no digits")]
    EmptyLiteral(String),

    #[error("unsigned number \"{0}\" is too large")]
    DecimalOverflow(String),

    #[error("added {0} zeros")]
    Padded(usize),
}

/// Radix marker of a literal token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Radix {
    Hex,
    Binary,
    Decimal,
}

impl Radix {
    fn from_marker(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Radix::Hex),
            'b' => Some(Radix::Binary),
            'd' => Some(Radix::Decimal),
            _ => None,
        }
    }

    fn accepts(self, c: char) -> bool {
        match self {
            Radix::Hex => c.is_ascii_hexdigit(),
            Radix::Binary => c == '0' || c == '1',
            Radix::Decimal => c.is_ascii_digit(),
        }
    }
}

/// An ordered sequence of bits, most significant first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitString {
    bits: Vec<bool>,
}

impl BitString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Prepend `count` zero bits
    pub fn pad_left(&mut self, count: usize) {
        self.bits.splice(0..0, std::iter::repeat(false).take(count));
    }

    /// Drop the `count` most significant bits
    pub fn truncate_left(&mut self, count: usize) {
        let count = count.min(self.bits.len());
        self.bits.drain(..count);
    }

    /// Number of zeros needed to reach the next multiple of 8
    pub fn padding_to_byte(&self) -> usize {
        (8 - self.bits.len() % 8) % 8
    }

    pub fn append(&mut self, other: &BitString) {
        self.bits.extend_from_slice(&other.bits);
    }

    /// Pack into bytes. The length must already be a multiple of 8.
    fn to_bytes(&self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| chunk.iter().fold(0u8, |acc, &bit| (acc << 1) | bit as u8))
            .collect()
    }

    fn push_nibble(&mut self, nibble: u8) {
        for shift in (0..4).rev() {
            self.bits.push((nibble >> shift) & 1 == 1);
        }
    }

    fn from_u32(value: u32) -> Self {
        // Minimal representation, "0" for zero
        let width = (32 - value.leading_zeros()).max(1);
        Self {
            bits: (0..width).rev().map(|i| (value >> i) & 1 == 1).collect(),
        }
    }
}

impl fmt::Display for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.bits {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Hex digit to nibble
const HEX_NIBBLES: [(char, u8); 16] = [
    ('0', 0x0), ('1', 0x1), ('2', 0x2), ('3', 0x3),
    ('4', 0x4), ('5', 0x5), ('6', 0x6), ('7', 0x7),
    ('8', 0x8), ('9', 0x9), ('A', 0xA), ('B', 0xB),
    ('C', 0xC), ('D', 0xD), ('E', 0xE), ('F', 0xF),
];

fn hex_nibble(c: char) -> Option<u8> {
    let upper = c.to_ascii_uppercase();
    HEX_NIBBLES
        .iter()
        .find(|(digit, _)| *digit == upper)
        .map(|&(_, nibble)| nibble)
}

/// Split a token into (bit count, radix, digits)
fn split_token(token: &str) -> Option<(usize, Radix, &str)> {
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        return Some((0, Radix::Decimal, token));
    }

    let count_len = token.chars().take_while(|c| c.is_ascii_digit()).count();
    if count_len > MAX_COUNT_DIGITS {
        return None;
    }

    let (count_str, rest) = token.split_at(count_len);
    let mut chars = rest.chars();
    let radix = chars.next().and_then(Radix::from_marker)?;
    let digits = chars.as_str();
    if !digits.chars().all(|c| radix.accepts(c)) {
        return None;
    }

    let count = if count_str.is_empty() {
        0
    } else {
        count_str.parse().ok()?
    };
    Some((count, radix, digits))
}

/// Encode a single token into its bit string
pub fn encode_token(token: &str) -> Result<BitString, LiteralWarning> {
    let (count, radix, digits) =
        split_token(token).ok_or_else(|| LiteralWarning::UnknownFormat(token.to_string()))?;

    if digits.is_empty() {
        return Err(LiteralWarning::EmptyLiteral(token.to_string()));
    }

    let mut bits = match radix {
        Radix::Hex => {
            let mut bits = BitString::new();
            for c in digits.chars() {
                // split_token only lets hex digits through
                if let Some(nibble) = hex_nibble(c) {
                    bits.push_nibble(nibble);
                }
            }
            bits
        }
        Radix::Binary => BitString {
            bits: digits.chars().map(|c| c == '1').collect(),
        },
        Radix::Decimal => {
            let value: u32 = digits
                .parse()
                .map_err(|_| LiteralWarning::DecimalOverflow(digits.to_string()))?;
            BitString::from_u32(value)
        }
    };

    if count == 0 {
        bits.pad_left(bits.padding_to_byte());
    } else if count > bits.len() {
        bits.pad_left(count - bits.len());
    } else {
        bits.truncate_left(bits.len() - count);
    }

    Ok(bits)
}

/// Result of encoding a token sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub warnings: Vec<LiteralWarning>,
}

/// Encode whitespace-separated tokens and pack them into bytes
///
/// Rejected tokens are skipped and reported; they never abort the whole
/// message. If the concatenated bits are not byte aligned, zeros are added on
/// the left and a [`LiteralWarning::Padded`] is reported.
pub fn encode_tokens<'a, I>(tokens: I) -> Encoded
where
    I: IntoIterator<Item = &'a str>,
{
    let mut combined = BitString::new();
    let mut warnings = Vec::new();

    for token in tokens {
        match encode_token(token) {
            Ok(bits) => combined.append(&bits),
            Err(warning) => {
                tracing::debug!("Skipping literal {:?}: {}", token, warning);
                warnings.push(warning);
            }
        }
    }

    let padding = combined.padding_to_byte();
    if padding != 0 {
        combined.pad_left(padding);
        warnings.push(LiteralWarning::Padded(padding));
    }

    Encoded {
        bytes: combined.to_bytes(),
        warnings,
    }
}
