//! Receive decoding
//!
//! Renders one received record as text according to the current
//! [`FormatProgram`]. Decimal columns are padded to the widest value of their
//! type so consecutive records line up.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use super::format::{DisplayRadix, FieldDescriptor, FormatProgram, NumericType};

/// Record separator appended after each structured record
const RECORD_SEPARATOR: &str = "\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record needs {expected} bytes, got {actual}")]
    RecordWidth { expected: usize, actual: usize },

    #[error("{radix:?} view of {ty:?} is not supported")]
    Unsupported { radix: DisplayRadix, ty: NumericType },
}

/// Renders one element of a field
type Render = fn(&[u8]) -> String;

macro_rules! decimal_renderer {
    ($name:ident, $t:ty, $width:expr) => {
        fn $name(bytes: &[u8]) -> String {
            let mut raw = [0u8; std::mem::size_of::<$t>()];
            raw.copy_from_slice(bytes);
            format!("{:>width$}", <$t>::from_le_bytes(raw), width = $width)
        }
    };
}

decimal_renderer!(render_u8, u8, 3);
decimal_renderer!(render_u16, u16, 5);
decimal_renderer!(render_u32, u32, 10);
decimal_renderer!(render_u64, u64, 20);
decimal_renderer!(render_i8, i8, 4);
decimal_renderer!(render_i16, i16, 6);
decimal_renderer!(render_i32, i32, 11);
decimal_renderer!(render_i64, i64, 20);
decimal_renderer!(render_f32, f32, 0);
decimal_renderer!(render_f64, f64, 0);

/// Decimal renderers by element type. Types missing here have no decimal view.
const DECIMAL_RENDERERS: [(NumericType, Render); 10] = [
    (NumericType::U8, render_u8),
    (NumericType::U16, render_u16),
    (NumericType::U32, render_u32),
    (NumericType::U64, render_u64),
    (NumericType::I8, render_i8),
    (NumericType::I16, render_i16),
    (NumericType::I32, render_i32),
    (NumericType::I64, render_i64),
    (NumericType::F32, render_f32),
    (NumericType::F64, render_f64),
];

/// Little-endian value of an element up to 8 bytes wide
fn le_value(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn render_hex(bytes: &[u8]) -> String {
    format!("0x{:0width$X}", le_value(bytes), width = bytes.len() * 2)
}

fn render_binary(bytes: &[u8]) -> String {
    format!("0b{:0width$b}", le_value(bytes), width = bytes.len() * 8)
}

/// Integers wider than 64 bits are shown as an opaque block in received order
fn render_hex_block(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!("0x{}", digits)
}

fn render_binary_block(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
    format!("0b{}", digits)
}

/// Pick the element renderer for a field
fn renderer(radix: DisplayRadix, ty: NumericType) -> Option<Render> {
    match radix {
        DisplayRadix::Hex if ty.is_wide() => Some(render_hex_block),
        DisplayRadix::Hex => Some(render_hex),
        DisplayRadix::Binary if ty.is_wide() => Some(render_binary_block),
        DisplayRadix::Binary => Some(render_binary),
        DisplayRadix::Decimal => DECIMAL_RENDERERS
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|&(_, render)| render),
        DisplayRadix::Character => None,
    }
}

/// Bytes as 7-bit ASCII, `?` for anything above 0x7F
pub fn ascii_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

fn render_field(field: &FieldDescriptor, bytes: &[u8]) -> Result<String, DecodeError> {
    if field.radix == DisplayRadix::Character {
        return Ok(ascii_text(bytes));
    }

    let render = renderer(field.radix, field.ty).ok_or(DecodeError::Unsupported {
        radix: field.radix,
        ty: field.ty,
    })?;

    let words: Vec<String> = bytes.chunks_exact(field.ty.size()).map(render).collect();
    Ok(words.join(" "))
}

/// Decode one record against a specific program
pub fn decode_with(program: &FormatProgram, bytes: &[u8]) -> Result<String, DecodeError> {
    if program.is_raw_text() {
        return Ok(ascii_text(bytes));
    }

    if bytes.len() != program.record_width() {
        return Err(DecodeError::RecordWidth {
            expected: program.record_width(),
            actual: bytes.len(),
        });
    }

    let mut words = Vec::with_capacity(program.fields().len());
    let mut offset = 0;
    for field in program.fields() {
        let slice = &bytes[offset..offset + field.byte_width];
        words.push(render_field(field, slice)?);
        offset += field.byte_width;
    }

    let mut text = words.join(" ");
    text.push_str(RECORD_SEPARATOR);
    Ok(text)
}

/// Decoder holding the current receive program
///
/// The program is replaced as a whole; a decode always runs against the
/// program that was current when it started.
pub struct ReceiveDecoder {
    program: RwLock<Arc<FormatProgram>>,
}

impl Default for ReceiveDecoder {
    fn default() -> Self {
        Self::new(FormatProgram::raw_text())
    }
}

impl ReceiveDecoder {
    pub fn new(program: FormatProgram) -> Self {
        Self {
            program: RwLock::new(Arc::new(program)),
        }
    }

    /// Snapshot of the current program
    pub fn program(&self) -> Arc<FormatProgram> {
        match self.program.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new program
    pub fn set_program(&self, program: FormatProgram) {
        let program = Arc::new(program);
        match self.program.write() {
            Ok(mut guard) => *guard = program,
            Err(poisoned) => *poisoned.into_inner() = program,
        }
    }

    /// Bytes per record, 0 when any amount can be decoded
    pub fn required_width(&self) -> usize {
        self.program().record_width()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        decode_with(&self.program(), bytes)
    }
}
