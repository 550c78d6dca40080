//! Receive format compiler
//!
//! Compiles a format specification such as `"2u32x 1f64 8char"` into a
//! [`FormatProgram`]: an ordered list of fixed-width fields describing one
//! received record.
//!
//! # Grammar
//!
//! Each whitespace-separated word is either
//!
//! ```text
//! <count?><radix?><type>     type  = i8|i16|i32|i64|i128|i256|u8|...|u256|f32|f64
//! <count?><type><radix>      radix = x (hex) | b (binary), decimal when omitted
//! <count?>ch | <count?>char
//! ```
//!
//! `count` defaults to 1 and `0`/`1` both mean a single element. Tags are
//! case-insensitive. An empty or whitespace-only spec, or the sentinel `str`,
//! selects raw-text mode.

use std::fmt;

use thiserror::Error;

/// Sentinel spec that selects raw-text mode
pub const RAW_TEXT_SENTINEL: &str = "str";

/// Largest record a program may describe, in bytes
pub const MAX_RECORD_WIDTH: usize = 64 * 1024;

/// Element types a field can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericType {
    U8,
    U16,
    U32,
    U64,
    U128,
    U256,
    I8,
    I16,
    I32,
    I64,
    I128,
    I256,
    F32,
    F64,
    Char,
}

/// Numeric types selectable by tag, in tag-lookup order
const NUMERIC_TYPES: [NumericType; 14] = [
    NumericType::U8,
    NumericType::U16,
    NumericType::U32,
    NumericType::U64,
    NumericType::U128,
    NumericType::U256,
    NumericType::I8,
    NumericType::I16,
    NumericType::I32,
    NumericType::I64,
    NumericType::I128,
    NumericType::I256,
    NumericType::F32,
    NumericType::F64,
];

impl NumericType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            NumericType::U8 | NumericType::I8 | NumericType::Char => 1,
            NumericType::U16 | NumericType::I16 => 2,
            NumericType::U32 | NumericType::I32 | NumericType::F32 => 4,
            NumericType::U64 | NumericType::I64 | NumericType::F64 => 8,
            NumericType::U128 | NumericType::I128 => 16,
            NumericType::U256 | NumericType::I256 => 32,
        }
    }

    /// Tag as written in a format spec
    pub fn tag(self) -> &'static str {
        match self {
            NumericType::U8 => "u8",
            NumericType::U16 => "u16",
            NumericType::U32 => "u32",
            NumericType::U64 => "u64",
            NumericType::U128 => "u128",
            NumericType::U256 => "u256",
            NumericType::I8 => "i8",
            NumericType::I16 => "i16",
            NumericType::I32 => "i32",
            NumericType::I64 => "i64",
            NumericType::I128 => "i128",
            NumericType::I256 => "i256",
            NumericType::F32 => "f32",
            NumericType::F64 => "f64",
            NumericType::Char => "char",
        }
    }

    /// Look up a numeric tag. `char` is not numeric and never matches here.
    fn from_tag(tag: &str) -> Option<Self> {
        NUMERIC_TYPES.iter().copied().find(|ty| ty.tag() == tag)
    }

    /// Integers wider than 64 bits
    pub fn is_wide(self) -> bool {
        self.size() > 8
    }
}

/// How a decoded field is rendered as text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayRadix {
    Decimal,
    Hex,
    Binary,
    Character,
}

/// One compiled field of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub repeat_count: usize,
    pub radix: DisplayRadix,
    pub ty: NumericType,
    pub byte_width: usize,
}

impl FieldDescriptor {
    fn new(repeat_count: usize, radix: DisplayRadix, ty: NumericType) -> Self {
        Self {
            repeat_count,
            radix,
            ty,
            byte_width: repeat_count * ty.size(),
        }
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let radix = match self.radix {
            DisplayRadix::Hex => "x",
            DisplayRadix::Binary => "b",
            DisplayRadix::Decimal | DisplayRadix::Character => "",
        };
        write!(f, "{}{}{}", self.repeat_count, radix, self.ty.tag())
    }
}

/// A compiled receive format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProgram {
    fields: Vec<FieldDescriptor>,
    record_width: usize,
    is_raw_text: bool,
}

impl FormatProgram {
    /// Program that decodes whatever arrives as ASCII text
    pub fn raw_text() -> Self {
        Self {
            fields: Vec::new(),
            record_width: 0,
            is_raw_text: true,
        }
    }

    fn from_fields(fields: Vec<FieldDescriptor>) -> Self {
        let record_width = fields.iter().map(|f| f.byte_width).sum();
        Self {
            fields,
            record_width,
            is_raw_text: false,
        }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Bytes per record, 0 in raw-text mode
    pub fn record_width(&self) -> usize {
        self.record_width
    }

    pub fn is_raw_text(&self) -> bool {
        self.is_raw_text
    }
}

impl Default for FormatProgram {
    fn default() -> Self {
        Self::raw_text()
    }
}

impl fmt::Display for FormatProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_raw_text {
            return f.write_str(RAW_TEXT_SENTINEL);
        }
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

/// Recoverable problems found while compiling a format
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatWarning {
    #[error("format word \"{0}\" is not recognized")]
    UnknownWord(String),

    #[error("format word \"{0}\": decimal view of {1} is not supported")]
    UnsupportedDecimal(String, &'static str),

    #[error("format \"{0}\" has no valid fields, using raw text")]
    NoFields(String),

    #[error("format word \"{0}\" makes the record longer than {1} bytes")]
    TooWide(String, usize),
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub program: FormatProgram,
    pub warnings: Vec<FormatWarning>,
}

fn is_raw_text_spec(spec: &str) -> bool {
    let trimmed = spec.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(RAW_TEXT_SENTINEL)
}

fn parse_count(digits: &str) -> Option<usize> {
    match digits {
        "" | "0" | "1" => Some(1),
        _ => digits.parse::<usize>().ok().map(|n| n.max(1)),
    }
}

/// Count that still fits a record once multiplied by the element size
fn bounded_count(digits: &str, element_size: usize) -> Option<usize> {
    parse_count(digits).filter(|&n| n <= MAX_RECORD_WIDTH / element_size)
}

/// Parse one format word
fn parse_word(word: &str) -> Result<FieldDescriptor, FormatWarning> {
    let unknown = || FormatWarning::UnknownWord(word.to_string());
    let too_wide = || FormatWarning::TooWide(word.to_string(), MAX_RECORD_WIDTH);
    let lower = word.to_ascii_lowercase();

    let count_len = lower.chars().take_while(|c| c.is_ascii_digit()).count();
    let (count_str, rest) = lower.split_at(count_len);

    if rest == "ch" || rest == "char" {
        let count = bounded_count(count_str, NumericType::Char.size()).ok_or_else(too_wide)?;
        return Ok(FieldDescriptor::new(count, DisplayRadix::Character, NumericType::Char));
    }

    // Radix may lead (`xu32`) or trail (`u32x`) the type tag
    let (radix, tag) = if let Some(tag) = rest.strip_prefix('x') {
        (DisplayRadix::Hex, tag)
    } else if let Some(tag) = rest.strip_prefix('b') {
        (DisplayRadix::Binary, tag)
    } else if let Some(tag) = rest.strip_suffix('x') {
        (DisplayRadix::Hex, tag)
    } else if let Some(tag) = rest.strip_suffix('b') {
        (DisplayRadix::Binary, tag)
    } else {
        (DisplayRadix::Decimal, rest)
    };

    let ty = NumericType::from_tag(tag).ok_or_else(unknown)?;
    if radix == DisplayRadix::Decimal && ty.is_wide() {
        return Err(FormatWarning::UnsupportedDecimal(word.to_string(), ty.tag()));
    }

    let count = bounded_count(count_str, ty.size()).ok_or_else(too_wide)?;
    Ok(FieldDescriptor::new(count, radix, ty))
}

/// Parse every word, rejecting any that would push the record past
/// [`MAX_RECORD_WIDTH`]
fn parse_words(spec: &str) -> Vec<Result<FieldDescriptor, FormatWarning>> {
    let mut total = 0usize;
    spec.split_whitespace()
        .map(|word| {
            let field = parse_word(word)?;
            match total.checked_add(field.byte_width) {
                Some(width) if width <= MAX_RECORD_WIDTH => {
                    total = width;
                    Ok(field)
                }
                _ => Err(FormatWarning::TooWide(word.to_string(), MAX_RECORD_WIDTH)),
            }
        })
        .collect()
}

/// Compile a format specification
///
/// Bad words are skipped and reported. The result is deterministic: the same
/// spec always yields an equal program.
pub fn compile(spec: &str) -> Compiled {
    if is_raw_text_spec(spec) {
        return Compiled {
            program: FormatProgram::raw_text(),
            warnings: Vec::new(),
        };
    }

    let mut fields = Vec::new();
    let mut warnings = Vec::new();
    for parsed in parse_words(spec) {
        match parsed {
            Ok(field) => fields.push(field),
            Err(warning) => warnings.push(warning),
        }
    }

    if fields.is_empty() {
        warnings.push(FormatWarning::NoFields(spec.trim().to_string()));
        return Compiled {
            program: FormatProgram::raw_text(),
            warnings,
        };
    }

    Compiled {
        program: FormatProgram::from_fields(fields),
        warnings,
    }
}

/// Flag each word of a spec: `true` marks a word that would be rejected
///
/// Raw-text specs have no words to flag.
pub fn validate(spec: &str) -> Vec<bool> {
    if is_raw_text_spec(spec) {
        return Vec::new();
    }
    parse_words(spec).iter().map(Result::is_err).collect()
}

/// Underline the bad words of a spec with `~`, `None` when the spec is valid
///
/// The marker line lines up with the words when printed under
/// `spec.split_whitespace().collect::<Vec<_>>().join(" ")`.
pub fn error_markers(spec: &str) -> Option<String> {
    let flags = validate(spec);
    if !flags.contains(&true) {
        return None;
    }
    let marks: Vec<String> = spec
        .split_whitespace()
        .zip(flags)
        .map(|(word, bad)| {
            let c = if bad { "~" } else { " " };
            c.repeat(word.len())
        })
        .collect();
    Some(format!("{} Wrong format", marks.join(" ")))
}
