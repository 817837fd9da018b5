//! Machine words and the type tags that interpret them.
//!
//! A word is a fixed-width signed integer; the width is a compile-time
//! choice (`i64` by default, `i32` with the `word32` feature). Every value
//! the machine manipulates is a word paired with a [`TypeTag`] that selects
//! how the bit pattern is interpreted. Floats are bit-cast into the low
//! bits of the word; printing and comparisons consult the tag.

use core::fmt;

/// The machine word. Opcodes, immediates, stack slots and tape cells all
/// share this representation.
#[cfg(not(feature = "word32"))]
pub type Word = i64;
#[cfg(not(feature = "word32"))]
pub type UWord = u64;

#[cfg(feature = "word32")]
pub type Word = i32;
#[cfg(feature = "word32")]
pub type UWord = u32;

/// Interpretation of a machine word.
///
/// The discriminants are part of the bytecode format: `Push`/`Set` carry a
/// tag as their first immediate, encoded as these small integers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum TypeTag {
    #[default]
    Unknown = 0,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
    Ptr,
    Void,
}

/// A word that could not be decoded as a type tag.
#[derive(Debug, Clone, Copy)]
pub struct InvalidTypeTag(pub Word);

impl fmt::Display for InvalidTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid type tag: {}", self.0)
    }
}

impl TryFrom<Word> for TypeTag {
    type Error = InvalidTypeTag;

    fn try_from(w: Word) -> Result<Self, Self::Error> {
        use TypeTag::*;
        Ok(match w {
            0 => Unknown,
            1 => I8,
            2 => U8,
            3 => I16,
            4 => U16,
            5 => I32,
            6 => U32,
            7 => I64,
            8 => U64,
            9 => F32,
            10 => F64,
            11 => Bool,
            12 => Ptr,
            13 => Void,
            _ => return Err(InvalidTypeTag(w)),
        })
    }
}

impl TypeTag {
    /// Lowercase name as used by the frontend and the TAC dump.
    pub fn name(self) -> &'static str {
        use TypeTag::*;
        match self {
            Unknown => "unknown",
            I8 => "i8",
            U8 => "u8",
            I16 => "i16",
            U16 => "u16",
            I32 => "i32",
            U32 => "u32",
            I64 => "i64",
            U64 => "u64",
            F32 => "f32",
            F64 => "f64",
            Bool => "bool",
            Ptr => "ptr",
            Void => "void",
        }
    }

    /// Parse a tag name. Unrecognized names map to `Unknown` rather than
    /// erroring; the frontend treats the tag as advisory.
    pub fn from_name(s: &str) -> TypeTag {
        use TypeTag::*;
        match s.to_ascii_lowercase().as_str() {
            "i8" => I8,
            "u8" => U8,
            "i16" => I16,
            "u16" => U16,
            "i32" => I32,
            "u32" => U32,
            "i64" => I64,
            "u64" => U64,
            "f32" => F32,
            "f64" => F64,
            "bool" => Bool,
            "ptr" => Ptr,
            "void" => Void,
            _ => Unknown,
        }
    }

    #[inline]
    pub fn is_unsigned(self) -> bool {
        matches!(self, TypeTag::U8 | TypeTag::U16 | TypeTag::U32 | TypeTag::U64)
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, TypeTag::F32 | TypeTag::F64)
    }
}

/// A tagged machine word: the unit of the data stack and the tape.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Value {
    pub raw: Word,
    pub tag: TypeTag,
}

static_assertions::assert_eq_size!(Value, [Word; 2]);

impl Value {
    #[inline]
    pub fn new(tag: TypeTag, raw: Word) -> Self {
        Value { raw, tag }
    }

    /// Reinterpret the low 32 bits as an IEEE-754 single.
    #[inline]
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.raw as u32)
    }

    /// Reinterpret the word as an IEEE-754 double.
    #[inline]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.raw as UWord as u64)
    }

    #[inline]
    pub fn from_f32(tag: TypeTag, v: f32) -> Self {
        Value { raw: v.to_bits() as Word, tag }
    }

    #[inline]
    pub fn from_f64(tag: TypeTag, v: f64) -> Self {
        Value { raw: v.to_bits() as Word, tag }
    }
}

impl fmt::Display for Value {
    /// Representation selected by the tag: float tags reinterpret the bit
    /// pattern, unsigned tags print unsigned, everything else signed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            TypeTag::F32 => write!(f, "{}", self.as_f32()),
            TypeTag::F64 => write!(f, "{}", self.as_f64()),
            t if t.is_unsigned() => write!(f, "{}", self.raw as UWord),
            _ => write!(f, "{}", self.raw),
        }
    }
}
