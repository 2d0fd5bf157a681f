//! Type codes and the alignment table.
//!
//! Every value on the wire is described by a type code drawn from a small
//! ASCII alphabet. Container types (`a`, `v`, and the delimiter pairs `()`
//! and `{}`) nest recursively; everything else is a basic type with a fixed
//! or length-prefixed encoding.

use crate::errors::{ProtocolError, Result};

/// Opening delimiter of a struct in a signature.
pub const STRUCT_BEGIN: u8 = b'(';
/// Closing delimiter of a struct in a signature.
pub const STRUCT_END: u8 = b')';
/// Opening delimiter of a dict entry in a signature.
pub const DICT_ENTRY_BEGIN: u8 = b'{';
/// Closing delimiter of a dict entry in a signature.
pub const DICT_ENTRY_END: u8 = b'}';

/// Wire type codes.
///
/// `Struct` and `DictEntry` never appear as their own byte in a signature;
/// they are spelled with delimiter pairs. The enum still assigns them the
/// conventional reserved codes so they can be named uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    /// 8-bit unsigned integer
    Byte = b'y',
    /// Boolean, one byte, 0 or 1
    Boolean = b'b',
    /// 32-bit signed integer
    Int32 = b'i',
    /// 32-bit unsigned integer
    Uint32 = b'u',
    /// 64-bit signed integer
    Int64 = b'x',
    /// 64-bit unsigned integer
    Uint64 = b't',
    /// IEEE 754 double
    Double = b'd',
    /// UTF-8 string, length-prefixed, nul-terminated
    String = b's',
    /// Object path, encoded like a string
    ObjectPath = b'o',
    /// Type signature, one-byte length prefix, nul-terminated
    Signature = b'g',
    /// Array of one complete element type
    Array = b'a',
    /// Self-describing value carrying its own signature
    Variant = b'v',
    /// Parenthesized sequence of complete types
    Struct = b'r',
    /// Key/value pair, valid only as an array element
    DictEntry = b'e',
}

impl TypeCode {
    /// Map a signature byte to its type code.
    ///
    /// `(` maps to [`TypeCode::Struct`] and `{` to [`TypeCode::DictEntry`];
    /// closing delimiters and unknown bytes are rejected.
    pub fn from_signature_byte(byte: u8) -> Result<TypeCode> {
        match byte {
            b'y' => Ok(TypeCode::Byte),
            b'b' => Ok(TypeCode::Boolean),
            b'i' => Ok(TypeCode::Int32),
            b'u' => Ok(TypeCode::Uint32),
            b'x' => Ok(TypeCode::Int64),
            b't' => Ok(TypeCode::Uint64),
            b'd' => Ok(TypeCode::Double),
            b's' => Ok(TypeCode::String),
            b'o' => Ok(TypeCode::ObjectPath),
            b'g' => Ok(TypeCode::Signature),
            b'a' => Ok(TypeCode::Array),
            b'v' => Ok(TypeCode::Variant),
            STRUCT_BEGIN => Ok(TypeCode::Struct),
            DICT_ENTRY_BEGIN => Ok(TypeCode::DictEntry),
            other => Err(ProtocolError::InvalidTypeCode(other)),
        }
    }

    /// Alignment requirement in bytes: 1, 4, or 8.
    ///
    /// Strings, object paths, and arrays align to 4 because they begin with
    /// a 4-byte length word. Structs and dict entries align to 8 so the
    /// padding inside them is predictable rather than location-dependent.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Boolean | TypeCode::Variant | TypeCode::Signature => 1,
            TypeCode::Int32
            | TypeCode::Uint32
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::Uint64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// Whether this is a basic (non-container) type.
    pub fn is_basic(self) -> bool {
        !self.is_container()
    }

    /// Whether this type contains other values.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            TypeCode::Array | TypeCode::Variant | TypeCode::Struct | TypeCode::DictEntry
        )
    }

    /// Encoded width for types whose size does not depend on the value.
    ///
    /// Length-prefixed and container types return `None`.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            TypeCode::Byte | TypeCode::Boolean => Some(1),
            TypeCode::Int32 | TypeCode::Uint32 => Some(4),
            TypeCode::Int64 | TypeCode::Uint64 | TypeCode::Double => Some(8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters_map_to_abstract_codes() {
        assert_eq!(TypeCode::from_signature_byte(b'(').unwrap(), TypeCode::Struct);
        assert_eq!(TypeCode::from_signature_byte(b'{').unwrap(), TypeCode::DictEntry);
        assert!(TypeCode::from_signature_byte(b')').is_err());
        assert!(TypeCode::from_signature_byte(b'}').is_err());
    }

    #[test]
    fn alignment_table() {
        assert_eq!(TypeCode::Byte.alignment(), 1);
        assert_eq!(TypeCode::Boolean.alignment(), 1);
        assert_eq!(TypeCode::Variant.alignment(), 1);
        assert_eq!(TypeCode::Signature.alignment(), 1);
        assert_eq!(TypeCode::Int32.alignment(), 4);
        assert_eq!(TypeCode::String.alignment(), 4);
        assert_eq!(TypeCode::ObjectPath.alignment(), 4);
        assert_eq!(TypeCode::Array.alignment(), 4);
        assert_eq!(TypeCode::Int64.alignment(), 8);
        assert_eq!(TypeCode::Double.alignment(), 8);
        assert_eq!(TypeCode::Struct.alignment(), 8);
        assert_eq!(TypeCode::DictEntry.alignment(), 8);
    }

    #[test]
    fn containers_have_no_fixed_width() {
        for code in [TypeCode::Array, TypeCode::Variant, TypeCode::Struct, TypeCode::String] {
            assert_eq!(code.fixed_width(), None);
        }
        assert_eq!(TypeCode::Boolean.fixed_width(), Some(1));
        assert_eq!(TypeCode::Uint64.fixed_width(), Some(8));
    }
}
