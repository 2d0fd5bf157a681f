//! Signature grammar: validation and complete-type traversal.
//!
//! A signature is a sequence of complete types. A complete type is a basic
//! type code, `v`, `a` followed by one complete type, `(` one-or-more
//! complete types `)`, or `{` basic-type complete-type `}` where the dict
//! entry is itself the element type of an array.

use std::fmt;

use crate::{
    errors::{ProtocolError, Result},
    types::{DICT_ENTRY_BEGIN, DICT_ENTRY_END, STRUCT_BEGIN, STRUCT_END, TypeCode},
};

/// Maximum nesting depth for arrays, and separately for structs.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum signature length: one-byte length prefix on the wire.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// A validated type signature.
///
/// Construction checks the full grammar, so every `Signature` in the
/// program can be traversed without re-validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(String);

impl Signature {
    /// The empty signature (a message with no body).
    pub fn empty() -> Signature {
        Signature(String::new())
    }

    /// Validate and wrap a signature string.
    pub fn new(text: impl Into<String>) -> Result<Signature> {
        let text = text.into();
        validate(text.as_bytes())?;
        Ok(Signature(text))
    }

    /// Validate a byte slice and wrap it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Signature> {
        validate(bytes)?;
        // validate() only accepts ASCII type codes
        Ok(Signature(String::from_utf8(bytes.to_vec()).expect("signatures are ASCII")))
    }

    /// Signature text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether this signature holds no types.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the signature is exactly one complete type.
    pub fn is_single_complete_type(&self) -> bool {
        let bytes = self.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let mut pos = 0;
        match skip_one_complete_type(bytes, &mut pos) {
            Ok(()) => pos == bytes.len(),
            Err(_) => false,
        }
    }

    /// Iterate over the complete types of this signature.
    ///
    /// Each item is the sub-signature of one complete type, in order.
    pub fn complete_types(&self) -> CompleteTypes<'_> {
        CompleteTypes { bytes: self.as_bytes(), pos: 0 }
    }

    /// Type code of the first complete type, if any.
    pub fn first_type(&self) -> Option<TypeCode> {
        self.as_bytes().first().map(|&b| {
            // validated at construction
            TypeCode::from_signature_byte(b).expect("validated signature")
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Iterator over the complete types of a signature.
pub struct CompleteTypes<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for CompleteTypes<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        // the signature was validated on construction
        skip_one_complete_type(self.bytes, &mut self.pos).expect("validated signature");
        Some(&self.bytes[start..self.pos])
    }
}

/// Map the byte at `pos` to the type code it begins.
///
/// Errors if `pos` is out of bounds or the byte is a closing delimiter.
pub fn first_type(sig: &[u8], pos: usize) -> Result<TypeCode> {
    let byte = *sig.get(pos).ok_or(ProtocolError::Truncated {
        at: pos,
        needed: 1,
        available: sig.len().saturating_sub(pos),
    })?;
    TypeCode::from_signature_byte(byte)
}

/// Advance `pos` past exactly one complete type.
///
/// Performs bounds and delimiter checks so it is safe on unvalidated
/// input; it does not enforce the dict-entry membership rules (those are
/// checked by [`Signature::new`]).
pub fn skip_one_complete_type(sig: &[u8], pos: &mut usize) -> Result<()> {
    let mut array_depth = 0usize;
    while sig.get(*pos) == Some(&b'a') {
        *pos += 1;
        array_depth += 1;
        if array_depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::DepthExceeded { limit: MAX_NESTING_DEPTH });
        }
    }

    let byte = *sig.get(*pos).ok_or(ProtocolError::MissingElementType)?;
    if byte == STRUCT_BEGIN || byte == DICT_ENTRY_BEGIN {
        let mut depth = 0usize;
        loop {
            let byte = *sig.get(*pos).ok_or(ProtocolError::UnbalancedDelimiters)?;
            match byte {
                STRUCT_BEGIN | DICT_ENTRY_BEGIN => {
                    depth += 1;
                    if depth > MAX_NESTING_DEPTH {
                        return Err(ProtocolError::DepthExceeded { limit: MAX_NESTING_DEPTH });
                    }
                }
                STRUCT_END | DICT_ENTRY_END => {
                    depth -= 1;
                }
                other => {
                    TypeCode::from_signature_byte(other)?;
                }
            }
            *pos += 1;
            if depth == 0 {
                break;
            }
        }
    } else {
        TypeCode::from_signature_byte(byte)?;
        *pos += 1;
    }
    Ok(())
}

/// Length in bytes of the complete type starting at `pos`.
pub fn complete_type_len(sig: &[u8], pos: usize) -> Result<usize> {
    let mut end = pos;
    skip_one_complete_type(sig, &mut end)?;
    Ok(end - pos)
}

/// Full grammar check.
fn validate(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_SIGNATURE_LENGTH {
        return Err(ProtocolError::SignatureTooLong(bytes.len()));
    }
    let mut pos = 0;
    while pos < bytes.len() {
        validate_one(bytes, &mut pos, 0, 0, false)?;
    }
    Ok(())
}

fn validate_one(
    bytes: &[u8],
    pos: &mut usize,
    array_depth: usize,
    struct_depth: usize,
    inside_array: bool,
) -> Result<()> {
    let byte = *bytes.get(*pos).ok_or(ProtocolError::MissingElementType)?;
    match byte {
        b'a' => {
            if array_depth + 1 > MAX_NESTING_DEPTH {
                return Err(ProtocolError::DepthExceeded { limit: MAX_NESTING_DEPTH });
            }
            *pos += 1;
            validate_one(bytes, pos, array_depth + 1, struct_depth, true)
        }
        STRUCT_BEGIN => {
            if struct_depth + 1 > MAX_NESTING_DEPTH {
                return Err(ProtocolError::DepthExceeded { limit: MAX_NESTING_DEPTH });
            }
            *pos += 1;
            let mut members = 0;
            loop {
                match bytes.get(*pos) {
                    None => return Err(ProtocolError::UnbalancedDelimiters),
                    Some(&STRUCT_END) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => {
                        validate_one(bytes, pos, array_depth, struct_depth + 1, false)?;
                        members += 1;
                    }
                }
            }
            if members == 0 {
                return Err(ProtocolError::EmptyStruct);
            }
            Ok(())
        }
        DICT_ENTRY_BEGIN => {
            // dict entries exist only as array element types
            if !inside_array {
                return Err(ProtocolError::MalformedDictEntry);
            }
            if struct_depth + 1 > MAX_NESTING_DEPTH {
                return Err(ProtocolError::DepthExceeded { limit: MAX_NESTING_DEPTH });
            }
            *pos += 1;
            let key_start = *pos;
            validate_one(bytes, pos, array_depth, struct_depth + 1, false)?;
            if *pos != key_start + 1
                || !TypeCode::from_signature_byte(bytes[key_start])?.is_basic()
            {
                return Err(ProtocolError::MalformedDictEntry);
            }
            validate_one(bytes, pos, array_depth, struct_depth + 1, false)?;
            match bytes.get(*pos) {
                Some(&DICT_ENTRY_END) => {
                    *pos += 1;
                    Ok(())
                }
                _ => Err(ProtocolError::MalformedDictEntry),
            }
        }
        STRUCT_END | DICT_ENTRY_END => Err(ProtocolError::UnbalancedDelimiters),
        other => {
            TypeCode::from_signature_byte(other)?;
            *pos += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_basic_and_container_signatures() {
        for sig in ["", "y", "ii", "a{sv}", "(isu)", "aas", "a(ii)", "v", "at", "a{s(iv)}"] {
            assert!(Signature::new(sig).is_ok(), "rejected {sig:?}");
        }
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert_eq!(Signature::new("a").unwrap_err(), ProtocolError::MissingElementType);
        assert_eq!(Signature::new("(i").unwrap_err(), ProtocolError::UnbalancedDelimiters);
        assert_eq!(Signature::new("i)").unwrap_err(), ProtocolError::UnbalancedDelimiters);
        assert_eq!(Signature::new("()").unwrap_err(), ProtocolError::EmptyStruct);
        assert_eq!(Signature::new("{sv}").unwrap_err(), ProtocolError::MalformedDictEntry);
        assert_eq!(Signature::new("a{vs}").unwrap_err(), ProtocolError::MalformedDictEntry);
        assert_eq!(Signature::new("a{s}").unwrap_err(), ProtocolError::MalformedDictEntry);
        assert_eq!(Signature::new("a{svv}").unwrap_err(), ProtocolError::MalformedDictEntry);
        assert!(matches!(Signature::new("z").unwrap_err(), ProtocolError::InvalidTypeCode(b'z')));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let deep_array = "a".repeat(MAX_NESTING_DEPTH + 1) + "i";
        assert!(matches!(
            Signature::new(deep_array).unwrap_err(),
            ProtocolError::DepthExceeded { .. }
        ));

        let deep_struct = "(".repeat(MAX_NESTING_DEPTH + 1) + "i" + &")".repeat(MAX_NESTING_DEPTH + 1);
        assert!(matches!(
            Signature::new(deep_struct).unwrap_err(),
            ProtocolError::DepthExceeded { .. }
        ));
    }

    #[test]
    fn complete_type_iteration() {
        let sig = Signature::new("ia{sv}(xy)as").unwrap();
        let types: Vec<&[u8]> = sig.complete_types().collect();
        assert_eq!(types, vec![b"i".as_ref(), b"a{sv}", b"(xy)", b"as"]);
    }

    #[test]
    fn single_complete_type() {
        assert!(Signature::new("a{sv}").unwrap().is_single_complete_type());
        assert!(Signature::new("(ii)").unwrap().is_single_complete_type());
        assert!(!Signature::new("ii").unwrap().is_single_complete_type());
        assert!(!Signature::empty().is_single_complete_type());
    }

    #[test]
    fn skip_covers_nested_types() {
        let sig = b"aa(i(sv)a{sy})u";
        let mut pos = 0;
        skip_one_complete_type(sig, &mut pos).unwrap();
        assert_eq!(pos, sig.len() - 1);
    }
}
