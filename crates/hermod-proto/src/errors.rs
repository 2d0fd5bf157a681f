//! Error types for the hermod wire format.
//!
//! All errors are structured and testable. Decode failures never carry
//! partial results: a function that returns an error has not mutated its
//! output buffers.

use thiserror::Error;

use crate::types::TypeCode;

/// Errors produced while validating signatures, marshaling values, or
/// framing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Signature grammar
    /// A byte in a signature is not a known type code
    #[error("invalid type code {0:#04x} in signature")]
    InvalidTypeCode(u8),

    /// Unbalanced `()` or `{}` in a signature
    #[error("unbalanced container delimiters in signature")]
    UnbalancedDelimiters,

    /// `a` at the end of a signature with no element type
    #[error("array type code with no element type")]
    MissingElementType,

    /// A struct signature `()` with no member types
    #[error("empty struct in signature")]
    EmptyStruct,

    /// A dict entry that is not `{basic complete}` or is outside an array
    #[error("malformed dict entry in signature")]
    MalformedDictEntry,

    /// Container nesting deeper than the protocol allows
    #[error("signature nesting exceeds depth limit {limit}")]
    DepthExceeded {
        /// Maximum permitted nesting depth
        limit: usize,
    },

    /// Signature longer than the one-byte length prefix can express
    #[error("signature length {0} exceeds 255 bytes")]
    SignatureTooLong(usize),

    // Value region decoding
    /// Fewer bytes available than the value requires
    #[error("truncated value region: need {needed} bytes at offset {at}, have {available}")]
    Truncated {
        /// Offset the read started at
        at: usize,
        /// Bytes the read required
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// String or object path bytes are not valid UTF-8
    #[error("invalid UTF-8 in string value at offset {0}")]
    InvalidUtf8(usize),

    /// A length-prefixed value is missing its nul terminator
    #[error("missing nul terminator at offset {0}")]
    MissingNul(usize),

    /// An array length word claims more bytes than the region holds
    #[error("array length {len} overruns value region at offset {at}")]
    ArrayOverrun {
        /// Offset of the length word
        at: usize,
        /// Claimed element-region length
        len: u32,
    },

    /// Array element region longer than the protocol allows
    #[error("array length {0} exceeds protocol maximum")]
    ArrayTooLong(u32),

    // Reader/writer contract
    /// Attempted a value operation on a type that does not support it
    #[error("type {0:?} does not support the requested operation")]
    WrongType(TypeCode),

    /// A read past the last value of the current container
    #[error("no value at the reader's current position")]
    EndOfValues,

    /// A value region holds bytes beyond its last value
    #[error("trailing bytes after the last value, starting at offset {0}")]
    TrailingBytes(usize),

    /// A writer inside an array or variant was given a type that does not
    /// match the expected signature
    #[error("expected type code {expected:?}, got {actual:?}")]
    UnexpectedType {
        /// Type code the fixed signature requires here
        expected: u8,
        /// Type code the caller tried to write
        actual: u8,
    },

    /// An array element's signature does not match its sibling elements
    #[error("array element signature mismatch")]
    ElementSignatureMismatch,

    // Message framing
    /// The byte-order tag is neither `l` nor `B`
    #[error("invalid byte order tag {0:#04x}")]
    InvalidByteOrder(u8),

    /// Unknown message type code
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Unsupported protocol version
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Message serial is zero
    #[error("message serial must be nonzero")]
    ZeroSerial,

    /// A header field appears twice
    #[error("duplicate header field {0}")]
    DuplicateHeaderField(u8),

    /// A header field's signature does not match its field code
    #[error("header field {field} carries wrong type signature")]
    BadHeaderFieldType {
        /// Field code of the offending field
        field: u8,
    },

    /// A required header field is absent for this message type
    #[error("missing required header field {field} for message type {message_type}")]
    MissingRequiredField {
        /// Message type code
        message_type: u8,
        /// Field code that is required
        field: u8,
    },

    /// Declared body length disagrees with the frame
    #[error("body length mismatch: header claims {header} bytes, frame holds {actual}")]
    BodyLengthMismatch {
        /// Length from the fixed header
        header: usize,
        /// Length actually present
        actual: usize,
    },

    /// Message larger than the implementation accepts
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Total frame size
        size: usize,
        /// Maximum permitted size
        max: usize,
    },

    /// A name-shaped header field has invalid syntax
    #[error("invalid {what} \"{value}\"")]
    InvalidName {
        /// Which kind of name failed validation
        what: &'static str,
        /// The offending text
        value: String,
    },
}

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
