//! Wire format for the hermod message bus.
//!
//! This crate is pure data plumbing with no I/O:
//!
//! - [`types`] / [`signature`]: the recursive type grammar
//! - [`codec`]: align-aware packing of basic values in either byte order
//! - [`reader`] / [`writer`]: streaming traversal over signature+value
//!   regions, the ground truth for the wire layout
//! - [`value`]: owned value trees for building and inspecting bodies
//! - [`message`]: framed messages with typed header fields
//!
//! Everything downstream (routing, policy, delivery) lives in
//! `hermod-core` and treats these types as opaque.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod errors;
pub mod message;
pub mod names;
pub mod reader;
pub mod signature;
pub mod types;
pub mod value;
pub mod writer;

pub use codec::ByteOrder;
pub use errors::{ProtocolError, Result};
pub use message::{HeaderFieldCode, Message, MessageFlags, MessageType};
pub use reader::{TypeMark, TypeReader};
pub use signature::Signature;
pub use types::TypeCode;
pub use value::{Basic, Value};
pub use writer::{MarshalBlock, TypeWriter};
