//! Streaming writer that builds a signature and a value region in step.
//!
//! A [`TypeWriter`] is the mirror of [`crate::reader::TypeReader`]: values
//! are appended to a [`MarshalBlock`] and type codes are appended to the
//! signature as they are written, except inside arrays and variants,
//! where the signature is fixed in advance and the writer only verifies
//! that each written value matches the expected type code
//! (`type_pos_is_expectation`).
//!
//! Containers are written by `recurse`/`unrecurse` pairs. Unrecursing an
//! array back-patches its length word with the number of element bytes
//! actually written. Failure paths never leave partial output:
//! [`TypeWriter::write_reader`] restores both buffers and the writer on
//! any error.

use crate::{
    codec::{self, ByteOrder},
    errors::{ProtocolError, Result},
    reader::TypeReader,
    signature,
    types::{DICT_ENTRY_BEGIN, DICT_ENTRY_END, STRUCT_BEGIN, STRUCT_END, TypeCode},
    value::{self, Basic},
};

/// Output buffers for marshaling: signature text and value bytes.
///
/// Padding inside `body` is computed from absolute offsets, so when a
/// value region must be aligned relative to an enclosing frame (as a
/// message body is), seed `body` with the frame prefix before writing.
#[derive(Debug, Default, Clone)]
pub struct MarshalBlock {
    /// Signature bytes accumulated so far
    pub signature: Vec<u8>,
    /// Marshaled value bytes
    pub body: Vec<u8>,
}

impl MarshalBlock {
    /// Empty block.
    pub fn new() -> MarshalBlock {
        MarshalBlock::default()
    }

    /// A top-level writer appending at the current end of both buffers.
    pub fn writer(&self, order: ByteOrder) -> TypeWriter {
        TypeWriter {
            order,
            kind: WriterKind::Body,
            type_in_value: false,
            type_pos: self.signature.len(),
            value_pos: self.body.len(),
            type_pos_is_expectation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterKind {
    Body,
    Struct,
    DictEntry,
    Array {
        /// Offset of the length word to back-patch on unrecurse
        len_pos: usize,
        /// Offset where element bytes begin
        start: usize,
        /// Offset of the element type in the type region
        element_type_pos: usize,
    },
    Variant,
}

/// Recursive writer state; buffers are passed to each operation.
#[derive(Debug, Clone, Copy)]
pub struct TypeWriter {
    order: ByteOrder,
    kind: WriterKind,
    /// The type cursor points into `block.body` (inside a variant)
    type_in_value: bool,
    type_pos: usize,
    value_pos: usize,
    /// Inside an array or variant the signature already exists; writes
    /// must match it instead of appending to it
    type_pos_is_expectation: bool,
}

impl TypeWriter {
    /// Byte order values are marshaled in.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Current absolute offset into the value buffer.
    pub fn value_pos(&self) -> usize {
        self.value_pos
    }

    fn expected_byte(&self, block: &MarshalBlock) -> Option<u8> {
        let buf = if self.type_in_value { &block.body } else { &block.signature };
        buf.get(self.type_pos).copied()
    }

    /// Append the type code, or verify it against the expected signature.
    fn write_or_verify_typecode(&mut self, block: &mut MarshalBlock, byte: u8) -> Result<()> {
        if self.type_pos_is_expectation {
            let expected = self.expected_byte(block).unwrap_or(0);
            if expected != byte {
                return Err(ProtocolError::UnexpectedType { expected, actual: byte });
            }
            // immediately inside an array every value is another element,
            // so the expected type does not move
            if !matches!(self.kind, WriterKind::Array { .. }) {
                self.type_pos += 1;
            }
        } else {
            let buf = if self.type_in_value { &mut block.body } else { &mut block.signature };
            debug_assert_eq!(self.type_pos, buf.len(), "append-only type region");
            buf.push(byte);
            self.type_pos += 1;
        }
        Ok(())
    }

    /// Write one basic value.
    pub fn write_basic(&mut self, block: &mut MarshalBlock, value: &Basic<'_>) -> Result<()> {
        let code = value.type_code() as u8;
        if self.type_pos_is_expectation {
            let expected = self.expected_byte(block).unwrap_or(0);
            if expected != code {
                return Err(ProtocolError::UnexpectedType { expected, actual: code });
            }
        }
        debug_assert_eq!(self.value_pos, block.body.len(), "append-only value region");
        value::put_basic(&mut block.body, self.order, value);
        self.value_pos = block.body.len();
        self.write_or_verify_typecode(block, code)?;
        Ok(())
    }

    /// Open a container and return the writer for its contents.
    ///
    /// `contained` is the element signature for arrays and the inner
    /// signature for variants; it is ignored for structs and dict entries
    /// (their member types are discovered as members are written).
    pub fn recurse(
        &mut self,
        block: &mut MarshalBlock,
        container: TypeCode,
        contained: Option<&[u8]>,
    ) -> Result<TypeWriter> {
        if self.type_pos_is_expectation {
            let expected = self.expected_byte(block).unwrap_or(0);
            let expected_code = TypeCode::from_signature_byte(expected)
                .map_err(|_| ProtocolError::UnexpectedType { expected, actual: container as u8 })?;
            if expected_code != container {
                return Err(ProtocolError::UnexpectedType { expected, actual: container as u8 });
            }
        }

        let mut sub = TypeWriter {
            order: self.order,
            kind: WriterKind::Body, // set per container below
            type_in_value: self.type_in_value,
            type_pos: self.type_pos,
            value_pos: self.value_pos,
            type_pos_is_expectation: self.type_pos_is_expectation
                || matches!(container, TypeCode::Array | TypeCode::Variant),
        };

        match container {
            TypeCode::Struct | TypeCode::DictEntry => {
                // bound mid-operation growth before any visible write
                block.body.reserve(8);
                sub.kind = if container == TypeCode::Struct {
                    WriterKind::Struct
                } else {
                    WriterKind::DictEntry
                };
                let open =
                    if container == TypeCode::Struct { STRUCT_BEGIN } else { DICT_ENTRY_BEGIN };
                sub.write_or_verify_typecode(block, open)?;
                codec::pad_to(&mut block.body, 8);
                sub.value_pos = block.body.len();
            }
            TypeCode::Array => {
                let contained = contained.ok_or(ProtocolError::MissingElementType)?;
                if let WriterKind::Array { element_type_pos, .. } = self.kind {
                    // a nested array must repeat its parent's element type
                    let buf: &[u8] =
                        if self.type_in_value { &block.body } else { &block.signature };
                    let declared = buf
                        .get(element_type_pos + 1..element_type_pos + 1 + contained.len());
                    if declared != Some(contained) {
                        return Err(ProtocolError::ElementSignatureMismatch);
                    }
                }

                // 3 pad + 4 length bytes + up to 4 bytes of element padding
                block.body.reserve(3 + 4 + 4);

                if !self.type_pos_is_expectation {
                    let buf =
                        if self.type_in_value { &mut block.body } else { &mut block.signature };
                    debug_assert_eq!(self.type_pos, buf.len());
                    buf.push(b'a');
                    buf.extend_from_slice(contained);
                }
                sub.type_pos = self.type_pos + 1;
                if !matches!(self.kind, WriterKind::Array { .. }) {
                    self.type_pos += 1 + contained.len();
                }

                codec::put_u32(&mut block.body, self.order, 0);
                let len_pos = block.body.len() - 4;

                // element alignment padding is written even for arrays
                // that stay empty, so decoders never special-case them
                let element = signature::first_type(contained, 0)?;
                codec::pad_to(&mut block.body, element.alignment());
                let start = block.body.len();

                sub.value_pos = start;
                sub.kind =
                    WriterKind::Array { len_pos, start, element_type_pos: sub.type_pos };
                sub.type_pos_is_expectation = true;
            }
            TypeCode::Variant => {
                let contained = contained.ok_or(ProtocolError::MissingElementType)?;
                if contained.len() > signature::MAX_SIGNATURE_LENGTH {
                    return Err(ProtocolError::SignatureTooLong(contained.len()));
                }
                // worst case: length byte, signature, nul, padding to 8
                block.body.reserve(contained.len() + 9);

                // the variant typecode belongs to the parent's type region
                self.write_or_verify_typecode(block, b'v')?;

                debug_assert_eq!(self.value_pos, block.body.len());
                block.body.push(contained.len() as u8);

                // the sub's expected signature lives inside the value bytes
                sub.type_in_value = true;
                sub.type_pos = block.body.len();
                block.body.extend_from_slice(contained);
                block.body.push(0);
                codec::pad_to(&mut block.body, 8);

                sub.value_pos = block.body.len();
                sub.kind = WriterKind::Variant;
                sub.type_pos_is_expectation = true;
            }
            basic => return Err(ProtocolError::WrongType(basic)),
        }
        Ok(sub)
    }

    /// Close a container opened with [`TypeWriter::recurse`].
    pub fn unrecurse(&mut self, block: &mut MarshalBlock, mut sub: TypeWriter) -> Result<()> {
        match sub.kind {
            WriterKind::Struct => sub.write_or_verify_typecode(block, STRUCT_END)?,
            WriterKind::DictEntry => sub.write_or_verify_typecode(block, DICT_ENTRY_END)?,
            WriterKind::Array { len_pos, start, .. } => {
                let len = (sub.value_pos - start) as u32;
                codec::set_u32(&mut block.body, sub.order, len_pos, len);
            }
            WriterKind::Body | WriterKind::Variant => {}
        }

        // a struct's member types only become known as they are written,
        // so the parent's type cursor catches up here; for arrays and
        // variants the parent already moved past the full contained type
        if matches!(sub.kind, WriterKind::Struct | WriterKind::DictEntry)
            && matches!(
                self.kind,
                WriterKind::Body | WriterKind::Struct | WriterKind::DictEntry
            )
        {
            self.type_pos = sub.type_pos;
        }
        self.value_pos = sub.value_pos;
        Ok(())
    }

    /// Copy every remaining value from `reader` into this writer.
    ///
    /// On failure both buffers are restored to their pre-call lengths and
    /// the writer to its pre-call state.
    pub fn write_reader(
        &mut self,
        block: &mut MarshalBlock,
        reader: &mut TypeReader<'_>,
    ) -> Result<()> {
        let saved = *self;
        let saved_sig_len = block.signature.len();
        let saved_body_len = block.body.len();

        let result = self.copy_from_reader(block, reader);
        if result.is_err() {
            block.signature.truncate(saved_sig_len);
            block.body.truncate(saved_body_len);
            *self = saved;
        }
        result
    }

    fn copy_from_reader(
        &mut self,
        block: &mut MarshalBlock,
        reader: &mut TypeReader<'_>,
    ) -> Result<()> {
        while let Some(code) = reader.current_type()? {
            if code.is_container() {
                let mut subreader = reader.recurse()?;
                let contained = subreader.signature_of_current()?;
                let mut subwriter = self.recurse(block, code, Some(contained))?;
                subwriter.write_reader(block, &mut subreader)?;
                self.unrecurse(block, subwriter)?;
            } else {
                let basic = reader.read_basic()?;
                self.write_basic(block, &basic)?;
            }
            reader.next()?;
        }
        Ok(())
    }
}
