//! Streaming reader over a signature and a value region.
//!
//! A [`TypeReader`] walks the values described by a type region (usually a
//! signature string) through a value region (the marshaled bytes). It is a
//! cheap copyable cursor: recursing into a container yields a new reader
//! scoped to that container, and [`TypeReader::next`] advances to the next
//! sibling. Container-specific behavior lives in a tagged kind rather than
//! a class table; each kind specializes recursion, advancement, and the
//! end-of-container test.
//!
//! Traversal is over values, not types: an empty array has no elements to
//! recurse into, although its element signature is still reachable via
//! [`TypeReader::signature_of_current`] after recursing.

use crate::{
    codec::{self, ByteOrder},
    errors::{ProtocolError, Result},
    message::MAX_ARRAY_LENGTH,
    signature,
    types::{DICT_ENTRY_END, STRUCT_END, TypeCode},
    value::{self, Basic},
};

/// Which container the reader is currently scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderKind {
    /// Top level of a value region
    Body,
    Struct,
    DictEntry,
    /// `start` is the absolute offset of the element region; `len_offset`
    /// is the distance from the end of the length word back to `start`,
    /// always in 0..8
    Array { start: usize, len_offset: u8 },
    Variant,
}

/// Saved reader position, sufficient to re-create an identical reader.
#[derive(Debug, Clone, Copy)]
pub struct TypeMark {
    kind: ReaderKind,
    types_only: bool,
    finished: bool,
    /// The type region lives inside the value region (true only for
    /// readers inside a variant)
    type_in_value: bool,
    type_pos: usize,
    value_pos: usize,
}

/// Recursive reader over `(type region, value region)`.
#[derive(Debug, Clone, Copy)]
pub struct TypeReader<'a> {
    order: ByteOrder,
    kind: ReaderKind,
    types_only: bool,
    finished: bool,
    type_in_value: bool,
    type_str: &'a [u8],
    type_pos: usize,
    value_str: &'a [u8],
    value_pos: usize,
}

impl<'a> TypeReader<'a> {
    /// Reader over a full value region from position zero.
    pub fn new(order: ByteOrder, type_str: &'a [u8], value_str: &'a [u8]) -> TypeReader<'a> {
        Self::new_at(order, type_str, 0, value_str, 0)
    }

    /// Reader starting at explicit positions inside both regions.
    ///
    /// Alignment inside the value region is computed from absolute
    /// offsets, so `value_pos` must be the value's true offset within the
    /// enclosing frame.
    pub fn new_at(
        order: ByteOrder,
        type_str: &'a [u8],
        type_pos: usize,
        value_str: &'a [u8],
        value_pos: usize,
    ) -> TypeReader<'a> {
        TypeReader {
            order,
            kind: ReaderKind::Body,
            types_only: false,
            finished: false,
            type_in_value: false,
            type_str,
            type_pos,
            value_str,
            value_pos,
        }
    }

    /// Reader that iterates types only; value operations are rejected.
    pub fn types_only(type_str: &'a [u8], type_pos: usize) -> TypeReader<'a> {
        TypeReader {
            order: ByteOrder::Little, // irrelevant without values
            kind: ReaderKind::Body,
            types_only: true,
            finished: false,
            type_in_value: false,
            type_str,
            type_pos,
            value_str: &[],
            value_pos: usize::MAX,
        }
    }

    /// Re-create a reader saved with [`TypeReader::save_mark`].
    ///
    /// `type_str` and `value_str` must be the same regions the original
    /// reader was built over.
    pub fn from_mark(
        order: ByteOrder,
        type_str: &'a [u8],
        value_str: &'a [u8],
        mark: &TypeMark,
    ) -> TypeReader<'a> {
        TypeReader {
            order,
            kind: mark.kind,
            types_only: mark.types_only,
            finished: mark.finished,
            type_in_value: mark.type_in_value,
            type_str: if mark.type_in_value { value_str } else { type_str },
            type_pos: mark.type_pos,
            value_str,
            value_pos: mark.value_pos,
        }
    }

    /// Save the current position.
    pub fn save_mark(&self) -> TypeMark {
        TypeMark {
            kind: self.kind,
            types_only: self.types_only,
            finished: self.finished,
            type_in_value: self.type_in_value,
            type_pos: self.type_pos,
            value_pos: self.value_pos,
        }
    }

    /// Byte order of the value region.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Current absolute offset into the value region.
    pub fn value_pos(&self) -> usize {
        self.value_pos
    }

    /// Type code of the current value, or `None` at the end of the
    /// current container.
    pub fn current_type(&self) -> Result<Option<TypeCode>> {
        if self.finished {
            return Ok(None);
        }
        if let ReaderKind::Array { start, .. } = self.kind {
            if !self.types_only {
                let end = start + self.array_region_len()? as usize;
                if self.value_pos > end {
                    return Err(ProtocolError::ArrayOverrun {
                        at: start,
                        len: (self.value_pos - start) as u32,
                    });
                }
                if self.value_pos == end {
                    return Ok(None);
                }
            }
        }
        if self.type_pos >= self.type_str.len() || self.type_str[self.type_pos] == 0 {
            return Ok(None);
        }
        signature::first_type(self.type_str, self.type_pos).map(Some)
    }

    /// Whether the current array value has zero elements.
    ///
    /// The reader must be positioned at an array.
    pub fn array_is_empty(&self) -> Result<bool> {
        match self.current_type()? {
            Some(TypeCode::Array) => {}
            Some(other) => return Err(ProtocolError::WrongType(other)),
            None => return Err(ProtocolError::EndOfValues),
        }
        let (len, _) = codec::get_u32(self.value_str, self.order, self.value_pos)?;
        Ok(len == 0)
    }

    /// Read the current basic value without advancing.
    pub fn read_basic(&self) -> Result<Basic<'a>> {
        let code = self.current_type()?.ok_or(ProtocolError::EndOfValues)?;
        if !code.is_basic() {
            return Err(ProtocolError::WrongType(code));
        }
        if self.types_only {
            return Err(ProtocolError::EndOfValues);
        }
        let (basic, _) = value::get_basic(self.value_str, self.order, code, self.value_pos)?;
        Ok(basic)
    }

    /// Signature bytes of the complete type at the current position.
    ///
    /// Unlike [`TypeReader::current_type`] this is defined even when a
    /// just-recursed array turns out to be empty: the element signature is
    /// a property of the type region, not of the values.
    pub fn signature_of_current(&self) -> Result<&'a [u8]> {
        let len = signature::complete_type_len(self.type_str, self.type_pos)?;
        Ok(&self.type_str[self.type_pos..self.type_pos + len])
    }

    /// Reader scoped to the children of the current container value.
    pub fn recurse(&self) -> Result<TypeReader<'a>> {
        let code = self.current_type()?.ok_or(ProtocolError::EndOfValues)?;
        let mut sub = *self;
        sub.finished = false;
        match code {
            TypeCode::Struct => {
                sub.kind = ReaderKind::Struct;
                sub.type_pos += 1; // past '('
                if !self.types_only {
                    sub.value_pos = codec::skip_padding(sub.value_str, sub.value_pos, 8)?;
                }
            }
            TypeCode::DictEntry => {
                sub.kind = ReaderKind::DictEntry;
                sub.type_pos += 1; // past '{'
                if !self.types_only {
                    sub.value_pos = codec::skip_padding(sub.value_str, sub.value_pos, 8)?;
                }
            }
            TypeCode::Array => {
                sub.type_pos += 1; // element type
                if self.types_only {
                    sub.kind = ReaderKind::Array { start: usize::MAX, len_offset: 7 };
                } else {
                    let len_pos = codec::align_up(sub.value_pos, 4);
                    let (len, after_len) = codec::get_u32(sub.value_str, self.order, len_pos)?;
                    if len > MAX_ARRAY_LENGTH {
                        return Err(ProtocolError::ArrayTooLong(len));
                    }
                    let elem_align = signature::first_type(sub.type_str, sub.type_pos)?.alignment();
                    let start = codec::skip_padding(sub.value_str, after_len, elem_align)?;
                    if start + len as usize > sub.value_str.len() {
                        return Err(ProtocolError::ArrayOverrun { at: len_pos, len });
                    }
                    sub.value_pos = start;
                    sub.kind = ReaderKind::Array {
                        start,
                        // always in 0..8, the element alignment gap
                        len_offset: (start - after_len) as u8,
                    };
                }
            }
            TypeCode::Variant => {
                if self.types_only {
                    return Err(ProtocolError::WrongType(TypeCode::Variant));
                }
                let (sig_len, sig_start) = codec::get_byte(sub.value_str, sub.value_pos)?;
                let nul_pos = sig_start + sig_len as usize;
                let (nul, after_sig) = codec::get_byte(sub.value_str, nul_pos)?;
                if nul != 0 {
                    return Err(ProtocolError::MissingNul(nul_pos));
                }
                sub.kind = ReaderKind::Variant;
                sub.type_in_value = true;
                sub.type_str = sub.value_str;
                sub.type_pos = sig_start;
                sub.value_pos = codec::skip_padding(sub.value_str, after_sig, 8)?;
            }
            basic => return Err(ProtocolError::WrongType(basic)),
        }
        Ok(sub)
    }

    /// Advance to the next sibling value.
    ///
    /// Returns `false` when there is nothing more at this level.
    pub fn next(&mut self) -> Result<bool> {
        let code = match self.current_type()? {
            Some(code) => code,
            None => return Ok(false),
        };
        match self.kind {
            ReaderKind::Array { .. } if self.types_only => {
                // a types-only array has exactly one "element": its type
                self.finished = true;
            }
            ReaderKind::Array { .. } => self.array_next(code)?,
            _ => {
                self.base_next(code)?;
                self.consume_close_delimiter();
            }
        }
        Ok(self.current_type()?.is_some())
    }

    /// Whether another sibling follows the current value.
    pub fn has_next(&self) -> Result<bool> {
        let mut probe = *self;
        probe.next()
    }

    /// Advance past one value at the current level; shared by the body,
    /// struct, dict-entry, and variant kinds.
    fn base_next(&mut self, code: TypeCode) -> Result<()> {
        match code {
            TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant => {
                if self.types_only && code == TypeCode::Variant {
                    // a variant's inner type lives in the value region, so
                    // in the type region it is a single byte
                    self.type_pos += 1;
                    return Ok(());
                }
                let mut sub = self.recurse()?;
                while sub.next()? {}
                if code == TypeCode::Variant {
                    // the sub's type cursor points into the value region;
                    // in our region a variant is one typecode wide
                    self.type_pos += 1;
                } else {
                    self.type_pos = sub.type_pos;
                }
                if !self.types_only {
                    self.value_pos = sub.value_pos;
                }
            }
            TypeCode::Array => {
                if !self.types_only {
                    let element = signature::first_type(self.type_str, self.type_pos + 1)?;
                    self.value_pos =
                        codec::skip_array(self.value_str, self.order, element, self.value_pos)?;
                }
                signature::skip_one_complete_type(self.type_str, &mut self.type_pos)?;
            }
            basic => {
                if !self.types_only {
                    self.value_pos =
                        codec::skip_basic(self.value_str, self.order, basic, self.value_pos)?;
                }
                self.type_pos += 1;
            }
        }
        Ok(())
    }

    /// Advance past one array element.
    fn array_next(&mut self, code: TypeCode) -> Result<()> {
        let ReaderKind::Array { start, .. } = self.kind else { unreachable!() };
        let end = start + self.array_region_len()? as usize;

        match code {
            TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant => {
                let mut sub = self.recurse()?;
                while sub.next()? {}
                self.value_pos = sub.value_pos;
            }
            TypeCode::Array => {
                let element = signature::first_type(self.type_str, self.type_pos + 1)?;
                self.value_pos =
                    codec::skip_array(self.value_str, self.order, element, self.value_pos)?;
            }
            basic => {
                self.value_pos =
                    codec::skip_basic(self.value_str, self.order, basic, self.value_pos)?;
            }
        }

        if self.value_pos > end {
            return Err(ProtocolError::ArrayOverrun {
                at: start,
                len: (self.value_pos - start) as u32,
            });
        }
        if self.value_pos == end {
            // consume the element type so the parent sees a finished reader
            signature::skip_one_complete_type(self.type_str, &mut self.type_pos)?;
        }
        Ok(())
    }

    /// After advancing inside a struct or dict entry, step over the
    /// closing delimiter and mark the reader finished.
    fn consume_close_delimiter(&mut self) {
        let close = match self.kind {
            ReaderKind::Struct => STRUCT_END,
            ReaderKind::DictEntry => DICT_ENTRY_END,
            _ => return,
        };
        if self.type_str.get(self.type_pos) == Some(&close) {
            self.type_pos += 1;
            self.finished = true;
        }
    }

    /// Length of this array reader's element region.
    fn array_region_len(&self) -> Result<u32> {
        let ReaderKind::Array { start, len_offset } = self.kind else {
            return Err(ProtocolError::EndOfValues);
        };
        let len_pos = start - len_offset as usize - 4;
        let (len, _) = codec::get_u32(self.value_str, self.order, len_pos)?;
        Ok(len)
    }
}
