//! Dynamic values: borrowed basics and owned trees.
//!
//! [`Basic`] is what a reader hands out: scalars by value, string-ish
//! types borrowed from the value region. [`Value`] is the owned recursive
//! tree used to build message bodies and inspect decoded ones. The
//! reader and writer remain the ground truth for the wire layout; this
//! module only drives them.

use crate::{
    codec::{self, ByteOrder},
    errors::{ProtocolError, Result},
    reader::TypeReader,
    signature::Signature,
    types::TypeCode,
    writer::{MarshalBlock, TypeWriter},
};

/// One basic value, borrowed from a value region where applicable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Basic<'a> {
    /// `y`
    Byte(u8),
    /// `b`, one byte on the wire
    Bool(bool),
    /// `i`
    I32(i32),
    /// `u`
    U32(u32),
    /// `x`
    I64(i64),
    /// `t`
    U64(u64),
    /// `d`
    F64(f64),
    /// `s`
    Str(&'a str),
    /// `o`
    ObjectPath(&'a str),
    /// `g`, raw signature bytes
    Signature(&'a [u8]),
}

impl Basic<'_> {
    /// The wire type code of this value.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Basic::Byte(_) => TypeCode::Byte,
            Basic::Bool(_) => TypeCode::Boolean,
            Basic::I32(_) => TypeCode::Int32,
            Basic::U32(_) => TypeCode::Uint32,
            Basic::I64(_) => TypeCode::Int64,
            Basic::U64(_) => TypeCode::Uint64,
            Basic::F64(_) => TypeCode::Double,
            Basic::Str(_) => TypeCode::String,
            Basic::ObjectPath(_) => TypeCode::ObjectPath,
            Basic::Signature(_) => TypeCode::Signature,
        }
    }
}

/// Unpack one basic value of the given type at `pos`.
pub(crate) fn get_basic<'a>(
    data: &'a [u8],
    order: ByteOrder,
    code: TypeCode,
    pos: usize,
) -> Result<(Basic<'a>, usize)> {
    match code {
        TypeCode::Byte => {
            let (b, end) = codec::get_byte(data, pos)?;
            Ok((Basic::Byte(b), end))
        }
        TypeCode::Boolean => {
            let (b, end) = codec::get_byte(data, pos)?;
            Ok((Basic::Bool(b != 0), end))
        }
        TypeCode::Int32 => {
            let (v, end) = codec::get_u32(data, order, pos)?;
            Ok((Basic::I32(v as i32), end))
        }
        TypeCode::Uint32 => {
            let (v, end) = codec::get_u32(data, order, pos)?;
            Ok((Basic::U32(v), end))
        }
        TypeCode::Int64 => {
            let (v, end) = codec::get_u64(data, order, pos)?;
            Ok((Basic::I64(v as i64), end))
        }
        TypeCode::Uint64 => {
            let (v, end) = codec::get_u64(data, order, pos)?;
            Ok((Basic::U64(v), end))
        }
        TypeCode::Double => {
            let (v, end) = codec::get_u64(data, order, pos)?;
            Ok((Basic::F64(f64::from_bits(v)), end))
        }
        TypeCode::String => {
            let (s, end) = codec::get_string(data, order, pos)?;
            Ok((Basic::Str(s), end))
        }
        TypeCode::ObjectPath => {
            let (s, end) = codec::get_string(data, order, pos)?;
            Ok((Basic::ObjectPath(s), end))
        }
        TypeCode::Signature => {
            let (s, end) = codec::get_signature_bytes(data, pos)?;
            Ok((Basic::Signature(s), end))
        }
        container => Err(ProtocolError::WrongType(container)),
    }
}

/// Pack one basic value, padding to its alignment first.
pub(crate) fn put_basic(buf: &mut Vec<u8>, order: ByteOrder, value: &Basic<'_>) {
    match value {
        Basic::Byte(b) => buf.push(*b),
        Basic::Bool(b) => buf.push(u8::from(*b)),
        Basic::I32(v) => codec::put_u32(buf, order, *v as u32),
        Basic::U32(v) => codec::put_u32(buf, order, *v),
        Basic::I64(v) => codec::put_u64(buf, order, *v as u64),
        Basic::U64(v) => codec::put_u64(buf, order, *v),
        Basic::F64(v) => codec::put_u64(buf, order, v.to_bits()),
        Basic::Str(s) => codec::put_string(buf, order, s),
        Basic::ObjectPath(s) => codec::put_string(buf, order, s),
        Basic::Signature(s) => codec::put_signature(buf, s),
    }
}

/// An owned value tree of any complete type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Bool(bool),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`
    Str(String),
    /// `o`
    ObjectPath(String),
    /// `g`
    Signature(Signature),
    /// `a` with an explicit element signature so empty arrays stay typed
    Array {
        /// Signature of one element
        element: Signature,
        /// The elements, each matching `element`
        items: Vec<Value>,
    },
    /// `(`…`)`
    Struct(Vec<Value>),
    /// `{`…`}`, only valid inside an array
    DictEntry(Box<Value>, Box<Value>),
    /// `v`
    Variant(Box<Value>),
}

impl Value {
    /// The outermost type code of this value.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Byte(_) => TypeCode::Byte,
            Value::Bool(_) => TypeCode::Boolean,
            Value::Int32(_) => TypeCode::Int32,
            Value::Uint32(_) => TypeCode::Uint32,
            Value::Int64(_) => TypeCode::Int64,
            Value::Uint64(_) => TypeCode::Uint64,
            Value::Double(_) => TypeCode::Double,
            Value::Str(_) => TypeCode::String,
            Value::ObjectPath(_) => TypeCode::ObjectPath,
            Value::Signature(_) => TypeCode::Signature,
            Value::Array { .. } => TypeCode::Array,
            Value::Struct(_) => TypeCode::Struct,
            Value::DictEntry(..) => TypeCode::DictEntry,
            Value::Variant(_) => TypeCode::Variant,
        }
    }

    /// The complete signature of this value.
    ///
    /// Errors only for trees that violate the grammar, e.g. a dict entry
    /// outside an array.
    pub fn signature(&self) -> Result<Signature> {
        let mut text = String::new();
        self.push_signature(&mut text);
        Signature::new(text)
    }

    fn push_signature(&self, out: &mut String) {
        match self {
            Value::Array { element, .. } => {
                out.push('a');
                out.push_str(element.as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.push_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(key, value) => {
                out.push('{');
                key.push_signature(out);
                value.push_signature(out);
                out.push('}');
            }
            Value::Variant(_) => out.push('v'),
            basic => out.push(basic.type_code() as u8 as char),
        }
    }

    /// View a basic value as a [`Basic`] borrow.
    fn as_basic(&self) -> Option<Basic<'_>> {
        Some(match self {
            Value::Byte(b) => Basic::Byte(*b),
            Value::Bool(b) => Basic::Bool(*b),
            Value::Int32(v) => Basic::I32(*v),
            Value::Uint32(v) => Basic::U32(*v),
            Value::Int64(v) => Basic::I64(*v),
            Value::Uint64(v) => Basic::U64(*v),
            Value::Double(v) => Basic::F64(*v),
            Value::Str(s) => Basic::Str(s),
            Value::ObjectPath(s) => Basic::ObjectPath(s),
            Value::Signature(s) => Basic::Signature(s.as_bytes()),
            _ => return None,
        })
    }

    /// String payload of `s` and `o` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    /// Payload of `u` values.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    /// Payload of `b` values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Marshal this value through `writer` into `block`.
    pub fn marshal(&self, writer: &mut TypeWriter, block: &mut MarshalBlock) -> Result<()> {
        match self {
            Value::Array { element, items } => {
                let mut sub = writer.recurse(block, TypeCode::Array, Some(element.as_bytes()))?;
                for item in items {
                    item.marshal(&mut sub, block)?;
                }
                writer.unrecurse(block, sub)
            }
            Value::Struct(fields) => {
                let mut sub = writer.recurse(block, TypeCode::Struct, None)?;
                for field in fields {
                    field.marshal(&mut sub, block)?;
                }
                writer.unrecurse(block, sub)
            }
            Value::DictEntry(key, value) => {
                let mut sub = writer.recurse(block, TypeCode::DictEntry, None)?;
                key.marshal(&mut sub, block)?;
                value.marshal(&mut sub, block)?;
                writer.unrecurse(block, sub)
            }
            Value::Variant(inner) => {
                let contained = inner.signature()?;
                let mut sub =
                    writer.recurse(block, TypeCode::Variant, Some(contained.as_bytes()))?;
                inner.marshal(&mut sub, block)?;
                writer.unrecurse(block, sub)
            }
            basic => {
                let basic = basic.as_basic().expect("non-container value");
                writer.write_basic(block, &basic)
            }
        }
    }

    /// Read the value at the reader's current position, without
    /// advancing the reader.
    pub fn unmarshal(reader: &TypeReader<'_>) -> Result<Value> {
        let code = reader.current_type()?.ok_or(ProtocolError::EndOfValues)?;
        match code {
            TypeCode::Array => {
                let mut sub = reader.recurse()?;
                let element = Signature::from_bytes(sub.signature_of_current()?)?;
                let mut items = Vec::new();
                while sub.current_type()?.is_some() {
                    items.push(Value::unmarshal(&sub)?);
                    sub.next()?;
                }
                Ok(Value::Array { element, items })
            }
            TypeCode::Struct => {
                let mut sub = reader.recurse()?;
                let mut fields = Vec::new();
                while sub.current_type()?.is_some() {
                    fields.push(Value::unmarshal(&sub)?);
                    sub.next()?;
                }
                Ok(Value::Struct(fields))
            }
            TypeCode::DictEntry => {
                let mut sub = reader.recurse()?;
                let key = Value::unmarshal(&sub)?;
                sub.next()?;
                let value = Value::unmarshal(&sub)?;
                Ok(Value::DictEntry(Box::new(key), Box::new(value)))
            }
            TypeCode::Variant => {
                let sub = reader.recurse()?;
                Ok(Value::Variant(Box::new(Value::unmarshal(&sub)?)))
            }
            _basic => {
                let basic = reader.read_basic()?;
                Ok(match basic {
                    Basic::Byte(b) => Value::Byte(b),
                    Basic::Bool(b) => Value::Bool(b),
                    Basic::I32(v) => Value::Int32(v),
                    Basic::U32(v) => Value::Uint32(v),
                    Basic::I64(v) => Value::Int64(v),
                    Basic::U64(v) => Value::Uint64(v),
                    Basic::F64(v) => Value::Double(v),
                    Basic::Str(s) => Value::Str(s.to_owned()),
                    Basic::ObjectPath(s) => Value::ObjectPath(s.to_owned()),
                    Basic::Signature(s) => Value::Signature(Signature::from_bytes(s)?),
                })
            }
        }
    }
}

/// Marshal a sequence of values into a fresh signature and body.
pub fn marshal_values(order: ByteOrder, values: &[Value]) -> Result<(Signature, Vec<u8>)> {
    let mut block = MarshalBlock::new();
    let mut writer = block.writer(order);
    for value in values {
        value.marshal(&mut writer, &mut block)?;
    }
    let signature = Signature::from_bytes(&block.signature)?;
    Ok((signature, block.body))
}

/// Decode a full body against its signature.
///
/// Every byte of `body` must belong to some value; trailing bytes are a
/// decode failure.
pub fn unmarshal_values(order: ByteOrder, signature: &Signature, body: &[u8]) -> Result<Vec<Value>> {
    let mut reader = TypeReader::new(order, signature.as_bytes(), body);
    let mut values = Vec::new();
    while reader.current_type()?.is_some() {
        values.push(Value::unmarshal(&reader)?);
        reader.next()?;
    }
    if reader.value_pos() != body.len() {
        return Err(ProtocolError::TrailingBytes(reader.value_pos()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(values: &[Value]) {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let (sig, body) = marshal_values(order, values).expect("marshal");
            let decoded = unmarshal_values(order, &sig, &body).expect("unmarshal");
            assert_eq!(decoded, values, "round trip in {order:?}");
        }
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(&[
            Value::Byte(0),
            Value::Bool(true),
            Value::Int32(i32::MIN),
            Value::Uint32(u32::MAX),
            Value::Int64(-1),
            Value::Uint64(u64::MAX),
            Value::Double(std::f64::consts::PI),
            Value::Str(String::new()),
            Value::ObjectPath("/com/example/Thing".into()),
            Value::Signature(Signature::new("a{sv}").unwrap()),
        ]);
    }

    #[test]
    fn nested_containers_round_trip() {
        round_trip(&[Value::Array {
            element: Signature::new("a(iv)").unwrap(),
            items: vec![
                Value::Array {
                    element: Signature::new("(iv)").unwrap(),
                    items: vec![Value::Struct(vec![
                        Value::Int32(1),
                        Value::Variant(Box::new(Value::Str("deep".into()))),
                    ])],
                },
                Value::Array { element: Signature::new("(iv)").unwrap(), items: vec![] },
            ],
        }]);
    }

    #[test]
    fn string_and_signature_arrays_round_trip() {
        round_trip(&[
            Value::Array {
                element: Signature::new("s").unwrap(),
                items: vec![
                    Value::Str("one".into()),
                    Value::Str(String::new()),
                    Value::Str("three".into()),
                ],
            },
            Value::Array {
                element: Signature::new("g").unwrap(),
                items: vec![
                    Value::Signature(Signature::new("i").unwrap()),
                    Value::Signature(Signature::empty()),
                ],
            },
        ]);
    }

    #[test]
    fn dict_round_trips_inside_array() {
        round_trip(&[Value::Array {
            element: Signature::new("{sv}").unwrap(),
            items: vec![
                Value::DictEntry(
                    Box::new(Value::Str("k1".into())),
                    Box::new(Value::Variant(Box::new(Value::Int32(7)))),
                ),
                Value::DictEntry(
                    Box::new(Value::Str("k2".into())),
                    Box::new(Value::Variant(Box::new(Value::Str("x".into())))),
                ),
            ],
        }]);
    }

    #[test]
    fn dict_entry_outside_array_has_no_signature() {
        let entry =
            Value::DictEntry(Box::new(Value::Str("k".into())), Box::new(Value::Byte(1)));
        assert!(entry.signature().is_err());
    }

    #[test]
    fn trailing_body_bytes_are_rejected() {
        let (sig, mut body) = marshal_values(ByteOrder::Little, &[Value::Uint32(5)]).unwrap();
        body.push(0);
        assert_eq!(
            unmarshal_values(ByteOrder::Little, &sig, &body).unwrap_err(),
            ProtocolError::TrailingBytes(4)
        );
    }

    #[test]
    fn signatures_compose() {
        let value = Value::Struct(vec![
            Value::Int32(1),
            Value::Str("s".into()),
            Value::Array {
                element: Signature::new("{sv}").unwrap(),
                items: vec![],
            },
        ]);
        assert_eq!(value.signature().unwrap().as_str(), "(isa{sv})");
    }
}
