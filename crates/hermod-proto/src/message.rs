//! Framed messages: fixed header, header-field region, body.
//!
//! Wire layout, in the declared byte order:
//!
//! ```text
//! [0]  byte order tag, `l` or `B`
//! [1]  message type
//! [2]  flags
//! [3]  protocol version
//! [4]  body length (u32)
//! [8]  serial (u32, nonzero)
//! [12] header fields, marshaled as a value of type a(yv)
//!      padding to the next 8-byte boundary
//! [..] body, marshaled against the signature header field
//! ```
//!
//! The fixed prefix is parsed zero-copy from raw byte arrays; everything
//! after it goes through the ordinary recursive reader, so the header
//! fields exercise the same code paths as message bodies.

use bytes::Bytes;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    codec::{self, ByteOrder},
    errors::{ProtocolError, Result},
    names,
    reader::TypeReader,
    signature::Signature,
    value::{Value, unmarshal_values},
    writer::MarshalBlock,
};

/// Protocol version accepted and emitted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum total size of one message frame.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Maximum byte length of one array's element region.
pub const MAX_ARRAY_LENGTH: u32 = 1 << 26;

/// Size of the fixed header prefix.
pub const FIXED_HEADER_LEN: usize = 12;

/// Bytes needed before the total frame length is known.
pub const MIN_HEADER_LEN: usize = 16;

bitflags::bitflags! {
    /// Per-message flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// The sender does not want a method return
        const NO_REPLY_EXPECTED = 0x1;
        /// Do not activate the destination service
        const NO_AUTO_START = 0x2;
    }
}

/// The four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A request addressed to a named service
    MethodCall = 1,
    /// The successful reply to a method call
    MethodReturn = 2,
    /// The failure reply to a method call
    Error = 3,
    /// A broadcast delivered through match rules
    Signal = 4,
}

impl MessageType {
    /// Parse a wire type code.
    pub fn from_u8(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Header field codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderFieldCode {
    /// Object path the message is about
    Path = 1,
    /// Interface of the member
    Interface = 2,
    /// Method or signal name
    Member = 3,
    /// Error name, on error messages
    ErrorName = 4,
    /// Serial of the message being replied to
    ReplySerial = 5,
    /// Intended recipient name
    Destination = 6,
    /// Name of the sending connection, stamped by the broker
    Sender = 7,
    /// Signature of the body
    Signature = 8,
}

/// Fixed 12-byte header prefix, stored as raw bytes.
///
/// Multi-byte fields are byte arrays rather than integers so the struct
/// has no alignment requirements and any 12 bytes parse; interpretation
/// honors the byte-order tag.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FixedHeader {
    order: u8,
    message_type: u8,
    flags: u8,
    version: u8,
    body_len: [u8; 4],
    serial: [u8; 4],
}

impl FixedHeader {
    fn body_len(&self, order: ByteOrder) -> u32 {
        match order {
            ByteOrder::Little => u32::from_le_bytes(self.body_len),
            ByteOrder::Big => u32::from_be_bytes(self.body_len),
        }
    }

    fn serial(&self, order: ByteOrder) -> u32 {
        match order {
            ByteOrder::Little => u32::from_le_bytes(self.serial),
            ByteOrder::Big => u32::from_be_bytes(self.serial),
        }
    }
}

/// One bus message.
///
/// Header fields are owned; the body is kept as marshaled bytes together
/// with its signature and decoded on demand.
#[derive(Debug, Clone)]
pub struct Message {
    order: ByteOrder,
    message_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Signature,
    body: Bytes,
}

impl Message {
    fn empty(message_type: MessageType) -> Message {
        Message {
            order: ByteOrder::Little,
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Bytes::new(),
        }
    }

    /// Build a method call.
    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Message> {
        if let Some(dest) = destination {
            check_name("bus name", dest, names::is_valid_bus_name)?;
        }
        check_name("object path", path, names::is_valid_object_path)?;
        if let Some(interface) = interface {
            check_name("interface name", interface, names::is_valid_interface_name)?;
        }
        check_name("member name", member, names::is_valid_member_name)?;

        let mut message = Message::empty(MessageType::MethodCall);
        message.destination = destination.map(str::to_owned);
        message.path = Some(path.to_owned());
        message.interface = interface.map(str::to_owned);
        message.member = Some(member.to_owned());
        Ok(message)
    }

    /// Build a signal.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        check_name("object path", path, names::is_valid_object_path)?;
        check_name("interface name", interface, names::is_valid_interface_name)?;
        check_name("member name", member, names::is_valid_member_name)?;

        let mut message = Message::empty(MessageType::Signal);
        message.path = Some(path.to_owned());
        message.interface = Some(interface.to_owned());
        message.member = Some(member.to_owned());
        Ok(message)
    }

    /// Build the successful reply to `call`.
    pub fn method_return(call: &Message) -> Message {
        let mut message = Message::empty(MessageType::MethodReturn);
        message.flags = MessageFlags::NO_REPLY_EXPECTED;
        message.destination = call.sender.clone();
        message.reply_serial = Some(call.serial);
        message
    }

    /// Build the error reply to `call`.
    pub fn error_reply(call: &Message, error_name: &str, text: &str) -> Result<Message> {
        check_name("error name", error_name, names::is_valid_error_name)?;
        let mut message = Message::empty(MessageType::Error);
        message.flags = MessageFlags::NO_REPLY_EXPECTED;
        message.destination = call.sender.clone();
        message.error_name = Some(error_name.to_owned());
        message.reply_serial = Some(call.serial);
        message.set_body(&[Value::Str(text.to_owned())])?;
        Ok(message)
    }

    /// Marshal `values` into the body, replacing any existing one.
    pub fn set_body(&mut self, values: &[Value]) -> Result<()> {
        let (signature, body) = crate::value::marshal_values(self.order, values)?;
        self.signature = signature;
        self.body = Bytes::from(body);
        Ok(())
    }

    /// Decode the body against its signature.
    pub fn body_values(&self) -> Result<Vec<Value>> {
        unmarshal_values(self.order, &self.signature, &self.body)
    }

    /// A reader over the raw body.
    pub fn body_reader(&self) -> TypeReader<'_> {
        TypeReader::new(self.order, self.signature.as_bytes(), &self.body)
    }

    /// Message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Byte order the message is marshaled in.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Flags.
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Serial, zero until assigned by the sending connection.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Assign the sender-scoped serial.
    pub fn set_serial(&mut self, serial: u32) {
        debug_assert_ne!(serial, 0, "serials start at 1");
        self.serial = serial;
    }

    /// Object path field.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Interface field.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Member field.
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Error name field.
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// Reply serial field.
    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    /// Destination field.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Replace the destination field.
    pub fn set_destination(&mut self, destination: Option<&str>) -> Result<()> {
        if let Some(dest) = destination {
            check_name("bus name", dest, names::is_valid_bus_name)?;
        }
        self.destination = destination.map(str::to_owned);
        Ok(())
    }

    /// Sender field.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Stamp the sender field; the broker does this on every inbound
    /// message from an active connection.
    pub fn set_sender(&mut self, sender: Option<&str>) -> Result<()> {
        if let Some(sender) = sender {
            check_name("bus name", sender, names::is_valid_bus_name)?;
        }
        self.sender = sender.map(str::to_owned);
        Ok(())
    }

    /// Body signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether this is a signal with the given interface and member.
    pub fn is_signal(&self, interface: &str, member: &str) -> bool {
        self.message_type == MessageType::Signal
            && self.interface.as_deref() == Some(interface)
            && self.member.as_deref() == Some(member)
    }

    /// Whether the sender wants a method return.
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Serialize into one frame.
    ///
    /// Writes the fixed 12-byte prefix, the header-field region as a
    /// marshaled `a(yv)` value, padding to the next 8-byte boundary,
    /// and the body bytes, then back-patches the body length word.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ZeroSerial`] if no serial has been
    /// assigned yet (serials are given out by the sending connection,
    /// so an unsent message cannot be framed), and
    /// [`ProtocolError::MessageTooLarge`] if the assembled frame would
    /// exceed [`MAX_MESSAGE_SIZE`]. Nothing is returned partially: a
    /// failed encode yields no bytes.
    ///
    /// # Invariants
    ///
    /// - **Self-consistency**: the body length word always matches the
    ///   body bytes actually appended, and the body begins 8-aligned
    ///   from the start of the frame. A frame produced here is always
    ///   accepted by [`Message::decode`], field for field.
    ///
    /// - **No validation**: header fields were validated when they were
    ///   set (constructors and setters check name syntax), so encoding
    ///   is pure assembly. Required-field rules per message type are
    ///   only enforced on decode; a hand-built message missing, say,
    ///   its interface still encodes, and is rejected by the peer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }

        let mut block = MarshalBlock::new();
        block.body.extend_from_slice(&[
            self.order.tag(),
            self.message_type as u8,
            self.flags.bits(),
            PROTOCOL_VERSION,
        ]);
        // body length is patched once the body is in place
        block.body.extend_from_slice(&[0; 4]);
        match self.order {
            ByteOrder::Little => block.body.extend_from_slice(&self.serial.to_le_bytes()),
            ByteOrder::Big => block.body.extend_from_slice(&self.serial.to_be_bytes()),
        }

        let mut writer = block.writer(self.order);
        self.header_fields()?.marshal(&mut writer, &mut block)?;
        codec::pad_to(&mut block.body, 8);
        block.body.extend_from_slice(&self.body);
        codec::set_u32(&mut block.body, self.order, 4, self.body.len() as u32);

        if block.body.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: block.body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(block.body)
    }

    /// The header-field region as a value of type `a(yv)`.
    fn header_fields(&self) -> Result<Value> {
        let mut items = Vec::new();
        let mut push = |code: HeaderFieldCode, value: Value| {
            items.push(Value::Struct(vec![
                Value::Byte(code as u8),
                Value::Variant(Box::new(value)),
            ]));
        };

        if let Some(path) = &self.path {
            push(HeaderFieldCode::Path, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(HeaderFieldCode::Interface, Value::Str(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(HeaderFieldCode::Member, Value::Str(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(HeaderFieldCode::ErrorName, Value::Str(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(HeaderFieldCode::ReplySerial, Value::Uint32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(HeaderFieldCode::Destination, Value::Str(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(HeaderFieldCode::Sender, Value::Str(sender.clone()));
        }
        if !self.signature.is_empty() {
            push(HeaderFieldCode::Signature, Value::Signature(self.signature.clone()));
        }

        Ok(Value::Array { element: Signature::new("(yv)")?, items })
    }

    /// Total frame length, once enough bytes are buffered to know it.
    ///
    /// Returns `Ok(None)` while fewer than [`MIN_HEADER_LEN`] bytes are
    /// available. Errors are unrecoverable for the connection.
    pub fn required_len(buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < MIN_HEADER_LEN {
            return Ok(None);
        }
        let (fixed, _) = FixedHeader::ref_from_prefix(buf)
            .map_err(|_| ProtocolError::Truncated { at: 0, needed: FIXED_HEADER_LEN, available: buf.len() })?;
        let order = ByteOrder::from_tag(fixed.order)?;
        let (fields_len, _) = codec::get_u32(buf, order, FIXED_HEADER_LEN)?;

        let header_end = MIN_HEADER_LEN
            .checked_add(fields_len as usize)
            .ok_or(ProtocolError::ArrayTooLong(fields_len))?;
        let total = codec::align_up(header_end, 8)
            .checked_add(fixed.body_len(order) as usize)
            .ok_or(ProtocolError::MessageTooLarge { size: usize::MAX, max: MAX_MESSAGE_SIZE })?;
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: total, max: MAX_MESSAGE_SIZE });
        }
        Ok(Some(total))
    }

    /// Parse one complete frame.
    ///
    /// `frame` must be exactly the length reported by
    /// [`Message::required_len`]; the connection layer slices frames
    /// out of its read buffer before calling this.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for every way untrusted bytes can be
    /// malformed, without panicking:
    ///
    /// - [`ProtocolError::InvalidByteOrder`],
    ///   [`ProtocolError::UnknownMessageType`],
    ///   [`ProtocolError::UnsupportedVersion`], and
    ///   [`ProtocolError::ZeroSerial`] for a bad fixed prefix
    /// - decode failures from the recursive reader (truncation, array
    ///   overruns, bad type codes) while walking the field region or
    ///   verifying the body
    /// - [`ProtocolError::DuplicateHeaderField`],
    ///   [`ProtocolError::BadHeaderFieldType`],
    ///   [`ProtocolError::MissingRequiredField`], and
    ///   [`ProtocolError::InvalidName`] for well-framed but
    ///   inconsistent headers
    /// - [`ProtocolError::BodyLengthMismatch`] when the declared body
    ///   length disagrees with the frame
    ///
    /// The caller treats any of these as fatal for the sending
    /// connection.
    ///
    /// # Security
    ///
    /// - **Bounded first**: the total size is capped at
    ///   [`MAX_MESSAGE_SIZE`] and the fixed prefix validated before
    ///   anything else is touched, so oversized or garbage frames are
    ///   rejected cheaply.
    ///
    /// - **One code path**: the header-field region is decoded by the
    ///   same recursive reader as message bodies, driven by the fixed
    ///   `a(yv)` signature. There is no hand-rolled header parser to
    ///   diverge from the marshaling rules.
    ///
    /// - **Fully checked body**: the body is walked against its
    ///   signature before the message is returned, so every later
    ///   `body_values` call operates on bytes already known to be
    ///   well-typed, with no length word pointing outside the frame.
    ///
    /// - **Unknown fields skipped**: field codes above the known range
    ///   are decoded (so their bytes are bounds-checked) and then
    ///   ignored, keeping the format forward compatible.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let (fixed, _) = FixedHeader::ref_from_prefix(frame).map_err(|_| {
            ProtocolError::Truncated { at: 0, needed: FIXED_HEADER_LEN, available: frame.len() }
        })?;
        let order = ByteOrder::from_tag(fixed.order)?;
        let message_type = MessageType::from_u8(fixed.message_type)
            .ok_or(ProtocolError::UnknownMessageType(fixed.message_type))?;
        if fixed.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(fixed.version));
        }
        let serial = fixed.serial(order);
        if serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }

        // the field region is an ordinary marshaled a(yv) value
        let mut reader = TypeReader::new_at(order, b"a(yv)", 0, frame, FIXED_HEADER_LEN);
        let fields = Value::unmarshal(&reader)?;
        reader.next()?;
        let body_start = codec::align_up(reader.value_pos(), 8);

        let body_len = fixed.body_len(order) as usize;
        let actual = frame.len().saturating_sub(body_start);
        if body_start > frame.len() || actual != body_len {
            return Err(ProtocolError::BodyLengthMismatch { header: body_len, actual });
        }

        let mut message = Message::empty(message_type);
        message.order = order;
        message.flags = MessageFlags::from_bits_truncate(fixed.flags);
        message.serial = serial;
        message.apply_header_fields(fields)?;
        message.body = Bytes::copy_from_slice(&frame[body_start..]);

        message.check_required_fields()?;
        // verify the body is well-typed against its signature
        unmarshal_values(order, &message.signature, &message.body)?;
        Ok(message)
    }

    fn apply_header_fields(&mut self, fields: Value) -> Result<()> {
        let Value::Array { items, .. } = fields else {
            return Err(ProtocolError::BadHeaderFieldType { field: 0 });
        };
        let mut seen = [false; 9];
        for entry in items {
            let Value::Struct(mut pair) = entry else {
                return Err(ProtocolError::BadHeaderFieldType { field: 0 });
            };
            // signature-driven decode guarantees the (yv) shape
            let Some(Value::Variant(inner)) = pair.pop() else {
                return Err(ProtocolError::BadHeaderFieldType { field: 0 });
            };
            let Some(Value::Byte(code)) = pair.pop() else {
                return Err(ProtocolError::BadHeaderFieldType { field: 0 });
            };
            if let Some(slot) = seen.get_mut(code as usize) {
                if *slot {
                    return Err(ProtocolError::DuplicateHeaderField(code));
                }
                *slot = true;
            }
            let inner = *inner;
            match code {
                1 => {
                    let Value::ObjectPath(path) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("object path", &path, names::is_valid_object_path)?;
                    self.path = Some(path);
                }
                2 => {
                    let Value::Str(interface) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("interface name", &interface, names::is_valid_interface_name)?;
                    self.interface = Some(interface);
                }
                3 => {
                    let Value::Str(member) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("member name", &member, names::is_valid_member_name)?;
                    self.member = Some(member);
                }
                4 => {
                    let Value::Str(error_name) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("error name", &error_name, names::is_valid_error_name)?;
                    self.error_name = Some(error_name);
                }
                5 => {
                    let Value::Uint32(reply_serial) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    self.reply_serial = Some(reply_serial);
                }
                6 => {
                    let Value::Str(destination) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("bus name", &destination, names::is_valid_bus_name)?;
                    self.destination = Some(destination);
                }
                7 => {
                    let Value::Str(sender) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    check_name("bus name", &sender, names::is_valid_bus_name)?;
                    self.sender = Some(sender);
                }
                8 => {
                    let Value::Signature(signature) = inner else {
                        return Err(ProtocolError::BadHeaderFieldType { field: code });
                    };
                    self.signature = signature;
                }
                // unknown fields are skipped for forward compatibility
                _ => {}
            }
        }
        Ok(())
    }

    fn check_required_fields(&self) -> Result<()> {
        let missing = |field: HeaderFieldCode| ProtocolError::MissingRequiredField {
            message_type: self.message_type as u8,
            field: field as u8,
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(missing(HeaderFieldCode::Path));
                }
                if self.member.is_none() {
                    return Err(missing(HeaderFieldCode::Member));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(missing(HeaderFieldCode::ReplySerial));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return Err(missing(HeaderFieldCode::ErrorName));
                }
                if self.reply_serial.is_none() {
                    return Err(missing(HeaderFieldCode::ReplySerial));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return Err(missing(HeaderFieldCode::Path));
                }
                if self.interface.is_none() {
                    return Err(missing(HeaderFieldCode::Interface));
                }
                if self.member.is_none() {
                    return Err(missing(HeaderFieldCode::Member));
                }
            }
        }
        Ok(())
    }
}

fn check_name(what: &'static str, value: &str, valid: fn(&str) -> bool) -> Result<()> {
    if valid(value) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName { what, value: value.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call() -> Message {
        let mut message = Message::method_call(
            Some("com.example.Service"),
            "/com/example/Service",
            Some("com.example.Interface"),
            "Frobnicate",
        )
        .unwrap();
        message
            .set_body(&[Value::Uint32(31), Value::Str("arg".into())])
            .unwrap();
        message.set_serial(7);
        message
    }

    #[test]
    fn frame_round_trip() {
        let message = sample_call();
        let frame = message.encode().unwrap();

        assert_eq!(Message::required_len(&frame).unwrap(), Some(frame.len()));

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.message_type(), MessageType::MethodCall);
        assert_eq!(decoded.serial(), 7);
        assert_eq!(decoded.destination(), Some("com.example.Service"));
        assert_eq!(decoded.path(), Some("/com/example/Service"));
        assert_eq!(decoded.interface(), Some("com.example.Interface"));
        assert_eq!(decoded.member(), Some("Frobnicate"));
        assert_eq!(decoded.signature().as_str(), "us");
        assert_eq!(
            decoded.body_values().unwrap(),
            vec![Value::Uint32(31), Value::Str("arg".into())]
        );
    }

    #[test]
    fn body_begins_on_eight_byte_boundary() {
        let message = sample_call();
        let frame = message.encode().unwrap();
        let body_len = message.body().len();
        let body_start = frame.len() - body_len;
        assert_eq!(body_start % 8, 0);
        assert_eq!(&frame[body_start..], message.body().as_ref());
    }

    #[test]
    fn required_len_needs_sixteen_bytes() {
        let frame = sample_call().encode().unwrap();
        for n in 0..MIN_HEADER_LEN {
            assert_eq!(Message::required_len(&frame[..n]).unwrap(), None);
        }
        assert!(Message::required_len(&frame[..MIN_HEADER_LEN]).unwrap().is_some());
    }

    #[test]
    fn zero_serial_cannot_encode() {
        let message = Message::signal("/", "com.example.Iface", "Pulse").unwrap();
        assert_eq!(message.encode().unwrap_err(), ProtocolError::ZeroSerial);
    }

    #[test]
    fn decode_rejects_bad_version_and_type() {
        let frame = sample_call().encode().unwrap();

        let mut bad = frame.clone();
        bad[3] = 9;
        assert_eq!(Message::decode(&bad).unwrap_err(), ProtocolError::UnsupportedVersion(9));

        let mut bad = frame.clone();
        bad[1] = 0;
        assert_eq!(Message::decode(&bad).unwrap_err(), ProtocolError::UnknownMessageType(0));

        let mut bad = frame;
        bad[0] = b'x';
        assert_eq!(Message::decode(&bad).unwrap_err(), ProtocolError::InvalidByteOrder(b'x'));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let frame = sample_call().encode().unwrap();
        let cut = &frame[..frame.len() - 3];
        assert!(matches!(
            Message::decode(cut).unwrap_err(),
            ProtocolError::BodyLengthMismatch { .. }
        ));
    }

    #[test]
    fn error_reply_links_serials() {
        let mut call = sample_call();
        call.set_sender(Some(":1.4")).unwrap();
        let reply =
            Message::error_reply(&call, "org.freedesktop.DBus.Error.Failed", "nope").unwrap();
        assert_eq!(reply.reply_serial(), Some(7));
        assert_eq!(reply.destination(), Some(":1.4"));
        assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.Failed"));
        assert_eq!(reply.signature().as_str(), "s");
    }

    #[test]
    fn signals_require_interface_on_decode() {
        // hand-build a signal, then strip the interface field by
        // re-encoding without it
        let mut message = Message::empty(MessageType::Signal);
        message.path = Some("/".into());
        message.member = Some("Ping".into());
        message.set_serial(1);
        let frame = message.encode().unwrap();
        assert!(matches!(
            Message::decode(&frame).unwrap_err(),
            ProtocolError::MissingRequiredField { field: 2, .. }
        ));
    }

    #[test]
    fn big_endian_frames_decode() {
        let mut message = sample_call();
        message.order = ByteOrder::Big;
        message.set_body(&[Value::Int64(-9)]).unwrap();
        let frame = message.encode().unwrap();
        assert_eq!(frame[0], b'B');
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.byte_order(), ByteOrder::Big);
        assert_eq!(decoded.body_values().unwrap(), vec![Value::Int64(-9)]);
    }
}
