//! Negative-space fuzzer for message decoding.
//!
//! Arbitrary bytes must never panic the decoder, and anything that does
//! decode must re-encode into a frame that decodes to the same header
//! fields and body.

#![no_main]

use hermod_proto::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // INVARIANT 1: framing on a partial buffer never panics
    let _ = Message::required_len(data);

    // INVARIANT 2: decoding never panics, only errors
    let Ok(message) = Message::decode(data) else {
        return;
    };

    // INVARIANT 3: whatever decoded must survive a re-encode round trip
    let encoded = message.encode().expect("decoded messages re-encode");
    let again = Message::decode(&encoded).expect("re-encoded frames decode");

    assert_eq!(again.message_type(), message.message_type());
    assert_eq!(again.serial(), message.serial());
    assert_eq!(again.path(), message.path());
    assert_eq!(again.interface(), message.interface());
    assert_eq!(again.member(), message.member());
    assert_eq!(again.error_name(), message.error_name());
    assert_eq!(again.reply_serial(), message.reply_serial());
    assert_eq!(again.destination(), message.destination());
    assert_eq!(again.sender(), message.sender());
    assert_eq!(again.signature(), message.signature());
    assert_eq!(again.body(), message.body());
});
