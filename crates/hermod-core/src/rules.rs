//! Match rules: the subscription filters connections register to
//! receive signals (and, optionally, other message kinds).
//!
//! A rule is a conjunction of optional filters. A message matches when
//! every filter that is present equals the corresponding message field.
//! The textual form is `key='value'` pairs joined by commas; apostrophes
//! quote a span literally and a backslash escapes the next character
//! outside quotes.

use hermod_proto::{Basic, Message, MessageType, TypeCode};
use thiserror::Error;

/// Highest argument index addressable by `argN` filters.
pub const MAX_ARG_INDEX: u8 = 63;

/// Errors from parsing a textual match rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchRuleError {
    /// A key that is not part of the rule vocabulary
    #[error("unknown match rule key \"{0}\"")]
    UnknownKey(String),

    /// The same key appeared twice
    #[error("duplicate match rule key \"{0}\"")]
    DuplicateKey(String),

    /// A key without `=value`
    #[error("match rule key \"{0}\" has no value")]
    MissingValue(String),

    /// A quote that never closes
    #[error("unterminated quote in match rule")]
    UnterminatedQuote,

    /// A trailing backslash with nothing to escape
    #[error("dangling escape in match rule")]
    DanglingEscape,

    /// `type=` with an unknown message type
    #[error("unknown message type \"{0}\" in match rule")]
    BadType(String),

    /// `argN` outside 0..=63
    #[error("argument index out of range in \"{0}\"")]
    BadArgIndex(String),
}

/// A parsed match rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    /// Message type filter
    pub message_type: Option<MessageType>,
    /// Sender name filter, compared against the stamped sender
    pub sender: Option<String>,
    /// Interface filter
    pub interface: Option<String>,
    /// Member filter
    pub member: Option<String>,
    /// Object path filter
    pub path: Option<String>,
    /// Destination filter
    pub destination: Option<String>,
    /// String-argument filters, sorted by index
    pub args: Vec<(u8, String)>,
}

impl MatchRule {
    /// Parse the textual rule form.
    pub fn parse(text: &str) -> Result<MatchRule, MatchRuleError> {
        let mut rule = MatchRule::default();
        for (key, value) in split_pairs(text)? {
            match key.as_str() {
                "type" => {
                    let message_type = match value.as_str() {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        _ => return Err(MatchRuleError::BadType(value)),
                    };
                    set_once(&mut rule.message_type, message_type, &key)?;
                }
                "sender" => set_once(&mut rule.sender, value, &key)?,
                "interface" => set_once(&mut rule.interface, value, &key)?,
                "member" => set_once(&mut rule.member, value, &key)?,
                "path" => set_once(&mut rule.path, value, &key)?,
                "destination" => set_once(&mut rule.destination, value, &key)?,
                _ => {
                    let Some(index_text) = key.strip_prefix("arg") else {
                        return Err(MatchRuleError::UnknownKey(key));
                    };
                    let index: u8 = index_text
                        .parse()
                        .map_err(|_| MatchRuleError::BadArgIndex(key.clone()))?;
                    if index > MAX_ARG_INDEX {
                        return Err(MatchRuleError::BadArgIndex(key));
                    }
                    if rule.args.iter().any(|(existing, _)| *existing == index) {
                        return Err(MatchRuleError::DuplicateKey(key));
                    }
                    rule.args.push((index, value));
                }
            }
        }
        rule.args.sort_by_key(|(index, _)| *index);
        Ok(rule)
    }

    /// Whether every present filter agrees with `message`.
    ///
    /// Comparison short-circuits on the first disagreeing field.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(message_type) = self.message_type {
            if message.message_type() != message_type {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if message.sender() != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if message.interface() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if message.member() != Some(member.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if message.path() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if message.destination() != Some(destination.as_str()) {
                return false;
            }
        }
        for (index, expected) in &self.args {
            if string_arg(message, *index).as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<(), MatchRuleError> {
    if slot.is_some() {
        return Err(MatchRuleError::DuplicateKey(key.to_owned()));
    }
    *slot = Some(value);
    Ok(())
}

/// Split `key='value'` pairs on commas, honoring quotes and escapes.
fn split_pairs(text: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let mut pairs = Vec::new();
    let mut chars = text.chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return Err(MatchRuleError::MissingValue(text.to_owned()));
        }

        let mut value = String::new();
        let mut in_quotes = false;
        loop {
            let Some(c) = chars.next() else {
                if in_quotes {
                    return Err(MatchRuleError::UnterminatedQuote);
                }
                break;
            };
            if in_quotes {
                if c == '\'' {
                    in_quotes = false;
                } else {
                    value.push(c);
                }
            } else {
                match c {
                    '\'' => in_quotes = true,
                    ',' => break,
                    '\\' => {
                        let escaped =
                            chars.next().ok_or(MatchRuleError::DanglingEscape)?;
                        value.push(escaped);
                    }
                    other => value.push(other),
                }
            }
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// The `index`-th top-level body value, if it is a string.
fn string_arg(message: &Message, index: u8) -> Option<String> {
    let mut reader = message.body_reader();
    let mut position = 0u8;
    loop {
        let code = reader.current_type().ok()??;
        if position == index {
            if code != TypeCode::String {
                return None;
            }
            return match reader.read_basic().ok()? {
                Basic::Str(s) => Some(s.to_owned()),
                _ => None,
            };
        }
        if !reader.next().ok()? {
            return None;
        }
        position += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_proto::Value;

    #[test]
    fn parses_the_usual_signal_rule() {
        let rule = MatchRule::parse("type='signal',interface='com.example.Iface'").unwrap();
        assert_eq!(rule.message_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("com.example.Iface"));
        assert_eq!(rule.sender, None);
    }

    #[test]
    fn quoting_and_escapes() {
        let rule = MatchRule::parse(r"member='With,Comma',arg0=plain\'ish").unwrap();
        assert_eq!(rule.member.as_deref(), Some("With,Comma"));
        assert_eq!(rule.args, vec![(0, "plain'ish".to_owned())]);
    }

    #[test]
    fn rejects_bad_rules() {
        assert_eq!(
            MatchRule::parse("flavor='salty'").unwrap_err(),
            MatchRuleError::UnknownKey("flavor".into())
        );
        assert_eq!(
            MatchRule::parse("type='signal',type='error'").unwrap_err(),
            MatchRuleError::DuplicateKey("type".into())
        );
        assert_eq!(
            MatchRule::parse("type='telegram'").unwrap_err(),
            MatchRuleError::BadType("telegram".into())
        );
        assert_eq!(
            MatchRule::parse("member='oops").unwrap_err(),
            MatchRuleError::UnterminatedQuote
        );
        assert_eq!(
            MatchRule::parse("arg64='x'").unwrap_err(),
            MatchRuleError::BadArgIndex("arg64".into())
        );
    }

    fn sample_signal() -> Message {
        let mut message =
            Message::signal("/com/example", "com.example.Iface", "Changed").unwrap();
        message.set_sender(Some(":1.7")).unwrap();
        message
            .set_body(&[Value::Str("first".into()), Value::Uint32(2)])
            .unwrap();
        message
    }

    #[test]
    fn matches_on_all_present_fields() {
        let message = sample_signal();
        let rule = MatchRule::parse(
            "type='signal',sender=':1.7',interface='com.example.Iface',member='Changed',path='/com/example',arg0='first'",
        )
        .unwrap();
        assert!(rule.matches(&message));
    }

    #[test]
    fn any_disagreeing_field_fails_the_match() {
        let message = sample_signal();
        for rule in [
            "type='method_call'",
            "sender=':1.8'",
            "interface='com.example.Other'",
            "member='Unchanged'",
            "path='/elsewhere'",
            "destination=':1.1'",
            "arg0='second'",
            // arg1 is a u32, not a string, so a string filter cannot match
            "arg1='2'",
        ] {
            assert!(!MatchRule::parse(rule).unwrap().matches(&message), "rule {rule}");
        }
    }

    #[test]
    fn empty_rule_matches_everything() {
        assert!(MatchRule::default().matches(&sample_signal()));
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::MatchRule;

        proptest! {
            /// Quoted values survive parsing byte for byte, whatever
            /// they contain.
            #[test]
            fn quoted_values_round_trip(value in "[a-zA-Z0-9_./:,= -]{0,24}") {
                let rule = MatchRule::parse(&format!("member='{value}'")).unwrap();
                prop_assert_eq!(rule.member.as_deref(), Some(value.as_str()));
            }
        }
    }
}
