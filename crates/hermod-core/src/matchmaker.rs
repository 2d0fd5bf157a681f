//! Rule storage and signal fan-out.
//!
//! Rules are kept in one registration-ordered list so recipients come
//! back in a stable order. A connection with several matching rules
//! still receives exactly one copy.

use hermod_proto::Message;

use crate::{connection::ConnectionId, rules::MatchRule};

/// The broker's rule table.
#[derive(Debug, Default)]
pub struct Matchmaker {
    /// Registration order is delivery order
    rules: Vec<(ConnectionId, MatchRule)>,
}

impl Matchmaker {
    /// Empty table.
    pub fn new() -> Matchmaker {
        Matchmaker::default()
    }

    /// Register a rule for `conn`.
    pub fn add(&mut self, conn: ConnectionId, rule: MatchRule) {
        self.rules.push((conn, rule));
    }

    /// Remove the first rule of `conn` equal to `rule`.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, conn: ConnectionId, rule: &MatchRule) -> bool {
        let position = self
            .rules
            .iter()
            .position(|(owner, existing)| *owner == conn && existing == rule);
        match position {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every rule belonging to `conn`.
    pub fn remove_connection(&mut self, conn: ConnectionId) {
        self.rules.retain(|(owner, _)| *owner != conn);
    }

    /// Number of registered rules, for diagnostics.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Connections whose rules match `message`, in registration order,
    /// at most once each, never the sender or the addressed recipient.
    pub fn recipients(
        &self,
        message: &Message,
        sender: Option<ConnectionId>,
        addressed_recipient: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let mut recipients = Vec::new();
        for (owner, rule) in &self.rules {
            if Some(*owner) == sender || Some(*owner) == addressed_recipient {
                continue;
            }
            if recipients.contains(owner) {
                continue;
            }
            if rule.matches(message) {
                recipients.push(*owner);
            }
        }
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_proto::Message;

    fn signal() -> Message {
        let mut message = Message::signal("/", "com.example.Iface", "Ping").unwrap();
        message.set_sender(Some(":1.0")).unwrap();
        message
    }

    fn rule(text: &str) -> MatchRule {
        MatchRule::parse(text).unwrap()
    }

    #[test]
    fn recipients_in_registration_order_without_duplicates() {
        let mut matchmaker = Matchmaker::new();
        matchmaker.add(3, rule("type='signal'"));
        matchmaker.add(1, rule("interface='com.example.Iface'"));
        // a second matching rule on connection 3 must not double-deliver
        matchmaker.add(3, rule("member='Ping'"));

        let recipients = matchmaker.recipients(&signal(), None, None);
        assert_eq!(recipients, vec![3, 1]);
    }

    #[test]
    fn sender_and_addressed_recipient_are_excluded() {
        let mut matchmaker = Matchmaker::new();
        matchmaker.add(1, rule("type='signal'"));
        matchmaker.add(2, rule("type='signal'"));
        matchmaker.add(3, rule("type='signal'"));

        let recipients = matchmaker.recipients(&signal(), Some(1), Some(2));
        assert_eq!(recipients, vec![3]);
    }

    #[test]
    fn remove_takes_only_the_first_equal_rule() {
        let mut matchmaker = Matchmaker::new();
        matchmaker.add(1, rule("type='signal'"));
        matchmaker.add(1, rule("type='signal'"));
        assert!(matchmaker.remove(1, &rule("type='signal'")));
        assert_eq!(matchmaker.len(), 1);
        assert!(!matchmaker.remove(2, &rule("type='signal'")));
        assert!(matchmaker.remove(1, &rule("type='signal'")));
        assert!(matchmaker.is_empty());
    }

    #[test]
    fn remove_connection_purges_all_rules() {
        let mut matchmaker = Matchmaker::new();
        matchmaker.add(1, rule("type='signal'"));
        matchmaker.add(1, rule("member='Ping'"));
        matchmaker.add(2, rule("type='signal'"));
        matchmaker.remove_connection(1);
        assert_eq!(matchmaker.recipients(&signal(), None, None), vec![2]);
    }
}
