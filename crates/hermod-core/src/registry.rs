//! Name ownership: unique name issuance and well-known name tracking.
//!
//! Unique names are broker-assigned, begin with `:`, and are never
//! reused. Well-known names have one primary owner and a queue of
//! waiting claimants; releasing or disconnecting promotes the next
//! waiter. Every ownership transition is reported back to the caller so
//! the driver can emit the corresponding signals.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::connection::ConnectionId;

/// Flags accepted by `RequestName`.
pub mod request_flags {
    /// The owner is willing to lose the name to a replacement request
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    /// Take the name from a willing owner instead of queueing
    pub const REPLACE_EXISTING: u32 = 0x2;
    /// Fail instead of waiting in the ownership queue
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Reply codes for `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    /// The caller is now the primary owner
    PrimaryOwner = 1,
    /// The caller waits in the ownership queue
    InQueue = 2,
    /// The name is taken and the caller declined to queue
    Exists = 3,
    /// The caller already owned the name
    AlreadyOwner = 4,
}

/// Reply codes for `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    /// The caller gave the name up
    Released = 1,
    /// Nobody owned the name
    NonExistent = 2,
    /// The caller neither owned nor waited for the name
    NotOwner = 3,
}

/// One ownership transition, for the driver to turn into signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    /// The well-known name that changed hands
    pub name: String,
    /// Previous primary owner, if any
    pub old_owner: Option<ConnectionId>,
    /// New primary owner, if any
    pub new_owner: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy)]
struct OwnerRecord {
    conn: ConnectionId,
    allow_replacement: bool,
    do_not_queue: bool,
}

impl OwnerRecord {
    fn new(conn: ConnectionId, flags: u32) -> OwnerRecord {
        OwnerRecord {
            conn,
            allow_replacement: flags & request_flags::ALLOW_REPLACEMENT != 0,
            do_not_queue: flags & request_flags::DO_NOT_QUEUE != 0,
        }
    }
}

#[derive(Debug, Default)]
struct NameEntry {
    owner: Option<OwnerRecord>,
    queue: VecDeque<OwnerRecord>,
}

/// The broker's name tables.
#[derive(Debug, Default)]
pub struct NameRegistry {
    /// Well-known name state
    names: HashMap<String, NameEntry>,
    /// Unique name to its connection
    unique: HashMap<String, ConnectionId>,
    /// Reverse index: connection to the well-known names it owns
    owned: HashMap<ConnectionId, BTreeSet<String>>,
    next_major: u32,
    next_minor: u32,
}

impl NameRegistry {
    /// Fresh registry; the first issued unique name is `:1.0`.
    pub fn new() -> NameRegistry {
        NameRegistry { next_major: 1, ..NameRegistry::default() }
    }

    /// Issue a never-before-seen unique name and bind it to `conn`.
    pub fn issue_unique_name(&mut self, conn: ConnectionId) -> String {
        let name = format!(":{}.{}", self.next_major, self.next_minor);
        match self.next_minor.checked_add(1) {
            Some(minor) => self.next_minor = minor,
            None => {
                self.next_major += 1;
                self.next_minor = 0;
            }
        }
        self.unique.insert(name.clone(), conn);
        name
    }

    /// The connection owning `name`, unique or well-known.
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        if name.starts_with(':') {
            return self.unique.get(name).copied();
        }
        self.names.get(name).and_then(|entry| entry.owner.map(|o| o.conn))
    }

    /// Whether any connection owns `name`.
    pub fn has_owner(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// All names with an owner: unique names plus owned well-known
    /// names, sorted for stable replies.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.unique.keys().cloned().collect();
        names.extend(
            self.names
                .iter()
                .filter(|(_, entry)| entry.owner.is_some())
                .map(|(name, _)| name.clone()),
        );
        names.sort();
        names
    }

    /// Well-known names owned by `conn`.
    pub fn names_owned_by(&self, conn: ConnectionId) -> Vec<String> {
        self.owned.get(&conn).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    /// Claim `name` for `conn` under the `RequestName` flag rules.
    pub fn request_name(
        &mut self,
        conn: ConnectionId,
        name: &str,
        flags: u32,
    ) -> (RequestNameReply, Option<OwnershipChange>) {
        let record = OwnerRecord::new(conn, flags);
        let entry = self.names.entry(name.to_owned()).or_default();

        match entry.owner {
            None => {
                entry.owner = Some(record);
                self.owned.entry(conn).or_default().insert(name.to_owned());
                (
                    RequestNameReply::PrimaryOwner,
                    Some(OwnershipChange {
                        name: name.to_owned(),
                        old_owner: None,
                        new_owner: Some(conn),
                    }),
                )
            }
            Some(current) if current.conn == conn => {
                // refresh the flags; owners may change their mind about
                // allowing replacement
                entry.owner = Some(record);
                (RequestNameReply::AlreadyOwner, None)
            }
            Some(current) => {
                let may_replace = flags & request_flags::REPLACE_EXISTING != 0
                    && current.allow_replacement;
                if may_replace {
                    entry.owner = Some(record);
                    // the displaced owner waits at the front of the
                    // queue unless it asked never to queue
                    if !current.do_not_queue {
                        entry.queue.retain(|waiting| waiting.conn != current.conn);
                        entry.queue.push_front(current);
                    }
                    entry.queue.retain(|waiting| waiting.conn != conn);
                    if let Some(set) = self.owned.get_mut(&current.conn) {
                        set.remove(name);
                    }
                    self.owned.entry(conn).or_default().insert(name.to_owned());
                    (
                        RequestNameReply::PrimaryOwner,
                        Some(OwnershipChange {
                            name: name.to_owned(),
                            old_owner: Some(current.conn),
                            new_owner: Some(conn),
                        }),
                    )
                } else if record.do_not_queue {
                    (RequestNameReply::Exists, None)
                } else {
                    entry.queue.retain(|waiting| waiting.conn != conn);
                    entry.queue.push_back(record);
                    (RequestNameReply::InQueue, None)
                }
            }
        }
    }

    /// Give up `name` on behalf of `conn`.
    pub fn release_name(
        &mut self,
        conn: ConnectionId,
        name: &str,
    ) -> (ReleaseNameReply, Option<OwnershipChange>) {
        let Some(entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        match entry.owner {
            Some(current) if current.conn == conn => {
                let change = Self::promote(&mut self.owned, entry, name, conn);
                if entry.owner.is_none() && entry.queue.is_empty() {
                    self.names.remove(name);
                }
                (ReleaseNameReply::Released, Some(change))
            }
            Some(_) if entry.queue.iter().any(|waiting| waiting.conn == conn) => {
                entry.queue.retain(|waiting| waiting.conn != conn);
                (ReleaseNameReply::Released, None)
            }
            Some(_) => (ReleaseNameReply::NotOwner, None),
            None => (ReleaseNameReply::NonExistent, None),
        }
    }

    /// Drop every name held or awaited by `conn`; returns the
    /// transitions in name order.
    pub fn drop_connection(&mut self, conn: ConnectionId) -> Vec<OwnershipChange> {
        let mut changes = Vec::new();
        let owned_names = self.names_owned_by(conn);
        for name in owned_names {
            if let Some(entry) = self.names.get_mut(&name) {
                changes.push(Self::promote(&mut self.owned, entry, &name, conn));
                if entry.owner.is_none() && entry.queue.is_empty() {
                    self.names.remove(&name);
                }
            }
        }
        // leave every queue the connection was waiting in
        self.names.retain(|_, entry| {
            entry.queue.retain(|waiting| waiting.conn != conn);
            entry.owner.is_some() || !entry.queue.is_empty()
        });
        self.owned.remove(&conn);
        self.unique.retain(|_, owner| *owner != conn);
        changes
    }

    /// Hand the name to the first queued waiter, if any.
    fn promote(
        owned: &mut HashMap<ConnectionId, BTreeSet<String>>,
        entry: &mut NameEntry,
        name: &str,
        releasing: ConnectionId,
    ) -> OwnershipChange {
        if let Some(set) = owned.get_mut(&releasing) {
            set.remove(name);
        }
        let next = entry.queue.pop_front();
        entry.owner = next;
        if let Some(next) = next {
            owned.entry(next.conn).or_default().insert(name.to_owned());
        }
        OwnershipChange {
            name: name.to_owned(),
            old_owner: Some(releasing),
            new_owner: next.map(|record| record.conn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = 1;
    const B: ConnectionId = 2;
    const C: ConnectionId = 3;

    #[test]
    fn unique_names_are_never_reused() {
        let mut registry = NameRegistry::new();
        let first = registry.issue_unique_name(A);
        let second = registry.issue_unique_name(B);
        assert_eq!(first, ":1.0");
        assert_eq!(second, ":1.1");
        assert_eq!(registry.lookup(&first), Some(A));
        registry.drop_connection(A);
        assert_eq!(registry.lookup(&first), None);
        assert_ne!(registry.issue_unique_name(C), first);
    }

    #[test]
    fn first_request_owns_then_queues() {
        let mut registry = NameRegistry::new();
        let (reply, change) = registry.request_name(A, "com.example.Name", 0);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(
            change,
            Some(OwnershipChange {
                name: "com.example.Name".into(),
                old_owner: None,
                new_owner: Some(A),
            })
        );

        let (reply, change) = registry.request_name(B, "com.example.Name", 0);
        assert_eq!(reply, RequestNameReply::InQueue);
        assert_eq!(change, None);

        let (reply, _) = registry.request_name(A, "com.example.Name", 0);
        assert_eq!(reply, RequestNameReply::AlreadyOwner);
    }

    #[test]
    fn do_not_queue_fails_fast() {
        let mut registry = NameRegistry::new();
        registry.request_name(A, "com.example.Name", 0);
        let (reply, _) =
            registry.request_name(B, "com.example.Name", request_flags::DO_NOT_QUEUE);
        assert_eq!(reply, RequestNameReply::Exists);
    }

    #[test]
    fn replacement_requires_both_sides_to_agree() {
        let mut registry = NameRegistry::new();
        registry.request_name(A, "com.example.Name", 0);
        let (reply, _) =
            registry.request_name(B, "com.example.Name", request_flags::REPLACE_EXISTING);
        assert_eq!(reply, RequestNameReply::InQueue, "owner did not allow replacement");

        let mut registry = NameRegistry::new();
        registry.request_name(A, "com.example.Name", request_flags::ALLOW_REPLACEMENT);
        let (reply, change) =
            registry.request_name(B, "com.example.Name", request_flags::REPLACE_EXISTING);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(change.unwrap().old_owner, Some(A));
        // the displaced owner waits in the queue
        let (_, change) = registry.release_name(B, "com.example.Name");
        assert_eq!(change.unwrap().new_owner, Some(A));
    }

    #[test]
    fn release_promotes_the_queue_in_order() {
        let mut registry = NameRegistry::new();
        registry.request_name(A, "com.example.Name", 0);
        registry.request_name(B, "com.example.Name", 0);
        registry.request_name(C, "com.example.Name", 0);

        let (reply, change) = registry.release_name(A, "com.example.Name");
        assert_eq!(reply, ReleaseNameReply::Released);
        assert_eq!(
            change,
            Some(OwnershipChange {
                name: "com.example.Name".into(),
                old_owner: Some(A),
                new_owner: Some(B),
            })
        );
        assert_eq!(registry.lookup("com.example.Name"), Some(B));

        let (_, change) = registry.release_name(B, "com.example.Name");
        assert_eq!(change.unwrap().new_owner, Some(C));
    }

    #[test]
    fn release_replies_distinguish_queue_and_stranger() {
        let mut registry = NameRegistry::new();
        assert_eq!(
            registry.release_name(A, "com.example.Name").0,
            ReleaseNameReply::NonExistent
        );
        registry.request_name(A, "com.example.Name", 0);
        registry.request_name(B, "com.example.Name", 0);
        assert_eq!(registry.release_name(B, "com.example.Name").0, ReleaseNameReply::Released);
        assert_eq!(registry.release_name(C, "com.example.Name").0, ReleaseNameReply::NotOwner);
    }

    #[test]
    fn disconnect_releases_and_promotes_everything() {
        let mut registry = NameRegistry::new();
        registry.issue_unique_name(A);
        registry.request_name(A, "com.example.One", 0);
        registry.request_name(A, "com.example.Two", 0);
        registry.request_name(B, "com.example.One", 0);

        let changes = registry.drop_connection(A);
        assert_eq!(changes.len(), 2);
        assert_eq!(registry.lookup("com.example.One"), Some(B));
        assert_eq!(registry.lookup("com.example.Two"), None);
        assert!(registry.names_owned_by(A).is_empty());
    }

    #[test]
    fn list_names_is_sorted_and_complete() {
        let mut registry = NameRegistry::new();
        let unique = registry.issue_unique_name(A);
        registry.request_name(A, "com.example.Name", 0);
        let names = registry.list_names();
        assert!(names.contains(&unique));
        assert!(names.contains(&"com.example.Name".to_string()));
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
