//! Broker error model.
//!
//! [`BusError`] covers the failures that turn into error replies on the
//! bus; each carries its dotted error name. Failures that end the
//! connection instead of producing a reply (malformed frames, protocol
//! violations) are separate variants so the dispatcher can tell the two
//! classes apart.

use thiserror::Error;

/// Dotted error-name prefix shared by all broker errors.
const ERROR_PREFIX: &str = "org.freedesktop.DBus.Error";

/// Errors raised while routing one message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A queue reservation was refused; the dispatch unwinds and the
    /// preallocated reply is used
    #[error("out of memory")]
    NoMemory,

    /// The destination name has no owner
    #[error("service \"{0}\" does not exist")]
    ServiceDoesNotExist(String),

    /// The security policy refused a delivery
    #[error("access denied by security policy")]
    AccessDenied,

    /// A driver method was called with the wrong arguments
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// GetNameOwner on a name nobody owns
    #[error("name \"{0}\" has no owner")]
    NameHasNoOwner(String),

    /// Activation was requested for an unknown service
    #[error("service \"{0}\" is not activatable")]
    ServiceUnknown(String),

    /// The driver does not implement the requested method
    #[error("unknown method \"{0}\"")]
    UnknownMethod(String),

    /// AddMatch was given an unparsable rule
    #[error("match rule is invalid: {0}")]
    MatchRuleInvalid(String),

    /// RemoveMatch was given a rule that was never added
    #[error("no such match rule")]
    MatchRuleNotFound,

    /// Catch-all failure with a human-readable explanation
    #[error("{0}")]
    Failed(String),

    /// The peer broke the protocol; the connection is dropped and no
    /// reply is sent
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl BusError {
    /// The dotted error name carried in the error reply.
    pub fn name(&self) -> String {
        let suffix = match self {
            BusError::NoMemory => "NoMemory",
            BusError::ServiceDoesNotExist(_) => "ServiceDoesNotExist",
            BusError::AccessDenied => "AccessDenied",
            BusError::InvalidArgs(_) => "InvalidArgs",
            BusError::NameHasNoOwner(_) => "NameHasNoOwner",
            BusError::ServiceUnknown(_) => "ServiceUnknown",
            BusError::UnknownMethod(_) => "UnknownMethod",
            BusError::MatchRuleInvalid(_) => "MatchRuleInvalid",
            BusError::MatchRuleNotFound => "MatchRuleNotFound",
            BusError::Failed(_) | BusError::ProtocolViolation(_) => "Failed",
        };
        format!("{ERROR_PREFIX}.{suffix}")
    }

    /// Whether this failure drops the connection instead of replying.
    pub fn disconnects(&self) -> bool {
        matches!(self, BusError::ProtocolViolation(_))
    }
}

impl From<hermod_proto::ProtocolError> for BusError {
    fn from(err: hermod_proto::ProtocolError) -> Self {
        BusError::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_dotted() {
        assert_eq!(BusError::NoMemory.name(), "org.freedesktop.DBus.Error.NoMemory");
        assert_eq!(
            BusError::ServiceDoesNotExist("x.y".into()).name(),
            "org.freedesktop.DBus.Error.ServiceDoesNotExist"
        );
        assert_eq!(
            BusError::NameHasNoOwner("x.y".into()).name(),
            "org.freedesktop.DBus.Error.NameHasNoOwner"
        );
    }

    #[test]
    fn only_violations_disconnect() {
        assert!(BusError::ProtocolViolation("early ListNames".into()).disconnects());
        assert!(!BusError::NoMemory.disconnects());
        assert!(!BusError::AccessDenied.disconnects());
    }
}
