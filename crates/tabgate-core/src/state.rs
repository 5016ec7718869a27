//! Lifecycle states for connections and attached sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of a logical connection.
///
/// `Connecting` covers transport open plus handshake; a connection only
/// carries traffic while `Open`. `Closing` is the window in which its
/// locks are being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true once close handling has started.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// ============================================================================
// Session Phase
// ============================================================================

/// State of the attached session on a single resource.
///
/// Legal edges:
///
/// ```text
/// DETACHED -> ATTACHING -> ATTACHED -> DETACHING -> DETACHED
///     any  -> ERROR -> DETACHED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    #[default]
    Detached,
    Attaching,
    Attached,
    Detaching,
    Error,
}

impl SessionPhase {
    /// Returns true if `self -> next` is one of the defined edges.
    #[must_use]
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        matches!(
            (self, next),
            (Detached, Attaching)
                | (Attaching, Attached)
                | (Attached, Detaching)
                | (Detaching, Detached)
                | (Error, Detached)
        ) || (next == Error && self != Error)
    }

    /// Returns true for phases in which an operation is in flight.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Attaching | Self::Detaching)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Detached => "DETACHED",
            Self::Attaching => "ATTACHING",
            Self::Attached => "ATTACHED",
            Self::Detaching => "DETACHING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase::*;

    #[test]
    fn test_happy_path_edges() {
        assert!(Detached.can_transition_to(Attaching));
        assert!(Attaching.can_transition_to(Attached));
        assert!(Attached.can_transition_to(Detaching));
        assert!(Detaching.can_transition_to(Detached));
    }

    #[test]
    fn test_any_phase_can_fail() {
        for phase in [Detached, Attaching, Attached, Detaching] {
            assert!(phase.can_transition_to(Error), "{phase} -> ERROR");
        }
        assert!(Error.can_transition_to(Detached));
    }

    #[test]
    fn test_skipping_edges_is_rejected() {
        assert!(!Detached.can_transition_to(Attached));
        assert!(!Attached.can_transition_to(Detached));
        assert!(!Attaching.can_transition_to(Detaching));
        assert!(!Error.can_transition_to(Attaching));
        assert!(!Error.can_transition_to(Error));
        assert!(!Attached.can_transition_to(Attached));
    }

    #[test]
    fn test_connection_state_helpers() {
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(ConnectionState::Closing.is_terminating());
        assert!(ConnectionState::Closed.is_terminating());
        assert!(!ConnectionState::Open.is_terminating());
    }

    #[test]
    fn test_phase_serializes_upper_case() {
        let json = serde_json::to_string(&Detaching).unwrap();
        assert_eq!(json, "\"DETACHING\"");
        assert_eq!(ConnectionState::Closing.to_string(), "CLOSING");
    }
}
