//! Closed set of request types the router understands.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Navigate,
    GoBack,
    GoForward,
    Click,
    Hover,
    Type,
    SelectOption,
    PressKey,
    Wait,
    Screenshot,
    Snapshot,
    Evaluate,
    ConsoleLogs,
    ListTabs,
    SelectTab,
    CloseTab,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        Self::Navigate,
        Self::GoBack,
        Self::GoForward,
        Self::Click,
        Self::Hover,
        Self::Type,
        Self::SelectOption,
        Self::PressKey,
        Self::Wait,
        Self::Screenshot,
        Self::Snapshot,
        Self::Evaluate,
        Self::ConsoleLogs,
        Self::ListTabs,
        Self::SelectTab,
        Self::CloseTab,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::GoBack => "goBack",
            Self::GoForward => "goForward",
            Self::Click => "click",
            Self::Hover => "hover",
            Self::Type => "type",
            Self::SelectOption => "selectOption",
            Self::PressKey => "pressKey",
            Self::Wait => "wait",
            Self::Screenshot => "screenshot",
            Self::Snapshot => "snapshot",
            Self::Evaluate => "evaluate",
            Self::ConsoleLogs => "consoleLogs",
            Self::ListTabs => "listTabs",
            Self::SelectTab => "selectTab",
            Self::CloseTab => "closeTab",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Returns true if handling this kind needs exclusive access to a resource.
    pub fn requires_lock(&self) -> bool {
        !matches!(self, Self::Wait | Self::ConsoleLogs | Self::ListTabs)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde() {
        for kind in MessageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_wire_name() {
        assert_eq!(MessageKind::from_wire("teleport"), None);
        assert_eq!(MessageKind::from_wire("Navigate"), None);
    }

    #[test]
    fn test_lock_free_kinds() {
        let free: Vec<_> = MessageKind::ALL
            .into_iter()
            .filter(|k| !k.requires_lock())
            .collect();
        assert_eq!(
            free,
            vec![MessageKind::Wait, MessageKind::ConsoleLogs, MessageKind::ListTabs]
        );
        assert!(MessageKind::Click.requires_lock());
    }
}
