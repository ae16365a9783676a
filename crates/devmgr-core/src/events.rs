//! Discovery events produced by diffing device-list snapshots

use serde::Serialize;

use crate::device::Device;

/// One change observed between two consecutive device-list snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "device", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// Newly seen, or known but never detail-fetched
    Added(Device),
    /// Already-fetched device back online or in a new transport state
    Updated(Device),
    /// No longer reported; kept in the registry and marked offline
    Removed(Device),
    /// The watch channel failed
    Error(String),
}

impl DiscoveryEvent {
    pub fn serial(&self) -> Option<&str> {
        match self {
            Self::Added(d) | Self::Updated(d) | Self::Removed(d) => Some(d.serial()),
            Self::Error(_) => None,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added(_))
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_accessor() {
        let event = DiscoveryEvent::Added(Device::new("ABC123"));
        assert_eq!(event.serial(), Some("ABC123"));
        assert!(event.is_added());
        assert!(!event.is_removed());

        let event = DiscoveryEvent::Error("boom".to_string());
        assert_eq!(event.serial(), None);
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(DiscoveryEvent::Removed(Device::new("X1"))).unwrap();
        assert_eq!(json["kind"], "removed");
        assert_eq!(json["device"]["serial"], "X1");
    }
}
