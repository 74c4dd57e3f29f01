//! Change notifications
//!
//! Every node owns a broadcast channel of [`ChangeEvent`]s. An event is
//! emitted where the change originates and then bubbles through the parent
//! chain; each hop prefixes the path with the child slot it came through, so
//! a subscriber on the aggregate root sees the full dotted path
//! (`"address.city"`) while a subscriber on the child sees `"city"`.
//!
//! Consumers may attach asynchronous handlers by spawning on the receiver;
//! the framework does not await them for its own correctness.

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A property value was assigned through the tracking path
    Value,
    /// The aggregated meta-state of the node changed
    Meta,
    /// Collection membership changed
    Structure,
}

/// A change notification carrying both the simple property name and the
/// dotted path relative to the node the event was received on
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Name of the property at the originating node, empty for meta events
    pub property: String,
    /// Dotted path from the receiving node down to the origin
    pub path: String,
    /// Id of the originating node
    pub source: u64,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub(crate) fn value(source: u64, property: &str) -> Self {
        ChangeEvent {
            property: property.to_string(),
            path: property.to_string(),
            source,
            kind: ChangeKind::Value,
        }
    }

    pub(crate) fn meta(source: u64) -> Self {
        ChangeEvent {
            property: String::new(),
            path: String::new(),
            source,
            kind: ChangeKind::Meta,
        }
    }

    pub(crate) fn structure(source: u64, slot: &str) -> Self {
        ChangeEvent {
            property: slot.to_string(),
            path: slot.to_string(),
            source,
            kind: ChangeKind::Structure,
        }
    }

    /// The same event as seen one level up, through the child slot `slot`
    pub(crate) fn prefixed(mut self, slot: &str) -> Self {
        self.path = if self.path.is_empty() {
            slot.to_string()
        } else {
            format!("{slot}.{}", self.path)
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bubbling_prefixes_the_path() {
        let event = ChangeEvent::value(1, "city").prefixed("address");
        assert_eq!(event.property, "city");
        assert_eq!(event.path, "address.city");
    }

    #[test]
    fn meta_events_pick_up_the_slot_as_path() {
        let event = ChangeEvent::meta(1).prefixed("lines");
        assert_eq!(event.path, "lines");
        assert_eq!(event.kind, ChangeKind::Meta);
    }
}
