//! The property container and its derived state
//!
//! Every declared property of a node is backed by a [`Property`] holding the
//! current payload plus the state derived from it: the modification flag, the
//! validation messages keyed by stable rule ordinal and the set of in-flight
//! execution markers. Property payloads are modeled as [`serde_json::Value`],
//! so anything serializable can be stored and the whole container survives a
//! serialize/deserialize round trip unchanged.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::node::{EntityList, Node};
use crate::rule::RuleId;

/// The payload held by a property slot
#[derive(Clone)]
pub(crate) enum PropertyValue {
    /// A plain serializable value
    Scalar(Value),
    /// A nested child node
    Child(Node),
    /// A nested child collection
    List(EntityList),
}

/// A single validation message tagged with the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable ordinal of the producing rule
    pub rule: RuleId,
    /// Human readable message text
    pub text: String,
}

/// Backing container for one named property
pub(crate) struct Property {
    pub(crate) name: String,
    pub(crate) display: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) value: PropertyValue,
    pub(crate) modified: bool,
    /// Messages grouped by producing rule. A `BTreeMap` keeps iteration in
    /// ordinal order, which keeps snapshots deterministic across round trips.
    messages: BTreeMap<RuleId, Vec<String>>,
    /// In-flight execution markers. Busy while non-empty.
    busy: HashSet<u64>,
}

impl Property {
    pub(crate) fn new(
        name: String,
        display: Option<String>,
        read_only: bool,
        value: PropertyValue,
    ) -> Self {
        Property {
            name,
            display,
            read_only,
            value,
            modified: false,
            messages: BTreeMap::new(),
            busy: HashSet::new(),
        }
    }

    /// Display name for use in validation messages, falling back to the
    /// property name
    pub(crate) fn label(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.name)
    }

    /// A property is valid iff it carries no messages
    pub(crate) fn is_valid(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn is_busy(&self) -> bool {
        !self.busy.is_empty()
    }

    pub(crate) fn mark_busy(&mut self, execution: u64) {
        self.busy.insert(execution);
    }

    pub(crate) fn clear_busy(&mut self, execution: u64) {
        self.busy.remove(&execution);
    }

    /// Replace exactly the subset of messages tagged with `rule`, leaving
    /// messages written by other rules untouched
    pub(crate) fn set_messages_for_rule(&mut self, rule: RuleId, messages: Vec<String>) {
        if messages.is_empty() {
            self.messages.remove(&rule);
        } else {
            self.messages.insert(rule, messages);
        }
    }

    pub(crate) fn clear_messages_for_rule(&mut self, rule: RuleId) {
        self.messages.remove(&rule);
    }

    pub(crate) fn has_messages_for(&self, rule: RuleId) -> bool {
        self.messages.contains_key(&rule)
    }

    pub(crate) fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub(crate) fn messages(&self) -> impl Iterator<Item = Message> + '_ {
        self.messages.iter().flat_map(|(rule, texts)| {
            texts.iter().map(|text| Message {
                rule: *rule,
                text: text.clone(),
            })
        })
    }

    pub(crate) fn scalar(&self) -> Option<&Value> {
        match &self.value {
            PropertyValue::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

/// A point-in-time view of one property, as returned by the node indexer.
///
/// This is the contract UI binding layers consume: the current value, the
/// validity and modification flags and the tagged messages. The view is a
/// clone; it does not track later changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyState {
    pub name: String,
    pub display_name: Option<String>,
    pub read_only: bool,
    pub modified: bool,
    pub busy: bool,
    pub valid: bool,
    /// Current payload for scalar slots, `None` for child and collection
    /// slots
    pub value: Option<Value>,
    pub messages: Vec<Message>,
}

impl PropertyState {
    pub(crate) fn capture(property: &Property) -> Self {
        PropertyState {
            name: property.name.clone(),
            display_name: property.display.clone(),
            read_only: property.read_only,
            modified: property.modified,
            busy: property.is_busy(),
            valid: property.is_valid(),
            value: property.scalar().cloned(),
            messages: property.messages().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prop(name: &str) -> Property {
        Property::new(
            name.into(),
            None,
            false,
            PropertyValue::Scalar(Value::Null),
        )
    }

    #[test]
    fn busy_markers_clear_independently() {
        let mut p = prop("a");
        p.mark_busy(1);
        p.mark_busy(2);
        assert!(p.is_busy());

        // one of two overlapping executions finishing must not clear the
        // other's contribution
        p.clear_busy(1);
        assert!(p.is_busy());

        p.clear_busy(2);
        assert!(!p.is_busy());
    }

    #[test]
    fn messages_replace_only_their_own_rule() {
        let mut p = prop("a");
        p.set_messages_for_rule(RuleId(0), vec!["required".into()]);
        p.set_messages_for_rule(RuleId(1), vec!["too short".into()]);
        assert!(!p.is_valid());
        assert_eq!(p.messages().count(), 2);

        p.set_messages_for_rule(RuleId(0), vec![]);
        let left: Vec<_> = p.messages().collect();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].rule, RuleId(1));
        assert_eq!(left[0].text, "too short");
    }

    #[test]
    fn state_captures_scalar_value() {
        let mut p = prop("a");
        p.value = PropertyValue::Scalar(json!(42));
        p.modified = true;

        let state = PropertyState::capture(&p);
        assert_eq!(state.value, Some(json!(42)));
        assert!(state.modified);
        assert!(state.valid);
        assert!(!state.busy);
    }
}
