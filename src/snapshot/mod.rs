//! The serialization contract
//!
//! A [`NodeSnapshot`] captures everything needed to reproduce a node's
//! state out of process: every property value, the per-rule message sets
//! tagged by stable ordinal, the executed-rule set and the entity meta
//! flags. Snapshots are plain serde types; the host picks the wire format.
//!
//! The counterpart is [`Blueprint::restore`](`crate::node::Blueprint::restore`),
//! which re-runs the normal construction path (reproducing the ordinal
//! assignment) and applies the captured messages as data instead of
//! re-executing rules. Capture is deterministic (properties in declaration
//! order, messages in ordinal order), so capturing a restored graph yields
//! an identical snapshot, repeatable without drift.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeInner;
use crate::property::PropertyValue;
use crate::rule::RuleId;
use crate::sync;

/// Serialized form of one node and everything reachable from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Blueprint name, verified on restore
    pub kind: String,
    pub new: bool,
    pub deleted: bool,
    pub child: bool,
    pub marked_modified: bool,
    /// Ordinals of the rules that have executed
    pub executed: Vec<usize>,
    /// Properties in declaration order
    pub properties: Vec<PropertySnapshot>,
}

/// Serialized form of one property container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub name: String,
    pub modified: bool,
    /// Messages in ordinal order
    pub messages: Vec<MessageSnapshot>,
    pub value: ValueSnapshot,
}

/// One validation message tagged with its producing rule's stable ordinal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub rule: RuleId,
    pub text: String,
}

/// Serialized property payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSnapshot {
    Scalar(Value),
    Child(NodeSnapshot),
    List(ListSnapshot),
}

/// Serialized form of a child collection, including the removed-but-not-
/// purged items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSnapshot {
    pub items: Vec<NodeSnapshot>,
    pub deleted: Vec<NodeSnapshot>,
}

enum RawValue {
    Scalar(Value),
    Child(Arc<NodeInner>),
    List(Vec<Arc<NodeInner>>, Vec<Arc<NodeInner>>),
}

struct RawProperty {
    name: String,
    modified: bool,
    messages: Vec<MessageSnapshot>,
    value: RawValue,
}

/// Capture the subtree rooted at `inner`.
///
/// The node's own state is cloned under its read lock; children are
/// captured afterwards so no two node locks are ever held at once.
pub(crate) fn capture(inner: &Arc<NodeInner>) -> NodeSnapshot {
    let (raw, executed, new, deleted, child, marked_modified) = {
        let state = sync::read(&inner.state);
        let raw: Vec<RawProperty> = state
            .props
            .iter()
            .map(|prop| RawProperty {
                name: prop.name.clone(),
                modified: prop.modified,
                messages: prop
                    .messages()
                    .map(|m| MessageSnapshot {
                        rule: m.rule,
                        text: m.text,
                    })
                    .collect(),
                value: match &prop.value {
                    PropertyValue::Scalar(value) => RawValue::Scalar(value.clone()),
                    PropertyValue::Child(node) => RawValue::Child(Arc::clone(&node.inner)),
                    PropertyValue::List(list) => {
                        let list_state = sync::read(&list.inner.state);
                        RawValue::List(
                            list_state
                                .items
                                .iter()
                                .map(|n| Arc::clone(&n.inner))
                                .collect(),
                            list_state
                                .deleted
                                .iter()
                                .map(|n| Arc::clone(&n.inner))
                                .collect(),
                        )
                    }
                },
            })
            .collect();
        let executed: Vec<usize> = state
            .executed
            .iter()
            .enumerate()
            .filter_map(|(ordinal, &done)| done.then_some(ordinal))
            .collect();
        (
            raw,
            executed,
            state.new,
            state.deleted,
            state.child,
            state.marked_modified,
        )
    };

    let properties = raw
        .into_iter()
        .map(|prop| PropertySnapshot {
            name: prop.name,
            modified: prop.modified,
            messages: prop.messages,
            value: match prop.value {
                RawValue::Scalar(value) => ValueSnapshot::Scalar(value),
                RawValue::Child(node) => ValueSnapshot::Child(capture(&node)),
                RawValue::List(items, deleted) => ValueSnapshot::List(ListSnapshot {
                    items: items.iter().map(capture).collect(),
                    deleted: deleted.iter().map(capture).collect(),
                }),
            },
        })
        .collect();

    NodeSnapshot {
        kind: inner.kind.clone(),
        new,
        deleted,
        child,
        marked_modified,
        executed,
        properties,
    }
}
