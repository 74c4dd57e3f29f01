//! Blueprints: the explicit per-node property and rule registry
//!
//! A blueprint declares, once, everything a node kind is made of: its
//! properties (with defaults, display names and read-only markers), its
//! child slots and collections and its rules. Every instance built from the
//! blueprint registers the same rules in the same order, which is what makes
//! rule ordinals stable across instances and across a
//! serialize/deserialize round trip.
//!
//! Blueprint misuse (duplicate property names, rules triggering on
//! undeclared properties) panics at declaration time: the blueprint is
//! set-up code and failing early beats failing on first use.
//!
//! ```rust
//! use trellis::node::{prop, Blueprint};
//! use trellis::rule::annotations::required;
//!
//! let person = Blueprint::entity("Person")
//!     .property(prop("name").display("Full name"))
//!     .property(prop("age").default_value(0))
//!     .rule(required("name"));
//!
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # let _guard = rt.enter();
//! let node = person.create();
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::errors::RestoreError;
use crate::node::{
    descendants, touch, Bindable, Capability, Entity, EntityList, Meta, Node, NodeInner,
    NodeState, ParentLink, Validated, Validating,
};
use crate::property::{Property, PropertyValue};
use crate::rule::{self, RuleDef, RuleId, RuleSlot, RunFlags};
use crate::snapshot::{MessageSnapshot, NodeSnapshot, ValueSnapshot};
use crate::sync::{self, next_node_id, Interrupt};

/// Declaration of one scalar property
#[derive(Clone)]
pub struct PropertyDef {
    pub(crate) name: String,
    pub(crate) default: Value,
    pub(crate) display: Option<String>,
    pub(crate) read_only: bool,
}

/// Start declaring a property with a `null` default
pub fn prop(name: impl Into<String>) -> PropertyDef {
    PropertyDef {
        name: name.into(),
        default: Value::Null,
        display: None,
        read_only: false,
    }
}

impl PropertyDef {
    /// Initial value for new instances
    pub fn default_value(mut self, value: impl Serialize) -> Self {
        self.default = serde_json::to_value(value)
            .unwrap_or_else(|e| panic!("default for `{}` must be serializable: {e}", self.name));
        self
    }

    /// Human readable name used in validation messages
    pub fn display(mut self, label: impl Into<String>) -> Self {
        self.display = Some(label.into());
        self
    }

    /// Reject assignment through the tracking path. The silent load path
    /// still works.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Clone)]
enum SlotKind {
    Scalar,
    Child(Box<Blueprint<Entity>>),
    List(Box<Blueprint<Entity>>),
}

#[derive(Clone)]
struct SlotDef {
    def: PropertyDef,
    kind: SlotKind,
}

/// The declaration a node kind is built from. Cloning is cheap enough to
/// share blueprints between factories and the deserializing side.
#[derive(Clone)]
pub struct Blueprint<C: Capability = Entity> {
    name: String,
    slots: Vec<SlotDef>,
    rules: Vec<RuleDef>,
    _tier: PhantomData<C>,
}

impl Blueprint<Entity> {
    /// A blueprint for full entity-tier nodes
    pub fn entity(name: impl Into<String>) -> Self {
        Self::with_name(name)
    }

    /// Declare a child node slot. Child slots exist only on entity
    /// blueprints: nesting an entity under a node that does not track
    /// modification would silently break propagation.
    pub fn child(mut self, name: impl Into<String>, blueprint: Blueprint<Entity>) -> Self {
        let def = prop(name);
        self.assert_new_slot(&def.name);
        self.slots.push(SlotDef {
            def,
            kind: SlotKind::Child(Box::new(blueprint)),
        });
        self
    }

    /// Declare a child collection slot
    pub fn list(mut self, name: impl Into<String>, blueprint: Blueprint<Entity>) -> Self {
        let def = prop(name);
        self.assert_new_slot(&def.name);
        self.slots.push(SlotDef {
            def,
            kind: SlotKind::List(Box::new(blueprint)),
        });
        self
    }
}

impl Blueprint<Validated> {
    /// A blueprint for validated nodes without the persistence lifecycle
    pub fn validated(name: impl Into<String>) -> Self {
        Self::with_name(name)
    }
}

impl Blueprint<Bindable> {
    /// A blueprint for plain bindable nodes: no rules, no validity
    pub fn bindable(name: impl Into<String>) -> Self {
        Self::with_name(name)
    }
}

impl<C: Validating> Blueprint<C> {
    /// Register a rule. The ordinal handed to the rule is the registration
    /// position; register rules in the same order on every side of a
    /// serialization boundary.
    pub fn rule(mut self, rule: RuleDef) -> Self {
        for trigger in &rule.triggers {
            assert!(
                self.slots.iter().any(|slot| &slot.def.name == trigger),
                "rule on `{}` triggers on undeclared property `{trigger}`",
                self.name
            );
        }
        self.rules.push(rule);
        self
    }
}

impl<C: Capability> Blueprint<C> {
    fn with_name(name: impl Into<String>) -> Self {
        Blueprint {
            name: name.into(),
            slots: Vec::new(),
            rules: Vec::new(),
            _tier: PhantomData,
        }
    }

    /// The blueprint (and node kind) name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a scalar property
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.assert_new_slot(&def.name);
        self.slots.push(SlotDef {
            def,
            kind: SlotKind::Scalar,
        });
        self
    }

    fn assert_new_slot(&self, name: &str) {
        assert!(
            !self.slots.iter().any(|slot| slot.def.name == name),
            "property `{name}` is declared twice on `{}`",
            self.name
        );
    }

    /// Build an instance representing a brand-new object: `is_new` is set
    /// on the whole subtree and a full rule run is queued so the initial
    /// validation state settles.
    ///
    /// Must be called within a Tokio runtime.
    pub fn create(&self) -> Node<C> {
        let node = self.instance();
        let subtree = descendants(&node.inner);
        for inner in &subtree {
            let mut state = sync::write(&inner.state);
            state.new = true;
        }
        // refresh caches leaf-first so parents aggregate the new flags
        for inner in subtree.iter().rev() {
            touch(inner, None);
        }
        let interrupt = Interrupt::new();
        for inner in &subtree {
            let selected = rule::select_with_flags(inner, RunFlags::ALL);
            rule::enqueue(inner, &selected, &interrupt);
        }
        node
    }

    /// Build an instance representing an object fetched from a data
    /// source: not new, not modified, no rules run. The caller populates
    /// values through the load path.
    pub fn fetch(&self) -> Node<C> {
        self.instance()
    }

    /// The deserializing constructor: rebuild an instance from a snapshot.
    ///
    /// Runs the normal construction path (registering the same rules in the
    /// same order, reproducing the ordinal assignment), loads the captured
    /// values silently and applies the transferred messages directly into
    /// the matching ordinal slots. Rules are *not* re-executed; messages
    /// are data.
    pub fn restore(&self, snapshot: &NodeSnapshot) -> Result<Node<C>, RestoreError> {
        if snapshot.kind != self.name {
            return Err(RestoreError::KindMismatch {
                expected: self.name.clone(),
                found: snapshot.kind.clone(),
            });
        }

        let node = self.instance();
        let rule_count = self.rules.len();
        {
            let mut guard = sync::write(&node.inner.state);
            let state = &mut *guard;
            for captured in &snapshot.properties {
                let &idx =
                    state
                        .index
                        .get(&captured.name)
                        .ok_or_else(|| RestoreError::UnknownProperty {
                            name: captured.name.clone(),
                        })?;

                match (&self.slots[idx].kind, &captured.value) {
                    (SlotKind::Scalar, ValueSnapshot::Scalar(value)) => {
                        state.props[idx].value = PropertyValue::Scalar(value.clone());
                    }
                    (SlotKind::Child(blueprint), ValueSnapshot::Child(nested)) => {
                        let child = blueprint.restore(nested)?;
                        {
                            let mut child_state = sync::write(&child.inner.state);
                            child_state.parent = Some(ParentLink {
                                node: Arc::downgrade(&node.inner),
                                slot: captured.name.clone(),
                            });
                        }
                        state.props[idx].value = PropertyValue::Child(child);
                    }
                    (SlotKind::List(blueprint), ValueSnapshot::List(nested)) => {
                        let list = match &state.props[idx].value {
                            PropertyValue::List(list) => list.clone(),
                            _ => unreachable!("list slots are built as lists"),
                        };
                        for item in &nested.items {
                            list.add_relaxed(blueprint.restore(item)?);
                        }
                        for item in &nested.deleted {
                            list.park_deleted(blueprint.restore(item)?);
                        }
                    }
                    _ => {
                        return Err(RestoreError::Shape {
                            name: captured.name.clone(),
                        })
                    }
                }

                state.props[idx].modified = captured.modified;
                apply_messages(state, idx, &captured.messages, rule_count)?;
            }

            for &ordinal in &snapshot.executed {
                if ordinal >= rule_count {
                    return Err(RestoreError::UnknownRule {
                        rule: RuleId(ordinal),
                        count: rule_count,
                    });
                }
                state.executed[ordinal] = true;
            }

            state.new = snapshot.new;
            state.deleted = snapshot.deleted;
            state.child = snapshot.child;
            state.marked_modified = snapshot.marked_modified;
        }

        touch(&node.inner, None);
        Ok(node)
    }

    /// Build a bare instance with default values and primed meta-state
    fn instance(&self) -> Node<C> {
        let (pending, _) = watch::channel(0usize);
        let (meta_tx, _) = watch::channel(Meta::default());
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(NodeInner {
            id: next_node_id(),
            kind: self.name.clone(),
            rules: self.rules.iter().map(RuleSlot::from).collect(),
            state: RwLock::new(NodeState {
                props: Vec::new(),
                index: HashMap::new(),
                parent: None,
                executed: vec![false; self.rules.len()],
                new: false,
                deleted: false,
                marked_modified: false,
                child: false,
                paused: false,
                interrupted: false,
                faults: Vec::new(),
                meta: Meta::default(),
            }),
            engine: Mutex::new(rule::Engine::default()),
            pending,
            meta_tx,
            events,
        });

        // children are built after the Arc exists so their parent links can
        // point back at it
        let mut props = Vec::with_capacity(self.slots.len());
        let mut index = HashMap::with_capacity(self.slots.len());
        for (at, slot) in self.slots.iter().enumerate() {
            let link = ParentLink {
                node: Arc::downgrade(&inner),
                slot: slot.def.name.clone(),
            };
            let value = match &slot.kind {
                SlotKind::Scalar => PropertyValue::Scalar(slot.def.default.clone()),
                SlotKind::Child(blueprint) => {
                    let child: Node = blueprint.instance();
                    {
                        let mut state = sync::write(&child.inner.state);
                        state.parent = Some(link);
                        state.child = true;
                    }
                    PropertyValue::Child(child)
                }
                SlotKind::List(_) => PropertyValue::List(EntityList::new(Some(link))),
            };
            props.push(Property::new(
                slot.def.name.clone(),
                slot.def.display.clone(),
                slot.def.read_only,
                value,
            ));
            index.insert(slot.def.name.clone(), at);
        }

        {
            let mut state = sync::write(&inner.state);
            state.props = props;
            state.index = index;
        }
        touch(&inner, None);
        Node::from_inner(inner)
    }
}

fn apply_messages(
    state: &mut NodeState,
    idx: usize,
    messages: &[MessageSnapshot],
    rule_count: usize,
) -> Result<(), RestoreError> {
    let mut grouped: std::collections::BTreeMap<RuleId, Vec<String>> = Default::default();
    for message in messages {
        if message.rule.0 >= rule_count {
            return Err(RestoreError::UnknownRule {
                rule: message.rule,
                count: rule_count,
            });
        }
        grouped
            .entry(message.rule)
            .or_default()
            .push(message.text.clone());
    }
    for (rule, texts) in grouped {
        state.props[idx].set_messages_for_rule(rule, texts);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::validate;
    use crate::rule::Outcome;

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_properties_panic_at_declaration() {
        let _ = Blueprint::entity("Broken")
            .property(prop("name"))
            .property(prop("name"));
    }

    #[test]
    #[should_panic(expected = "undeclared property")]
    fn rules_on_undeclared_properties_panic_at_declaration() {
        let _ = Blueprint::entity("Broken")
            .property(prop("name"))
            .rule(validate(["nope"], |_| Outcome::ok()));
    }

    #[test]
    fn instances_carry_defaults_and_display_names() {
        let node = Blueprint::entity("Widget")
            .property(prop("count").default_value(3).display("Widget count"))
            .fetch();

        assert_eq!(node.get_as::<i64>("count").unwrap(), 3);
        let state = node.property("count").unwrap();
        assert_eq!(state.display_name.as_deref(), Some("Widget count"));
    }

    #[test]
    fn rule_ordinals_follow_registration_order() {
        let blueprint = Blueprint::entity("Ordered")
            .property(prop("a"))
            .property(prop("b"))
            .rule(validate(["a"], |_| Outcome::ok()).order(10))
            .rule(validate(["b"], |_| Outcome::ok()));

        // registration order is the ordinal, independent of RuleOrder
        assert_eq!(blueprint.rules.len(), 2);
        assert_eq!(blueprint.rules[0].order, 10);
        assert_eq!(blueprint.rules[1].order, 0);
    }
}
