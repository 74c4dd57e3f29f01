#![cfg_attr(docsrs, feature(doc_cfg))]
//! trellis is a stateful object graph library for building editable,
//! validated domain aggregates.
//!
//! An aggregate is a tree of [nodes](`node::Node`), each owning a set of
//! named [property containers](`property`) that track per-property
//! modification, validation messages and asynchronous-task busy state.
//! Property changes trigger [rules](`rule`); rule results roll up through
//! the parent chain into object-level meta-properties (`is_valid`,
//! `is_modified`, `is_busy`, `is_savable`); and the whole graph (values,
//! messages, flags) survives a serialize/deserialize round trip with its
//! derived state intact.
//!
//! # Blueprints
//!
//! Nodes are declared through a [Blueprint](`node::Blueprint`): an explicit
//! registry of properties, child slots and rules, built once and shared by
//! every instance (including the deserializing side of a round trip).
//!
//! ```rust
//! use trellis::node::{prop, Blueprint};
//! use trellis::rule::annotations::{max_length, required};
//! use trellis::rule::{validate, Outcome};
//!
//! fn person() -> Blueprint {
//!     Blueprint::entity("Person")
//!         .property(prop("name").display("Full name"))
//!         .property(prop("nickname"))
//!         .rule(required("name"))
//!         .rule(max_length("nickname", 16))
//!         .rule(validate(["name", "nickname"], |ctx| {
//!             if ctx.get("name").ok() == ctx.get("nickname").ok() {
//!                 Outcome::invalid("nickname", "nickname must differ from the name")
//!             } else {
//!                 Outcome::ok()
//!             }
//!         }))
//! }
//!
//! # tokio_test::block_on(async {
//! let node = person().create();
//! node.set("name", "Ada").unwrap();
//! node.wait_for_tasks().await.unwrap();
//! assert!(node.is_valid());
//! # })
//! ```
//!
//! # Capability tiers
//!
//! Nodes come in three tiers, modeled as typestate over a shared
//! implementation:
//!
//! - [`Node<Bindable>`](`node::Bindable`): busy tracking and change
//!   notification
//! - [`Node<Validated>`](`node::Validated`): adds validity, messages and
//!   rule runs
//! - [`Node<Entity>`](`node::Entity`): adds the persistence lifecycle and
//!   graph membership
//!
//! Child slots and [collections](`node::EntityList`) exist only on entity
//! blueprints and hold entity nodes, so modification tracking can never be
//! silently broken by nesting an entity under a node that does not
//! propagate it.
//!
//! # Rules
//!
//! A [rule](`rule::Rule`) triggers on one or more named properties and
//! produces zero or more messages. Rules execute strictly one at a time per
//! node (an asynchronous rule is awaited to completion before the next one
//! starts) because rules may both read and write properties, and
//! concurrent execution would race on shared derived state. A rule
//! assigning a property re-enters the change path: the cascade drains to a
//! fixed point before the node goes idle.
//!
//! Every rule is identified by its [ordinal](`rule::RuleId`), assigned in
//! blueprint registration order. Messages are tagged with the ordinal of
//! the rule that wrote them, so re-running one rule replaces exactly its
//! own messages, and so messages survive serialization and can still be
//! selectively cleared on the other side.
//!
//! # Waiting and cancellation
//!
//! Setting a property returns synchronously with the trigger properties
//! already marked busy; [`wait_for_tasks`](`node::Node::wait_for_tasks`)
//! awaits the graph settling, transitively over all descendants. An
//! [`Interrupt`](`sync::Interrupt`) cancels only the waiter: in-flight
//! rules run to completion in the background, and the node stays marked
//! invalid until the next full [`run_rules`](`node::Node::run_rules`).
//!
//! Faults thrown inside rule logic never abort sibling rules. They are
//! captured per rule, turned into invalidating messages on the trigger
//! properties and re-surfaced together as one
//! [aggregate error](`errors::AggregateError`) to the next waiter.
//!
//! # Serialization
//!
//! [`Node::snapshot`](`node::Node::snapshot`) captures the reachable graph
//! as plain serde data;
//! [`Blueprint::restore`](`node::Blueprint::restore`) rebuilds it by
//! running the normal construction path and applying the transferred
//! messages into their ordinal slots without re-executing rules. Capture is
//! deterministic, so capturing a restored graph yields an identical
//! snapshot, with no drift over repeated round trips.
//!
//! # Observability
//!
//! The library is instrumented with the [tracing](https://crates.io/crates/tracing)
//! crate: rule executions run inside spans carrying the node and rule ids,
//! and the set/attach paths emit trace events. Pair with
//! `tracing_subscriber` for structured or human readable logs.

pub mod errors;
pub mod factory;
pub mod node;
pub mod property;
pub mod rule;
pub mod snapshot;
pub mod sync;

pub mod prelude {
    //! Convenience re-exports for the common surface of the library

    pub use crate::errors::{AttachError, PropertyError, RuleFailure, WaitError};
    pub use crate::factory::{save_with, OperationKind, Persist, PersistOp};
    pub use crate::node::{
        prop, Bindable, Blueprint, ChangeEvent, ChangeKind, Entity, EntityList, Meta, Node,
        NodeMessage, Validated,
    };
    pub use crate::property::{Message, PropertyState};
    pub use crate::rule::annotations::{max_length, min_length, pattern, range, required};
    pub use crate::rule::{
        act, act_async, validate, validate_async, Outcome, Rule, RuleContext, RuleDef, RuleId,
        RunFlags,
    };
    pub use crate::snapshot::NodeSnapshot;
    pub use crate::sync::Interrupt;
}
