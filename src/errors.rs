//! Public error vocabulary for the crate
//!
//! Validation failures are never represented here: a failing rule produces
//! messages, which are data read through the property surface. The types in
//! this module cover usage errors, configuration errors and rule execution
//! faults.

use std::fmt::{self, Display};
use std::ops::{Deref, DerefMut};

use thiserror::Error;

use crate::rule::RuleId;

#[derive(Debug, Error)]
#[error("serialization error: {0:?}")]
/// An error happened while serializing or deserializing a property payload
pub struct SerializationError(#[from] pub(crate) serde_json::Error);

#[derive(Debug, Error)]
/// Errors raised by the property access surface of a node.
///
/// These are local usage errors. The framework never recovers from them on
/// behalf of the caller; the call site must be fixed.
pub enum PropertyError {
    #[error("unknown property `{name}` on `{node}`")]
    /// The property name is not declared on the owning node
    Unknown { node: String, name: String },

    #[error("property `{name}` is read-only")]
    /// An attempt was made to set a read-only property through the
    /// modification-tracking path
    ReadOnly { name: String },

    #[error("property `{name}` does not hold a scalar value")]
    /// The property is a child or collection slot and cannot be assigned
    /// through the scalar set/load path
    NotScalar { name: String },

    #[error("property `{name}` does not hold a child node")]
    NotChild { name: String },

    #[error("property `{name}` does not hold a collection")]
    NotList { name: String },

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors raised when attaching or detaching collection items
pub enum AttachError {
    #[error("item is already present in the collection")]
    Duplicate,

    #[error("item has in-flight rule executions")]
    /// Busy items cannot be moved between collections, as their pending rule
    /// results would be written into a graph with a different shape
    Busy,

    #[error("item belongs to a different aggregate root")]
    /// Splicing an entity from one aggregate into another would corrupt
    /// modification propagation and later confuse persistence
    CrossAggregate,

    #[error("item is not a member of the collection")]
    NotFound,
}

#[derive(Debug, Error)]
/// Errors raised while rebuilding a node graph from a snapshot
pub enum RestoreError {
    #[error("snapshot is for `{found}`, blueprint builds `{expected}`")]
    KindMismatch { expected: String, found: String },

    #[error("snapshot carries unknown property `{name}`")]
    UnknownProperty { name: String },

    #[error("snapshot references {rule} but only {count} rules are registered")]
    /// The serializing side registered more rules than this blueprint does.
    /// Registration order must be identical on both sides of a round trip.
    UnknownRule { rule: RuleId, count: usize },

    #[error("snapshot value for `{name}` does not match the declared slot kind")]
    Shape { name: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{rule} failed: {message}")]
/// A fault captured from inside rule logic.
///
/// Faults do not abort sibling rules; they are accumulated and surfaced
/// together through [`WaitError::Rules`] at the next awaiting boundary.
pub struct RuleFailure {
    /// Stable ordinal of the failed rule
    pub rule: RuleId,
    /// Rendered error message
    pub message: String,
}

#[derive(Debug)]
/// An error aggregating the faults of every rule that failed while a batch
/// of executions drained
pub struct AggregateError<E>(pub Vec<E>);

impl<E: std::error::Error> std::error::Error for AggregateError<E> {}

impl<E: std::error::Error> From<Vec<E>> for AggregateError<E> {
    fn from(vec: Vec<E>) -> Self {
        AggregateError(vec)
    }
}

impl<E> Display for AggregateError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.0 {
            writeln!(f, "- {e}")?;
        }
        Ok(())
    }
}

impl<E> Deref for AggregateError<E> {
    type Target = Vec<E>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E> DerefMut for AggregateError<E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Error)]
/// Result of awaiting the in-flight rule executions of a graph
pub enum WaitError {
    #[error("wait interrupted before the graph settled")]
    /// The waiter gave up. In-flight rules keep running to completion in the
    /// background and the node is left marked invalid until the next full
    /// rule run.
    Interrupted,

    #[error("one or more rules failed:\n{0}")]
    Rules(#[from] AggregateError<RuleFailure>),
}

#[derive(Debug, Error)]
/// Errors raised by targeted rule runs
pub enum RunError {
    #[error("unknown property `{name}`")]
    UnknownProperty { name: String },

    #[error("{rule} is not registered on this node")]
    UnknownRule { rule: RuleId },

    #[error(transparent)]
    Wait(#[from] WaitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The reason a save gate refused an entity
pub enum SaveBlocker {
    /// Children are persisted through their aggregate root
    IsChild,
    /// The graph carries validation messages
    Invalid,
    /// Nothing to persist
    NotModified,
    /// Rule executions are still in flight
    Busy,
    /// The host registered no handler for the required persist operation
    NoHandler,
}

impl Display for SaveBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SaveBlocker::IsChild => "the node is a child of another aggregate",
            SaveBlocker::Invalid => "the node is invalid",
            SaveBlocker::NotModified => "the node is not modified",
            SaveBlocker::Busy => "the node has in-flight rule executions",
            SaveBlocker::NoHandler => "no persist handler is registered",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
#[error("cannot save: {reason}")]
/// The entity did not pass the save gate
pub struct SaveBlocked {
    pub reason: SaveBlocker,
}

#[derive(Debug, Error)]
/// Errors surfaced by [`save_with`](`crate::factory::save_with`)
pub enum SaveError {
    #[error(transparent)]
    Blocked(#[from] SaveBlocked),

    #[error("persist handler failed: {0:?}")]
    Handler(#[from] anyhow::Error),
}
