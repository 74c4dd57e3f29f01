//! Rules: validation and side-effect logic triggered by property changes
//!
//! A rule is a unit of logic attached to one or more *trigger properties* of
//! a node. When a trigger property changes, the rule becomes eligible for
//! execution; the engine runs eligible rules strictly one at a time, in
//! [`order`](`RuleDef::order`)-then-registration order, even when individual
//! rules are asynchronous. Rules may read and write properties of their
//! target node, so concurrent execution would race on shared derived state.
//!
//! Rules are registered on a [`Blueprint`](`crate::node::Blueprint`) and
//! identified by their [`RuleId`]: the ordinal assigned in registration
//! order. The ordinal tags every message the rule produces, which is what
//! lets a later re-run of one rule replace exactly its own messages, and
//! what lets messages survive a serialize/deserialize round trip.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PropertyError, SerializationError};
use crate::node::{self, NodeInner};
use crate::sync::Interrupt;

pub mod annotations;
mod engine;
mod flags;

pub(crate) use engine::{enqueue, select_for_property, select_with_flags, Engine};
pub use flags::RunFlags;

/// Stable identifier of a rule on its owning node.
///
/// Assigned by blueprint registration order, so every instance of a
/// blueprint (including the deserializing side of a round trip) assigns the
/// same ordinal to the same rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RuleId(pub usize);

impl Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule #{}", self.0)
    }
}

/// The messages produced by one rule execution.
///
/// An empty outcome means the rule passed: any messages the rule previously
/// wrote are cleared when the outcome is applied.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub(crate) entries: Vec<(String, String)>,
}

impl Outcome {
    /// The rule passed; clear any messages it wrote before
    pub fn ok() -> Self {
        Self::default()
    }

    /// The rule failed validation for `property`
    pub fn invalid(property: impl Into<String>, text: impl Into<String>) -> Self {
        Outcome {
            entries: vec![(property.into(), text.into())],
        }
    }

    /// Add another message to this outcome
    pub fn and(mut self, property: impl Into<String>, text: impl Into<String>) -> Self {
        self.entries.push((property.into(), text.into()));
        self
    }

    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Execution context handed to a rule: the owning node plus the optional
/// cancellation signal of the run that triggered it.
///
/// All property access goes through the context. `set` re-enters the normal
/// change path, so rules assigning properties cascade into further rule
/// executions; `load` is the silent path for bookkeeping writes that must
/// not re-trigger anything.
pub struct RuleContext {
    pub(crate) node: Arc<NodeInner>,
    pub(crate) interrupt: Interrupt,
}

impl RuleContext {
    /// Current value of a scalar property
    pub fn get(&self, property: &str) -> Result<Value, PropertyError> {
        node::get_value(&self.node, property)
    }

    /// Current value of a scalar property, deserialized
    pub fn get_as<T: DeserializeOwned>(&self, property: &str) -> Result<T, PropertyError> {
        let value = self.get(property)?;
        serde_json::from_value(value)
            .map_err(|e| PropertyError::Serialization(SerializationError(e)))
    }

    /// Assign a property through the tracking path.
    ///
    /// The assignment marks the property modified and triggers the rules
    /// registered for it; the cascade drains before the node goes idle.
    pub fn set(&self, property: &str, value: impl Serialize) -> Result<(), PropertyError> {
        let value = serde_json::to_value(value).map_err(SerializationError)?;
        node::set_value(&self.node, property, value, self.interrupt.clone())
    }

    /// Assign a property silently: no modification flag, no rule
    /// triggering, no notifications. Bypasses the read-only check, as this
    /// is the trusted bookkeeping path.
    pub fn load(&self, property: &str, value: impl Serialize) -> Result<(), PropertyError> {
        let value = serde_json::to_value(value).map_err(SerializationError)?;
        node::load_value(&self.node, property, value)
    }

    /// Display name of a property, for use in messages
    pub fn display_name(&self, property: &str) -> Result<String, PropertyError> {
        node::label_of(&self.node, property)
    }

    /// Cancellation signal of the run that triggered this execution.
    ///
    /// The engine never aborts a rule mid-execution; long-running rules may
    /// poll this to bail out voluntarily.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}

#[async_trait]
/// A unit of validation or side-effect logic.
///
/// Most rules are built from closures through [`validate`],
/// [`validate_async`], [`act`] or [`act_async`]; implement the trait
/// directly for rules carrying their own configuration (see
/// [`annotations`]).
pub trait Rule: Send + Sync {
    /// Run the rule against its owning node.
    ///
    /// An `Err` marks the trigger properties invalid with a message derived
    /// from the error and is re-surfaced, together with any sibling faults,
    /// to the next `wait_for_tasks` caller. Sibling rules still run.
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome>;
}

/// A rule registration: trigger properties, execution order and the shared
/// logic
#[derive(Clone)]
pub struct RuleDef {
    pub(crate) triggers: Vec<String>,
    pub(crate) order: i32,
    pub(crate) logic: Arc<dyn Rule>,
}

impl RuleDef {
    pub fn new<I, S>(triggers: I, logic: impl Rule + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RuleDef {
            triggers: triggers.into_iter().map(Into::into).collect(),
            order: 0,
            logic: Arc::new(logic),
        }
    }

    /// Primary sort key when multiple rules share a trigger. Lower runs
    /// first; ties break by registration order.
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

/// Per-node slot for a registered rule
#[derive(Clone)]
pub(crate) struct RuleSlot {
    pub(crate) triggers: Vec<String>,
    pub(crate) order: i32,
    pub(crate) logic: Arc<dyn Rule>,
}

impl From<&RuleDef> for RuleSlot {
    fn from(def: &RuleDef) -> Self {
        RuleSlot {
            triggers: def.triggers.clone(),
            order: def.order,
            logic: def.logic.clone(),
        }
    }
}

/// A synchronous validation rule built from a closure
pub fn validate<I, S, F>(triggers: I, check: F) -> RuleDef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(&RuleContext) -> Outcome + Send + Sync + 'static,
{
    struct Validate<F>(F);

    #[async_trait]
    impl<F> Rule for Validate<F>
    where
        F: Fn(&RuleContext) -> Outcome + Send + Sync,
    {
        async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
            Ok((self.0)(&ctx))
        }
    }

    RuleDef::new(triggers, Validate(check))
}

/// An asynchronous validation rule built from a closure returning a future
pub fn validate_async<I, S, F, Fut>(triggers: I, check: F) -> RuleDef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(RuleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    struct ValidateAsync<F>(F);

    #[async_trait]
    impl<F, Fut> Rule for ValidateAsync<F>
    where
        F: Fn(RuleContext) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
            (self.0)(ctx).await
        }
    }

    RuleDef::new(triggers, ValidateAsync(check))
}

/// A synchronous side-effect rule: produces no messages of its own
pub fn act<I, S, F>(triggers: I, action: F) -> RuleDef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(&RuleContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    struct Act<F>(F);

    #[async_trait]
    impl<F> Rule for Act<F>
    where
        F: Fn(&RuleContext) -> anyhow::Result<()> + Send + Sync,
    {
        async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
            (self.0)(&ctx)?;
            Ok(Outcome::ok())
        }
    }

    RuleDef::new(triggers, Act(action))
}

/// An asynchronous side-effect rule: produces no messages of its own
pub fn act_async<I, S, F, Fut>(triggers: I, action: F) -> RuleDef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(RuleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    struct ActAsync<F>(F);

    #[async_trait]
    impl<F, Fut> Rule for ActAsync<F>
    where
        F: Fn(RuleContext) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
            (self.0)(ctx).await?;
            Ok(Outcome::ok())
        }
    }

    RuleDef::new(triggers, ActAsync(action))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accumulates_entries() {
        let outcome = Outcome::invalid("name", "name is required").and("age", "age is required");
        assert!(!outcome.is_clean());
        assert_eq!(outcome.entries.len(), 2);
    }

    #[test]
    fn rule_ids_display_their_ordinal() {
        assert_eq!(RuleId(3).to_string(), "rule #3");
    }

    #[test]
    fn rule_defs_default_to_order_zero() {
        let def = validate(["name"], |_| Outcome::ok());
        assert_eq!(def.order, 0);
        assert_eq!(def.order(5).order, 5);
    }
}
