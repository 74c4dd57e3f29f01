//! Graph nodes: the stateful objects of an editable aggregate
//!
//! A node owns one [`Property`](`crate::property`) container per declared
//! property, aggregates their state into object-level meta-properties and
//! maintains the parent/child links of the graph. Nodes come in three
//! capability tiers, modeled as typestate over a shared implementation:
//!
//! - [`Node<Bindable>`]: busy tracking and change notification only
//! - [`Node<Validated>`]: adds validity, messages and rule runs
//! - [`Node<Entity>`]: adds the persistence lifecycle (`is_new`,
//!   `is_deleted`, `is_modified`, `is_savable`) and parent/child membership
//!
//! Child slots and collections exist only on entity blueprints and hold
//! entity nodes, so an entity can never end up nested under a node that
//! does not propagate modification state. The constraint is enforced at
//! construction time by the type system rather than checked at runtime.
//!
//! Nodes are cheap handles: cloning shares the underlying state. The
//! framework assumes a single writer at a time per node; concurrency exists
//! only in the tracking of overlapping asynchronous rule executions.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use crate::errors::{
    AggregateError, PropertyError, RuleFailure, RunError, SerializationError, WaitError,
};
use crate::property::{Property, PropertyState, PropertyValue};
use crate::rule::{self, RuleId, RuleSlot, RunFlags};
use crate::snapshot::{self, NodeSnapshot};
use crate::sync::{self, Interrupt};

mod blueprint;
mod collection;
mod events;
mod meta;

pub use blueprint::{prop, Blueprint, PropertyDef};
pub use collection::EntityList;
pub use events::{ChangeEvent, ChangeKind};
pub use meta::Meta;

mod sealed {
    pub trait Sealed {}
}

/// Capability tier of a node. Sealed; the only tiers are [`Bindable`],
/// [`Validated`] and [`Entity`].
pub trait Capability: sealed::Sealed + Send + Sync + 'static {}

/// Tiers that carry the rule engine and the validity surface
pub trait Validating: Capability {}

/// Tier 1: busy tracking and change notification
#[derive(Clone, Copy)]
pub struct Bindable;
/// Tier 2: adds validation state and rule runs
#[derive(Clone, Copy)]
pub struct Validated;
/// Tier 3: adds the persistence lifecycle and graph membership
#[derive(Clone, Copy)]
pub struct Entity;

impl sealed::Sealed for Bindable {}
impl sealed::Sealed for Validated {}
impl sealed::Sealed for Entity {}
impl Capability for Bindable {}
impl Capability for Validated {}
impl Capability for Entity {}
impl Validating for Validated {}
impl Validating for Entity {}

/// Non-owning back-reference from a child to the node that holds it
#[derive(Clone)]
pub(crate) struct ParentLink {
    pub(crate) node: Weak<NodeInner>,
    /// Name of the property slot the child is reachable through, used to
    /// build dotted paths while events bubble
    pub(crate) slot: String,
}

pub(crate) struct NodeState {
    pub(crate) props: Vec<Property>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) executed: Vec<bool>,
    pub(crate) new: bool,
    pub(crate) deleted: bool,
    pub(crate) marked_modified: bool,
    pub(crate) child: bool,
    pub(crate) paused: bool,
    /// Set when a waiter observed an interrupt; cleared by the next full
    /// rule run
    pub(crate) interrupted: bool,
    pub(crate) faults: Vec<RuleFailure>,
    /// Cached aggregate, kept fresh by [`touch`] so parents can aggregate
    /// without re-walking the whole subtree
    pub(crate) meta: Meta,
}

pub(crate) struct NodeInner {
    pub(crate) id: u64,
    pub(crate) kind: String,
    pub(crate) rules: Vec<RuleSlot>,
    pub(crate) state: RwLock<NodeState>,
    pub(crate) engine: Mutex<rule::Engine>,
    /// Count of queued plus running rule executions
    pub(crate) pending: watch::Sender<usize>,
    pub(crate) meta_tx: watch::Sender<Meta>,
    pub(crate) events: broadcast::Sender<ChangeEvent>,
}

/// A handle to a graph node of capability tier `C`.
///
/// Handles are cheap to clone and compare equal when they refer to the same
/// underlying node.
pub struct Node<C: Capability = Entity> {
    pub(crate) inner: Arc<NodeInner>,
    _tier: PhantomData<C>,
}

impl<C: Capability> Clone for Node<C> {
    fn clone(&self) -> Self {
        Node {
            inner: Arc::clone(&self.inner),
            _tier: PhantomData,
        }
    }
}

impl<C: Capability> PartialEq for Node<C> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<C: Capability> Eq for Node<C> {}

impl<C: Capability> fmt::Debug for Node<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.inner.kind)
            .field("id", &self.inner.id)
            .finish()
    }
}

/// An aggregated validation message with the dotted path of the property
/// that carries it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessage {
    /// Dotted path from the node the aggregation started on
    pub path: String,
    /// Stable ordinal of the producing rule on the owning node
    pub rule: RuleId,
    pub text: String,
}

impl<C: Capability> Node<C> {
    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Node {
            inner,
            _tier: PhantomData,
        }
    }

    /// Blueprint name this node was built from
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Process-unique id of this node instance, as carried by
    /// [`ChangeEvent::source`]
    pub fn uid(&self) -> u64 {
        self.inner.id
    }

    /// Current aggregate meta-state
    pub fn meta(&self) -> Meta {
        compute_meta(&self.inner)
    }

    /// Whether this node or any descendant has in-flight rule executions
    pub fn is_busy(&self) -> bool {
        self.meta().is_busy
    }

    /// The property container view for direct inspection and binding
    pub fn property(&self, name: &str) -> Result<PropertyState, PropertyError> {
        let state = sync::read(&self.inner.state);
        let &idx = state
            .index
            .get(name)
            .ok_or_else(|| self.unknown(name))?;
        Ok(PropertyState::capture(&state.props[idx]))
    }

    /// Current value of a scalar property
    pub fn get(&self, name: &str) -> Result<Value, PropertyError> {
        get_value(&self.inner, name)
    }

    /// Current value of a scalar property, deserialized
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, PropertyError> {
        let value = self.get(name)?;
        serde_json::from_value(value)
            .map_err(|e| PropertyError::Serialization(SerializationError(e)))
    }

    /// Assign a property silently: no rule triggering, no modification
    /// flag, no notifications.
    ///
    /// This is the population path used when loading from a data source.
    pub fn load(&self, name: &str, value: impl Serialize) -> Result<(), PropertyError> {
        let value = serde_json::to_value(value).map_err(SerializationError)?;
        load_value(&self.inner, name, value)
    }

    /// Subscribe to the change notifications of this node.
    ///
    /// Events originating in descendants bubble up with their path prefixed
    /// by the child slots they came through.
    pub fn on_change(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    /// A stream producing the aggregate meta-state every time it changes
    pub fn follow(&self) -> WatchStream<Meta> {
        WatchStream::new(self.inner.meta_tx.subscribe())
    }

    /// Wait until every in-flight rule execution on this node and all of
    /// its descendants has completed.
    ///
    /// Rule faults accumulated while draining are surfaced here as a single
    /// aggregate error.
    pub async fn wait_for_tasks(&self) -> Result<(), WaitError> {
        wait_idle(&self.inner).await;
        settle(&self.inner)
    }

    /// Like [`wait_for_tasks`](`Node::wait_for_tasks`), giving up when the
    /// interrupt triggers.
    ///
    /// Cancelling affects only this waiter: in-flight rules run to
    /// completion in the background. The node is marked invalid until the
    /// next full rule run.
    pub async fn wait_for_tasks_until(&self, interrupt: &Interrupt) -> Result<(), WaitError> {
        tokio::select! {
            _ = wait_idle(&self.inner) => settle(&self.inner),
            _ = interrupt.wait() => {
                {
                    let mut state = sync::write(&self.inner.state);
                    state.interrupted = true;
                }
                touch(&self.inner, None);
                Err(WaitError::Interrupted)
            }
        }
    }

    /// Capture the full reachable graph: values, per-rule messages, meta
    /// flags
    pub fn snapshot(&self) -> NodeSnapshot {
        snapshot::capture(&self.inner)
    }

    fn unknown(&self, name: &str) -> PropertyError {
        PropertyError::Unknown {
            node: self.inner.kind.clone(),
            name: name.to_string(),
        }
    }
}

impl<C: Validating> Node<C> {
    /// Assign a property through the tracking path.
    ///
    /// Setting the current value again is a no-op. Otherwise the property
    /// is flagged modified, the rules triggered by it are queued (their
    /// trigger properties are busy when this returns) and change
    /// notifications bubble towards the aggregate root. Await
    /// [`wait_for_tasks`](`Node::wait_for_tasks`) to observe the settled
    /// validation state.
    ///
    /// Must be called within a Tokio runtime when rules are registered for
    /// the property.
    pub fn set(&self, name: &str, value: impl Serialize) -> Result<(), PropertyError> {
        let value = serde_json::to_value(value).map_err(SerializationError)?;
        set_value(&self.inner, name, value, Interrupt::new())
    }

    /// Whether own properties and every descendant are free of messages
    pub fn is_valid(&self) -> bool {
        self.meta().is_valid
    }

    /// Whether own properties are free of messages, ignoring descendants
    pub fn is_self_valid(&self) -> bool {
        self.meta().is_self_valid
    }

    /// All validation messages of this node and its descendants, keyed by
    /// dotted path and producing rule
    pub fn messages(&self) -> Vec<NodeMessage> {
        let mut out = Vec::new();
        collect_messages(&self.inner, "", &mut out);
        out
    }

    /// Clear every message on this node and all of its descendants
    pub fn clear_all_messages(&self) {
        let nodes = descendants(&self.inner);
        for node in &nodes {
            let mut state = sync::write(&node.state);
            for prop in state.props.iter_mut() {
                prop.clear_messages();
            }
        }
        for node in nodes.iter().rev() {
            touch(node, None);
        }
    }

    /// Clear every message on this node's own properties
    pub fn clear_self_messages(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            for prop in state.props.iter_mut() {
                prop.clear_messages();
            }
        }
        touch(&self.inner, None);
    }

    /// Queue the rules selected by `flags` on this node (and, unless
    /// [`RunFlags::SELF_ONLY`] is given, on every descendant), then wait
    /// for the graph to settle.
    ///
    /// A full run clears the invalid marker left behind by an interrupted
    /// wait.
    pub async fn run_rules(&self, flags: RunFlags) -> Result<(), WaitError> {
        self.run_rules_until(flags, &Interrupt::new()).await
    }

    /// Like [`run_rules`](`Node::run_rules`), giving up the wait when the
    /// interrupt triggers
    pub async fn run_rules_until(
        &self,
        flags: RunFlags,
        interrupt: &Interrupt,
    ) -> Result<(), WaitError> {
        let targets = if flags.contains(RunFlags::SELF_ONLY) {
            vec![Arc::clone(&self.inner)]
        } else {
            descendants(&self.inner)
        };
        for node in &targets {
            {
                let mut state = sync::write(&node.state);
                state.interrupted = false;
            }
            let selected = rule::select_with_flags(node, flags);
            rule::enqueue(node, &selected, interrupt);
        }
        self.wait_for_tasks_until(interrupt).await
    }

    /// Run the rules triggered by one property and wait for the cascade to
    /// settle
    pub async fn run_rules_for(&self, property: &str) -> Result<(), RunError> {
        {
            let state = sync::read(&self.inner.state);
            if !state.index.contains_key(property) {
                return Err(RunError::UnknownProperty {
                    name: property.to_string(),
                });
            }
        }
        let selected = rule::select_for_property(&self.inner, property);
        rule::enqueue(&self.inner, &selected, &Interrupt::new());
        self.wait_for_tasks().await?;
        Ok(())
    }

    /// Run a single rule by its stable ordinal and wait for it (and any
    /// cascade it causes) to settle
    pub async fn run_rule(&self, rule: RuleId) -> Result<(), RunError> {
        if rule.0 >= self.inner.rules.len() {
            return Err(RunError::UnknownRule { rule });
        }
        rule::enqueue(&self.inner, &[rule.0], &Interrupt::new());
        self.wait_for_tasks().await?;
        Ok(())
    }

    /// Suspend notifications, rule triggering and modification tracking for
    /// bulk mutations.
    ///
    /// The scope is a plain flag, not a ref-counted nesting: the innermost
    /// [`resume_side_effects`](`Node::resume_side_effects`) unconditionally
    /// un-pauses.
    pub fn pause_side_effects(&self) {
        let mut state = sync::write(&self.inner.state);
        state.paused = true;
    }

    /// Resume side effects and recompute the aggregate meta-state exactly
    /// once. Rules are not re-run; request a full
    /// [`run_rules`](`Node::run_rules`) afterwards if validation is wanted.
    pub fn resume_side_effects(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            state.paused = false;
        }
        touch(&self.inner, None);
    }
}

impl Node<Entity> {
    /// Whether this instance was created rather than fetched from a data
    /// source
    pub fn is_new(&self) -> bool {
        sync::read(&self.inner.state).new
    }

    /// Whether this instance is marked for removal on the next persist
    pub fn is_deleted(&self) -> bool {
        sync::read(&self.inner.state).deleted
    }

    /// Whether this node is owned by another node or collection
    pub fn is_child(&self) -> bool {
        sync::read(&self.inner.state).child
    }

    /// Whether this node was explicitly marked modified
    pub fn is_marked_modified(&self) -> bool {
        sync::read(&self.inner.state).marked_modified
    }

    pub fn is_modified(&self) -> bool {
        self.meta().is_modified
    }

    pub fn is_self_modified(&self) -> bool {
        self.meta().is_self_modified
    }

    /// `is_modified && is_valid && !is_busy && !is_child`
    pub fn is_savable(&self) -> bool {
        self.meta().is_savable
    }

    /// Flag this node modified without touching any property
    pub fn mark_modified(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            state.marked_modified = true;
        }
        touch(&self.inner, None);
    }

    /// Mark this node for removal. Counts as a modification.
    pub fn delete(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            state.deleted = true;
        }
        touch(&self.inner, None);
    }

    /// Revert a pending [`delete`](`Node::delete`)
    pub fn undelete(&self) {
        {
            let mut state = sync::write(&self.inner.state);
            state.deleted = false;
        }
        touch(&self.inner, None);
    }

    /// The node this one is a child of, if any
    pub fn parent(&self) -> Option<Node> {
        let link = sync::read(&self.inner.state).parent.clone()?;
        link.node.upgrade().map(Node::from_inner)
    }

    /// The aggregate root: the topmost ancestor. A node with no parent is
    /// its own root.
    pub fn root(&self) -> Node {
        Node::from_inner(root_of(&self.inner))
    }

    /// The child node held by the given slot
    pub fn child(&self, name: &str) -> Result<Node, PropertyError> {
        let state = sync::read(&self.inner.state);
        let &idx = state
            .index
            .get(name)
            .ok_or_else(|| self.unknown(name))?;
        match &state.props[idx].value {
            PropertyValue::Child(node) => Ok(node.clone()),
            _ => Err(PropertyError::NotChild {
                name: name.to_string(),
            }),
        }
    }

    /// The child collection held by the given slot
    pub fn list(&self, name: &str) -> Result<EntityList, PropertyError> {
        let state = sync::read(&self.inner.state);
        let &idx = state
            .index
            .get(name)
            .ok_or_else(|| self.unknown(name))?;
        match &state.props[idx].value {
            PropertyValue::List(list) => Ok(list.clone()),
            _ => Err(PropertyError::NotList {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn cached_meta(&self) -> Meta {
        sync::read(&self.inner.state).meta
    }

    pub(crate) fn mark_new(&self) {
        let mut state = sync::write(&self.inner.state);
        state.new = true;
    }

    pub(crate) fn mark_old(&self) {
        let mut state = sync::write(&self.inner.state);
        state.new = false;
    }

    pub(crate) fn mark_unmodified(&self) {
        let mut state = sync::write(&self.inner.state);
        state.marked_modified = false;
        for prop in state.props.iter_mut() {
            prop.modified = false;
        }
    }
}

/// Read the current value of a scalar property
pub(crate) fn get_value(inner: &Arc<NodeInner>, name: &str) -> Result<Value, PropertyError> {
    let state = sync::read(&inner.state);
    let &idx = state.index.get(name).ok_or_else(|| PropertyError::Unknown {
        node: inner.kind.clone(),
        name: name.to_string(),
    })?;
    state
        .props[idx]
        .scalar()
        .cloned()
        .ok_or_else(|| PropertyError::NotScalar {
            name: name.to_string(),
        })
}

/// The silent population path: assign with no rules, no modification flag
/// and no notifications
pub(crate) fn load_value(
    inner: &Arc<NodeInner>,
    name: &str,
    value: Value,
) -> Result<(), PropertyError> {
    let mut state = sync::write(&inner.state);
    let &idx = state.index.get(name).ok_or_else(|| PropertyError::Unknown {
        node: inner.kind.clone(),
        name: name.to_string(),
    })?;
    match &mut state.props[idx].value {
        PropertyValue::Scalar(slot) => {
            *slot = value;
            Ok(())
        }
        _ => Err(PropertyError::NotScalar {
            name: name.to_string(),
        }),
    }
}

/// The tracking path: assign, flag modified, queue triggered rules, notify.
///
/// While the node is paused this degrades to the silent load path.
pub(crate) fn set_value(
    inner: &Arc<NodeInner>,
    name: &str,
    value: Value,
    interrupt: Interrupt,
) -> Result<(), PropertyError> {
    {
        let mut guard = sync::write(&inner.state);
        let state = &mut *guard;
        let &idx = state.index.get(name).ok_or_else(|| PropertyError::Unknown {
            node: inner.kind.clone(),
            name: name.to_string(),
        })?;
        let paused = state.paused;
        let prop = &mut state.props[idx];
        let current = match &mut prop.value {
            PropertyValue::Scalar(current) => current,
            _ => {
                return Err(PropertyError::NotScalar {
                    name: name.to_string(),
                })
            }
        };
        if paused {
            *current = value;
            return Ok(());
        }
        if prop.read_only {
            return Err(PropertyError::ReadOnly {
                name: name.to_string(),
            });
        }
        if *current == value {
            // equality no-op: no modification flag, no rule execution
            return Ok(());
        }
        *current = value;
        prop.modified = true;
    }

    trace!(node = inner.id, property = name, "property changed");
    let selected = rule::select_for_property(inner, name);
    rule::enqueue(inner, &selected, &interrupt);
    touch(inner, Some(ChangeEvent::value(inner.id, name)));
    Ok(())
}

/// Display label of a property for use in messages
pub(crate) fn label_of(inner: &Arc<NodeInner>, name: &str) -> Result<String, PropertyError> {
    let state = sync::read(&inner.state);
    let &idx = state.index.get(name).ok_or_else(|| PropertyError::Unknown {
        node: inner.kind.clone(),
        name: name.to_string(),
    })?;
    Ok(state.props[idx].label().to_string())
}

/// Recompute the aggregate meta-state of a node from its own properties,
/// the engine queue and the cached state of its children
pub(crate) fn compute_meta(inner: &Arc<NodeInner>) -> Meta {
    let mut self_valid = true;
    let mut props_busy = false;
    let mut props_modified = false;
    let mut children = Vec::new();
    let mut lists = Vec::new();
    let (new, deleted, marked_modified, child, interrupted);
    {
        let state = sync::read(&inner.state);
        for prop in &state.props {
            self_valid &= prop.is_valid();
            props_busy |= prop.is_busy();
            props_modified |= prop.modified;
            match &prop.value {
                PropertyValue::Child(node) => children.push(node.clone()),
                PropertyValue::List(list) => lists.push(list.clone()),
                PropertyValue::Scalar(_) => {}
            }
        }
        new = state.new;
        deleted = state.deleted;
        marked_modified = state.marked_modified;
        child = state.child;
        interrupted = state.interrupted;
    }

    let mut nested_valid = true;
    let mut nested_modified = false;
    let mut nested_busy = false;
    for node in &children {
        let meta = node.cached_meta();
        nested_valid &= meta.is_valid;
        nested_modified |= meta.is_modified;
        nested_busy |= meta.is_busy;
    }
    for list in &lists {
        let (valid, modified, busy) = list.aggregate();
        nested_valid &= valid;
        nested_modified |= modified;
        nested_busy |= busy;
    }

    let pending = *inner.pending.borrow();

    let is_self_valid = self_valid && !interrupted;
    let is_valid = is_self_valid && nested_valid;
    let is_self_modified = props_modified || new || deleted || marked_modified;
    let is_modified = is_self_modified || nested_modified;
    let is_busy = props_busy || pending > 0 || nested_busy;

    Meta {
        is_self_valid,
        is_valid,
        is_self_modified,
        is_modified,
        is_busy,
        is_savable: is_modified && is_valid && !is_busy && !child,
    }
}

/// Refresh the cached meta-state and propagate notifications towards the
/// aggregate root.
///
/// `event` is the notification that caused the refresh, if any; it is
/// re-emitted on every ancestor with the path prefixed by the child slot it
/// bubbled through. When the cached meta changes, a meta event and a value
/// on the [`follow`](`Node::follow`) stream are emitted as well.
pub(crate) fn touch(inner: &Arc<NodeInner>, event: Option<ChangeEvent>) {
    {
        let state = sync::read(&inner.state);
        if state.paused {
            return;
        }
    }

    let meta = compute_meta(inner);
    let (changed, parent) = {
        let mut state = sync::write(&inner.state);
        let changed = state.meta != meta;
        state.meta = meta;
        (changed, state.parent.clone())
    };

    if let Some(event) = &event {
        let _ = inner.events.send(event.clone());
    }
    if changed {
        inner.meta_tx.send_replace(meta);
        let _ = inner.events.send(ChangeEvent::meta(inner.id));
    }

    if changed || event.is_some() {
        if let Some(link) = parent {
            if let Some(parent) = link.node.upgrade() {
                touch(&parent, event.map(|e| e.prefixed(&link.slot)));
            }
        }
    }
}

/// Every node of the subtree rooted at `inner`, in breadth-first order,
/// including items parked on deleted lists
pub(crate) fn descendants(inner: &Arc<NodeInner>) -> Vec<Arc<NodeInner>> {
    let mut out = vec![Arc::clone(inner)];
    let mut at = 0;
    while at < out.len() {
        let node = Arc::clone(&out[at]);
        at += 1;

        let (children, lists) = {
            let state = sync::read(&node.state);
            let mut children = Vec::new();
            let mut lists = Vec::new();
            for prop in &state.props {
                match &prop.value {
                    PropertyValue::Child(child) => children.push(child.clone()),
                    PropertyValue::List(list) => lists.push(list.clone()),
                    PropertyValue::Scalar(_) => {}
                }
            }
            (children, lists)
        };

        out.extend(children.into_iter().map(|child| child.inner));
        for list in lists {
            out.extend(list.iter_all().into_iter().map(|item| item.inner));
        }
    }
    out
}

/// Walk the parent chain to the aggregate root
pub(crate) fn root_of(inner: &Arc<NodeInner>) -> Arc<NodeInner> {
    let mut current = Arc::clone(inner);
    loop {
        let parent = sync::read(&current.state)
            .parent
            .as_ref()
            .and_then(|link| link.node.upgrade());
        match parent {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}

/// Wait until every node of the subtree reports an empty rule queue.
///
/// Cascades may enqueue work on nodes already observed, so passes repeat
/// until one observes the whole subtree idle.
pub(crate) async fn wait_idle(inner: &Arc<NodeInner>) {
    loop {
        let nodes = descendants(inner);
        if nodes.iter().all(|node| *node.pending.borrow() == 0) {
            break;
        }
        join_all(nodes.iter().map(|node| async move {
            let mut rx = node.pending.subscribe();
            let _ = rx.wait_for(|pending| *pending == 0).await;
        }))
        .await;
    }
}

/// Drain accumulated rule faults from the subtree
pub(crate) fn take_faults(inner: &Arc<NodeInner>) -> Vec<RuleFailure> {
    let mut faults = Vec::new();
    for node in descendants(inner) {
        let mut state = sync::write(&node.state);
        faults.append(&mut state.faults);
    }
    faults
}

fn settle(inner: &Arc<NodeInner>) -> Result<(), WaitError> {
    let faults = take_faults(inner);
    if faults.is_empty() {
        Ok(())
    } else {
        Err(WaitError::Rules(AggregateError(faults)))
    }
}

pub(crate) fn collect_messages(inner: &Arc<NodeInner>, prefix: &str, out: &mut Vec<NodeMessage>) {
    let mut children = Vec::new();
    let mut lists = Vec::new();
    {
        let state = sync::read(&inner.state);
        for prop in &state.props {
            for message in prop.messages() {
                out.push(NodeMessage {
                    path: format!("{prefix}{}", prop.name),
                    rule: message.rule,
                    text: message.text,
                });
            }
            match &prop.value {
                PropertyValue::Child(node) => children.push((prop.name.clone(), node.clone())),
                PropertyValue::List(list) => lists.push((prop.name.clone(), list.clone())),
                PropertyValue::Scalar(_) => {}
            }
        }
    }
    for (slot, node) in children {
        collect_messages(&node.inner, &format!("{prefix}{slot}."), out);
    }
    for (slot, list) in lists {
        for (at, item) in list.items().into_iter().enumerate() {
            collect_messages(&item.inner, &format!("{prefix}{slot}[{at}]."), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PropertyError;
    use serde_json::json;

    fn document() -> Blueprint {
        Blueprint::entity("Document")
            .property(prop("title"))
            .property(prop("revision").default_value(0).read_only())
            .property(prop("body").display("Body text"))
    }

    #[test]
    fn fetched_nodes_start_clean() {
        let node = document().fetch();
        assert!(!node.is_new());
        assert!(!node.is_modified());
        assert!(node.is_valid());
        assert!(!node.is_busy());
        assert!(!node.is_savable());
    }

    #[test]
    fn setting_a_value_marks_the_property_and_node_modified() {
        let node = document().fetch();
        node.set("title", "draft").unwrap();

        assert!(node.property("title").unwrap().modified);
        assert!(node.is_self_modified());
        assert!(node.is_savable());
    }

    #[test]
    fn setting_the_current_value_is_a_no_op() {
        let node = document().fetch();
        node.set("revision", 0).unwrap_err();

        // the default is already 0; assigning it again must not flag
        // anything
        node.set("title", Value::Null).unwrap();
        assert!(!node.property("title").unwrap().modified);
        assert!(!node.is_modified());
    }

    #[test]
    fn read_only_properties_reject_set_but_accept_load() {
        let node = document().fetch();
        let err = node.set("revision", 7).unwrap_err();
        assert!(matches!(err, PropertyError::ReadOnly { .. }));

        node.load("revision", 7).unwrap();
        assert_eq!(node.get("revision").unwrap(), json!(7));
        assert!(!node.is_modified());
    }

    #[test]
    fn unknown_properties_are_an_error() {
        let node = document().fetch();
        assert!(matches!(
            node.get("missing"),
            Err(PropertyError::Unknown { .. })
        ));
        assert!(matches!(
            node.set("missing", 1),
            Err(PropertyError::Unknown { .. })
        ));
    }

    #[test]
    fn load_does_not_notify_or_flag() {
        let node = document().fetch();
        node.load("title", "loaded").unwrap();

        assert_eq!(node.get_as::<String>("title").unwrap(), "loaded");
        assert!(!node.property("title").unwrap().modified);
        assert!(!node.is_modified());
    }

    #[test]
    fn pause_suppresses_tracking_until_resume() {
        let node = document().fetch();
        node.pause_side_effects();
        node.set("title", "bulk").unwrap();
        node.set("body", "bulk body").unwrap();
        node.resume_side_effects();

        assert_eq!(node.get("title").unwrap(), json!("bulk"));
        assert!(!node.is_modified());
    }

    #[test]
    fn delete_counts_as_modification() {
        let node = document().fetch();
        node.delete();
        assert!(node.is_deleted());
        assert!(node.is_self_modified());

        node.undelete();
        assert!(!node.is_deleted());
        assert!(!node.is_self_modified());
    }

    #[test]
    fn mark_modified_without_touching_properties() {
        let node = document().fetch();
        node.mark_modified();
        assert!(node.is_marked_modified());
        assert!(node.is_modified());
    }

    #[test]
    fn child_state_rolls_up_into_the_parent() {
        let address = Blueprint::entity("Address").property(prop("city"));
        let person = Blueprint::entity("Person")
            .property(prop("name"))
            .child("address", address);

        let node = person.fetch();
        let address = node.child("address").unwrap();
        assert_eq!(node, address.parent().unwrap());
        assert!(address.is_child());

        address.set("city", "Lyon").unwrap();
        assert!(!node.is_self_modified());
        assert!(node.is_modified());
        assert_eq!(node.root(), node);
        assert_eq!(address.root(), node);
    }

    #[test]
    fn savable_is_an_exact_function_of_its_inputs() {
        let node = document().fetch();
        // not modified
        assert!(!node.is_savable());

        node.set("title", "x").unwrap();
        assert!(node.is_savable());

        // children are not savable
        let person = Blueprint::entity("Person")
            .property(prop("name"))
            .child("doc", document());
        let parent = person.fetch();
        let doc = parent.child("doc").unwrap();
        doc.set("title", "y").unwrap();
        assert!(doc.is_modified() && doc.is_valid() && !doc.is_busy());
        assert!(!doc.is_savable());
        assert!(parent.is_savable());
    }

    #[test]
    fn validated_tier_exposes_validity_without_lifecycle() {
        let form = Blueprint::validated("Form").property(prop("field"));
        let node: Node<Validated> = form.fetch();
        node.set("field", "value").unwrap();
        assert!(node.is_valid());
        assert!(node.is_self_valid());
    }

    #[test]
    fn bindable_tier_provides_binding_only() {
        let node: Node<Bindable> = Blueprint::bindable("Display")
            .property(prop("label"))
            .fetch();
        node.load("label", "ready").unwrap();

        assert!(!node.is_busy());
        assert_eq!(node.get_as::<String>("label").unwrap(), "ready");
        assert_eq!(node.property("label").unwrap().name, "label");
    }

    #[test]
    fn bubbled_events_carry_the_dotted_path() {
        let address = Blueprint::entity("Address").property(prop("city"));
        let person = Blueprint::entity("Person")
            .property(prop("name"))
            .child("address", address);

        let node = person.fetch();
        let mut events = node.on_change();
        node.child("address").unwrap().set("city", "Nantes").unwrap();

        let event = loop {
            let event = events.try_recv().unwrap();
            if event.kind == ChangeKind::Value {
                break event;
            }
        };
        assert_eq!(event.property, "city");
        assert_eq!(event.path, "address.city");
    }
}
