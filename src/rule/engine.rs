//! Rule selection, ordering and the per-node drain task
//!
//! Each node owns one queue of pending executions. Whatever enqueues first
//! spawns the drain task; the task pops executions one at a time and awaits
//! each to completion before starting the next, so rules never run
//! concurrently against the same node. A rule assigning a property during
//! its execution appends to the same queue, which is how cascades settle to
//! a fixed point before the node goes idle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::errors::RuleFailure;
use crate::node::{touch, NodeInner};
use crate::rule::{RuleContext, RuleId, RunFlags};
use crate::sync::{self, next_execution_id, Interrupt};

/// Queue bookkeeping for a node
#[derive(Default)]
pub(crate) struct Engine {
    queue: VecDeque<QueuedRule>,
    running: bool,
}

/// One pending rule execution
struct QueuedRule {
    ordinal: usize,
    execution: u64,
    interrupt: Interrupt,
}

/// Ordinals of the rules triggered by a change of `property`, sorted by
/// `(order, ordinal)`
pub(crate) fn select_for_property(inner: &Arc<NodeInner>, property: &str) -> Vec<usize> {
    let mut selected: Vec<usize> = inner
        .rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.triggers.iter().any(|t| t == property))
        .map(|(ordinal, _)| ordinal)
        .collect();
    selected.sort_by_key(|&ordinal| (inner.rules[ordinal].order, ordinal));
    selected
}

/// Ordinals of the rules matching the given selection flags, sorted by
/// `(order, ordinal)`
pub(crate) fn select_with_flags(inner: &Arc<NodeInner>, flags: RunFlags) -> Vec<usize> {
    let state = sync::read(&inner.state);
    let mut selected: Vec<usize> = (0..inner.rules.len())
        .filter(|&ordinal| {
            let has_messages = state
                .props
                .iter()
                .any(|p| p.has_messages_for(RuleId(ordinal)));
            flags.selects(state.executed[ordinal], has_messages)
        })
        .collect();
    drop(state);
    selected.sort_by_key(|&ordinal| (inner.rules[ordinal].order, ordinal));
    selected
}

/// Queue the given rules for execution, marking their trigger properties
/// busy before this call returns.
///
/// Busy markers carry a fresh execution id each, so overlapping executions
/// triggered by the same property clear their own contribution
/// independently. Spawns the drain task unless one is already running.
pub(crate) fn enqueue(inner: &Arc<NodeInner>, ordinals: &[usize], interrupt: &Interrupt) {
    if ordinals.is_empty() {
        return;
    }

    let mut batch = Vec::with_capacity(ordinals.len());
    {
        let mut guard = sync::write(&inner.state);
        let state = &mut *guard;
        for &ordinal in ordinals {
            let execution = next_execution_id();
            for trigger in &inner.rules[ordinal].triggers {
                if let Some(&idx) = state.index.get(trigger) {
                    state.props[idx].mark_busy(execution);
                }
            }
            batch.push(QueuedRule {
                ordinal,
                execution,
                interrupt: interrupt.clone(),
            });
        }
    }

    inner.pending.send_modify(|pending| *pending += batch.len());

    let spawn_drain = {
        let mut engine = sync::lock(&inner.engine);
        engine.queue.extend(batch);
        !std::mem::replace(&mut engine.running, true)
    };

    if spawn_drain {
        let node = Arc::clone(inner);
        tokio::spawn(drain(node));
    }

    touch(inner, None);
}

async fn drain(inner: Arc<NodeInner>) {
    loop {
        let next = {
            let mut engine = sync::lock(&inner.engine);
            match engine.queue.pop_front() {
                Some(item) => item,
                None => {
                    engine.running = false;
                    break;
                }
            }
        };
        run_one(&inner, next).await;
    }
    trace!(node = inner.id, "rule queue drained");
}

#[instrument(name = "run_rule", skip_all, fields(node = inner.id, rule = item.ordinal))]
async fn run_one(inner: &Arc<NodeInner>, item: QueuedRule) {
    let slot = inner.rules[item.ordinal].clone();
    let ctx = RuleContext {
        node: Arc::clone(inner),
        interrupt: item.interrupt.clone(),
    };

    let result = slot.logic.execute(ctx).await;
    let rule = RuleId(item.ordinal);

    {
        let mut guard = sync::write(&inner.state);
        let state = &mut *guard;
        match result {
            Ok(outcome) => {
                // replace semantics: drop whatever this rule wrote on a
                // previous run, across all properties, then apply the new
                // messages
                for prop in state.props.iter_mut() {
                    prop.clear_messages_for_rule(rule);
                }

                let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (property, text) in outcome.entries {
                    grouped.entry(property).or_default().push(text);
                }
                for (property, texts) in grouped {
                    match state.index.get(&property) {
                        Some(&idx) => state.props[idx].set_messages_for_rule(rule, texts),
                        None => {
                            warn!(node = inner.id, %rule, %property, "message for unknown property");
                            state.faults.push(RuleFailure {
                                rule,
                                message: format!("wrote message for unknown property `{property}`"),
                            });
                        }
                    }
                }
            }
            Err(error) => {
                // the fault invalidates the trigger properties and is
                // re-surfaced to the next awaiting wait_for_tasks caller;
                // sibling rules keep running
                let message = error.to_string();
                for trigger in &slot.triggers {
                    if let Some(&idx) = state.index.get(trigger) {
                        state.props[idx].set_messages_for_rule(rule, vec![message.clone()]);
                    }
                }
                state.faults.push(RuleFailure { rule, message });
            }
        }

        for trigger in &slot.triggers {
            if let Some(&idx) = state.index.get(trigger) {
                state.props[idx].clear_busy(item.execution);
            }
        }
        state.executed[item.ordinal] = true;
    }

    inner.pending.send_modify(|pending| *pending = pending.saturating_sub(1));
    touch(inner, None);
}
