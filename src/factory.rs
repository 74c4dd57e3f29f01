//! Factory lifecycle callbacks and the persistence gate
//!
//! The host's factory drives the node through its persistence lifecycle:
//! [`factory_start`](`Node::factory_start`) suspends side effects for the
//! duration of a bulk population, [`factory_complete`](`Node::factory_complete`)
//! resumes them and applies the lifecycle transition for the operation that
//! just ran. The core's obligation towards the persistence collaborator is
//! to expose the lifecycle flags accurately and to gate saves through
//! [`save_gate`](`Node::save_gate`).

use async_trait::async_trait;

use crate::errors::{SaveBlocked, SaveBlocker, SaveError};
use crate::node::{Entity, Node};

/// The lifecycle operation a factory is performing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Fetch,
    Insert,
    Update,
    Delete,
}

/// The persistence operation implied by an entity's lifecycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Insert,
    Update,
    Delete,
}

impl Node<Entity> {
    /// Enter a factory operation: side effects are suspended so the bulk
    /// population does not fire notifications, rules or modification flags
    /// per mutation
    pub fn factory_start(&self, _operation: OperationKind) {
        self.pause_side_effects();
    }

    /// Leave a factory operation: side effects resume (recomputing the
    /// aggregate state once) and the lifecycle transition is applied.
    ///
    /// `Create` marks the node new; `Fetch`, `Insert` and `Update` mark it
    /// old and unmodified. Transitions apply to this node; children go
    /// through their own factory lifecycle.
    pub fn factory_complete(&self, operation: OperationKind) {
        match operation {
            OperationKind::Create => self.mark_new(),
            OperationKind::Fetch | OperationKind::Insert | OperationKind::Update => {
                self.mark_old();
                self.mark_unmodified();
            }
            OperationKind::Delete => {
                self.mark_unmodified();
            }
        }
        self.resume_side_effects();
    }

    /// The persistence pre-check: which operation the current flags call
    /// for, or the reason nothing can be saved.
    ///
    /// Savable means modified, valid, not busy and not a child; the
    /// returned operation follows from `is_new`/`is_deleted`.
    pub fn save_gate(&self) -> Result<PersistOp, SaveBlocked> {
        let meta = self.meta();
        if self.is_child() {
            return Err(SaveBlocked {
                reason: SaveBlocker::IsChild,
            });
        }
        if !meta.is_valid {
            return Err(SaveBlocked {
                reason: SaveBlocker::Invalid,
            });
        }
        if !meta.is_modified {
            return Err(SaveBlocked {
                reason: SaveBlocker::NotModified,
            });
        }
        if meta.is_busy {
            return Err(SaveBlocked {
                reason: SaveBlocker::Busy,
            });
        }

        if self.is_deleted() {
            if self.is_new() {
                // never persisted, nothing to delete
                return Err(SaveBlocked {
                    reason: SaveBlocker::NotModified,
                });
            }
            Ok(PersistOp::Delete)
        } else if self.is_new() {
            Ok(PersistOp::Insert)
        } else {
            Ok(PersistOp::Update)
        }
    }
}

#[async_trait]
/// Host-side persistence handlers.
///
/// Implement the operations the host supports; the defaults report a
/// missing handler, which surfaces as [`SaveError::Handler`] naming the
/// blocked operation.
pub trait Persist: Send + Sync {
    async fn insert(&self, _node: &Node<Entity>) -> anyhow::Result<()> {
        Err(SaveBlocked {
            reason: SaveBlocker::NoHandler,
        }
        .into())
    }

    async fn update(&self, _node: &Node<Entity>) -> anyhow::Result<()> {
        Err(SaveBlocked {
            reason: SaveBlocker::NoHandler,
        }
        .into())
    }

    async fn delete(&self, _node: &Node<Entity>) -> anyhow::Result<()> {
        Err(SaveBlocked {
            reason: SaveBlocker::NoHandler,
        }
        .into())
    }
}

/// Gate, dispatch and complete one persistence pass for an aggregate root.
///
/// On success the node is marked old and unmodified through the factory
/// lifecycle, matching the operation that ran.
pub async fn save_with(node: &Node<Entity>, handlers: &dyn Persist) -> Result<(), SaveError> {
    let op = node.save_gate()?;
    match op {
        PersistOp::Insert => handlers.insert(node).await?,
        PersistOp::Update => handlers.update(node).await?,
        PersistOp::Delete => handlers.delete(node).await?,
    }
    node.factory_complete(match op {
        PersistOp::Insert => OperationKind::Insert,
        PersistOp::Update => OperationKind::Update,
        PersistOp::Delete => OperationKind::Delete,
    });
    Ok(())
}
