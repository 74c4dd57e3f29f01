/// Derived object-level state, recomputed whenever any constituent changes.
///
/// None of these values are independently settable: they are exact boolean
/// functions of the underlying property state, the entity lifecycle flags
/// and the state of nested children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Meta {
    /// Own properties carry no messages and the node is not marked invalid
    /// by an interrupted wait
    pub is_self_valid: bool,
    /// [`is_self_valid`](`Meta::is_self_valid`) and every nested child node
    /// and collection is valid
    pub is_valid: bool,
    /// Any own property was modified, or the node is new, deleted or
    /// explicitly marked modified
    pub is_self_modified: bool,
    /// [`is_self_modified`](`Meta::is_self_modified`) or any nested child is
    /// modified
    pub is_modified: bool,
    /// Any own property has an in-flight rule execution, the rule queue is
    /// not empty, or any nested child is busy
    pub is_busy: bool,
    /// `is_modified && is_valid && !is_busy && !is_child`, the precondition
    /// for persistence
    pub is_savable: bool,
}
