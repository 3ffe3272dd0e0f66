//! Opaque handles for IR entities.
//!
//! All references into a method body are u32 indices, not pointers.
//! Node identity (not structural equality) is what liveness tracking keys
//! on, since two nodes may be structurally identical but represent
//! distinct evaluations.

use std::fmt;

/// Reference to a node in the body's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Raw index into the node arena.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Reference to a control-flow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Raw index into the block arena.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Reference to a local slot in the body's local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub(crate) u32);

impl LocalId {
    /// Raw index into the local table.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Index into the exception-region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EhIndex(pub u32);

impl EhIndex {
    /// Raw index into the region table.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EhIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EH#{}", self.0)
    }
}

/// Interned struct layout identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(pub(crate) u32);

impl LayoutId {
    /// Raw index into the layout table.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Identity of an external method (user function or runtime import).
/// Minted by the front end; opaque to lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

/// Identity of a signature-deferring external accessor created during
/// interop call lowering. Indexes the lowering context's accessor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessorId(pub u32);
