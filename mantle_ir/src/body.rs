//! Method body: the top-level IR container for one compilation.
//!
//! Owns the node arena, the block arena and layout order, the
//! exception-region table, the local table, and the interned layouts.
//! Everything is mutated in place by lowering and handed to code emission
//! when lowering completes.

use crate::block::{Block, BlockKind};
use crate::eh::EhRegion;
use crate::local::{LocalDesc, LocalTable};
use crate::node::{CallData, Node, Op};
use crate::types::{LayoutTable, ValueType};
use crate::value::{BlockId, LocalId, NodeId};

/// An accepted exceptional program behavior that must be materialized as an
/// explicit failure point in the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NullRef,
    DivByZero,
    Overflow,
}

/// Registration of a fault code path for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPath {
    pub block: BlockId,
    pub kind: FaultKind,
}

/// IR of one method, owned by that method's compilation.
#[derive(Debug)]
pub struct MethodBody {
    pub name: String,
    nodes: Vec<Node>,
    blocks: Vec<Block>,
    /// Block layout order. Block ids are arena indices and stay stable as
    /// blocks are prepended or appended.
    block_order: Vec<BlockId>,
    /// Exception regions, ordered most- to least-nested.
    pub eh_table: Vec<EhRegion>,
    pub locals: LocalTable,
    pub layouts: LayoutTable,
    /// Fault code paths registered during lowering, for code emission.
    pub fault_paths: Vec<FaultPath>,
    /// The method uses dynamically-sized stack allocation.
    pub stack_alloc_used: bool,
    /// Total shadow-stack frame size, set by layout planning.
    pub shadow_frame_size: u32,
}

impl MethodBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            blocks: Vec::new(),
            block_order: Vec::new(),
            eh_table: Vec::new(),
            locals: LocalTable::new(),
            layouts: LayoutTable::new(),
            fault_paths: Vec::new(),
            stack_alloc_used: false,
            shadow_frame_size: 0,
        }
    }

    // -- Nodes --

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index() as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index() as usize]
    }

    /// Call payload of a call node. Panics on non-call nodes.
    pub fn call_data(&self, id: NodeId) -> &CallData {
        match &self.node(id).op {
            Op::Call(call) => call,
            op => panic!("{id} is not a call: {op:?}"),
        }
    }

    pub fn call_data_mut(&mut self, id: NodeId) -> &mut CallData {
        match &mut self.node_mut(id).op {
            Op::Call(call) => call,
            op => panic!("{id} is not a call: {op:?}"),
        }
    }

    /// Add a node to the arena without placing it in a block.
    /// Local references in the op count toward the slot's ref count.
    pub fn push_node(&mut self, node: Node) -> NodeId {
        if let Some(lcl) = node.op.local() {
            self.locals.get_mut(lcl).ref_count += 1;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // -- Blocks --

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index() as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index() as usize]
    }

    /// Append a new block at the end of the layout order.
    pub fn new_block(&mut self, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(kind));
        self.block_order.push(id);
        id
    }

    /// Insert a new empty block at the front of the layout order.
    pub fn prepend_block(&mut self, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(kind));
        self.block_order.insert(0, id);
        id
    }

    /// Block ids in layout order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_order.iter().copied()
    }

    pub fn block_count(&self) -> usize {
        self.block_order.len()
    }

    pub fn first_block(&self) -> BlockId {
        self.block_order[0]
    }

    pub fn last_block(&self) -> BlockId {
        *self.block_order.last().unwrap()
    }

    // -- Node placement --

    /// Position of a node within a block's evaluation order.
    /// Panics if the node is not in the block.
    pub fn node_pos(&self, block: BlockId, id: NodeId) -> usize {
        self.block(block)
            .nodes
            .iter()
            .position(|&n| n == id)
            .unwrap_or_else(|| panic!("{id} not in {block}"))
    }

    /// Place an arena node at the end of a block.
    pub fn append_node(&mut self, block: BlockId, id: NodeId) {
        self.block_mut(block).nodes.push(id);
    }

    /// Place an arena node immediately before `anchor` in its block.
    pub fn insert_before(&mut self, block: BlockId, anchor: NodeId, id: NodeId) {
        let pos = self.node_pos(block, anchor);
        self.block_mut(block).nodes.insert(pos, id);
    }

    /// Place an arena node immediately after `anchor` in its block.
    pub fn insert_after(&mut self, block: BlockId, anchor: NodeId, id: NodeId) {
        let pos = self.node_pos(block, anchor);
        self.block_mut(block).nodes.insert(pos + 1, id);
    }

    /// Remove a node from a block's evaluation order. The arena entry
    /// stays behind; nothing may reference it afterwards.
    pub fn remove_node(&mut self, block: BlockId, id: NodeId) {
        let pos = self.node_pos(block, id);
        self.block_mut(block).nodes.remove(pos);
    }

    /// Delete every node after `anchor` in the block. Operands of deleted
    /// nodes that survive the cut are marked as unused values so the block
    /// stays well formed.
    pub fn truncate_after(&mut self, block: BlockId, anchor: NodeId) {
        let pos = self.node_pos(block, anchor);
        let removed: Vec<NodeId> = self.block_mut(block).nodes.split_off(pos + 1);
        let mut operands = Vec::new();
        for &dead in &removed {
            self.node(dead).op.operands(&mut operands);
        }
        for used in operands {
            if !removed.contains(&used) {
                self.node_mut(used).unused_value = true;
            }
        }
    }

    // -- Locals --

    /// Grab a fresh temporary local.
    pub fn new_temp(&mut self, ty: ValueType) -> LocalId {
        self.locals.add(LocalDesc::new(ty))
    }

    /// Grab a fresh temporary with an implicit use, exempting it from
    /// unreferenced-slot elimination.
    pub fn new_temp_implicit(&mut self, ty: ValueType) -> LocalId {
        let mut desc = LocalDesc::new(ty);
        desc.implicitly_referenced = true;
        self.locals.add(desc)
    }

    /// Whether the slot's type holds GC-tracked data.
    pub fn local_has_gc_ptr(&self, lcl: LocalId) -> bool {
        self.layouts.is_gc_type(self.locals.get(lcl).ty)
    }

    // -- Exception regions and fault paths --

    /// Whether the method has any exception handlers.
    pub fn has_handlers(&self) -> bool {
        !self.eh_table.is_empty()
    }

    /// Register a fault code path for a block. Idempotent per (block, kind).
    pub fn add_fault_path(&mut self, block: BlockId, kind: FaultKind) {
        let path = FaultPath { block, kind };
        if !self.fault_paths.contains(&path) {
            self.fault_paths.push(path);
        }
    }
}
