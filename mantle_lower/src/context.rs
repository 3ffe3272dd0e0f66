//! Per-compilation lowering context.
//!
//! One `LowerContext` exists per method compilation and is passed by
//! reference to every component; there is no implicit global state.

use std::collections::BTreeMap;

use mantle_ir::body::MethodBody;
use mantle_ir::node::{Node, Op};
use mantle_ir::types::{NativeType, ValueType};
use mantle_ir::value::{AccessorId, BlockId, LayoutId, LocalId, MethodId, NodeId};

use crate::abi::AbiClassifier;

/// Shape of the method being lowered, as reported by the signature provider.
#[derive(Debug, Clone)]
pub struct MethodSig {
    /// The method is an entry point called from native code; it has no
    /// managed caller to propagate exceptions to and no shadow-stack
    /// argument (the frame is established from the runtime on entry).
    pub is_reverse_native_entry: bool,
    /// Local slot of the receiver parameter, if any.
    pub this_param: Option<LocalId>,
    /// Local slot of the return-buffer parameter, if any.
    pub ret_buffer_param: Option<LocalId>,
    /// Local slot of the generic instantiation context parameter, if any.
    pub inst_param: Option<LocalId>,
    /// Signature return type.
    pub ret_ty: ValueType,
}

impl MethodSig {
    pub fn returning(ret_ty: ValueType) -> Self {
        Self {
            is_reverse_native_entry: false,
            this_param: None,
            ret_buffer_param: None,
            inst_param: None,
            ret_ty,
        }
    }
}

/// Fixed offsets and layouts dictated by the runtime/collector contract.
#[derive(Debug, Clone)]
pub struct RuntimeContract {
    /// Offset of the wrapped target object within a delegate instance.
    pub delegate_target_offset: i64,
    /// Offset of the invocation pointer within a delegate instance.
    pub delegate_invoke_offset: i64,
    /// Shadow-frame offset at which the caught exception object lives
    /// while a handler runs.
    pub catch_arg_offset: i64,
    /// Layout of the collector-transition frame used around native calls.
    pub transition_frame_layout: LayoutId,
}

/// Tunables owned by the surrounding compilation driver.
#[derive(Debug, Clone)]
pub struct LowerConfig {
    /// Dynamically-sized stack allocations release their extent together
    /// with the shadow frame.
    pub dynamic_stack_for_alloc: bool,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            dynamic_stack_for_alloc: true,
        }
    }
}

/// Mutable state shared by all lowering components for one method.
pub struct LowerContext<'a> {
    pub body: &'a mut MethodBody,
    pub sig: MethodSig,
    pub abi: AbiClassifier,
    pub contract: RuntimeContract,
    pub config: LowerConfig,
    /// Slot holding the callee shadow-stack pointer.
    pub(crate) shadow_stack_lcl: Option<LocalId>,
    /// Slot holding the caller's shadow-stack pointer, needed when
    /// handlers must unwind to the original frame.
    pub(crate) original_shadow_stack_lcl: Option<LocalId>,
    /// Lazily-created collector-transition frame slot.
    pub(crate) transition_frame_lcl: Option<LocalId>,
    /// Number of backend arguments after assignment.
    pub backend_arg_count: u32,
    pub(crate) cur_block: Option<BlockId>,
    /// Last node of the entry prolog built so far.
    pub(crate) prolog_cursor: Option<NodeId>,
    /// Signature-deferring accessors minted for interop calls, interned by
    /// (callee, native signature).
    accessors: BTreeMap<(MethodId, Vec<NativeType>), AccessorId>,
}

impl<'a> LowerContext<'a> {
    pub fn new(
        body: &'a mut MethodBody,
        sig: MethodSig,
        abi: AbiClassifier,
        contract: RuntimeContract,
    ) -> Self {
        Self {
            body,
            sig,
            abi,
            contract,
            config: LowerConfig::default(),
            shadow_stack_lcl: None,
            original_shadow_stack_lcl: None,
            transition_frame_lcl: None,
            backend_arg_count: 0,
            cur_block: None,
            prolog_cursor: None,
            accessors: BTreeMap::new(),
        }
    }

    /// The shadow-stack pointer slot. Valid once arguments are assigned.
    pub fn shadow_stack_local(&self) -> LocalId {
        self.shadow_stack_lcl.expect("backend args not assigned")
    }

    /// Whether `lcl` is one of the shadow-stack pointer slots.
    pub(crate) fn is_shadow_stack_local(&self, lcl: LocalId) -> bool {
        self.shadow_stack_lcl == Some(lcl) || self.original_shadow_stack_lcl == Some(lcl)
    }

    pub(crate) fn cur_block(&self) -> BlockId {
        self.cur_block.expect("not inside a block")
    }

    /// The collector-transition frame slot, created on first use.
    pub(crate) fn transition_frame_local(&mut self) -> LocalId {
        match self.transition_frame_lcl {
            Some(lcl) => lcl,
            None => {
                let layout = self.contract.transition_frame_layout;
                let lcl = self.body.new_temp_implicit(ValueType::Struct(layout));
                self.transition_frame_lcl = Some(lcl);
                lcl
            }
        }
    }

    /// Intern a signature-deferring accessor for a native callee.
    pub(crate) fn external_accessor(
        &mut self,
        callee: MethodId,
        native_sig: Vec<NativeType>,
    ) -> AccessorId {
        let next = AccessorId(self.accessors.len() as u32);
        *self.accessors.entry((callee, native_sig)).or_insert(next)
    }

    /// Accessors minted during lowering, for code emission.
    pub fn accessors(&self) -> &BTreeMap<(MethodId, Vec<NativeType>), AccessorId> {
        &self.accessors
    }

    // -- Node insertion helpers --

    /// Insert a node immediately before `anchor` in the current block.
    pub(crate) fn insert_node_before(&mut self, anchor: NodeId, op: Op, ty: ValueType) -> NodeId {
        let block = self.cur_block();
        let id = self.body.push_node(Node::new(op, ty));
        self.body.insert_before(block, anchor, id);
        id
    }

    /// Insert a node immediately after `anchor` in the current block.
    pub(crate) fn insert_node_after(&mut self, anchor: NodeId, op: Op, ty: ValueType) -> NodeId {
        let block = self.cur_block();
        let id = self.body.push_node(Node::new(op, ty));
        self.body.insert_after(block, anchor, id);
        id
    }

    /// Materialize the address `shadow_stack + offset` before `anchor`.
    pub(crate) fn insert_shadow_stack_addr(&mut self, anchor: NodeId, offset: i64) -> NodeId {
        let ss = self.shadow_stack_local();
        let base = self.insert_node_before(anchor, Op::LocalLoad(ss), ValueType::NativeInt);
        if offset == 0 {
            return base;
        }
        let off = self.insert_node_before(anchor, Op::ConstInt(offset), ValueType::NativeInt);
        self.insert_node_before(anchor, Op::Add(base, off), ValueType::NativeInt)
    }

    // -- Prolog construction --

    /// Append a node at the current end of the entry prolog.
    pub(crate) fn prolog_insert(&mut self, op: Op, ty: ValueType) -> NodeId {
        let first = self.body.first_block();
        let id = self.body.push_node(Node::new(op, ty));
        let pos = match self.prolog_cursor {
            Some(cursor) => self.body.node_pos(first, cursor) + 1,
            None => 0,
        };
        self.body.block_mut(first).nodes.insert(pos, id);
        self.prolog_cursor = Some(id);
        id
    }

    /// Append `lcl = value` at the current end of the entry prolog.
    pub(crate) fn prolog_store(&mut self, lcl: LocalId, value: NodeId) -> NodeId {
        let ty = self.body.locals.get(lcl).ty;
        self.prolog_insert(Op::LocalStore(lcl, value), ty)
    }
}
