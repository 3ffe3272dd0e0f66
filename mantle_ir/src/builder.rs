//! Builder API for constructing mantle IR.

use crate::block::BlockKind;
use crate::body::MethodBody;
use crate::node::{CallData, Node, Op};
use crate::types::ValueType;
use crate::value::{BlockId, LocalId, NodeId};

/// Builder for constructing a method body's IR.
pub struct Builder<'a> {
    body: &'a mut MethodBody,
    current_block: Option<BlockId>,
}

impl<'a> Builder<'a> {
    pub fn new(body: &'a mut MethodBody) -> Self {
        Self {
            body,
            current_block: None,
        }
    }

    pub fn body(&mut self) -> &mut MethodBody {
        self.body
    }

    /// Create a new block and return its reference.
    pub fn create_block(&mut self, kind: BlockKind) -> BlockId {
        self.body.new_block(kind)
    }

    /// Set the current block for subsequent nodes.
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = Some(block);
    }

    /// Append a node with the given op and type to the current block.
    pub fn emit(&mut self, op: Op, ty: ValueType) -> NodeId {
        let id = self.body.push_node(Node::new(op, ty));
        let block = self.current_block.expect("no current block");
        self.body.append_node(block, id);
        id
    }

    /// Mark a node's value as having no consumer.
    pub fn mark_unused(&mut self, id: NodeId) {
        self.body.node_mut(id).unused_value = true;
    }

    pub fn const_int(&mut self, value: i64, ty: ValueType) -> NodeId {
        self.emit(Op::ConstInt(value), ty)
    }

    pub fn const_handle(&mut self, value: i64) -> NodeId {
        self.emit(Op::ConstHandle(value), ValueType::Ref)
    }

    pub fn local_load(&mut self, lcl: LocalId) -> NodeId {
        let ty = self.body.locals.get(lcl).ty;
        self.emit(Op::LocalLoad(lcl), ty)
    }

    /// Store into a local; the node is typed by the stored location.
    pub fn local_store(&mut self, lcl: LocalId, value: NodeId) -> NodeId {
        let ty = self.body.locals.get(lcl).ty;
        self.emit(Op::LocalStore(lcl, value), ty)
    }

    pub fn local_field(&mut self, lcl: LocalId, offset: u32, ty: ValueType) -> NodeId {
        self.emit(Op::LocalField(lcl, offset), ty)
    }

    pub fn local_field_store(
        &mut self,
        lcl: LocalId,
        offset: u32,
        value: NodeId,
        ty: ValueType,
    ) -> NodeId {
        self.emit(Op::LocalFieldStore(lcl, offset, value), ty)
    }

    pub fn local_addr(&mut self, lcl: LocalId, offset: u32) -> NodeId {
        self.emit(Op::LocalAddr(lcl, offset), ValueType::Byref)
    }

    pub fn load(&mut self, addr: NodeId, ty: ValueType) -> NodeId {
        self.emit(Op::Load(addr), ty)
    }

    pub fn store(&mut self, addr: NodeId, value: NodeId) -> NodeId {
        self.emit(Op::Store(addr, value), ValueType::Void)
    }

    pub fn null_check(&mut self, addr: NodeId) -> NodeId {
        self.emit(Op::NullCheck(addr), ValueType::Void)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId, ty: ValueType) -> NodeId {
        self.emit(Op::Add(a, b), ty)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId, ty: ValueType) -> NodeId {
        self.emit(Op::Div(a, b), ty)
    }

    pub fn call(&mut self, call: CallData) -> NodeId {
        let ty = call.sig_ret;
        self.emit(Op::Call(Box::new(call)), ty)
    }

    pub fn catch_arg(&mut self) -> NodeId {
        self.emit(Op::CatchArg, ValueType::Ref)
    }

    pub fn ret(&mut self, value: Option<NodeId>, ty: ValueType) -> NodeId {
        self.emit(Op::Return(value), ty)
    }

    pub fn stack_alloc(&mut self, size: NodeId) -> NodeId {
        self.emit(Op::StackAlloc(size), ValueType::NativeInt)
    }
}
