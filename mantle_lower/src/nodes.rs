//! Per-node lowering dispatcher and rewrite rules.
//!
//! A single in-place pass over each block. Newly inserted nodes are only
//! lowered when explicitly re-dispatched (synthesized helper calls are);
//! re-running a rule on an already-rewritten node is a no-op because each
//! rule keys on state its rewrite clears.

use mantle_ir::body::FaultKind;
use mantle_ir::node::{Node, Op};
use mantle_ir::types::ValueType;
use mantle_ir::value::{LayoutId, LocalId, NodeId};

use crate::call;
use crate::context::LowerContext;
use crate::LowerError;

pub(crate) fn lower_node(ctx: &mut LowerContext, id: NodeId) -> Result<(), LowerError> {
    match ctx.body.node(id).op {
        Op::LocalLoad(_)
        | Op::LocalStore(_, _)
        | Op::LocalField(_, _)
        | Op::LocalFieldStore(_, _, _)
        | Op::LocalAddr(_, _) => lower_local(ctx, id),
        Op::Call(_) => call::lower_call(ctx, id)?,
        Op::CatchArg => lower_catch_arg(ctx, id),
        Op::Load(_) | Op::Store(_, _) | Op::NullCheck(_) => lower_indir(ctx, id),
        Op::Div(_, _) | Op::Rem(_, _) | Op::UDiv(_, _) | Op::URem(_, _) => {
            lower_div_rem(ctx, id)
        }
        Op::Return(_) => lower_return(ctx, id),
        Op::StackAlloc(_) => {
            // Concrete expansion happens in codegen; only the shadow-frame
            // padding rule needs to know.
            ctx.body.stack_alloc_used = true;
        }
        Op::ConstInt(_) | Op::ConstHandle(_) | Op::ParamIn(_) | Op::Add(_, _) => {}
    }
    Ok(())
}

pub(crate) fn lower_local(ctx: &mut LowerContext, id: NodeId) {
    rewrite_dependent_field(ctx, id);

    if matches!(ctx.body.node(id).op, Op::LocalStore(_, _)) {
        lower_local_store(ctx, id);
    }

    // An integer-typed source of a struct store is evaluated as part of
    // the store itself.
    if let Op::LocalStore(_, value) | Op::LocalFieldStore(_, _, value) = ctx.body.node(id).op {
        if matches!(ctx.body.node(id).ty, ValueType::Struct(_))
            && matches!(
                ctx.body.node(value).ty,
                ValueType::Int32 | ValueType::Int64
            )
        {
            ctx.body.node_mut(value).contained = true;
        }
    }
}

/// Accesses to fields of dependently promoted aggregates reference the
/// parent slot at `parent_offset + field_offset`.
fn rewrite_dependent_field(ctx: &mut LowerContext, id: NodeId) {
    let Some(lcl) = ctx.body.node(id).op.local() else {
        return;
    };
    let Some((parent, parent_offset)) = ctx.body.locals.dependent_field(lcl) else {
        return;
    };

    let node = ctx.body.node(id);
    let new_op = match node.op {
        Op::LocalLoad(_) => Op::LocalField(parent, parent_offset),
        Op::LocalField(_, offset) => Op::LocalField(parent, parent_offset + offset),
        Op::LocalStore(_, value) => Op::LocalFieldStore(parent, parent_offset, value),
        Op::LocalFieldStore(_, offset, value) => {
            Op::LocalFieldStore(parent, parent_offset + offset, value)
        }
        Op::LocalAddr(_, offset) => Op::LocalAddr(parent, parent_offset + offset),
        _ => return,
    };
    let is_store = matches!(new_op, Op::LocalFieldStore(_, _, _));
    let node = ctx.body.node_mut(id);
    node.op = new_op;
    if is_store && is_partial_store(ctx, id, parent) {
        // The untouched part of the parent lives through the store.
        ctx.body.node_mut(id).use_and_def = true;
    }
}

fn is_partial_store(ctx: &LowerContext, id: NodeId, target: LocalId) -> bool {
    let store_size = ctx.body.layouts.type_size(ctx.body.node(id).ty);
    let slot_size = ctx.body.layouts.type_size(ctx.body.locals.get(target).ty);
    store_size < slot_size
}

fn lower_local_store(ctx: &mut LowerContext, id: NodeId) {
    let Op::LocalStore(lcl, value) = ctx.body.node(id).op else {
        return;
    };

    if let Some(field) = ctx.body.locals.single_promoted_field(lcl) {
        // The aggregate is fully represented by its one promoted field.
        ctx.body.node_mut(id).op = Op::LocalFieldStore(field, 0, value);
        if is_partial_store(ctx, id, field) {
            ctx.body.node_mut(id).use_and_def = true;
        }
        return;
    }

    if let ValueType::Struct(dst_layout) = ctx.body.node(id).ty {
        let value_ty = ctx.body.node(value).ty;
        if matches!(value_ty, ValueType::Struct(_)) {
            normalize_struct_use(ctx, id, value, dst_layout);
        } else if matches!(ctx.body.node(value).op, Op::ConstInt(_)) {
            // Storing an init value needs the slot's address; go through
            // the field form.
            ctx.body.node_mut(id).op = Op::LocalFieldStore(lcl, 0, value);
            if is_partial_store(ctx, id, lcl) {
                ctx.body.node_mut(id).use_and_def = true;
            }
        }
    }
}

/// The caught exception object lives at a fixed shadow-frame offset.
fn lower_catch_arg(ctx: &mut LowerContext, id: NodeId) {
    let addr = ctx.insert_shadow_stack_addr(id, ctx.contract.catch_arg_offset);
    let node = ctx.body.node_mut(id);
    node.op = Op::Load(addr);
    node.nonfaulting = true;
}

/// Faulting indirections get an explicit null-fault code path for the
/// enclosing block.
pub(crate) fn lower_indir(ctx: &mut LowerContext, id: NodeId) {
    let node = ctx.body.node(id);
    let faulting = match node.op {
        Op::NullCheck(_) => true,
        _ => !node.nonfaulting,
    };
    if faulting {
        let block = ctx.cur_block();
        ctx.body.add_fault_path(block, FaultKind::NullRef);
    }
}

/// Register the fault paths a divide or remainder can take, based on what
/// is statically known about the divisor.
fn lower_div_rem(ctx: &mut LowerContext, id: NodeId) {
    let (divisor, signed) = match ctx.body.node(id).op {
        Op::Div(_, b) | Op::Rem(_, b) => (b, true),
        Op::UDiv(_, b) | Op::URem(_, b) => (b, false),
        _ => unreachable!(),
    };

    let divisor_const = match ctx.body.node(divisor).op {
        Op::ConstInt(c) => Some(c),
        _ => None,
    };
    let block = ctx.cur_block();
    if divisor_const.map_or(true, |c| c == 0) {
        // Divisor is not a known non-zero constant.
        ctx.body.add_fault_path(block, FaultKind::DivByZero);
    }
    if signed && divisor_const.map_or(true, |c| c == -1) {
        // MinValue / -1 overflows.
        ctx.body.add_fault_path(block, FaultKind::Overflow);
    }
}

/// Force a returned value whose type does not exactly match the method's
/// return shape through a temporary of the exact return layout.
fn lower_return(ctx: &mut LowerContext, id: NodeId) {
    let Op::Return(Some(value)) = ctx.body.node(id).op else {
        return;
    };

    let ret_ty = ctx.sig.ret_ty;
    if let (ValueType::Struct(ret_layout), ValueType::Struct(_)) =
        (ret_ty, ctx.body.node(value).ty)
    {
        normalize_struct_use(ctx, id, value, ret_layout);
    }

    let Op::Return(Some(value)) = ctx.body.node(id).op else {
        unreachable!()
    };
    let value_ty = ctx.body.node(value).ty;
    let is_struct_zero = matches!(ret_ty, ValueType::Struct(_))
        && matches!(ctx.body.node(value).op, Op::ConstInt(0));
    if value_ty != ret_ty && !is_struct_zero {
        let tmp = ctx.body.new_temp(value_ty);
        ctx.insert_node_before(id, Op::LocalStore(tmp, value), value_ty);
        let read = ctx.insert_node_before(id, Op::LocalField(tmp, 0), ret_ty);
        let replaced = ctx.body.node_mut(id).op.replace_operand(value, read);
        debug_assert!(replaced);
    }
}

/// Retype a struct def to the exact `layout` its user requires.
///
/// Loads and local fields are retyped in place; values that have no
/// address (call results) are spilled to a temporary first. Returns the
/// node that now feeds the use.
pub(crate) fn normalize_struct_use(
    ctx: &mut LowerContext,
    user: NodeId,
    def: NodeId,
    layout: LayoutId,
) -> NodeId {
    debug_assert!(matches!(ctx.body.node(def).ty, ValueType::Struct(_)));
    if ctx.body.node(def).ty == ValueType::Struct(layout) {
        return def;
    }

    match ctx.body.node(def).op {
        Op::Load(_) | Op::LocalField(_, _) => {
            ctx.body.node_mut(def).ty = ValueType::Struct(layout);
            def
        }
        Op::LocalLoad(lcl) => {
            let node = ctx.body.node_mut(def);
            node.op = Op::LocalField(lcl, 0);
            node.ty = ValueType::Struct(layout);
            def
        }
        Op::Call(_) => {
            let def_ty = ctx.body.node(def).ty;
            let block = ctx.cur_block();
            let tmp = ctx.body.new_temp(def_ty);
            let store = ctx.body.push_node(Node::new(Op::LocalStore(tmp, def), def_ty));
            ctx.body.insert_after(block, def, store);
            let read = ctx.insert_node_before(user, Op::LocalField(tmp, 0), ValueType::Struct(layout));
            let replaced = ctx.body.node_mut(user).op.replace_operand(def, read);
            debug_assert!(replaced);
            read
        }
        ref op => unreachable!("cannot normalize struct def {op:?}"),
    }
}
