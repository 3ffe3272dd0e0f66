//! Call-site lowering.
//!
//! Rewrites virtual/interface dispatch, delegate invocation, and native
//! interop calls into the concrete operation sequences the backend can
//! execute. Synthesized helper calls are recursively lowered; every rule
//! keys on a flag its rewrite clears, so re-entry is a no-op.

use mantle_ir::block::BlockKind;
use mantle_ir::node::{ArgKind, CallArg, CallData, CallTarget, Helper, Node, Op};
use mantle_ir::types::{AbiClass, NativeType, ValueType};
use mantle_ir::value::{LocalId, NodeId};

use crate::context::LowerContext;
use crate::nodes;
use crate::LowerError;

pub(crate) fn lower_call(ctx: &mut LowerContext, call_id: NodeId) -> Result<(), LowerError> {
    if ctx.body.call_data(call_id).is_helper(Helper::Rethrow) {
        lower_rethrow(ctx, call_id)?;
    } else if ctx.body.call_data(call_id).is_helper(Helper::Overflow)
        && !ctx.body.call_data(call_id).args.is_empty()
    {
        // Constant folding can attach a superfluous argument to the
        // overflow helper. Remove it.
        let arg = ctx.body.call_data_mut(call_id).args.remove(0);
        let block = ctx.cur_block();
        ctx.body.remove_node(block, arg.node);
    }

    let (needs_null_check, is_virtual_stub, is_delegate_invoke) = {
        let call = ctx.body.call_data(call_id);
        (
            call.needs_null_check,
            call.is_virtual_stub,
            call.is_delegate_invoke,
        )
    };

    if needs_null_check || is_virtual_stub {
        // Virtual stubs do not tolerate a null receiver; checking here
        // also lets a redundant check be eliminated later.
        insert_null_check(ctx, call_id);
    }

    if is_virtual_stub {
        lower_virtual_stub_call(ctx, call_id)?;
    } else if is_delegate_invoke {
        lower_delegate_invoke(ctx, call_id);
    }

    lower_call_return(ctx, call_id);
    lower_call_args(ctx, call_id);

    if ctx.body.call_data(call_id).is_unmanaged {
        lower_unmanaged_call(ctx, call_id)?;
    }

    // Nothing after a call that never returns is reachable; delete it so
    // the block and region structure stay consistent.
    if ctx.body.call_data(call_id).is_terminal() {
        let block = ctx.cur_block();
        ctx.body.truncate_after(block, call_id);
        ctx.body.block_mut(block).kind = BlockKind::Throw;
    }

    Ok(())
}

/// A rethrow takes the caught exception object's shadow-frame address as an
/// explicit argument.
fn lower_rethrow(ctx: &mut LowerContext, call_id: NodeId) -> Result<(), LowerError> {
    let block = ctx.cur_block();
    let hnd_index = ctx
        .body
        .block(block)
        .hnd_index
        .expect("rethrow outside of a handler");
    if !ctx.body.eh_table[hnd_index.index() as usize].has_catch_handler() {
        // Rethrow nested in a finally or fault would need the exception
        // object saved on the shadow frame shared between handlers.
        return Err(LowerError::Limitation("nested rethrow"));
    }

    debug_assert!(ctx.body.call_data(call_id).args.is_empty());
    let addr = ctx.insert_shadow_stack_addr(call_id, ctx.contract.catch_arg_offset);
    ctx.body
        .call_data_mut(call_id)
        .args
        .insert(0, CallArg::new(addr, ValueType::NativeInt));
    Ok(())
}

/// Materialize an explicit receiver null check unless the receiver is
/// provably non-null. The explicit check subsumes the call's implicit one.
fn insert_null_check(ctx: &mut LowerContext, call_id: NodeId) {
    let this_index = ctx
        .body
        .call_data(call_id)
        .find_arg(ArgKind::This)
        .expect("null check on a call without a receiver");

    let this_node = ctx.body.call_data(call_id).args[this_index].node;
    if addr_could_be_null(ctx, this_node) {
        let lcl = represent_arg_as_local(ctx, call_id, this_index);
        let ty = ctx.body.locals.get(lcl).ty;
        let receiver = ctx.insert_node_before(call_id, Op::LocalLoad(lcl), ty);
        let check = ctx.insert_node_before(call_id, Op::NullCheck(receiver), ValueType::Void);
        nodes::lower_indir(ctx, check);
    }

    ctx.body.call_data_mut(call_id).needs_null_check = false;
}

fn addr_could_be_null(ctx: &LowerContext, node: NodeId) -> bool {
    !matches!(
        ctx.body.node(node).op,
        Op::LocalAddr(_, _) | Op::ConstHandle(_)
    )
}

/// Rewrite an unresolved virtual/interface call:
/// ```text
///   Call(cell, this, args...)
/// ```
/// becomes
/// ```text
///   t = this
///   p = resolve_interface(t, cell)
///   p(t, args...)
/// ```
fn lower_virtual_stub_call(ctx: &mut LowerContext, call_id: NodeId) -> Result<(), LowerError> {
    debug_assert!(ctx.body.call_data(call_id).is_virtual_stub);
    debug_assert!(!ctx.body.call_data(call_id).needs_null_check);

    // The receiver is used twice (resolution and the call itself).
    let this_index = ctx
        .body
        .call_data(call_id)
        .find_arg(ArgKind::This)
        .expect("virtual stub call without a receiver");
    let this_lcl = represent_arg_as_local(ctx, call_id, this_index);
    let this_ty = ctx.body.locals.get(this_lcl).ty;
    let this_for_stub = ctx.insert_node_before(call_id, Op::LocalLoad(this_lcl), this_ty);

    let cell_index = ctx
        .body
        .call_data(call_id)
        .find_arg(ArgKind::DispatchCell)
        .expect("virtual stub call without a dispatch cell");
    let cell = ctx.body.call_data_mut(call_id).args.remove(cell_index);

    let stub_call = CallData::new(
        CallTarget::Helper(Helper::ResolveInterfaceCallTarget),
        vec![
            CallArg::new(this_for_stub, this_ty),
            CallArg::new(cell.node, cell.sig_ty),
        ],
        ValueType::NativeInt,
    );
    let stub_call =
        ctx.insert_node_before(call_id, Op::Call(Box::new(stub_call)), ValueType::NativeInt);

    // In shared code the cell address itself was computed dynamically;
    // that computation is dead now.
    let old_target = ctx.body.call_data(call_id).target;
    let call = ctx.body.call_data_mut(call_id);
    call.target = CallTarget::Indirect(stub_call);
    call.is_virtual_stub = false;
    if let CallTarget::Indirect(addr) = old_target {
        if matches!(ctx.body.node(addr).op, Op::LocalLoad(_)) {
            let block = ctx.cur_block();
            ctx.body.remove_node(block, addr);
        } else {
            ctx.body.node_mut(addr).unused_value = true;
        }
    }

    // The resolution call participates in lowering itself.
    lower_call(ctx, stub_call)
}

/// Rewrite a delegate invocation to call the delegate's invocation pointer
/// with the wrapped target object as the receiver.
fn lower_delegate_invoke(ctx: &mut LowerContext, call_id: NodeId) {
    debug_assert!(ctx.body.call_data(call_id).is_delegate_invoke);
    debug_assert!(!ctx.body.call_data(call_id).needs_null_check);

    // The delegate reference is used twice; copy it to a local.
    let this_index = ctx
        .body
        .call_data(call_id)
        .find_arg(ArgKind::This)
        .expect("delegate invocation without a receiver");
    let delegate_lcl = represent_arg_as_local(ctx, call_id, this_index);

    // Replace the receiver with [delegate + target_offset]. The load sits
    // immediately before the call so the target object cannot be moved
    // while arguments after the receiver are evaluated; it faults on a
    // null delegate, which subsumes the null check.
    let delegate = ctx.body.call_data(call_id).args[this_index].node;
    let target_offset = ctx.insert_node_before(
        call_id,
        Op::ConstInt(ctx.contract.delegate_target_offset),
        ValueType::NativeInt,
    );
    let target_addr =
        ctx.insert_node_before(call_id, Op::Add(delegate, target_offset), ValueType::Byref);
    let target_this = ctx.insert_node_before(call_id, Op::Load(target_addr), ValueType::Ref);
    ctx.body.call_data_mut(call_id).args[this_index].node = target_this;
    nodes::lower_indir(ctx, target_this);

    // The call target is [delegate + invoke_offset], loaded non-faulting
    // and ordered strictly before argument evaluation.
    let delegate_ty = ctx.body.locals.get(delegate_lcl).ty;
    let delegate_again = ctx.insert_node_before(call_id, Op::LocalLoad(delegate_lcl), delegate_ty);
    let invoke_offset = ctx.insert_node_before(
        call_id,
        Op::ConstInt(ctx.contract.delegate_invoke_offset),
        ValueType::NativeInt,
    );
    let invoke_addr = ctx.insert_node_before(
        call_id,
        Op::Add(delegate_again, invoke_offset),
        ValueType::Byref,
    );
    let invoke_ptr = ctx.insert_node_before(call_id, Op::Load(invoke_addr), ValueType::NativeInt);
    {
        let node = ctx.body.node_mut(invoke_ptr);
        node.nonfaulting = true;
        node.ordered = true;
    }

    let call = ctx.body.call_data_mut(call_id);
    call.target = CallTarget::Indirect(invoke_ptr);
    call.is_delegate_invoke = false;
}

/// Record the backend ABI classification of the call's return.
fn lower_call_return(ctx: &mut LowerContext, call_id: NodeId) {
    let sig_ret = ctx.body.call_data(call_id).sig_ret;
    let abi = ctx.abi.classify_return(sig_ret, &ctx.body.layouts);
    ctx.body.call_data_mut(call_id).abi_ret = Some(abi);
}

/// Classify every argument against the backend ABI, normalizing struct
/// arguments to the exact signature layout first.
fn lower_call_args(ctx: &mut LowerContext, call_id: NodeId) {
    let arg_count = ctx.body.call_data(call_id).args.len();
    for index in 0..arg_count {
        let (kind, node, sig_ty) = {
            let arg = &ctx.body.call_data(call_id).args[index];
            (arg.kind, arg.node, arg.sig_ty)
        };
        let sig_ty = match kind {
            ArgKind::This => {
                if ctx.body.node(node).ty == ValueType::Ref {
                    ValueType::Ref
                } else {
                    ValueType::Byref
                }
            }
            ArgKind::RetBuffer | ArgKind::InstParam => ValueType::NativeInt,
            _ => sig_ty,
        };

        if let (ValueType::Struct(target), ValueType::Struct(_)) = (sig_ty, ctx.body.node(node).ty)
        {
            nodes::normalize_struct_use(ctx, call_id, node, target);
        }

        let abi = ctx.abi.classify_arg(sig_ty, &ctx.body.layouts);
        ctx.body.call_data_mut(call_id).args[index].abi = Some(abi);
    }
}

/// Lower a native interop call: defer signature binding for direct callees
/// and bracket the call with collector transitions unless suppressed.
fn lower_unmanaged_call(ctx: &mut LowerContext, call_id: NodeId) -> Result<(), LowerError> {
    debug_assert!(ctx.body.call_data(call_id).is_unmanaged);
    if ctx.body.call_data(call_id).native_sig.is_some() {
        // Already lowered.
        return Ok(());
    }

    // Record the native signature: return type, then each argument.
    let native_sig: Vec<NativeType> = {
        let call = ctx.body.call_data(call_id);
        let ret = match call.abi_ret.expect("return not classified") {
            AbiClass::Direct(native) => native,
            AbiClass::ShadowStackRef => NativeType::Ptr,
        };
        std::iter::once(ret)
            .chain(call.args.iter().map(|arg| {
                match arg.abi.expect("argument not classified") {
                    AbiClass::Direct(native) => native,
                    AbiClass::ShadowStackRef => NativeType::Ptr,
                }
            }))
            .collect()
    };

    if let CallTarget::Direct(callee) = ctx.body.call_data(call_id).target {
        // The backend requires caller and callee signatures to agree, and a
        // single static declaration cannot be known correct until runtime.
        // Hide the target behind an accessor that binds the signature late.
        let accessor = ctx.external_accessor(callee, native_sig.clone());
        ctx.body.call_data_mut(call_id).external_accessor = Some(accessor);
    }
    ctx.body.call_data_mut(call_id).native_sig = Some(native_sig);

    if !ctx.body.call_data(call_id).suppress_gc_transition {
        insert_gc_transitions(ctx, call_id)?;
    }
    Ok(())
}

/// Bracket an unmanaged call with enter/leave collector-transition helper
/// calls taking the transition frame's address.
fn insert_gc_transitions(ctx: &mut LowerContext, call_id: NodeId) -> Result<(), LowerError> {
    let frame_lcl = ctx.transition_frame_local();
    let block = ctx.cur_block();

    let frame_addr = ctx.insert_node_before(call_id, Op::LocalAddr(frame_lcl, 0), ValueType::NativeInt);
    let enter = make_transition_call(ctx, Helper::GcTransitionBegin, frame_addr);
    ctx.body.insert_before(block, call_id, enter);
    nodes::lower_local(ctx, frame_addr);
    lower_call(ctx, enter)?;

    // The leave pair is picked up by the normal lowering walk.
    let frame_addr = ctx.insert_node_after(call_id, Op::LocalAddr(frame_lcl, 0), ValueType::NativeInt);
    let leave = make_transition_call(ctx, Helper::GcTransitionEnd, frame_addr);
    ctx.body.insert_after(block, frame_addr, leave);
    Ok(())
}

fn make_transition_call(ctx: &mut LowerContext, helper: Helper, frame_addr: NodeId) -> NodeId {
    let call = CallData::new(
        CallTarget::Helper(helper),
        vec![CallArg::new(frame_addr, ValueType::NativeInt)],
        ValueType::Void,
    );
    ctx.body
        .push_node(Node::new(Op::Call(Box::new(call)), ValueType::Void))
}

/// Ensure an argument is a local variable read, introducing a store/load
/// pair through a fresh temporary if it is anything else. Returns the
/// local holding the value.
fn represent_arg_as_local(ctx: &mut LowerContext, call_id: NodeId, arg_index: usize) -> LocalId {
    let def = ctx.body.call_data(call_id).args[arg_index].node;
    if let Op::LocalLoad(lcl) = ctx.body.node(def).op {
        return lcl;
    }

    let block = ctx.cur_block();
    let ty = ctx.body.node(def).ty;
    let tmp = ctx.body.new_temp(ty);
    let store = ctx.body.push_node(Node::new(Op::LocalStore(tmp, def), ty));
    ctx.body.insert_after(block, def, store);
    let load = ctx.insert_node_before(call_id, Op::LocalLoad(tmp), ty);
    ctx.body.call_data_mut(call_id).args[arg_index].node = load;
    tmp
}
