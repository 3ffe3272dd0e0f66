//! End-to-end lowering tests over complete method bodies.

use mantle_ir::block::BlockKind;
use mantle_ir::body::MethodBody;
use mantle_ir::builder::Builder;
use mantle_ir::local::LocalDesc;
use mantle_ir::node::{ArgKind, CallArg, CallData, CallTarget, Helper, Op};
use mantle_ir::types::{StructLayout, ValueType};
use mantle_ir::value::MethodId;
use mantle_ir::verifier::verify;
use mantle_lower::{lower, AbiClassifier, LowerContext, MethodSig, RuntimeContract};

fn test_contract(body: &mut MethodBody) -> RuntimeContract {
    let frame = body.layouts.add(StructLayout {
        size: 16,
        align: 8,
        gc_ptr_offsets: vec![],
    });
    RuntimeContract {
        delegate_target_offset: 8,
        delegate_invoke_offset: 16,
        catch_arg_offset: 0,
        transition_frame_layout: frame,
    }
}

fn run_lower(body: &mut MethodBody, sig: MethodSig) {
    let contract = test_contract(body);
    let mut ctx = LowerContext::new(body, sig, AbiClassifier::default(), contract);
    lower(&mut ctx).expect("lowering failed");
}

/// A loop-shaped body: every iteration produces a GC reference, calls, and
/// uses the reference afterwards. The spill slot introduced for one
/// iteration's value is reused for the next independent value.
#[test]
fn loop_body_spills_and_reuses_one_slot() {
    let mut body = MethodBody::new("loop_spill");
    let src = body.locals.add(LocalDesc::new(ValueType::NativeInt));
    let mut sink = LocalDesc::new(ValueType::Ref);
    sink.has_explicit_init = true;
    let sink = body.locals.add(sink);

    let mut b = Builder::new(&mut body);
    let header = b.create_block(BlockKind::Normal);
    let body_block = b.create_block(BlockKind::Normal);
    let exit = b.create_block(BlockKind::Normal);

    b.switch_to_block(header);
    let zero = b.const_int(0, ValueType::Int32);
    b.mark_unused(zero);

    // Two independent cross-safepoint references in the loop body.
    b.switch_to_block(body_block);
    let addr1 = b.local_load(src);
    let tmp1 = b.load(addr1, ValueType::Ref);
    b.call(CallData::new(
        CallTarget::Direct(MethodId(1)),
        vec![],
        ValueType::Void,
    ));
    b.local_store(sink, tmp1);
    let addr2 = b.local_load(src);
    let tmp2 = b.load(addr2, ValueType::Ref);
    b.call(CallData::new(
        CallTarget::Direct(MethodId(1)),
        vec![],
        ValueType::Void,
    ));
    b.local_store(sink, tmp2);

    b.switch_to_block(exit);
    b.ret(None, ValueType::Void);

    run_lower(&mut body, MethodSig::returning(ValueType::Void));

    // tmp = load; store slot; call; use(load slot) — for both values,
    // through the same recycled slot.
    let spill_slot_of = |def| {
        let pos = body.node_pos(body_block, def);
        match body.node(body.block(body_block).nodes[pos + 1]).op {
            Op::LocalStore(slot, stored) => {
                assert_eq!(stored, def);
                slot
            }
            ref op => panic!("expected a spill store, found {op:?}"),
        }
    };
    let slot = spill_slot_of(tmp1);
    assert_eq!(spill_slot_of(tmp2), slot);

    // Every use reads the slot, never the original definition.
    for store in body.block(body_block).nodes.iter().copied() {
        if let Op::LocalStore(l, value) = body.node(store).op {
            if l == sink {
                assert!(matches!(body.node(value).op, Op::LocalLoad(s) if s == slot));
            }
        }
    }

    // The slot is homed on the scanned shadow frame.
    assert!(body.locals.get(slot).shadow_offset.is_some());

    let result = verify(&body);
    assert!(result.is_ok(), "{result}");
}

/// Interface dispatch: `Call(cell, this, arg)` becomes resolution through
/// the runtime helper plus an indirect call without the cell argument.
#[test]
fn interface_dispatch_end_to_end() {
    let mut body = MethodBody::new("dispatch");
    let this_lcl = body.locals.add(LocalDesc::param(ValueType::Ref));

    let mut b = Builder::new(&mut body);
    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);
    let cell = b.const_int(0x7700, ValueType::NativeInt);
    let this = b.local_load(this_lcl);
    let arg = b.const_int(11, ValueType::Int32);
    let mut data = CallData::new(
        CallTarget::Direct(MethodId(21)),
        vec![
            CallArg::with_kind(cell, ValueType::NativeInt, ArgKind::DispatchCell),
            CallArg::with_kind(this, ValueType::Ref, ArgKind::This),
            CallArg::new(arg, ValueType::Int32),
        ],
        ValueType::Void,
    );
    data.is_virtual_stub = true;
    let call = b.call(data);
    b.ret(None, ValueType::Void);

    run_lower(&mut body, MethodSig::returning(ValueType::Void));

    let lowered = body.call_data(call);
    assert!(!lowered.is_virtual_stub);
    assert_eq!(lowered.args.len(), 2); // receiver + arg, cell removed

    let CallTarget::Indirect(resolver) = lowered.target else {
        panic!("dispatch was not rewritten to an indirect call");
    };
    let resolver_data = body.call_data(resolver);
    assert_eq!(
        resolver_data.helper(),
        Some(Helper::ResolveInterfaceCallTarget)
    );
    // The resolver runs before the call it feeds.
    assert!(body.node_pos(entry, resolver) < body.node_pos(entry, call));

    // Receiver reaches both the resolver and the call from the same local.
    let this_index = lowered.find_arg(ArgKind::This).unwrap();
    let receiver = lowered.args[this_index].node;
    let Op::LocalLoad(receiver_lcl) = body.node(receiver).op else {
        panic!("receiver was not materialized into a local");
    };
    assert!(matches!(
        body.node(resolver_data.args[0].node).op,
        Op::LocalLoad(l) if l == receiver_lcl
    ));

    let result = verify(&body);
    assert!(result.is_ok(), "{result}");
}

/// A reverse native entry with no protected regions gets exactly one
/// region spanning its whole body, and the appended handler blocks do not
/// disturb the existing control flow.
#[test]
fn reverse_native_entry_region_end_to_end() {
    let mut body = MethodBody::new("entry_point");
    let mut b = Builder::new(&mut body);
    let first = b.create_block(BlockKind::Normal);
    let second = b.create_block(BlockKind::Normal);
    b.switch_to_block(first);
    let v = b.const_int(3, ValueType::Int32);
    b.mark_unused(v);
    b.switch_to_block(second);
    b.ret(None, ValueType::Void);

    let mut sig = MethodSig::returning(ValueType::Void);
    sig.is_reverse_native_entry = true;
    run_lower(&mut body, sig);

    // Exactly one region, covering every pre-existing block.
    assert_eq!(body.eh_table.len(), 1);
    let region = &body.eh_table[0];
    assert!(region.enclosing_try.is_none());
    assert_eq!(region.try_first, first);
    assert_eq!(region.try_last, second);
    for block in [first, second] {
        assert_eq!(body.block(block).try_index.map(|i| i.index()), Some(0));
    }

    // The original blocks kept their kind and contents' shape.
    assert_eq!(body.block(first).kind, BlockKind::Normal);
    assert_eq!(body.block(second).kind, BlockKind::Normal);

    // The appended handler terminates through the runtime helper.
    let handler = region.hnd_first;
    assert_eq!(body.block(handler).kind, BlockKind::Throw);
    assert!(body
        .block(handler)
        .nodes
        .iter()
        .any(|&n| matches!(
            &body.node(n).op,
            Op::Call(c) if c.is_helper(Helper::UnhandledException)
        )));

    let result = verify(&body);
    assert!(result.is_ok(), "{result}");
}
