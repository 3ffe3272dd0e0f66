//! Tests for the mantle IR builder, display, and verifier.

use crate::block::BlockKind;
use crate::body::MethodBody;
use crate::builder::Builder;
use crate::eh::{EhKind, EhRegion};
use crate::local::LocalDesc;
use crate::node::{CallArg, CallData, CallTarget, Op};
use crate::types::ValueType;
use crate::value::{EhIndex, MethodId};
use crate::verifier::verify;

#[test]
fn build_store_load_roundtrip() {
    let mut body = MethodBody::new("store_load");
    let lcl = body.locals.add(LocalDesc::new(ValueType::Ref));
    let mut b = Builder::new(&mut body);

    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);

    let handle = b.const_handle(0x1000);
    b.local_store(lcl, handle);
    let loaded = b.local_load(lcl);
    b.ret(Some(loaded), ValueType::Ref);

    assert_eq!(body.block(entry).nodes.len(), 4);
    assert!(matches!(body.node(handle).op, Op::ConstHandle(0x1000)));
    // Two local references: the store and the load.
    assert_eq!(body.locals.get(lcl).ref_count, 2);
}

#[test]
fn insertion_preserves_order() {
    let mut body = MethodBody::new("insertion");
    let lcl = body.locals.add(LocalDesc::new(ValueType::Int32));
    let mut b = Builder::new(&mut body);

    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);
    let a = b.const_int(1, ValueType::Int32);
    let ret = b.ret(Some(a), ValueType::Int32);

    // Insert a store between the const and the return.
    let store = body.push_node(crate::node::Node::new(
        Op::LocalStore(lcl, a),
        ValueType::Void,
    ));
    body.insert_before(entry, ret, store);

    assert_eq!(body.block(entry).nodes, vec![a, store, ret]);
    assert_eq!(body.node_pos(entry, store), 1);
}

#[test]
fn truncate_marks_surviving_operands_unused() {
    let mut body = MethodBody::new("truncate");
    let mut b = Builder::new(&mut body);

    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);
    let a = b.const_int(7, ValueType::Int32);
    let call = b.call(CallData::new(
        CallTarget::Direct(MethodId(1)),
        vec![],
        ValueType::Void,
    ));
    // `a` only feeds the return, which truncation deletes.
    let ret = b.ret(Some(a), ValueType::Int32);

    body.truncate_after(entry, call);

    assert_eq!(body.block(entry).nodes, vec![a, call]);
    assert!(body.node(a).unused_value);
    let _ = ret;
}

#[test]
fn display_call_with_args() {
    let mut body = MethodBody::new("calls");
    let lcl = body.locals.add(LocalDesc::param(ValueType::Ref));
    let mut b = Builder::new(&mut body);

    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);
    let this = b.local_load(lcl);
    let call = b.call(CallData::new(
        CallTarget::Direct(MethodId(3)),
        vec![CallArg::new(this, ValueType::Ref)],
        ValueType::Void,
    ));
    b.ret(None, ValueType::Void);
    let _ = call;

    let text = format!("{body}");
    assert_eq!(
        text,
        "func @calls {\n\
         \x20\x20bb0:\n\
         \x20\x20\x20\x20n0 = local.load l0\n\
         \x20\x20\x20\x20call m3(n0)\n\
         \x20\x20\x20\x20ret\n\
         }"
    );
}

#[test]
fn verify_accepts_well_formed_body() {
    let mut body = MethodBody::new("ok");
    let mut b = Builder::new(&mut body);
    let entry = b.create_block(BlockKind::Normal);
    b.switch_to_block(entry);
    let v = b.const_int(0, ValueType::Int32);
    b.ret(Some(v), ValueType::Int32);

    let result = verify(&body);
    assert!(result.is_ok(), "{result}");
}

#[test]
fn verify_rejects_cross_block_operand() {
    let mut body = MethodBody::new("cross_block");
    let mut b = Builder::new(&mut body);
    let bb0 = b.create_block(BlockKind::Normal);
    b.switch_to_block(bb0);
    let v = b.const_int(0, ValueType::Int32);
    let bb1 = b.create_block(BlockKind::Normal);
    b.switch_to_block(bb1);
    // Uses a value defined in bb0 — not allowed in the linear form.
    b.ret(Some(v), ValueType::Int32);
    let _ = bb1;

    let result = verify(&body);
    assert!(!result.is_ok());
    assert!(result.errors[0].message.contains("not in the user's block"));
}

#[test]
fn verify_rejects_unordered_region_nesting() {
    let mut body = MethodBody::new("bad_eh");
    let mut b = Builder::new(&mut body);
    let bb0 = b.create_block(BlockKind::Normal);
    let bb1 = b.create_block(BlockKind::Normal);
    b.switch_to_block(bb0);
    b.ret(None, ValueType::Void);

    // A region claiming to be enclosed by itself: the enclosing index must
    // point at a strictly later (less nested) entry.
    body.eh_table.push(EhRegion {
        kind: EhKind::Catch,
        try_first: bb0,
        try_last: bb0,
        filter: None,
        hnd_first: bb1,
        hnd_last: bb1,
        enclosing_try: Some(EhIndex(0)),
        enclosing_hnd: None,
    });

    let result = verify(&body);
    assert!(!result.is_ok());
    assert!(result.errors[0].message.contains("does not follow"));
}

#[test]
fn verify_rejects_shared_try_begin() {
    let mut body = MethodBody::new("shared_try");
    let mut b = Builder::new(&mut body);
    let bb0 = b.create_block(BlockKind::Normal);
    let bb1 = b.create_block(BlockKind::Normal);
    let bb2 = b.create_block(BlockKind::Normal);
    b.switch_to_block(bb0);
    b.ret(None, ValueType::Void);

    for hnd in [bb1, bb2] {
        body.eh_table.push(EhRegion {
            kind: EhKind::Catch,
            try_first: bb0,
            try_last: bb0,
            filter: None,
            hnd_first: hnd,
            hnd_last: hnd,
            enclosing_try: None,
            enclosing_hnd: None,
        });
    }

    let result = verify(&body);
    assert!(!result.is_ok());
    assert!(result.errors.iter().any(|e| e.message.contains("shared")));
}
