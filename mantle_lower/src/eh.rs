//! Exception-region synthesis.
//!
//! A reverse native entry has no managed caller, and the target backend
//! has no native unwinder: an exception escaping the method would silently
//! corrupt the native caller. Synthesize one outermost filter region over
//! the whole body whose handler terminates the process.

use mantle_ir::block::BlockKind;
use mantle_ir::eh::{EhKind, EhRegion};
use mantle_ir::node::{CallArg, CallData, CallTarget, Helper, Node, Op};
use mantle_ir::types::ValueType;
use mantle_ir::value::{BlockId, EhIndex};

use crate::context::LowerContext;

pub(crate) fn add_unhandled_exception_handler(ctx: &mut LowerContext) {
    if !ctx.sig.is_reverse_native_entry {
        return;
    }

    // No two regions may share a first try block; give the new region its
    // own entry block if the method's first block already starts one.
    let mut try_first = ctx.body.first_block();
    if ctx.body.block(try_first).has_try_index() {
        try_first = ctx.body.prepend_block(BlockKind::Normal);
    }
    let try_last = ctx.body.last_block();
    let user_blocks: Vec<BlockId> = ctx.body.block_ids().collect();

    // The filter decides to terminate; the handler part is unreachable but
    // required for the region table to be well formed.
    let filter_block = ctx.body.new_block(BlockKind::Throw);
    let handler_block = ctx.body.new_block(BlockKind::Throw);

    // The new region is the least nested, so it goes last.
    let new_index = EhIndex(ctx.body.eh_table.len() as u32);
    ctx.body.eh_table.push(EhRegion {
        kind: EhKind::Filter,
        try_first,
        try_last,
        filter: Some(filter_block),
        hnd_first: handler_block,
        hnd_last: handler_block,
        enclosing_try: None,
        enclosing_hnd: None,
    });

    {
        let block = ctx.body.block_mut(try_first);
        block.dont_remove = true;
        block.try_index = Some(new_index);
        block.hnd_index = None;
    }
    for hnd in [filter_block, handler_block] {
        let block = ctx.body.block_mut(hnd);
        block.dont_remove = true;
        block.try_index = None;
        block.hnd_index = Some(new_index);
    }

    // Every block not yet protected now belongs to the new region.
    for block_id in user_blocks {
        let block = ctx.body.block_mut(block_id);
        if !block.has_try_index() {
            block.try_index = Some(new_index);
        }
    }

    // Previously outermost regions are now nested in the new one.
    for i in 0..new_index.index() as usize {
        let region = &mut ctx.body.eh_table[i];
        if region.enclosing_try.is_none() {
            region.enclosing_try = Some(new_index);
        }
    }

    // The handler feeds the caught exception to a terminal runtime helper.
    let catch_arg = ctx.body.push_node(Node::new(Op::CatchArg, ValueType::Ref));
    ctx.body.node_mut(catch_arg).ordered = true;
    ctx.body.append_node(handler_block, catch_arg);
    let helper_call = CallData::new(
        CallTarget::Helper(Helper::UnhandledException),
        vec![CallArg::new(catch_arg, ValueType::Ref)],
        ValueType::Void,
    );
    let helper_call = ctx
        .body
        .push_node(Node::new(Op::Call(Box::new(helper_call)), ValueType::Void));
    ctx.body.append_node(handler_block, helper_call);

    tracing::debug!(region = %new_index, "created unhandled-exception region");
}
