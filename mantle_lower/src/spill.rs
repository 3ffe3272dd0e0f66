//! Safepoint spill analysis.
//!
//! Rewrites
//! ```text
//!   t = load.ref ...
//!       call            ; may trigger a collection
//!       use(t)
//! ```
//! into
//! ```text
//!   t = load.ref ...
//!       local.store S, t
//!       call
//!       use(local.load S)
//! ```
//! so every GC-tracked temporary live across a potential collection point
//! is homed in a slot the collector can find.
//!
//! Runs as a full IR walk before the general lowering: slot layout needs to
//! know about every GC local before it is finalized.

use std::collections::BTreeMap;

use mantle_ir::node::{ArgKind, Node, Op};
use mantle_ir::types::ValueType;
use mantle_ir::value::{BlockId, LocalId, NodeId};

use crate::context::LowerContext;

pub(crate) fn spill_across_safepoints(ctx: &mut LowerContext) {
    // Live GC values defined but not yet consumed, keyed by producing-node
    // identity (two structurally identical nodes are distinct evaluations).
    // Ordered map so force-spill order is deterministic.
    let mut live: BTreeMap<NodeId, Option<LocalId>> = BTreeMap::new();
    let mut free_slots = FreeSlots::default();
    let mut contained_operands: Vec<NodeId> = Vec::new();
    let mut released: Vec<LocalId> = Vec::new();
    let mut operands: Vec<NodeId> = Vec::new();

    let blocks: Vec<BlockId> = ctx.body.block_ids().collect();
    for block in blocks {
        let order: Vec<NodeId> = ctx.body.block(block).nodes.clone();
        for node_id in order {
            if matches!(ctx.body.node(node_id).op, Op::StackAlloc(_)) {
                // Recorded here because it feeds shadow-frame layout.
                ctx.body.stack_alloc_used = true;
            }

            if ctx.body.node(node_id).contained {
                debug_assert!(!is_safepoint(ctx, node_id));
                continue;
            }

            // Calls with return buffer pointers need them pinned across
            // the call: spill immediately if the buffer is a tracked def.
            let ret_buf = match &ctx.body.node(node_id).op {
                Op::Call(call) => call
                    .find_arg(ArgKind::RetBuffer)
                    .map(|i| call.args[i].node),
                _ => None,
            };
            if let Some(ret_buf) = ret_buf {
                if ctx.body.node(ret_buf).marked {
                    let entry = live.get_mut(&ret_buf).expect("marked def not tracked");
                    spill_value(ctx, block, ret_buf, entry, &mut free_slots);
                }
            }

            // Consume operand edges. Operands of contained nodes are used
            // at the containing node's position; they are processed through
            // the worklist, out of order, which is fine.
            let mut user = node_id;
            loop {
                operands.clear();
                ctx.body.node(user).op.operands(&mut operands);
                for &operand in &operands {
                    if ctx.body.node(operand).contained {
                        contained_operands.push(operand);
                        continue;
                    }
                    if !ctx.body.node(operand).marked {
                        continue;
                    }
                    let entry = live.remove(&operand).expect("marked def not tracked");
                    if let Some(slot) = entry {
                        // A collection point intervened: read the slot
                        // instead of the original def.
                        let ty = ctx.body.node(operand).ty;
                        let load = ctx.body.push_node(Node::new(Op::LocalLoad(slot), ty));
                        ctx.body.insert_before(block, user, load);
                        let replaced = ctx.body.node_mut(user).op.replace_operand(operand, load);
                        debug_assert!(replaced);
                        tracing::debug!(def = %operand, %slot, user = %user, "rewrote use to spill slot");
                        released.push(slot);
                    }
                    ctx.body.node_mut(operand).marked = false;
                }
                match contained_operands.pop() {
                    Some(next) => user = next,
                    None => break,
                }
            }

            // Anything still live across a safepoint gets homed now.
            if is_safepoint(ctx, node_id) && !live.is_empty() {
                tracing::debug!(at = %node_id, live = live.len(), "safepoint with live GC defs");
                let defs: Vec<NodeId> = live.keys().copied().collect();
                for def in defs {
                    let entry = live.get_mut(&def).expect("def disappeared");
                    spill_value(ctx, block, def, entry, &mut free_slots);
                }
            }

            // Slots released by this node's uses become reusable only now,
            // after the force-spills above, so a slot still being read at
            // this node is never also written at it.
            for slot in released.drain(..) {
                free_slots.release(ctx, slot);
            }

            // Track the value this node defines.
            let node = ctx.body.node(node_id);
            if node.is_value() && !node.unused_value && is_gc_temp(ctx, node_id) {
                ctx.body.node_mut(node_id).marked = true;
                live.insert(node_id, None);
            }
        }

        // Every GC def must have been consumed within its block.
        debug_assert!(live.is_empty(), "GC defs live out of {block}");
        live.clear();
    }
}

/// Type-stratified free lists of spill slots. Recycling bounds the slot
/// count by the maximum simultaneous cross-safepoint liveness instead of
/// the total number of spill events.
#[derive(Default)]
struct FreeSlots {
    refs: Vec<LocalId>,
    byrefs: Vec<LocalId>,
}

impl FreeSlots {
    fn take(&mut self, ctx: &mut LowerContext, ty: ValueType) -> LocalId {
        let recycled = match ty {
            ValueType::Ref => self.refs.pop(),
            ValueType::Byref => self.byrefs.pop(),
            // Struct spills should be very rare; always use a fresh slot.
            ValueType::Struct(_) => None,
            _ => unreachable!("non-GC type {ty:?} in the live set"),
        };
        recycled.unwrap_or_else(|| ctx.body.new_temp(ty))
    }

    fn release(&mut self, ctx: &LowerContext, slot: LocalId) {
        match ctx.body.locals.get(slot).ty {
            ValueType::Ref => self.refs.push(slot),
            ValueType::Byref => self.byrefs.push(slot),
            _ => {}
        }
    }
}

/// Store a tracked def into a slot right after its definition. A def
/// already spilled across an earlier safepoint keeps its slot.
fn spill_value(
    ctx: &mut LowerContext,
    block: BlockId,
    def: NodeId,
    entry: &mut Option<LocalId>,
    free_slots: &mut FreeSlots,
) {
    if entry.is_some() {
        return;
    }
    let ty = ctx.body.node(def).ty;
    let slot = free_slots.take(ctx, ty);
    tracing::debug!(%def, %slot, "spilling GC def across safepoint");
    let store = ctx.body.push_node(Node::new(Op::LocalStore(slot, def), ty));
    ctx.body.insert_after(block, def, store);
    *entry = Some(slot);
}

fn is_safepoint(ctx: &LowerContext, id: NodeId) -> bool {
    match &ctx.body.node(id).op {
        Op::Call(call) => call.is_potential_safepoint(),
        _ => false,
    }
}

/// Whether this def must be tracked: a GC-tracked value produced by
/// something other than a local access, a local address (always stack),
/// or a handle constant (only ever points at frozen objects).
fn is_gc_temp(ctx: &LowerContext, id: NodeId) -> bool {
    let node = ctx.body.node(id);
    match node.ty {
        ValueType::Ref | ValueType::Byref => {}
        ValueType::Struct(layout) => {
            // Raw struct indirections are not spillable as values.
            if matches!(node.op, Op::Load(_)) {
                return false;
            }
            if !ctx.body.layouts.get(layout).has_gc_ptrs() {
                return false;
            }
        }
        _ => return false,
    }
    !node.op.is_local_access() && !matches!(node.op, Op::LocalAddr(_, _) | Op::ConstHandle(_))
}
