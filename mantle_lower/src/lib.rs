//! mantle_lower: lowering of optimizer-level IR into backend-ready IR.
//!
//! The target backend has no native stack unwinding and cannot scan its
//! stack or registers for GC references. Lowering therefore (a) homes
//! every GC-tracked value that must survive a collection on an explicit,
//! scanned shadow stack, (b) synthesizes the exception-handling regions
//! the backend understands, and (c) rewrites call sites into the exact
//! argument and ABI shape the backend requires.
//!
//! The pass is synchronous, deterministic, and total over well-formed
//! input; one method body is lowered at a time with no shared state
//! between compilations.

pub mod abi;
pub mod context;

mod call;
mod eh;
mod layout;
mod nodes;
mod spill;


use mantle_ir::value::BlockId;
use thiserror::Error;

pub use crate::abi::AbiClassifier;
pub use crate::context::{LowerConfig, LowerContext, MethodSig, RuntimeContract};

/// Failure to lower a method.
///
/// A limitation aborts this method's compilation; the surrounding driver
/// owns any fallback execution strategy. Invariant violations are not
/// errors but panics: they indicate a compiler defect and must never be
/// swallowed, since they risk miscompilation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    #[error("implementation limitation: {0}")]
    Limitation(&'static str),
}

/// Lower one method body in place.
pub fn lower(ctx: &mut LowerContext) -> Result<(), LowerError> {
    eh::add_unhandled_exception_handler(ctx);
    abi::assign_backend_args(ctx);

    // The spill analyzer must see the whole method before slot layout is
    // finalized: slots it creates are homed by the layout planner.
    spill::spill_across_safepoints(ctx);
    layout::plan_shadow_frame(ctx);

    lower_blocks(ctx)?;

    #[cfg(debug_assertions)]
    {
        let result = mantle_ir::verifier::verify(ctx.body);
        assert!(result.is_ok(), "lowering broke the body: {result}");
    }
    Ok(())
}

fn lower_blocks(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let blocks: Vec<BlockId> = ctx.body.block_ids().collect();
    for &block in &blocks {
        lower_range(ctx, block)?;
        ctx.body.block_mut(block).marked = true;
    }

    // Lowering may insert out-of-line blocks that must themselves be
    // lowered. One extra round suffices: lowering those blocks does not
    // create further blocks.
    let all_blocks: Vec<BlockId> = ctx.body.block_ids().collect();
    for block in all_blocks {
        if !ctx.body.block(block).marked {
            lower_range(ctx, block)?;
        }
        ctx.body.block_mut(block).marked = false;
    }
    Ok(())
}

fn lower_range(ctx: &mut LowerContext, block: BlockId) -> Result<(), LowerError> {
    ctx.cur_block = Some(block);
    let mut index = 0;
    while index < ctx.body.block(block).nodes.len() {
        let id = ctx.body.block(block).nodes[index];
        nodes::lower_node(ctx, id)?;
        // Rewrites insert nodes around the current one (and may truncate
        // the block); recompute where to continue from.
        index = ctx.body.node_pos(block, id) + 1;
    }
    ctx.cur_block = None;
    Ok(())
}
