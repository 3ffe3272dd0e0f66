//! Shadow-stack frame layout planning.
//!
//! Decides which local slots must be homed on the collector-scanned
//! shadow stack, inserts their entry initialization, and assigns stable
//! byte offsets. A slot qualifies when it holds GC-tracked data or must
//! survive an exception-handler transfer; slots created by the spill
//! analyzer qualify through their GC-tracked types.

use mantle_ir::local::Promotion;
use mantle_ir::node::Op;
use mantle_ir::types::ValueType;
use mantle_ir::value::LocalId;

use crate::context::LowerContext;

pub(crate) fn plan_shadow_frame(ctx: &mut LowerContext) {
    let has_handlers = ctx.body.has_handlers();
    let mut shadow_locals: Vec<LocalId> = Vec::new();

    let ids: Vec<LocalId> = ctx.body.locals.ids().collect();
    for lcl in ids {
        // Decouple independently promoted parameters from their fields:
        // each referenced field gets an explicit copy-in from the parent.
        if ctx.body.locals.get(lcl).is_param {
            if let Promotion::Independent { fields } = ctx.body.locals.get(lcl).promotion.clone() {
                for field in fields {
                    let field_desc = ctx.body.locals.get(field);
                    if field_desc.ref_count == 0 {
                        continue;
                    }
                    let field_ty = field_desc.ty;
                    let offset = ctx
                        .body
                        .locals
                        .field_offset(field)
                        .expect("promoted field without an offset");
                    let value = ctx.prolog_insert(Op::LocalField(lcl, offset), field_ty);
                    ctx.prolog_store(field, value);
                    ctx.body.locals.get_mut(field).has_explicit_init = true;
                }
            }
        }

        // Liveness across handlers is unknown for untracked slots; assume
        // the worst whenever the method has handlers at all.
        if !ctx.body.locals.get(lcl).tracked && has_handlers {
            ctx.body.locals.get_mut(lcl).live_in_out_of_handler = true;
        }

        if ctx.is_shadow_stack_local(lcl) {
            continue;
        }

        let desc = ctx.body.locals.get(lcl);
        if !ctx.body.local_has_gc_ptr(lcl) && !desc.live_in_out_of_handler {
            continue;
        }
        if matches!(desc.promotion, Promotion::Independent { .. }) {
            // The individual fields are placed on the shadow stack.
            continue;
        }
        if ctx.body.locals.dependent_field(lcl).is_some() {
            // The fields are referenced through the parent.
            continue;
        }
        // A dependently promoted parent is referenced through its fields.
        let mut refs = desc.ref_count;
        if let Promotion::Dependent { fields } = &desc.promotion {
            refs += fields
                .iter()
                .map(|&f| ctx.body.locals.get(f).ref_count)
                .sum::<u32>();
        }
        if refs == 0 && !desc.implicitly_referenced {
            continue;
        }

        // Entry initialization: parameters homed here get a copy-in; other
        // slots are zeroed unless a reaching initializer was proven, and
        // GC-tracked slots are zeroed regardless so the first scan never
        // sees garbage.
        let desc = ctx.body.locals.get(lcl);
        if !desc.has_explicit_init {
            if desc.is_param {
                let ty = desc.ty;
                let value = ctx.prolog_insert(Op::ParamIn(lcl), ty);
                ctx.prolog_store(lcl, value);
            } else if ctx.body.local_has_gc_ptr(lcl) || !desc.proved_initialized {
                let zero_ty = match desc.ty {
                    ValueType::Struct(_) => ValueType::Int32,
                    ty => ty,
                };
                let zero = ctx.prolog_insert(Op::ConstInt(0), zero_ty);
                ctx.prolog_store(lcl, zero);
            }
        }

        shadow_locals.push(lcl);
    }

    if shadow_locals.is_empty() && ctx.body.stack_alloc_used && ctx.config.dynamic_stack_for_alloc
    {
        // Dynamic-extent state is released together with the shadow frame.
        // An empty shadow frame over a non-empty dynamic frame would be
        // indistinguishable from the caller's on release, so pad it out.
        let padding = ctx.body.new_temp_implicit(ValueType::Ref);
        let zero = ctx.prolog_insert(Op::ConstInt(0), ValueType::Ref);
        ctx.prolog_store(padding, zero);
        shadow_locals.push(padding);
    }

    assign_shadow_offsets(ctx, &shadow_locals);
}

/// Bump-allocate byte offsets over the qualifying slots. The slot list is
/// in local-table order, so the assignment is deterministic.
fn assign_shadow_offsets(ctx: &mut LowerContext, shadow_locals: &[LocalId]) {
    let align = ctx.abi.ptr_size;
    let mut offset = 0u32;
    for &lcl in shadow_locals {
        let size = ctx.body.layouts.type_size(ctx.body.locals.get(lcl).ty).max(1);
        offset = next_multiple(offset, align);
        ctx.body.locals.get_mut(lcl).shadow_offset = Some(offset);
        tracing::debug!(%lcl, offset, size, "homed on shadow stack");
        offset += size;
    }
    ctx.body.shadow_frame_size = next_multiple(offset, align);
    tracing::debug!(frame_size = ctx.body.shadow_frame_size, "shadow frame laid out");
}

fn next_multiple(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
