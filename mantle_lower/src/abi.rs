//! Call/ABI classification and backend argument assignment.
//!
//! Backend argument layout for a managed method:
//!   - shadow-stack pointer (omitted for reverse native entries)
//!   - receiver, if required
//!   - return buffer, if required
//!   - generic instantiation context, if required
//!   - the signature arguments

use mantle_ir::types::{AbiClass, LayoutTable, NativeType, ValueType, POINTER_SIZE};
use mantle_ir::value::LocalId;

use crate::context::LowerContext;

/// Maps managed types onto the target backend's native ABI.
#[derive(Debug, Clone)]
pub struct AbiClassifier {
    pub ptr_size: u32,
}

impl Default for AbiClassifier {
    fn default() -> Self {
        Self {
            ptr_size: POINTER_SIZE,
        }
    }
}

impl AbiClassifier {
    /// The backend-native type for a value of `ty`.
    pub fn native_type(&self, ty: ValueType) -> NativeType {
        match ty {
            ValueType::Void => NativeType::Void,
            ValueType::Int32 => NativeType::I32,
            ValueType::Int64 => NativeType::I64,
            ValueType::Double => NativeType::F64,
            ValueType::NativeInt | ValueType::Ref | ValueType::Byref | ValueType::Struct(_) => {
                NativeType::Ptr
            }
        }
    }

    /// Classify an argument: passed directly as a native value, or through
    /// a reference into the caller's scanned shadow frame.
    ///
    /// Aggregates holding GC slots must be discoverable by the collector,
    /// so they always travel through the shadow stack; so do aggregates too
    /// large to pass by value.
    pub fn classify_arg(&self, ty: ValueType, layouts: &LayoutTable) -> AbiClass {
        match ty {
            ValueType::Struct(layout) => {
                let layout = layouts.get(layout);
                if layout.has_gc_ptrs() || layout.size > self.ptr_size {
                    AbiClass::ShadowStackRef
                } else {
                    AbiClass::Direct(NativeType::I64)
                }
            }
            ValueType::Void => AbiClass::Direct(NativeType::Void),
            other => AbiClass::Direct(self.native_type(other)),
        }
    }

    /// Classify a return value. Returns that cannot travel in a native
    /// return register use a caller-provided buffer on the shadow stack.
    pub fn classify_return(&self, ty: ValueType, layouts: &LayoutTable) -> AbiClass {
        match ty {
            ValueType::Struct(layout) => {
                let layout = layouts.get(layout);
                if layout.has_gc_ptrs() || layout.size > self.ptr_size {
                    AbiClass::ShadowStackRef
                } else {
                    AbiClass::Direct(NativeType::I64)
                }
            }
            other => AbiClass::Direct(self.native_type(other)),
        }
    }
}

/// Create the shadow-stack slots and assign backend argument numbers.
pub(crate) fn assign_backend_args(ctx: &mut LowerContext) {
    if ctx.body.has_handlers() {
        // Handlers run against the frame that was live when the exception
        // was raised; keep the caller's shadow-stack pointer around.
        let lcl = ctx.body.new_temp_implicit(ValueType::NativeInt);
        ctx.original_shadow_stack_lcl = Some(lcl);
    }

    let shadow = ctx.body.new_temp_implicit(ValueType::NativeInt);
    ctx.shadow_stack_lcl = Some(shadow);

    let mut next_arg = 0u32;
    if !ctx.sig.is_reverse_native_entry {
        let desc = ctx.body.locals.get_mut(shadow);
        desc.is_param = true;
        desc.backend_arg = Some(next_arg);
        next_arg += 1;
    }

    // The return buffer is pinned in this convention and passed as a
    // native pointer; so is the instantiation context.
    if let Some(ret_buf) = ctx.sig.ret_buffer_param {
        let desc = ctx.body.locals.get_mut(ret_buf);
        debug_assert_eq!(desc.ty, ValueType::Byref);
        desc.ty = ValueType::NativeInt;
    }
    if let Some(inst) = ctx.sig.inst_param {
        ctx.body.locals.get_mut(inst).ty = ValueType::NativeInt;
    }

    let params: Vec<LocalId> = ctx
        .body
        .locals
        .ids()
        .filter(|&l| ctx.body.locals.get(l).is_param && l != shadow)
        .collect();
    for lcl in params {
        ctx.body.locals.get_mut(lcl).backend_arg = Some(next_arg);
        next_arg += 1;
    }

    ctx.backend_arg_count = next_arg;
}
