//! Node definitions for the mantle IR.
//!
//! A node is one typed operation with operand edges to earlier nodes in the
//! same block. Operand edges are `NodeId` values inside the `Op` payload;
//! a node produces at most one value, consumed by exactly one use edge
//! (the representation is post-SSA, single-def single-use).

use crate::types::{AbiClass, NativeType, ValueType};
use crate::value::{AccessorId, LocalId, MethodId, NodeId};

/// A node in the mantle IR.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub ty: ValueType,
    /// Evaluated as part of its consumer; never separately materialized.
    pub contained: bool,
    /// Transient bit used by live-set bookkeeping. Always clear between passes.
    pub marked: bool,
    /// The produced value has no consumer.
    pub unused_value: bool,
    /// May not be reordered relative to side-effecting nodes.
    pub ordered: bool,
    /// For indirections: proven unable to fault.
    pub nonfaulting: bool,
    /// For partial-width local stores: the untouched part of the slot is
    /// live through the store (use-and-define).
    pub use_and_def: bool,
}

impl Node {
    pub fn new(op: Op, ty: ValueType) -> Self {
        Self {
            op,
            ty,
            contained: false,
            marked: false,
            unused_value: false,
            ordered: false,
            nonfaulting: false,
            use_and_def: false,
        }
    }

    /// Whether this node produces a value. Stores and checks are typed by
    /// the location they write but produce nothing.
    pub fn is_value(&self) -> bool {
        match self.op {
            Op::LocalStore(_, _)
            | Op::LocalFieldStore(_, _, _)
            | Op::Store(_, _)
            | Op::NullCheck(_)
            | Op::Return(_) => false,
            _ => self.ty != ValueType::Void,
        }
    }
}

/// Node opcodes.
///
/// Operand edges are `NodeId`s referencing earlier nodes in the same block.
/// Local slots are referenced by `LocalId` and are not edges.
#[derive(Debug, Clone)]
pub enum Op {
    /// Integer constant.
    ConstInt(i64),
    /// Handle constant. Only ever points at immortal, immovable data.
    ConstHandle(i64),
    /// The incoming backend argument value of a parameter local.
    ParamIn(LocalId),
    /// Read a local slot.
    LocalLoad(LocalId),
    /// Store a value into a local slot.
    LocalStore(LocalId, NodeId),
    /// Read a field of a local slot at a byte offset.
    LocalField(LocalId, u32),
    /// Store into a field of a local slot at a byte offset.
    LocalFieldStore(LocalId, u32, NodeId),
    /// Address of a local slot (plus byte offset). Always points at the
    /// stack, native or shadow.
    LocalAddr(LocalId, u32),
    /// Load through an address.
    Load(NodeId),
    /// Store a value through an address: store addr, value.
    Store(NodeId, NodeId),
    /// Explicit null check of an address; produces no value.
    NullCheck(NodeId),
    /// Pointer/integer addition (address arithmetic).
    Add(NodeId, NodeId),
    /// Signed division: div %a, %b.
    Div(NodeId, NodeId),
    /// Signed remainder.
    Rem(NodeId, NodeId),
    /// Unsigned division.
    UDiv(NodeId, NodeId),
    /// Unsigned remainder.
    URem(NodeId, NodeId),
    /// Call. Payload boxed to keep `Node` small.
    Call(Box<CallData>),
    /// The caught exception object, valid in handler entry blocks.
    CatchArg,
    /// Return from the method.
    Return(Option<NodeId>),
    /// Dynamically-sized stack allocation; operand is the byte count.
    StackAlloc(NodeId),
}

impl Op {
    /// Append all operand edges of this node to `out`, in evaluation order.
    pub fn operands(&self, out: &mut Vec<NodeId>) {
        match self {
            Op::ConstInt(_)
            | Op::ConstHandle(_)
            | Op::ParamIn(_)
            | Op::LocalLoad(_)
            | Op::LocalField(_, _)
            | Op::LocalAddr(_, _)
            | Op::CatchArg
            | Op::Return(None) => {}
            Op::LocalStore(_, v) | Op::LocalFieldStore(_, _, v) => out.push(*v),
            Op::Load(a) | Op::NullCheck(a) | Op::StackAlloc(a) | Op::Return(Some(a)) => {
                out.push(*a)
            }
            Op::Store(a, v) => {
                out.push(*a);
                out.push(*v);
            }
            Op::Add(a, b)
            | Op::Div(a, b)
            | Op::Rem(a, b)
            | Op::UDiv(a, b)
            | Op::URem(a, b) => {
                out.push(*a);
                out.push(*b);
            }
            Op::Call(call) => {
                if let CallTarget::Indirect(addr) = call.target {
                    out.push(addr);
                }
                for arg in &call.args {
                    out.push(arg.node);
                }
            }
        }
    }

    /// Replace the first operand edge equal to `old` with `new`.
    /// Returns false if no edge matched.
    pub fn replace_operand(&mut self, old: NodeId, new: NodeId) -> bool {
        let mut replaced = false;
        self.for_each_operand_mut(|edge| {
            if !replaced && *edge == old {
                *edge = new;
                replaced = true;
            }
        });
        replaced
    }

    fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut NodeId)) {
        match self {
            Op::ConstInt(_)
            | Op::ConstHandle(_)
            | Op::ParamIn(_)
            | Op::LocalLoad(_)
            | Op::LocalField(_, _)
            | Op::LocalAddr(_, _)
            | Op::CatchArg
            | Op::Return(None) => {}
            Op::LocalStore(_, v) | Op::LocalFieldStore(_, _, v) => f(v),
            Op::Load(a) | Op::NullCheck(a) | Op::StackAlloc(a) | Op::Return(Some(a)) => f(a),
            Op::Store(a, v) => {
                f(a);
                f(v);
            }
            Op::Add(a, b)
            | Op::Div(a, b)
            | Op::Rem(a, b)
            | Op::UDiv(a, b)
            | Op::URem(a, b) => {
                f(a);
                f(b);
            }
            Op::Call(call) => {
                if let CallTarget::Indirect(ref mut addr) = call.target {
                    f(addr);
                }
                for arg in &mut call.args {
                    f(&mut arg.node);
                }
            }
        }
    }

    /// The local slot this node references, if it is a local access.
    pub fn local(&self) -> Option<LocalId> {
        match self {
            Op::ParamIn(l)
            | Op::LocalLoad(l)
            | Op::LocalStore(l, _)
            | Op::LocalField(l, _)
            | Op::LocalFieldStore(l, _, _)
            | Op::LocalAddr(l, _) => Some(*l),
            _ => None,
        }
    }

    /// Whether this is a read or write of a local slot (not an address-take).
    pub fn is_local_access(&self) -> bool {
        matches!(
            self,
            Op::ParamIn(_)
                | Op::LocalLoad(_)
                | Op::LocalStore(_, _)
                | Op::LocalField(_, _)
                | Op::LocalFieldStore(_, _, _)
        )
    }
}

/// Runtime helper identities fixed by the runtime/collector contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// Resolve the concrete entry point of an interface/virtual call given
    /// the receiver and a dispatch cell.
    ResolveInterfaceCallTarget,
    /// Mark the thread as leaving managed code before a native call.
    GcTransitionBegin,
    /// Mark the thread as back in managed code after a native call.
    GcTransitionEnd,
    /// Terminal handler for an exception no managed frame caught.
    UnhandledException,
    /// Rethrow the in-flight exception, preserving the stack trace.
    Rethrow,
    /// Throw an arithmetic overflow exception.
    Overflow,
}

impl Helper {
    /// Whether a call to this helper is a potential GC safepoint.
    pub fn may_trigger_gc(self) -> bool {
        match self {
            Helper::ResolveInterfaceCallTarget | Helper::Rethrow | Helper::Overflow => true,
            Helper::GcTransitionBegin | Helper::GcTransitionEnd | Helper::UnhandledException => {
                false
            }
        }
    }

    /// Whether a call to this helper never returns normally.
    pub fn never_returns(self) -> bool {
        matches!(
            self,
            Helper::UnhandledException | Helper::Rethrow | Helper::Overflow
        )
    }
}

/// What a call invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Direct call to a known method.
    Direct(MethodId),
    /// Indirect call through a computed code pointer.
    Indirect(NodeId),
    /// Call to a runtime helper.
    Helper(Helper),
}

/// Distinguished roles an argument can play at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Normal,
    /// The receiver.
    This,
    /// The dispatch cell of a not-yet-resolved virtual/interface call.
    DispatchCell,
    /// Address the callee stores a by-reference return into. Always pinned.
    RetBuffer,
    /// Generic instantiation context.
    InstParam,
}

/// One call argument: the operand edge, its role, the signature type, and
/// (after lowering) its backend ABI classification.
#[derive(Debug, Clone)]
pub struct CallArg {
    pub node: NodeId,
    pub kind: ArgKind,
    pub sig_ty: ValueType,
    pub abi: Option<AbiClass>,
}

impl CallArg {
    /// An ordinary argument whose signature type equals the operand's type.
    pub fn new(node: NodeId, sig_ty: ValueType) -> Self {
        Self {
            node,
            kind: ArgKind::Normal,
            sig_ty,
            abi: None,
        }
    }

    pub fn with_kind(node: NodeId, sig_ty: ValueType, kind: ArgKind) -> Self {
        Self {
            node,
            kind,
            sig_ty,
            abi: None,
        }
    }
}

/// Call payload.
#[derive(Debug, Clone)]
pub struct CallData {
    pub target: CallTarget,
    pub args: Vec<CallArg>,
    /// Signature return type. `abi_ret` holds the lowered classification.
    pub sig_ret: ValueType,
    pub abi_ret: Option<AbiClass>,
    /// Set when an interop call was routed through a signature-deferring
    /// external accessor.
    pub external_accessor: Option<AccessorId>,
    /// Native signature recorded for the backend (interop calls only).
    pub native_sig: Option<Vec<NativeType>>,
    /// Unresolved virtual/interface dispatch through a dispatch cell.
    pub is_virtual_stub: bool,
    /// Delegate `Invoke` that must be unwrapped to its target.
    pub is_delegate_invoke: bool,
    /// Native/interop call.
    pub is_unmanaged: bool,
    /// Suppress collector-transition bookkeeping around an unmanaged call.
    pub suppress_gc_transition: bool,
    /// An explicit receiver null check must be materialized before the call.
    pub needs_null_check: bool,
    /// The callee never returns normally.
    pub no_return: bool,
}

impl CallData {
    pub fn new(target: CallTarget, args: Vec<CallArg>, sig_ret: ValueType) -> Self {
        Self {
            target,
            args,
            sig_ret,
            abi_ret: None,
            external_accessor: None,
            native_sig: None,
            is_virtual_stub: false,
            is_delegate_invoke: false,
            is_unmanaged: false,
            suppress_gc_transition: false,
            needs_null_check: false,
            no_return: false,
        }
    }

    /// The helper this call invokes, if any.
    pub fn helper(&self) -> Option<Helper> {
        match self.target {
            CallTarget::Helper(h) => Some(h),
            _ => None,
        }
    }

    /// Whether this call invokes the given helper.
    pub fn is_helper(&self, helper: Helper) -> bool {
        self.helper() == Some(helper)
    }

    /// Index of the first argument with the given role.
    pub fn find_arg(&self, kind: ArgKind) -> Option<usize> {
        self.args.iter().position(|a| a.kind == kind)
    }

    /// Whether garbage collection can occur while this call is in flight.
    ///
    /// Helpers carry a static answer; unmanaged calls are safepoints
    /// exactly when they perform a collector transition; every managed
    /// call may reach a safepoint in the callee.
    pub fn is_potential_safepoint(&self) -> bool {
        match self.target {
            CallTarget::Helper(h) => h.may_trigger_gc(),
            _ => {
                if self.is_unmanaged {
                    !self.suppress_gc_transition
                } else {
                    true
                }
            }
        }
    }

    /// Whether control never continues past this call.
    pub fn is_terminal(&self) -> bool {
        self.no_return || self.helper().is_some_and(|h| h.never_returns())
    }
}
