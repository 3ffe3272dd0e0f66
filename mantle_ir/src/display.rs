//! Text format for method bodies, used by tests and dump logging.
//!
//! Output format:
//! ```text
//! func @name {
//!   bb0 try=EH#0:
//!     n0 = local.load l1
//!     n1 = call helper:resolve_interface(n0)
//!     ret n1
//! }
//! ```
//!
//! Node names are raw arena indices: they stay stable while lowering
//! inserts and removes nodes, which keeps dumps diffable.

use std::fmt;

use crate::body::MethodBody;
use crate::node::{ArgKind, CallTarget, Helper, Op};
use crate::types::ValueType;
use crate::value::NodeId;

fn fmt_type(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Void => "void",
        ValueType::Int32 => "i32",
        ValueType::Int64 => "i64",
        ValueType::NativeInt => "nint",
        ValueType::Double => "f64",
        ValueType::Ref => "ref",
        ValueType::Byref => "byref",
        ValueType::Struct(_) => "struct",
    }
}

fn fmt_helper(helper: Helper) -> &'static str {
    match helper {
        Helper::ResolveInterfaceCallTarget => "resolve_interface",
        Helper::GcTransitionBegin => "gc_transition_begin",
        Helper::GcTransitionEnd => "gc_transition_end",
        Helper::UnhandledException => "unhandled_exception",
        Helper::Rethrow => "rethrow",
        Helper::Overflow => "overflow",
    }
}

fn fmt_node(body: &MethodBody, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let node = body.node(id);
    if node.is_value() {
        write!(f, "{id} = ")?;
    }
    match &node.op {
        Op::ConstInt(v) => write!(f, "const.{} {v}", fmt_type(node.ty))?,
        Op::ConstHandle(v) => write!(f, "const.handle {v:#x}")?,
        Op::ParamIn(l) => write!(f, "param.in {l}")?,
        Op::LocalLoad(l) => write!(f, "local.load {l}")?,
        Op::LocalStore(l, v) => write!(f, "local.store {l}, {v}")?,
        Op::LocalField(l, off) => write!(f, "local.field {l}+{off}")?,
        Op::LocalFieldStore(l, off, v) => write!(f, "local.field.store {l}+{off}, {v}")?,
        Op::LocalAddr(l, off) => write!(f, "local.addr {l}+{off}")?,
        Op::Load(a) => write!(f, "load.{} {a}", fmt_type(node.ty))?,
        Op::Store(a, v) => write!(f, "store {a}, {v}")?,
        Op::NullCheck(a) => write!(f, "nullcheck {a}")?,
        Op::Add(a, b) => write!(f, "add {a}, {b}")?,
        Op::Div(a, b) => write!(f, "div {a}, {b}")?,
        Op::Rem(a, b) => write!(f, "rem {a}, {b}")?,
        Op::UDiv(a, b) => write!(f, "udiv {a}, {b}")?,
        Op::URem(a, b) => write!(f, "urem {a}, {b}")?,
        Op::Call(call) => {
            match call.target {
                CallTarget::Direct(m) => write!(f, "call m{}", m.0)?,
                CallTarget::Indirect(t) => write!(f, "call.ind {t}")?,
                CallTarget::Helper(h) => write!(f, "call helper:{}", fmt_helper(h))?,
            }
            write!(f, "(")?;
            for (i, arg) in call.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match arg.kind {
                    ArgKind::Normal => {}
                    ArgKind::This => write!(f, "this:")?,
                    ArgKind::DispatchCell => write!(f, "cell:")?,
                    ArgKind::RetBuffer => write!(f, "retbuf:")?,
                    ArgKind::InstParam => write!(f, "inst:")?,
                }
                write!(f, "{}", arg.node)?;
            }
            write!(f, ")")?;
        }
        Op::CatchArg => write!(f, "catch.arg")?,
        Op::Return(None) => write!(f, "ret")?,
        Op::Return(Some(v)) => write!(f, "ret {v}")?,
        Op::StackAlloc(n) => write!(f, "stack.alloc {n}")?,
    }
    if node.contained {
        write!(f, " [contained]")?;
    }
    if node.nonfaulting {
        write!(f, " [nonfaulting]")?;
    }
    Ok(())
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func @{} {{", self.name)?;
        for block_id in self.block_ids() {
            let block = self.block(block_id);
            write!(f, "  {block_id}")?;
            if let Some(try_index) = block.try_index {
                write!(f, " try={try_index}")?;
            }
            if let Some(hnd_index) = block.hnd_index {
                write!(f, " hnd={hnd_index}")?;
            }
            writeln!(f, ":")?;
            for &node in &block.nodes {
                write!(f, "    ")?;
                fmt_node(self, node, f)?;
                writeln!(f)?;
            }
        }
        write!(f, "}}")
    }
}
