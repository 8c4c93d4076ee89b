//! Tracelet - Meta-Tracing Specializer
//!
//! Tracelet interprets a typed SSA intermediate representation and, while
//! interpreting, incrementally builds a second, constant-specialized copy of
//! the program — the *trace* — which is compiled to native code and invoked
//! directly on later calls.
//!
//! # Architecture
//!
//! One invocation of an uncompiled target flows through the whole engine:
//!
//! 1. **JIT target cache** ([`target`]) — misses fall through to the
//!    interpreter; hits call the cached native pointer.
//! 2. **Interpreter engine** ([`interp`]) — walks basic blocks, dispatches
//!    per-instruction semantics, decides per call site between inlining the
//!    callee's IR and an opaque native call, and emulates variadic argument
//!    passing.
//! 3. **Trace emitter** ([`trace`]) — mirrors every interpreted instruction
//!    into the residual function, remapping operands through frame-scoped
//!    value maps, importing referenced globals and functions, and pinning
//!    speculated constants with guards that trap on divergence.
//! 4. **Native backend** ([`backend`]) — verifies, optimizes once, and
//!    compiles the residual function with Cranelift, resolving imports
//!    through the [`symbols`] resolver.
//!
//! The [`session`] module ties the pieces together behind an explicit
//! [`Session`] object; there is no process-global state.
//!
//! # Example
//!
//! ```rust
//! use tracelet::ir::builder::{FunctionBuilder, ModuleBuilder};
//! use tracelet::ir::{FuncTy, Ty};
//! use tracelet::Session;
//!
//! // fn double_sum(a, b) = (a + b) * 2
//! let mut f = FunctionBuilder::new(
//!     "double_sum",
//!     FuncTy::new(Ty::int(64), vec![Ty::int(64), Ty::int(64)]),
//! );
//! let (a, b) = (f.arg(0), f.arg(1));
//! let sum = f.add(Ty::int(64), a, b);
//! let two = f.iconst(64, 2);
//! let result = f.mul(Ty::int(64), sum, two);
//! f.ret(Some(result));
//!
//! let mut module = ModuleBuilder::new("example");
//! module.define(f.finish());
//!
//! let mut session = Session::new();
//! session.register_module(module.finish()).unwrap();
//!
//! let address = session.address_of("double_sum").unwrap();
//! let target = session.jit_target(address, 2).unwrap();
//!
//! // First run interprets and compiles; later runs hit the cached trace.
//! assert_eq!(session.run(&target, &[3, 5]), 16);
//! assert_eq!(session.run(&target, &[10, 11]), 42);
//! assert!(target.compiled().is_some());
//! ```
//!
//! # Error model
//!
//! Every failure is terminal ([`error`]): unsupported constructs,
//! consistency violations, and compile failures abort the process at the
//! public entry points. Failed speculation is deferred to trace run time as
//! a guard trap — never silently recomputed.

pub mod backend;
pub mod error;
pub mod interp;
pub mod ir;
pub mod registry;
pub mod session;
pub mod symbols;
pub mod target;
pub mod trace;
pub mod value;

pub use error::{EngineError, EngineResult};
pub use registry::{FuncRef, ModuleRegistry};
pub use session::{Session, TraceArtifact, TraceStrategy};
pub use symbols::SymbolResolver;
pub use target::JitTarget;
pub use value::{RuntimeValue, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use ir::builder::{FunctionBuilder, ModuleBuilder};
    use ir::{FuncTy, Ty};

    #[test]
    fn end_to_end_add() {
        let mut f = FunctionBuilder::new(
            "add2",
            FuncTy::new(Ty::int(64), vec![Ty::int(64), Ty::int(64)]),
        );
        let (a, b) = (f.arg(0), f.arg(1));
        let sum = f.add(Ty::int(64), a, b);
        f.ret(Some(sum));
        let mut mb = ModuleBuilder::new("smoke");
        mb.define(f.finish());

        let mut session = Session::new();
        session.register_module(mb.finish()).unwrap();
        let target = session
            .jit_target(session.address_of("add2").unwrap(), 2)
            .unwrap();

        assert_eq!(session.try_run(&target, &[3, 5]).unwrap(), 8);
        // Pure arithmetic pins nothing, so the cached trace generalizes.
        assert_eq!(session.try_run(&target, &[40, 2]).unwrap(), 42);
    }

    #[test]
    fn unknown_target_is_an_error() {
        let session = Session::new();
        let target = JitTarget::new(0x10, 0);
        assert!(session.try_run(&target, &[]).is_err());
    }
}
