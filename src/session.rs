//! Engine Session
//!
//! The explicit owner of everything the engine would otherwise keep in
//! process globals: the module registry, the symbol resolver, the trace
//! strategy, the target cache, and the compiled traces kept alive for the
//! process lifetime. Constructed once per process (or once per test) —
//! repeated runs stay isolated by constructing separate sessions.
//!
//! The session is the public entry surface: register modules and symbols,
//! create JIT targets, run them. `run` follows the engine's fatal error
//! contract; the `try_` variants surface the underlying [`EngineError`] for
//! hosts that want to observe it before the process ends.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::{self, CompiledTrace};
use crate::error::{fatal, EngineResult};
use crate::interp;
use crate::ir;
use crate::registry::{FuncRef, ModuleRegistry};
use crate::symbols::SymbolResolver;
use crate::target::{JitTarget, JitTargetCache};

/// Call-site policy: which callees are never traced (invoked natively by
/// address) and which names are opaque (invoked natively even when their IR
/// is registered).
pub struct TraceStrategy {
    never_trace: HashSet<usize>,
    opaque_names: HashSet<String>,
}

impl Default for TraceStrategy {
    fn default() -> Self {
        // The engine's own runtime entry points are unsafe to inline: the
        // fatal-error path, diagnostic formatting, and the allocator.
        let opaque_names = ["rt_fatal_error", "rt_format_error", "rt_alloc"]
            .into_iter()
            .map(String::from)
            .collect();
        TraceStrategy {
            never_trace: HashSet::new(),
            opaque_names,
        }
    }
}

impl TraceStrategy {
    pub fn new() -> Self {
        TraceStrategy::default()
    }

    /// Always invoke `addr` natively, without consulting the registry.
    pub fn never_trace_address(&mut self, addr: usize) -> &mut Self {
        self.never_trace.insert(addr);
        self
    }

    /// Invoke `name` natively even when its IR is available.
    pub fn opaque_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.opaque_names.insert(name.into());
        self
    }

    pub(crate) fn is_never_traced(&self, addr: usize) -> bool {
        self.never_trace.contains(&addr)
    }

    pub(crate) fn traces_into(&self, name: &str) -> bool {
        !self.opaque_names.contains(name)
    }
}

/// Everything produced by one trace build, for hosts and tests that want to
/// look at the residual IR alongside the results.
pub struct TraceArtifact {
    /// Concrete result of the interpretation that built the trace
    pub result: i64,
    /// Executable address of the compiled trace
    pub code: usize,
    /// The residual module, post-optimization
    pub residual: ir::Module,
    /// Name of the residual function inside `residual`
    pub trace_name: String,
}

/// One engine instance: registry, resolver, strategy, caches.
pub struct Session {
    registry: ModuleRegistry,
    resolver: SymbolResolver,
    strategy: TraceStrategy,
    targets: JitTargetCache,
    compiled: RefCell<Vec<CompiledTrace>>,
    trace_counter: AtomicU64,
    max_inline_depth: usize,
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session {
            registry: ModuleRegistry::new(),
            resolver: SymbolResolver::new(),
            strategy: TraceStrategy::default(),
            targets: JitTargetCache::new(),
            compiled: RefCell::new(Vec::new()),
            trace_counter: AtomicU64::new(0),
            max_inline_depth: 256,
        }
    }

    pub fn with_strategy(strategy: TraceStrategy) -> Session {
        Session {
            strategy,
            ..Session::new()
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Register an IR module: index its definitions and make sure every
    /// defined function has a native address (host-registered or sentinel).
    pub fn register_module(&mut self, module: ir::Module) -> EngineResult<()> {
        let names: Vec<String> = module
            .functions
            .iter()
            .filter(|f| !f.is_declaration())
            .map(|f| f.name.clone())
            .collect();
        self.registry.register(module)?;
        for name in names {
            self.resolver.ensure(&name);
        }
        Ok(())
    }

    /// Register a host symbol (function or global) at its loaded address.
    /// Must happen before any module registration mints a sentinel for the
    /// same name.
    pub fn register_symbol(&mut self, name: &str, addr: usize) -> EngineResult<()> {
        self.resolver.register(name, addr)
    }

    pub fn strategy_mut(&mut self) -> &mut TraceStrategy {
        &mut self.strategy
    }

    pub fn set_max_inline_depth(&mut self, depth: usize) {
        self.max_inline_depth = depth;
    }

    // =========================================================================
    // Component access (used by the interpreter)
    // =========================================================================

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    pub fn strategy(&self) -> &TraceStrategy {
        &self.strategy
    }

    pub fn max_inline_depth(&self) -> usize {
        self.max_inline_depth
    }

    pub(crate) fn next_trace_name(&self) -> String {
        let n = self.trace_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("traced_{}", n)
    }

    /// Loaded address of a defined function, for creating targets by name.
    pub fn address_of(&self, name: &str) -> EngineResult<usize> {
        self.resolver.address_of(name)
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Cache entry for the target function at `address`.
    pub fn jit_target(&self, address: usize, num_args: usize) -> EngineResult<Arc<JitTarget>> {
        self.targets.target(address, num_args)
    }

    /// Cache entry for a defined function, by name.
    pub fn jit_target_named(&self, name: &str, num_args: usize) -> EngineResult<Arc<JitTarget>> {
        let addr = self.resolver.address_of(name)?;
        self.targets.target(addr, num_args)
    }

    /// Run a target: the first call interprets the target with these
    /// concrete arguments, compiles the recorded trace, caches it, and
    /// returns the interpreted result; later calls invoke the cached native
    /// code directly.
    pub fn try_run(&self, target: &JitTarget, args: &[i64]) -> EngineResult<i64> {
        if target.compiled().is_some() {
            return target.invoke_compiled(args);
        }

        let name = self.resolver.name_of(target.address())?;
        let fref = self.registry.find_function(name)?;
        let (result, code) = self.build_trace(fref, args)?;
        target.publish(code);
        Ok(result)
    }

    /// Like [`try_run`](Self::try_run), with the engine's fatal contract:
    /// any failure terminates the process.
    pub fn run(&self, target: &JitTarget, args: &[i64]) -> i64 {
        self.try_run(target, args)
            .unwrap_or_else(|err| fatal(&err))
    }

    /// Interpret a defined function once and return the full trace artifact,
    /// residual IR included.
    pub fn trace_function(&self, name: &str, args: &[i64]) -> EngineResult<TraceArtifact> {
        let fref = self.registry.find_function(name)?;
        let (result, residual, trace_name) = interp::interpret_and_trace(self, fref, args)?;
        let code = self.compile_residual(&residual, &trace_name)?;
        Ok(TraceArtifact {
            result,
            code,
            residual,
            trace_name,
        })
    }

    fn build_trace(&self, fref: FuncRef, args: &[i64]) -> EngineResult<(i64, usize)> {
        let (result, residual, trace_name) = interp::interpret_and_trace(self, fref, args)?;
        let code = self.compile_residual(&residual, &trace_name)?;
        Ok((result, code))
    }

    fn compile_residual(&self, residual: &ir::Module, trace_name: &str) -> EngineResult<usize> {
        let compiled = backend::compile(residual, trace_name, &self.resolver)?;
        let code = compiled.addr();
        debug!(trace = trace_name, code = format_args!("{:#x}", code), "trace cached");
        self.compiled.borrow_mut().push(compiled);
        Ok(code)
    }
}
