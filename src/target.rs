//! JIT Target Cache
//!
//! A [`JitTarget`] memoizes the one-time compilation of a target function:
//! created with the target's native address and declared argument count, it
//! starts uncompiled, transitions exactly once to compiled when the first
//! invocation finishes interpreting and building the trace, and thereafter
//! hands out the cached executable address so later invocations bypass the
//! interpreter entirely.
//!
//! The per-session cache maps target addresses to shared targets so repeated
//! lookups of the same function reuse one entry.

use std::mem::transmute;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::{EngineError, EngineResult};

/// One target function's compile-once cache entry.
pub struct JitTarget {
    address: usize,
    num_args: usize,
    compiled: OnceLock<usize>,
}

impl JitTarget {
    pub fn new(address: usize, num_args: usize) -> JitTarget {
        JitTarget {
            address,
            num_args,
            compiled: OnceLock::new(),
        }
    }

    /// Native address of the target function.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Declared argument count.
    pub fn num_args(&self) -> usize {
        self.num_args
    }

    /// The cached trace address, if the one-time compile happened.
    pub fn compiled(&self) -> Option<usize> {
        self.compiled.get().copied()
    }

    /// Publish the compiled trace address. Only the first publication takes;
    /// the entry is immutable afterwards.
    pub(crate) fn publish(&self, addr: usize) {
        let _ = self.compiled.set(addr);
    }

    /// Invoke the cached trace directly. Supports 0-3 arguments; the trace
    /// commits to whatever constants were pinned when it was built.
    pub(crate) fn invoke_compiled(&self, args: &[i64]) -> EngineResult<i64> {
        let addr = self
            .compiled()
            .ok_or_else(|| EngineError::Consistency("no compiled trace to invoke".to_string()))?;
        if args.len() != self.num_args {
            return Err(EngineError::ArgCountMismatch {
                name: format!("target {:#x}", self.address),
                expected: self.num_args,
                got: args.len(),
            });
        }
        Ok(match args.len() {
            0 => unsafe { transmute::<usize, extern "C" fn() -> i64>(addr)() },
            1 => unsafe { transmute::<usize, extern "C" fn(i64) -> i64>(addr)(args[0]) },
            2 => unsafe {
                transmute::<usize, extern "C" fn(i64, i64) -> i64>(addr)(args[0], args[1])
            },
            3 => unsafe {
                transmute::<usize, extern "C" fn(i64, i64, i64) -> i64>(addr)(
                    args[0], args[1], args[2],
                )
            },
            n => return Err(EngineError::UnsupportedArgCount(n)),
        })
    }
}

/// Per-session map from target address to its shared cache entry.
#[derive(Default)]
pub struct JitTargetCache {
    targets: DashMap<usize, Arc<JitTarget>>,
}

impl JitTargetCache {
    pub fn new() -> Self {
        JitTargetCache::default()
    }

    /// Get or create the entry for `address`. A second lookup with a
    /// different argument count is a consistency error.
    pub fn target(&self, address: usize, num_args: usize) -> EngineResult<Arc<JitTarget>> {
        let entry = self
            .targets
            .entry(address)
            .or_insert_with(|| Arc::new(JitTarget::new(address, num_args)))
            .clone();
        if entry.num_args() != num_args {
            return Err(EngineError::ArgCountMismatch {
                name: format!("target {:#x}", address),
                expected: entry.num_args(),
                got: num_args,
            });
        }
        Ok(entry)
    }
}
