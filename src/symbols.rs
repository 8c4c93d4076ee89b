//! Symbol Resolution
//!
//! A bidirectional, exact-match table between symbol names and native
//! addresses. Call targets resolve through it in both directions: an address
//! observed at a call site maps back to the one function name it belongs to,
//! and a name referenced by the IR maps to the address the host process
//! loaded it at.
//!
//! Host glue registers real addresses for the functions and globals it
//! provides. IR functions without a host registration receive a sentinel
//! address — a stable, unique heap cell owned by the resolver — so function
//! values still have concrete scalars and call-target guards stay sound.
//! Sentinels are never executable; invoking one natively is a configuration
//! error and fails when the call is made.
//!
//! Inexact matches do not exist by construction: every lookup is a hash map
//! hit on the full name or the exact address, and conflicting registrations
//! are rejected instead of shadowed.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Bidirectional name/address table with sentinel minting.
#[derive(Default)]
pub struct SymbolResolver {
    by_name: HashMap<String, usize>,
    by_addr: HashMap<usize, String>,
    // Owned cells backing sentinel addresses; never freed or reused.
    anchors: Vec<Box<u64>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        SymbolResolver::default()
    }

    /// Register `name` at `addr`. Re-registering the same pair is a no-op;
    /// any disagreement with an existing entry is a clash.
    pub fn register(&mut self, name: &str, addr: usize) -> EngineResult<()> {
        if let Some(&existing) = self.by_name.get(name) {
            if existing == addr {
                return Ok(());
            }
            return Err(EngineError::SymbolClash(name.to_string()));
        }
        if self.by_addr.contains_key(&addr) {
            return Err(EngineError::SymbolClash(name.to_string()));
        }
        debug!(name, addr = format_args!("{addr:#x}"), "registered symbol");
        self.by_name.insert(name.to_string(), addr);
        self.by_addr.insert(addr, name.to_string());
        Ok(())
    }

    /// Address for `name`, minting a sentinel when the host registered none.
    pub fn ensure(&mut self, name: &str) -> usize {
        if let Some(&addr) = self.by_name.get(name) {
            return addr;
        }
        let anchor = Box::new(0u64);
        let addr = &*anchor as *const u64 as usize;
        self.anchors.push(anchor);
        debug!(name, addr = format_args!("{addr:#x}"), "minted sentinel address");
        self.by_name.insert(name.to_string(), addr);
        self.by_addr.insert(addr, name.to_string());
        addr
    }

    /// Loaded address of `name`.
    pub fn address_of(&self, name: &str) -> EngineResult<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownSymbol(name.to_string()))
    }

    /// Exported name owning exactly the address `addr`.
    pub fn name_of(&self, addr: usize) -> EngineResult<&str> {
        self.by_addr
            .get(&addr)
            .map(String::as_str)
            .ok_or(EngineError::UnknownAddress(addr))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}
