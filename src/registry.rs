//! IR Module Registry
//!
//! Owns every registered module and indexes each function that has a body by
//! name. Later registrations extend the index; redefining an already-indexed
//! name is rejected rather than silently shadowed. Declarations are not
//! indexed — they resolve against some other module's definition or against
//! a host symbol.

use std::collections::HashMap;

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::ir::{self, verify::verify};

/// Stable handle to a function definition inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncRef {
    pub module: u32,
    pub func: u32,
}

/// Append-only store of registered modules with a by-name function index.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<ir::Module>,
    index: HashMap<String, FuncRef>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    /// Register a module, verifying and indexing every definition it holds.
    pub fn register(&mut self, module: ir::Module) -> EngineResult<u32> {
        let module_idx = self.modules.len() as u32;
        for (func_idx, func) in module.functions.iter().enumerate() {
            if func.is_declaration() {
                continue;
            }
            verify(func)?;
            if self.index.contains_key(&func.name) {
                return Err(EngineError::FunctionClash(func.name.clone()));
            }
            self.index.insert(
                func.name.clone(),
                FuncRef {
                    module: module_idx,
                    func: func_idx as u32,
                },
            );
        }
        info!(
            module = %module.name,
            functions = module.functions.iter().filter(|f| !f.is_declaration()).count(),
            "registered module"
        );
        self.modules.push(module);
        Ok(module_idx)
    }

    /// Handle for the definition of `name`.
    pub fn find_function(&self, name: &str) -> EngineResult<FuncRef> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownFunction(name.to_string()))
    }

    pub fn function(&self, fref: FuncRef) -> &ir::Function {
        &self.modules[fref.module as usize].functions[fref.func as usize]
    }

    pub fn module_of(&self, fref: FuncRef) -> &ir::Module {
        &self.modules[fref.module as usize]
    }

    /// Names of every defined function, for host glue that wants to assign
    /// addresses to all of them.
    pub fn defined_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{FunctionBuilder, ModuleBuilder};
    use crate::ir::{FuncTy, Ty};

    fn identity_module(module_name: &str, func_name: &str) -> ir::Module {
        let mut f =
            FunctionBuilder::new(func_name, FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let x = f.arg(0);
        f.ret(Some(x));
        let mut mb = ModuleBuilder::new(module_name);
        mb.define(f.finish());
        mb.finish()
    }

    #[test]
    fn indexes_definitions_and_skips_declarations() {
        let mut registry = ModuleRegistry::new();
        let mut mb = ModuleBuilder::new("decls");
        mb.declare("external", FuncTy::new(Ty::int(64), vec![]));
        registry.register(mb.finish()).unwrap();
        assert!(registry.find_function("external").is_err());

        registry.register(identity_module("defs", "id")).unwrap();
        let fref = registry.find_function("id").unwrap();
        assert_eq!(registry.function(fref).name, "id");
        assert_eq!(registry.module_of(fref).name, "defs");
    }

    #[test]
    fn later_modules_extend_but_may_not_redefine() {
        let mut registry = ModuleRegistry::new();
        registry.register(identity_module("one", "f")).unwrap();
        registry.register(identity_module("two", "g")).unwrap();
        assert!(registry.find_function("f").is_ok());
        assert!(registry.find_function("g").is_ok());

        let err = registry.register(identity_module("three", "f")).unwrap_err();
        assert!(matches!(err, EngineError::FunctionClash(_)));
    }

    #[test]
    fn registration_verifies_bodies() {
        let f = FunctionBuilder::new("broken", FuncTy::new(Ty::int(64), vec![]));
        // No terminator was ever added.
        let mut mb = ModuleBuilder::new("bad");
        mb.define(f.finish());
        let mut registry = ModuleRegistry::new();
        assert!(matches!(
            registry.register(mb.finish()),
            Err(EngineError::VerifyFailed(_))
        ));
    }
}
