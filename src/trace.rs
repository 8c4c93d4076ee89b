//! Trace Emitter / Residual Code Builder
//!
//! Builds one residual function per top-level interpretation, with the same
//! signature as the function being interpreted. Every interpreted
//! instruction the trace keeps is cloned here with its operands remapped
//! through the innermost scoped value map; referenced globals and functions
//! are imported into the residual module on first use; and values the
//! interpreter treats as compile-time constants are pinned by speculative
//! guards that trap when a later invocation disagrees.
//!
//! Scope discipline: one map is pushed when the top-level interpretation
//! starts and one per inlined call; pops mirror pushes on every path,
//! including errors, so the stack is balanced whenever a trace finishes.
//!
//! Finishing appends the return terminator, verifies the residual function,
//! runs the single fixed optimization pass, verifies again, and hands the
//! finished module back for native compilation.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::ir::{
    self, opt, verify, Block, BlockId, Const, FuncTy, Function, Global, Inst, InstId, Op, Pred, Ty,
    ValueRef,
};

/// Symbol name of the abort primitive guard failures call.
pub const TRAP_SYMBOL: &str = "trace_trap";

/// Key identifying an original-IR value inside one inlining extent.
///
/// Keys within a scope always belong to the single function interpreted in
/// that extent, so the extent's map needs no function qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Arg(u32),
    Inst(InstId),
}

impl Slot {
    /// The slot a value reference names, if it names one.
    pub fn of(vr: &ValueRef) -> Option<Slot> {
        match vr {
            ValueRef::Arg(i) => Some(Slot::Arg(*i)),
            ValueRef::Inst(id) => Some(Slot::Inst(*id)),
            ValueRef::Const(_) => None,
        }
    }
}

/// Incremental builder for the residual function and its enclosing module.
pub struct TraceBuilder {
    module: ir::Module,
    func: Function,
    cur_block: BlockId,
    /// How many allocas sit at the head of the entry block.
    entry_allocas: usize,
    scopes: Vec<HashMap<Slot, ValueRef>>,
}

impl TraceBuilder {
    /// Start a residual function mirroring `orig`'s signature. The initial
    /// scope maps each original parameter to the residual parameter in the
    /// same position.
    pub fn new(orig: &Function, trace_name: String) -> TraceBuilder {
        let mut func = Function::declaration(trace_name.clone(), orig.sig.clone());
        func.blocks.push(Block::default());

        let mut scope = HashMap::new();
        for i in 0..orig.sig.params.len() as u32 {
            scope.insert(Slot::Arg(i), ValueRef::Arg(i));
        }

        TraceBuilder {
            module: ir::Module::new(trace_name),
            func,
            cur_block: BlockId(0),
            entry_allocas: 0,
            scopes: vec![scope],
        }
    }

    pub fn trace_name(&self) -> &str {
        &self.func.name
    }

    // =========================================================================
    // Scoped value maps
    // =========================================================================

    pub fn push_scope(&mut self) {
        debug!(depth = self.scopes.len() + 1, "push residual scope");
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) -> EngineResult<()> {
        debug!(depth = self.scopes.len(), "pop residual scope");
        if self.scopes.len() <= 1 {
            return Err(EngineError::ScopeImbalance);
        }
        self.scopes.pop();
        Ok(())
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    fn innermost(&mut self) -> &mut HashMap<Slot, ValueRef> {
        self.scopes.last_mut().expect("scope stack never empty")
    }

    /// Map an original value to a node of the residual function.
    pub fn map_residual(&mut self, from: Slot, to: ValueRef) {
        self.innermost().insert(from, to);
    }

    /// Map an original value to another *original* operand's remapping:
    /// integer literals map to themselves, anything else must already be
    /// present in the innermost map. Used by select and phi, which forward
    /// an existing value instead of materializing a new instruction.
    pub fn map_forward(&mut self, from: Slot, to: &ValueRef) -> EngineResult<()> {
        let resolved = self.remap(to)?;
        self.innermost().insert(from, resolved);
        Ok(())
    }

    /// Resolve an original operand to its residual form through the
    /// innermost scope. Residual nodes stored in the map are fully resolved
    /// at insertion, so a single lookup reaches the fixed point.
    pub fn remap(&self, vr: &ValueRef) -> EngineResult<ValueRef> {
        match vr {
            ValueRef::Const(c) => Ok(ValueRef::Const(self.remap_const(c)?)),
            other => {
                let slot = Slot::of(other).expect("non-const operand names a slot");
                self.scopes
                    .last()
                    .expect("scope stack never empty")
                    .get(&slot)
                    .cloned()
                    .ok_or_else(|| EngineError::UndefinedValue(format!("{}", other)))
            }
        }
    }

    fn remap_const(&self, c: &Const) -> EngineResult<Const> {
        match c {
            Const::Int { .. } | Const::NullPtr(_) => Ok(c.clone()),
            Const::Global(name) => {
                if self.module.global(name).is_none() {
                    return Err(EngineError::Consistency(format!(
                        "global '{}' referenced before import",
                        name
                    )));
                }
                Ok(c.clone())
            }
            Const::Func(name) => {
                if self.module.function(name).is_none() {
                    return Err(EngineError::Consistency(format!(
                        "function '{}' referenced before import",
                        name
                    )));
                }
                Ok(c.clone())
            }
            Const::Gep {
                pointee,
                base,
                indices,
            } => Ok(Const::Gep {
                pointee: pointee.clone(),
                base: Box::new(self.remap_const(base)?),
                indices: indices.clone(),
            }),
        }
    }

    // =========================================================================
    // Direct emission
    // =========================================================================

    fn append(&mut self, op: Op, ty: Ty) -> ValueRef {
        let id = InstId(self.func.insts.len() as u32);
        self.func.insts.push(Inst { op, ty });
        self.func.blocks[self.cur_block.0 as usize].insts.push(id);
        ValueRef::Inst(id)
    }

    /// Stack allocation, placed with the other allocas at the head of the
    /// residual entry block regardless of the current block.
    pub fn alloca(&mut self, ty: Ty) -> ValueRef {
        let id = InstId(self.func.insts.len() as u32);
        let ptr_ty = Ty::ptr(ty.clone());
        self.func.insts.push(Inst {
            op: Op::Alloca { ty },
            ty: ptr_ty,
        });
        self.func.blocks[0].insts.insert(self.entry_allocas, id);
        self.entry_allocas += 1;
        ValueRef::Inst(id)
    }

    pub fn bitcast(&mut self, value: ValueRef, to: Ty) -> ValueRef {
        self.append(
            Op::Cast {
                kind: ir::CastKind::Bitcast,
                value,
            },
            to,
        )
    }

    /// Address computation with literal i32 indices, emitted directly into
    /// the residual function (used by the variadic spill emulation).
    pub fn gep(&mut self, pointee: Ty, base: ValueRef, indices: &[i64]) -> ValueRef {
        let tail: Vec<Option<i64>> = indices[1..].iter().map(|&i| Some(i)).collect();
        let result = ir::gep_result_ty(&pointee, &tail)
            .expect("residual gep walks a non-aggregate type");
        let indices: SmallVec<[ValueRef; 4]> = indices
            .iter()
            .map(|&i| ValueRef::const_int(32, i))
            .collect();
        self.append(
            Op::Gep {
                pointee,
                base,
                indices,
            },
            Ty::ptr(result),
        )
    }

    pub fn store(&mut self, value: ValueRef, ptr: ValueRef) {
        self.append(Op::Store { value, ptr }, Ty::Void);
    }

    // =========================================================================
    // Instruction cloning
    // =========================================================================

    /// Clone an interpreted instruction into the residual function, remapping
    /// every operand, and map the original instruction to its clone.
    pub fn add_inst(&mut self, orig: &Function, id: InstId) -> EngineResult<ValueRef> {
        let inst = orig.inst(id);
        let op = match &inst.op {
            Op::Cmp { pred, lhs, rhs } => Op::Cmp {
                pred: *pred,
                lhs: self.remap(lhs)?,
                rhs: self.remap(rhs)?,
            },
            Op::Bin { op, lhs, rhs } => Op::Bin {
                op: *op,
                lhs: self.remap(lhs)?,
                rhs: self.remap(rhs)?,
            },
            Op::Gep {
                pointee,
                base,
                indices,
            } => {
                let mut remapped: SmallVec<[ValueRef; 4]> = SmallVec::new();
                for idx in indices {
                    remapped.push(self.remap(idx)?);
                }
                Op::Gep {
                    pointee: pointee.clone(),
                    base: self.remap(base)?,
                    indices: remapped,
                }
            }
            Op::Load { ptr } => Op::Load {
                ptr: self.remap(ptr)?,
            },
            Op::Store { value, ptr } => Op::Store {
                value: self.remap(value)?,
                ptr: self.remap(ptr)?,
            },
            Op::Cast { kind, value } => Op::Cast {
                kind: *kind,
                value: self.remap(value)?,
            },
            Op::Call { callee, args } => {
                let mut remapped: SmallVec<[ValueRef; 4]> = SmallVec::new();
                for arg in args {
                    remapped.push(self.remap(arg)?);
                }
                Op::Call {
                    callee: self.remap(callee)?,
                    args: remapped,
                }
            }
            other => {
                return Err(EngineError::Consistency(format!(
                    "instruction kind is never cloned into a trace: {:?}",
                    other
                )))
            }
        };

        let cloned = self.append(op, inst.ty.clone());
        if let ValueRef::Inst(cloned_id) = &cloned {
            trace!(emitted = %self.func.render_inst(*cloned_id), "emitted residual instruction");
        }
        self.map_residual(Slot::Inst(id), cloned.clone());
        Ok(cloned)
    }

    // =========================================================================
    // Imports
    // =========================================================================

    /// Declare a global in the residual module on first reference, copying
    /// its attributes. Local globals carry their initializer so they behave
    /// like ordinary memory; others stay declarations and resolve by name.
    pub fn add_global(&mut self, global: &Global) {
        if self.module.global(&global.name).is_some() {
            return;
        }
        debug!(name = %global.name, "imported global into residual module");
        self.module.add_global(Global {
            name: global.name.clone(),
            ty: global.ty.clone(),
            init: if global.local {
                global.init.clone()
            } else {
                None
            },
            is_const: global.is_const,
            local: global.local,
        });
    }

    /// Declare a function import in the residual module on first reference.
    pub fn add_function(&mut self, name: &str, sig: &FuncTy) {
        if self.module.function(name).is_some() {
            return;
        }
        debug!(name, "imported function into residual module");
        self.module
            .add_function(Function::declaration(name, sig.clone()));
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Pin a residual value to the concrete constant observed while
    /// interpreting. Literal integers need no pin; everything else gets a
    /// runtime equality check that branches to a fresh continuation on
    /// success and to a trap block on mismatch. All later instructions are
    /// emitted into the continuation, so a compiled trace either agrees with
    /// every pinned constant or aborts before computing anything with it.
    pub fn ensure_constant(&mut self, value: &ValueRef, constant: i64) {
        if matches!(value, ValueRef::Const(Const::Int { .. })) {
            return;
        }

        let bits = self.residual_ty(value).bit_size().max(1) as u32;
        let check = ValueRef::const_int(bits.min(64), constant);
        let cond = self.append(
            Op::Cmp {
                pred: Pred::Eq,
                lhs: value.clone(),
                rhs: check,
            },
            Ty::int(1),
        );
        trace!(constant, "emitted guard");

        let success = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::default());
        let fail = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::default());

        self.append(
            Op::CondBr {
                cond,
                on_true: success,
                on_false: fail,
            },
            Ty::Void,
        );

        self.add_function(TRAP_SYMBOL, &FuncTy::new(Ty::Void, vec![]));
        self.cur_block = fail;
        self.append(
            Op::Call {
                callee: ValueRef::Const(Const::Func(TRAP_SYMBOL.to_string())),
                args: SmallVec::new(),
            },
            Ty::Void,
        );
        self.append(Op::Unreachable, Ty::Void);

        self.cur_block = success;
    }

    /// Type of a residual value in the residual function's context.
    pub fn residual_ty(&self, vr: &ValueRef) -> Ty {
        self.func
            .value_ty(&self.module, vr)
            .unwrap_or(Ty::int(64))
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Append the return terminator, check scope balance, verify, run the
    /// fixed optimization pass, verify again, and yield the finished module
    /// (residual function included) for native compilation.
    pub fn finish(mut self, retval: Option<ValueRef>) -> EngineResult<ir::Module> {
        self.append(Op::Ret { value: retval }, Ty::Void);

        self.scopes.pop();
        if !self.scopes.is_empty() {
            return Err(EngineError::ScopeImbalance);
        }

        let mut func = self.func;
        verify::verify(&func)?;
        opt::optimize(&mut func);
        verify::verify(&func)?;
        debug!(trace = %func.name, blocks = func.blocks.len(), "finished residual function");

        let mut module = self.module;
        module.add_function(func);
        Ok(module)
    }
}
