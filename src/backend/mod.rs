//! Native Backend
//!
//! Translates a finished residual module to executable code with Cranelift.
//! The backend is the engine's opaque "compile this function, return an
//! executable address" service: it declares every imported function and
//! global of the residual module (resolving their addresses through the
//! symbol resolver), translates the residual function's blocks into
//! Cranelift IR, and finalizes the JIT module.
//!
//! Residual functions are forward-only: a linear chain of guard diamonds
//! with no loops, phis, selects, or switches, ending in a single return.
//! The translation exploits that shape — blocks are emitted and sealed in
//! order, and every value definition dominates its uses.
//!
//! Compiled code is permanent: the returned [`CompiledTrace`] keeps its
//! `JITModule` alive for the lifetime of the session that requested it.

use std::collections::HashMap;

use cranelift::codegen;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{
    default_libcall_names, DataDescription, DataId, FuncId, Linkage, Module,
};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::ir::{self, BinOp, CastKind, Const, Op, Pred, Ty, ValueRef};
use crate::symbols::SymbolResolver;
use crate::trace::TRAP_SYMBOL;

/// The abort primitive guard-failure blocks call. Reports the speculation
/// failure and terminates the process; a trace never survives a divergent
/// guard.
pub extern "C" fn trace_trap() {
    tracing::error!("speculated constant diverged at trace run time");
    eprintln!("tracelet: speculation guard failed; aborting");
    std::process::abort();
}

/// A finished piece of native code. Holding it keeps the executable memory
/// mapped; traces are never invalidated or freed.
pub struct CompiledTrace {
    addr: usize,
    #[allow(dead_code)]
    module: JITModule,
}

impl CompiledTrace {
    pub fn addr(&self) -> usize {
        self.addr
    }
}

/// Compile `func_name` out of the residual module, resolving imports through
/// `resolver`, and return the executable address.
pub fn compile(
    module: &ir::Module,
    func_name: &str,
    resolver: &SymbolResolver,
) -> EngineResult<CompiledTrace> {
    let compile_err = EngineError::Compile;

    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| compile_err(format!("failed to set opt_level: {}", e)))?;

    let isa_builder = cranelift_native::builder()
        .map_err(|e| compile_err(format!("failed to create ISA builder: {}", e)))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| compile_err(format!("failed to create ISA: {}", e)))?;

    let mut builder = JITBuilder::with_isa(isa, default_libcall_names());

    // Resolve every import to a host address up front. The trap primitive is
    // the engine's own; everything else goes through the resolver.
    for func in &module.functions {
        if !func.is_declaration() {
            continue;
        }
        let addr = if func.name == TRAP_SYMBOL {
            trace_trap as *const u8
        } else {
            resolver.address_of(&func.name)? as *const u8
        };
        builder.symbol(&func.name, addr);
    }
    for global in &module.globals {
        if global.init.is_none() {
            builder.symbol(&global.name, resolver.address_of(&global.name)? as *const u8);
        }
    }

    let mut jit = JITModule::new(builder);

    // Data objects: defined globals carry their bytes, imports link by name.
    let mut data_ids: HashMap<String, DataId> = HashMap::new();
    for global in &module.globals {
        let id = match &global.init {
            Some(bytes) => {
                let id = jit
                    .declare_data(&global.name, Linkage::Local, !global.is_const, false)
                    .map_err(|e| compile_err(format!("declare data '{}': {}", global.name, e)))?;
                let mut desc = DataDescription::new();
                desc.define(bytes.clone().into_boxed_slice());
                desc.set_align(global.ty.align());
                jit.define_data(id, &desc)
                    .map_err(|e| compile_err(format!("define data '{}': {}", global.name, e)))?;
                id
            }
            None => jit
                .declare_data(&global.name, Linkage::Import, true, false)
                .map_err(|e| compile_err(format!("declare data '{}': {}", global.name, e)))?,
        };
        data_ids.insert(global.name.clone(), id);
    }

    // Function declarations, the residual function included.
    let mut func_ids: HashMap<String, FuncId> = HashMap::new();
    for func in &module.functions {
        let sig = clif_signature(&jit, &func.sig)?;
        let linkage = if func.is_declaration() {
            Linkage::Import
        } else {
            Linkage::Local
        };
        let id = jit
            .declare_function(&func.name, linkage, &sig)
            .map_err(|e| compile_err(format!("declare function '{}': {}", func.name, e)))?;
        func_ids.insert(func.name.clone(), id);
    }

    let func = module
        .function(func_name)
        .ok_or_else(|| EngineError::UnknownFunction(func_name.to_string()))?;

    let mut ctx = jit.make_context();
    ctx.func.signature = clif_signature(&jit, &func.sig)?;
    build_function(&mut ctx, &mut jit, module, func, &func_ids, &data_ids)?;

    let func_id = func_ids[func_name];
    jit.define_function(func_id, &mut ctx)
        .map_err(|e| compile_err(format!("define function '{}': {}", func_name, e)))?;
    jit.finalize_definitions()
        .map_err(|e| compile_err(format!("finalize definitions: {}", e)))?;

    let code = jit.get_finalized_function(func_id);
    info!(trace = func_name, addr = format_args!("{:#x}", code as usize), "compiled trace");
    Ok(CompiledTrace {
        addr: code as usize,
        module: jit,
    })
}

fn clif_ty(ty: &Ty) -> EngineResult<Type> {
    match ty {
        Ty::Int(1) | Ty::Int(8) => Ok(types::I8),
        Ty::Int(32) => Ok(types::I32),
        Ty::Int(64) => Ok(types::I64),
        Ty::Ptr(_) | Ty::Func(_) => Ok(types::I64),
        other => Err(EngineError::Compile(format!(
            "type {} has no native scalar form",
            other
        ))),
    }
}

fn clif_signature(jit: &JITModule, sig: &ir::FuncTy) -> EngineResult<Signature> {
    let mut out = jit.make_signature();
    for param in &sig.params {
        out.params.push(AbiParam::new(clif_ty(param)?));
    }
    if !sig.ret.is_void() {
        out.returns.push(AbiParam::new(clif_ty(&sig.ret)?));
    }
    Ok(out)
}

/// Blocks reachable from the entry. The optimization pass can orphan guard
/// diamonds whose branches folded; those are skipped, not translated.
fn reachable_blocks(func: &ir::Function) -> Vec<bool> {
    let mut seen = vec![false; func.blocks.len()];
    let mut worklist = vec![0usize];
    seen[0] = true;
    while let Some(bi) = worklist.pop() {
        let terminator = *func.blocks[bi]
            .insts
            .last()
            .expect("verified blocks are non-empty");
        let visit = |b: ir::BlockId, seen: &mut Vec<bool>, worklist: &mut Vec<usize>| {
            if !seen[b.0 as usize] {
                seen[b.0 as usize] = true;
                worklist.push(b.0 as usize);
            }
        };
        match &func.inst(terminator).op {
            Op::Br { target } => visit(*target, &mut seen, &mut worklist),
            Op::CondBr {
                on_true, on_false, ..
            } => {
                visit(*on_true, &mut seen, &mut worklist);
                visit(*on_false, &mut seen, &mut worklist);
            }
            Op::Switch { cases, default, .. } => {
                for (_, b) in cases {
                    visit(*b, &mut seen, &mut worklist);
                }
                visit(*default, &mut seen, &mut worklist);
            }
            _ => {}
        }
    }
    seen
}

fn build_function(
    ctx: &mut codegen::Context,
    jit: &mut JITModule,
    module: &ir::Module,
    func: &ir::Function,
    func_ids: &HashMap<String, FuncId>,
    data_ids: &HashMap<String, DataId>,
) -> EngineResult<()> {
    let mut fctx = FunctionBuilderContext::new();
    let builder = FunctionBuilder::new(&mut ctx.func, &mut fctx);

    let reachable = reachable_blocks(func);
    let mut translator = Translator {
        builder,
        jit,
        module,
        func,
        func_ids,
        data_ids,
        values: HashMap::new(),
        args: Vec::new(),
        blocks: Vec::new(),
    };

    for (bi, _) in func.blocks.iter().enumerate() {
        let block = if reachable[bi] {
            Some(translator.builder.create_block())
        } else {
            None
        };
        translator.blocks.push(block);
    }
    let entry = translator.blocks[0].expect("entry is always reachable");
    translator
        .builder
        .append_block_params_for_function_params(entry);

    for (bi, block) in func.blocks.iter().enumerate() {
        let Some(clif_block) = translator.blocks[bi] else {
            continue;
        };
        translator.builder.switch_to_block(clif_block);
        // Residual control flow is forward-only, so every predecessor has
        // already been emitted by the time its successor starts.
        translator.builder.seal_block(clif_block);
        if bi == 0 {
            translator.args = translator.builder.block_params(entry).to_vec();
        }
        for &iid in &block.insts {
            translator.translate(iid)?;
        }
    }

    translator.builder.finalize();
    debug!(trace = %func.name, "translated residual function");
    Ok(())
}

struct Translator<'a, 'm> {
    builder: FunctionBuilder<'a>,
    jit: &'m mut JITModule,
    module: &'m ir::Module,
    func: &'m ir::Function,
    func_ids: &'m HashMap<String, FuncId>,
    data_ids: &'m HashMap<String, DataId>,
    values: HashMap<u32, Value>,
    args: Vec<Value>,
    blocks: Vec<Option<Block>>,
}

impl Translator<'_, '_> {
    fn block(&self, b: ir::BlockId) -> EngineResult<Block> {
        self.blocks[b.0 as usize]
            .ok_or_else(|| EngineError::Compile("branch into untranslated block".to_string()))
    }

    fn use_val(&mut self, vr: &ValueRef) -> EngineResult<Value> {
        match vr {
            ValueRef::Inst(id) => self.values.get(&id.0).copied().ok_or_else(|| {
                EngineError::Compile(format!("v{} used before translation", id.0))
            }),
            ValueRef::Arg(i) => self
                .args
                .get(*i as usize)
                .copied()
                .ok_or_else(|| EngineError::Compile(format!("missing parameter arg{}", i))),
            ValueRef::Const(c) => self.const_val(c),
        }
    }

    fn const_val(&mut self, c: &Const) -> EngineResult<Value> {
        match c {
            Const::Int { bits, value } => {
                let ty = clif_ty(&Ty::Int(*bits))?;
                let imm = match ty {
                    types::I8 => i64::from(*value as i8),
                    types::I32 => i64::from(*value as i32),
                    _ => *value,
                };
                Ok(self.builder.ins().iconst(ty, imm))
            }
            Const::NullPtr(_) => Ok(self.builder.ins().iconst(types::I64, 0)),
            Const::Global(name) => {
                let data_id = *self.data_ids.get(name).ok_or_else(|| {
                    EngineError::Compile(format!("global '{}' not declared", name))
                })?;
                let gv = self.jit.declare_data_in_func(data_id, self.builder.func);
                Ok(self.builder.ins().global_value(types::I64, gv))
            }
            Const::Func(name) => {
                let func_id = *self.func_ids.get(name).ok_or_else(|| {
                    EngineError::Compile(format!("function '{}' not declared", name))
                })?;
                let fref = self.jit.declare_func_in_func(func_id, self.builder.func);
                Ok(self.builder.ins().func_addr(types::I64, fref))
            }
            Const::Gep {
                pointee,
                base,
                indices,
            } => {
                let base_val = self.const_val(base)?;
                let offset = const_gep_offset(pointee, indices)?;
                Ok(if offset != 0 {
                    self.builder.ins().iadd_imm(base_val, offset)
                } else {
                    base_val
                })
            }
        }
    }

    /// Widen a value to a 64-bit address word.
    fn widen_index(&mut self, v: Value) -> Value {
        if self.builder.func.dfg.value_type(v) == types::I64 {
            v
        } else {
            self.builder.ins().sextend(types::I64, v)
        }
    }

    fn translate(&mut self, iid: ir::InstId) -> EngineResult<()> {
        let inst = self.func.inst(iid);
        match &inst.op {
            Op::Cmp { pred, lhs, rhs } => {
                let cc = match pred {
                    Pred::Eq => IntCC::Equal,
                    Pred::Ne => IntCC::NotEqual,
                    Pred::Ult => IntCC::UnsignedLessThan,
                    Pred::Slt => IntCC::SignedLessThan,
                    Pred::Ugt => IntCC::UnsignedGreaterThan,
                    Pred::Sgt => IntCC::SignedGreaterThan,
                };
                let l = self.use_val(lhs)?;
                let r = self.use_val(rhs)?;
                let result = self.builder.ins().icmp(cc, l, r);
                self.values.insert(iid.0, result);
            }

            Op::Bin { op, lhs, rhs } => {
                let l = self.use_val(lhs)?;
                let r = self.use_val(rhs)?;
                let result = match op {
                    BinOp::Add => self.builder.ins().iadd(l, r),
                    BinOp::Sub => self.builder.ins().isub(l, r),
                    BinOp::Mul => self.builder.ins().imul(l, r),
                    BinOp::And => self.builder.ins().band(l, r),
                    BinOp::Or => self.builder.ins().bor(l, r),
                    BinOp::Shl => self.builder.ins().ishl(l, r),
                    BinOp::Lshr => self.builder.ins().ushr(l, r),
                };
                self.values.insert(iid.0, result);
            }

            Op::Cast { kind, value } => {
                let v = self.use_val(value)?;
                let from = self.builder.func.dfg.value_type(v);
                let to = clif_ty(&inst.ty)?;
                let result = match kind {
                    CastKind::Bitcast => {
                        if from != to {
                            return Err(EngineError::Compile(format!(
                                "width-changing bitcast {} to {}",
                                from, to
                            )));
                        }
                        v
                    }
                    CastKind::ZExt => {
                        if from == to {
                            v
                        } else {
                            self.builder.ins().uextend(to, v)
                        }
                    }
                    CastKind::SExt => {
                        if from == to {
                            v
                        } else {
                            self.builder.ins().sextend(to, v)
                        }
                    }
                    CastKind::Trunc => {
                        if from == to {
                            v
                        } else {
                            self.builder.ins().ireduce(to, v)
                        }
                    }
                };
                self.values.insert(iid.0, result);
            }

            Op::Gep {
                pointee,
                base,
                indices,
            } => {
                let mut addr = self.use_val(base)?;
                let mut static_off: i64 = 0;

                let elem_size = pointee.alloc_size() as i64;
                match indices[0].as_const_int() {
                    Some(idx) => static_off += idx.wrapping_mul(elem_size),
                    None => {
                        let idx = self.use_val(&indices[0])?;
                        let idx = self.widen_index(idx);
                        let scaled = self.builder.ins().imul_imm(idx, elem_size);
                        addr = self.builder.ins().iadd(addr, scaled);
                    }
                }

                let mut ty = pointee;
                for index in &indices[1..] {
                    match ty {
                        Ty::Struct(fields) => {
                            let field = index.as_const_int().ok_or_else(|| {
                                EngineError::Compile("dynamic struct field index".to_string())
                            })? as usize;
                            static_off += ir::struct_layout(fields).offsets[field] as i64;
                            ty = &fields[field];
                        }
                        Ty::Array(elem, _) => {
                            let elem_size = elem.alloc_size() as i64;
                            match index.as_const_int() {
                                Some(idx) => static_off += idx.wrapping_mul(elem_size),
                                None => {
                                    let idx = self.use_val(index)?;
                                    let idx = self.widen_index(idx);
                                    let scaled = self.builder.ins().imul_imm(idx, elem_size);
                                    addr = self.builder.ins().iadd(addr, scaled);
                                }
                            }
                            ty = elem;
                        }
                        other => {
                            return Err(EngineError::Compile(format!(
                                "address computation walks into {}",
                                other
                            )))
                        }
                    }
                }

                let result = if static_off != 0 {
                    self.builder.ins().iadd_imm(addr, static_off)
                } else {
                    addr
                };
                self.values.insert(iid.0, result);
            }

            Op::Load { ptr } => {
                let addr = self.use_val(ptr)?;
                let ty = clif_ty(&inst.ty)?;
                let result = self.builder.ins().load(ty, MemFlags::new(), addr, 0);
                self.values.insert(iid.0, result);
            }

            Op::Store { value, ptr } => {
                let v = self.use_val(value)?;
                let addr = self.use_val(ptr)?;
                self.builder.ins().store(MemFlags::new(), v, addr, 0);
            }

            Op::Alloca { ty } => {
                let size = ty.alloc_size().max(1) as u32;
                let align_shift = ty.align().trailing_zeros() as u8;
                let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    size,
                    align_shift,
                ));
                let result = self.builder.ins().stack_addr(types::I64, slot, 0);
                self.values.insert(iid.0, result);
            }

            Op::Call { callee, args } => {
                let mut arg_vals = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vals.push(self.use_val(arg)?);
                }

                let call = match callee {
                    ValueRef::Const(Const::Func(name)) => {
                        let decl = self.module.function(name).ok_or_else(|| {
                            EngineError::Compile(format!("call to undeclared '{}'", name))
                        })?;
                        let func_id = self.func_ids[name.as_str()];
                        if decl.sig.variadic {
                            // No native variadic signatures: call through the
                            // address with the call site's own signature.
                            let mut sig = self.jit.make_signature();
                            for v in &arg_vals {
                                sig.params
                                    .push(AbiParam::new(self.builder.func.dfg.value_type(*v)));
                            }
                            if !decl.sig.ret.is_void() {
                                sig.returns.push(AbiParam::new(clif_ty(&decl.sig.ret)?));
                            }
                            let sig_ref = self.builder.import_signature(sig);
                            let fref = self.jit.declare_func_in_func(func_id, self.builder.func);
                            let callee_addr = self.builder.ins().func_addr(types::I64, fref);
                            self.builder
                                .ins()
                                .call_indirect(sig_ref, callee_addr, &arg_vals)
                        } else {
                            let fref = self.jit.declare_func_in_func(func_id, self.builder.func);
                            self.builder.ins().call(fref, &arg_vals)
                        }
                    }
                    other => {
                        let callee_val = self.use_val(other)?;
                        let mut sig = self.jit.make_signature();
                        for v in &arg_vals {
                            sig.params
                                .push(AbiParam::new(self.builder.func.dfg.value_type(*v)));
                        }
                        if !inst.ty.is_void() {
                            sig.returns.push(AbiParam::new(clif_ty(&inst.ty)?));
                        }
                        let sig_ref = self.builder.import_signature(sig);
                        self.builder
                            .ins()
                            .call_indirect(sig_ref, callee_val, &arg_vals)
                    }
                };

                if !inst.ty.is_void() {
                    let result = self.builder.inst_results(call)[0];
                    self.values.insert(iid.0, result);
                }
            }

            Op::Ret { value } => match value {
                Some(v) => {
                    let v = self.use_val(v)?;
                    self.builder.ins().return_(&[v]);
                }
                None => {
                    self.builder.ins().return_(&[]);
                }
            },

            Op::Br { target } => {
                let block = self.block(*target)?;
                self.builder.ins().jump(block, &[]);
            }

            Op::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.use_val(cond)?;
                let t = self.block(*on_true)?;
                let f = self.block(*on_false)?;
                self.builder.ins().brif(c, t, &[], f, &[]);
            }

            Op::Unreachable => {
                self.builder.ins().trap(TrapCode::unwrap_user(1));
            }

            Op::Select { .. } | Op::Switch { .. } | Op::Phi { .. } => {
                return Err(EngineError::Compile(format!(
                    "instruction kind never reaches the backend: {}",
                    self.func.render_inst(iid)
                )))
            }
        }
        Ok(())
    }
}

/// Static byte offset of a constant GEP expression.
fn const_gep_offset(pointee: &Ty, indices: &[Const]) -> EngineResult<i64> {
    let as_int = |c: &Const| -> EngineResult<i64> {
        match c {
            Const::Int { bits, value } => Ok(ir::sign_extend(*value, *bits)),
            other => Err(EngineError::Compile(format!(
                "non-literal constant gep index: {}",
                other
            ))),
        }
    };

    let mut offset = as_int(&indices[0])?.wrapping_mul(pointee.alloc_size() as i64);
    let mut ty = pointee;
    for index in &indices[1..] {
        let idx = as_int(index)?;
        match ty {
            Ty::Struct(fields) => {
                offset += ir::struct_layout(fields).offsets[idx as usize] as i64;
                ty = &fields[idx as usize];
            }
            Ty::Array(elem, _) => {
                offset += idx.wrapping_mul(elem.alloc_size() as i64);
                ty = elem;
            }
            other => {
                return Err(EngineError::Compile(format!(
                    "constant address computation walks into {}",
                    other
                )))
            }
        }
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{FunctionBuilder as IrFunctionBuilder, ModuleBuilder};
    use crate::ir::FuncTy;

    #[test]
    fn compiles_and_runs_straight_line_code() {
        let mut f = IrFunctionBuilder::new(
            "mix",
            FuncTy::new(Ty::int(64), vec![Ty::int(64), Ty::int(64)]),
        );
        let (a, b) = (f.arg(0), f.arg(1));
        let sum = f.add(Ty::int(64), a, b.clone());
        let prod = f.mul(Ty::int(64), sum, b);
        f.ret(Some(prod));
        let mut mb = ModuleBuilder::new("unit");
        mb.define(f.finish());
        let module = mb.finish();

        let resolver = SymbolResolver::new();
        let compiled = compile(&module, "mix", &resolver).unwrap();
        let mix: extern "C" fn(i64, i64) -> i64 =
            unsafe { std::mem::transmute(compiled.addr()) };
        assert_eq!(mix(3, 5), 40);
        assert_eq!(mix(-2, 10), 80);
    }

    #[test]
    fn compiles_guard_shapes() {
        // A guard diamond: cmp, brif to the continuation or the trap block.
        let mut f =
            IrFunctionBuilder::new("guarded", FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let success = f.create_block();
        let fail = f.create_block();
        let x = f.arg(0);
        let c = f.cmp(Pred::Eq, x.clone(), f.iconst(64, 7));
        f.cond_br(c, success, fail);
        f.switch_to_block(success);
        let doubled = f.add(Ty::int(64), x.clone(), x);
        f.ret(Some(doubled));
        f.switch_to_block(fail);
        f.unreachable();
        let mut mb = ModuleBuilder::new("unit");
        mb.define(f.finish());
        let module = mb.finish();

        let resolver = SymbolResolver::new();
        let compiled = compile(&module, "guarded", &resolver).unwrap();
        let guarded: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(compiled.addr()) };
        assert_eq!(guarded(7), 14);
    }

    #[test]
    fn defined_data_is_addressable() {
        let mut mb = ModuleBuilder::new("unit");
        mb.global(
            "text",
            Ty::array(Ty::int(8), 5),
            Some(b"abcde".to_vec()),
            true,
            true,
        );
        let mut f = IrFunctionBuilder::new("third", FuncTy::new(Ty::int(64), vec![]));
        let base = ValueRef::Const(Const::Global("text".to_string()));
        let zero = f.iconst(32, 0);
        let two = f.iconst(32, 2);
        let p = f.gep(Ty::array(Ty::int(8), 5), base, &[zero, two]);
        let c = f.load(Ty::int(8), p);
        let wide = f.sext(Ty::int(64), c);
        f.ret(Some(wide));
        mb.define(f.finish());
        let module = mb.finish();

        let resolver = SymbolResolver::new();
        let compiled = compile(&module, "third", &resolver).unwrap();
        let third: extern "C" fn() -> i64 = unsafe { std::mem::transmute(compiled.addr()) };
        assert_eq!(third(), i64::from(b'c'));
    }
}
