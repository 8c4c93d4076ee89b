//! Interpreter Engine
//!
//! A single-threaded recursive-descent walk over IR basic blocks. Every
//! interpretation step computes the concrete result of one instruction and
//! mirrors it into the residual function being built by the
//! [`TraceBuilder`]: cloned instructions for real computation, forwarded
//! mappings for selects and phis, guards wherever a value is treated as
//! compile-time known.
//!
//! Call sites are dispatched through the session's trace strategy: callees
//! on the never-trace address list or the opaque-name list are invoked
//! natively (with a structurally identical call cloned into the trace);
//! everything else with a registered body is inlined — a fresh residual
//! scope, parameters bound, the callee's blocks walked to completion, the
//! scope popped.
//!
//! Simulated memory (allocas, spill areas, byte-array global copies) is
//! owned by the top-level interpretation and freed only when it ends.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::ir::{
    self, eval_bin, eval_cast, sign_extend, struct_layout, BlockId, CastKind, Const, Function,
    InstId, Op, Pred, Ty, ValueRef,
};
use crate::registry::FuncRef;
use crate::session::Session;
use crate::trace::{Slot, TraceBuilder};
use crate::value::{Allocation, IntrinsicKind, RealValue, RuntimeValue, Value};

/// Callee names the interpreter recognizes as markers and skips entirely.
const MARKER_INTRINSICS: [&str; 4] = [
    "dbg.value",
    "dbg.declare",
    "lifetime.begin",
    "lifetime.end",
];

/// Callee name of the begin-varargs intrinsic.
pub const VA_BEGIN: &str = "va.begin";
/// Callee name of the end-varargs intrinsic.
pub const VA_END: &str = "va.end";

/// Per-extent interpretation state: one frame per function being walked,
/// nested strictly (an inlined callee runs to completion before its caller
/// continues).
struct Frame {
    fref: FuncRef,
    symtab: HashMap<Slot, Value>,
    vaargs: Vec<Value>,
    prev_block: Option<BlockId>,
}

impl Frame {
    fn new(fref: FuncRef) -> Frame {
        Frame {
            fref,
            symtab: HashMap::new(),
            vaargs: Vec::new(),
            prev_block: None,
        }
    }
}

/// What interpreting a basic block decided.
enum BlockOutcome {
    Branch(BlockId),
    Return(Value),
}

/// One top-level interpretation: walks the target function (and everything
/// it inlines) while recording the residual trace.
pub struct Interpreter<'s> {
    session: &'s Session,
    trace: TraceBuilder,
    allocations: Vec<Allocation>,
    depth: usize,
}

/// Interpret `fref` with the given concrete arguments, producing the
/// concrete result and the finished residual module ready for compilation.
pub(crate) fn interpret_and_trace(
    session: &Session,
    fref: FuncRef,
    args: &[i64],
) -> EngineResult<(i64, ir::Module, String)> {
    let func = session.registry().function(fref);

    for param in &func.sig.params {
        if !param.is_integer() && !param.is_pointer() {
            return Err(EngineError::Consistency(format!(
                "target parameter type {} is not an integer or pointer",
                param
            )));
        }
    }
    if args.len() != func.sig.params.len() {
        return Err(EngineError::ArgCountMismatch {
            name: func.name.clone(),
            expected: func.sig.params.len(),
            got: args.len(),
        });
    }

    let trace_name = session.next_trace_name();
    let mut interp = Interpreter {
        session,
        trace: TraceBuilder::new(func, trace_name.clone()),
        allocations: Vec::new(),
        depth: 0,
    };

    let arg_values: Vec<Value> = args
        .iter()
        .enumerate()
        .map(|(i, &a)| Value::real(a, ValueRef::Arg(i as u32)))
        .collect();

    let result = interp.run_function(fref, arg_values)?;
    let real = result.materialize()?;
    let scalar = real.runtime.scalar()?;

    let module = interp.trace.finish(real.residual)?;
    Ok((scalar, module, trace_name))
}

impl<'s> Interpreter<'s> {
    // =========================================================================
    // Function and block walking
    // =========================================================================

    /// Walk one function extent to completion. Recursion happens here when
    /// calls are inlined.
    fn run_function(&mut self, fref: FuncRef, args: Vec<Value>) -> EngineResult<Value> {
        let session = self.session;
        let func = session.registry().function(fref);
        if func.is_declaration() {
            return Err(EngineError::Consistency(format!(
                "'{}' has no body to interpret",
                func.name
            )));
        }

        let mut frame = Frame::new(fref);
        let num_params = func.sig.params.len();
        if func.sig.variadic {
            if args.len() < num_params {
                return Err(EngineError::ArgCountMismatch {
                    name: func.name.clone(),
                    expected: num_params,
                    got: args.len(),
                });
            }
            frame.vaargs = args[num_params..].to_vec();
        } else if args.len() != num_params {
            return Err(EngineError::ArgCountMismatch {
                name: func.name.clone(),
                expected: num_params,
                got: args.len(),
            });
        }
        for (i, arg) in args.into_iter().take(num_params).enumerate() {
            frame.symtab.insert(Slot::Arg(i as u32), arg);
        }

        let mut block = func.entry();
        loop {
            match self.run_block(&mut frame, func, block)? {
                BlockOutcome::Branch(next) => {
                    frame.prev_block = Some(block);
                    block = next;
                }
                BlockOutcome::Return(value) => return Ok(value),
            }
        }
    }

    /// Interpret the instructions of one block up to its terminator.
    fn run_block(
        &mut self,
        frame: &mut Frame,
        func: &'s Function,
        block: BlockId,
    ) -> EngineResult<BlockOutcome> {
        for &iid in &func.block(block).insts {
            trace!(inst = %func.render_inst(iid), "interpreting");
            let inst = func.inst(iid);
            match &inst.op {
                Op::Cmp { pred, lhs, rhs } => {
                    let module = self.session.registry().module_of(frame.fref);
                    let lbits = func.value_ty(module, lhs)?.bit_size();
                    let rbits = func.value_ty(module, rhs)?.bit_size();
                    if lbits != rbits {
                        return Err(EngineError::Consistency(format!(
                            "compare operand widths differ: {}",
                            func.render_inst(iid)
                        )));
                    }
                    let lhs_val = self.get_int(frame, func, lhs)?;
                    let rhs_val = self.get_int(frame, func, rhs)?;
                    let result = eval_cmp(*pred, lbits, lhs_val, rhs_val)?;
                    let residual = self.trace.add_inst(func, iid)?;
                    frame
                        .symtab
                        .insert(Slot::Inst(iid), Value::real(i64::from(result), residual));
                }

                Op::Bin { op, lhs, rhs } => {
                    let module = self.session.registry().module_of(frame.fref);
                    let lbits = func.value_ty(module, lhs)?.bit_size();
                    let lhs_val = self.get_int(frame, func, lhs)?;
                    let rhs_val = self.get_int(frame, func, rhs)?;
                    let result =
                        eval_bin(*op, lhs_val, rhs_val, lbits).ok_or({
                            EngineError::UnsupportedWidth {
                                what: "logical shift right",
                                bits: lbits,
                            }
                        })?;
                    let residual = self.trace.add_inst(func, iid)?;
                    frame
                        .symtab
                        .insert(Slot::Inst(iid), Value::real(result, residual));
                }

                Op::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let cond_val = {
                        let v = self.get_val(frame, func, cond)?;
                        self.get_const_int(&v)?
                    };
                    let picked = if cond_val != 0 { on_true } else { on_false };
                    let result = self.get_val(frame, func, picked)?;
                    self.trace.map_forward(Slot::Inst(iid), picked)?;
                    frame.symtab.insert(Slot::Inst(iid), result);
                }

                Op::Gep {
                    pointee,
                    base,
                    indices,
                } => {
                    let base_val = self.get_val(frame, func, base)?;
                    let mut addr = base_val.materialize()?.runtime.scalar()?;
                    let mut index_values = Vec::with_capacity(indices.len());
                    for idx in indices {
                        index_values.push(self.get_val(frame, func, idx)?);
                    }
                    addr = addr.wrapping_add(self.gep_offset(pointee, &index_values)?);
                    let residual = self.trace.add_inst(func, iid)?;
                    frame
                        .symtab
                        .insert(Slot::Inst(iid), Value::real(addr, residual));
                }

                Op::Load { ptr } => {
                    let ptr_val = self.get_int(frame, func, ptr)?;
                    let size = inst.ty.store_size();
                    let loaded = load_scalar(ptr_val as usize, size)?;
                    let residual = self.trace.add_inst(func, iid)?;
                    frame
                        .symtab
                        .insert(Slot::Inst(iid), Value::real(loaded, residual));
                }

                Op::Store { value, ptr } => {
                    let module = self.session.registry().module_of(frame.fref);
                    let size = func.value_ty(module, value)?.store_size();
                    let pointer = self.get_val(frame, func, ptr)?;
                    let datum = self.get_val(frame, func, value)?;
                    pointer.store(&datum, size)?;
                    self.trace.add_inst(func, iid)?;
                }

                Op::Cast { kind, value } => {
                    let module = self.session.registry().module_of(frame.fref);
                    let from_bits = func.value_ty(module, value)?.bit_size();
                    let op_val = self.get_int(frame, func, value)?;
                    if *kind == CastKind::ZExt && from_bits == 1 && !(0..=1).contains(&op_val) {
                        return Err(EngineError::Consistency(format!(
                            "boolean operand out of range: {}",
                            func.render_inst(iid)
                        )));
                    }
                    let result = eval_cast(*kind, from_bits, op_val).ok_or({
                        EngineError::UnsupportedWidth {
                            what: "cast source",
                            bits: from_bits,
                        }
                    })?;
                    let residual = self.trace.add_inst(func, iid)?;
                    frame
                        .symtab
                        .insert(Slot::Inst(iid), Value::real(result, residual));
                }

                Op::Alloca { ty } => {
                    let allocation = self.allocate(ty)?;
                    self.trace
                        .map_residual(Slot::Inst(iid), allocation.residual.clone().unwrap());
                    frame.symtab.insert(Slot::Inst(iid), Value::Real(allocation));
                }

                Op::Call { callee, args } => {
                    if let ValueRef::Const(Const::Func(name)) = callee {
                        if MARKER_INTRINSICS.contains(&name.as_str()) {
                            continue;
                        }
                    }
                    let callee_val = self.get_val(frame, func, callee)?;
                    let mut arg_values = Vec::with_capacity(args.len());
                    for arg in args {
                        arg_values.push(self.get_val(frame, func, arg)?);
                    }
                    let result = match callee_val {
                        Value::Intrinsic(IntrinsicKind::VaBegin) => {
                            self.exec_va_begin(frame, func, iid, &arg_values)?
                        }
                        Value::Intrinsic(IntrinsicKind::VaEnd) => Value::void(),
                        Value::DeferredPointer(_) => {
                            return Err(EngineError::NotCallable("deferred pointer"))
                        }
                        Value::Real(rv) => self.exec_call(frame, func, iid, rv, arg_values)?,
                    };
                    frame.symtab.insert(Slot::Inst(iid), result);
                }

                Op::Ret { value } => {
                    let result = match value {
                        None => Value::void(),
                        Some(v) => self.get_val(frame, func, v)?,
                    };
                    return Ok(BlockOutcome::Return(result));
                }

                Op::Br { target } => return Ok(BlockOutcome::Branch(*target)),

                Op::CondBr {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let v = self.get_val(frame, func, cond)?;
                    let cond_val = self.get_const_int(&v)?;
                    if !(0..=1).contains(&cond_val) {
                        return Err(EngineError::Consistency(format!(
                            "branch condition out of range: {}",
                            func.render_inst(iid)
                        )));
                    }
                    let next = if cond_val != 0 { on_true } else { on_false };
                    return Ok(BlockOutcome::Branch(*next));
                }

                Op::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let v = self.get_val(frame, func, value)?;
                    let disc = self.get_const_int(&v)?;
                    let next = cases
                        .iter()
                        .find(|(case, _)| *case == disc)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                    return Ok(BlockOutcome::Branch(next));
                }

                Op::Phi { incoming } => {
                    let Some(prev) = frame.prev_block else {
                        return Err(EngineError::PhiWithoutPredecessor(func.render_inst(iid)));
                    };
                    let Some((_, picked)) = incoming.iter().find(|(from, _)| *from == prev)
                    else {
                        return Err(EngineError::PhiWithoutPredecessor(func.render_inst(iid)));
                    };
                    let picked = picked.clone();
                    let result = self.get_val(frame, func, &picked)?;
                    self.trace.map_forward(Slot::Inst(iid), &picked)?;
                    frame.symtab.insert(Slot::Inst(iid), result);
                }

                Op::Unreachable => {
                    return Err(EngineError::UnsupportedInstruction(func.render_inst(iid)))
                }
            }
        }
        Err(EngineError::Consistency(format!(
            "block{} of '{}' has no terminator",
            block.0, func.name
        )))
    }

    // =========================================================================
    // Values and constants
    // =========================================================================

    /// Interpreted value for an operand: constants evaluate (and import
    /// their referents), everything else must already be in the frame.
    fn get_val(
        &mut self,
        frame: &Frame,
        func: &Function,
        vr: &ValueRef,
    ) -> EngineResult<Value> {
        match vr {
            ValueRef::Const(c) => self.eval_constant(frame, c),
            other => {
                let slot = Slot::of(other).expect("non-const operand names a slot");
                frame.symtab.get(&slot).cloned().ok_or_else(|| {
                    EngineError::UndefinedValue(format!("{} in '{}'", other, func.name))
                })
            }
        }
    }

    /// Concrete scalar of an operand.
    fn get_int(
        &mut self,
        frame: &Frame,
        func: &Function,
        vr: &ValueRef,
    ) -> EngineResult<i64> {
        let value = self.get_val(frame, func, vr)?;
        value.materialize()?.runtime.scalar()
    }

    /// Concrete scalar of a value that the trace must treat as known:
    /// pins the residual side with a guard before handing the scalar out.
    fn get_const_int(&mut self, value: &Value) -> EngineResult<i64> {
        let real = value.materialize()?;
        let scalar = real.runtime.scalar()?;
        if let Some(residual) = &real.residual {
            self.trace.ensure_constant(residual, scalar);
        }
        Ok(scalar)
    }

    /// Evaluate a constant operand to an interpreted value.
    fn eval_constant(&mut self, frame: &Frame, c: &Const) -> EngineResult<Value> {
        match c {
            Const::Int { bits, value } => Ok(Value::real(
                sign_extend(*value, *bits),
                ValueRef::Const(c.clone()),
            )),

            Const::NullPtr(_) => Ok(Value::real(0, ValueRef::Const(c.clone()))),

            Const::Global(name) => {
                let module = self.session.registry().module_of(frame.fref);
                let global = module
                    .global(name)
                    .ok_or_else(|| EngineError::UnknownGlobal(name.clone()))?;
                self.trace.add_global(global);

                // Constant byte arrays get a private backing buffer so the
                // global reads like ordinary memory while interpreting.
                let byte_array =
                    matches!(&global.ty, Ty::Array(elem, _) if **elem == Ty::Int(8));
                let addr = if byte_array && global.is_const {
                    let init = global.init.as_ref().ok_or_else(|| {
                        EngineError::Consistency(format!(
                            "constant global '{}' has no initializer",
                            name
                        ))
                    })?;
                    let copy = Allocation::from_bytes(init);
                    let addr = copy.addr();
                    self.allocations.push(copy);
                    addr
                } else {
                    self.session.resolver().address_of(name)?
                };
                Ok(Value::real(
                    addr as i64,
                    ValueRef::Const(Const::Global(name.clone())),
                ))
            }

            Const::Func(name) => match name.as_str() {
                VA_BEGIN => Ok(Value::Intrinsic(IntrinsicKind::VaBegin)),
                VA_END => Ok(Value::Intrinsic(IntrinsicKind::VaEnd)),
                _ => {
                    let addr = self.session.resolver().address_of(name)?;
                    Ok(Value::real(
                        addr as i64,
                        ValueRef::const_int(64, addr as i64),
                    ))
                }
            },

            Const::Gep {
                pointee,
                base,
                indices,
            } => {
                let base_val = self.eval_constant(frame, base)?;
                let mut addr = base_val.materialize()?.runtime.scalar()?;
                let mut index_values = Vec::with_capacity(indices.len());
                for idx in indices {
                    index_values.push(self.eval_constant(frame, idx)?);
                }
                addr = addr.wrapping_add(self.gep_offset(pointee, &index_values)?);
                Ok(Value::real(addr, ValueRef::Const(c.clone())))
            }
        }
    }

    /// Linear byte offset of an index list against a pointee type's layout.
    ///
    /// The first index scales by the pointee's allocation size and is pinned
    /// as a trace constant; later indices walk struct fields (layout offset)
    /// or array elements (index times element size) and stay dynamic.
    fn gep_offset(&mut self, pointee: &Ty, indices: &[Value]) -> EngineResult<i64> {
        let first = self.get_const_int(&indices[0])?;
        let mut offset = first.wrapping_mul(pointee.alloc_size() as i64);

        let mut ty = pointee;
        for idx in &indices[1..] {
            match ty {
                Ty::Struct(fields) => {
                    let field = idx.materialize()?.runtime.scalar()? as usize;
                    if field >= fields.len() {
                        return Err(EngineError::Consistency(format!(
                            "struct field index {} out of range",
                            field
                        )));
                    }
                    offset =
                        offset.wrapping_add(struct_layout(fields).offsets[field] as i64);
                    ty = &fields[field];
                }
                Ty::Array(elem, _) => {
                    let index = idx.materialize()?.runtime.scalar()?;
                    if index != 0 {
                        offset = offset.wrapping_add(index.wrapping_mul(elem.alloc_size() as i64));
                    }
                    ty = elem;
                }
                other => {
                    return Err(EngineError::Consistency(format!(
                        "address computation walks into non-aggregate type {}",
                        other
                    )))
                }
            }
        }
        Ok(offset)
    }

    /// Allocate a zeroed buffer for `ty` plus the matching residual stack
    /// allocation. The buffer joins the run-lifetime allocation list.
    fn allocate(&mut self, ty: &Ty) -> EngineResult<RealValue> {
        let bits = ty.alloc_size() * 8;
        if bits % 8 != 0 {
            return Err(EngineError::Consistency(format!(
                "allocation size {} bits is not byte-sized",
                bits
            )));
        }
        let allocation = Allocation::new((bits / 8) as usize);
        let addr = allocation.addr();
        self.allocations.push(allocation);
        let residual = self.trace.alloca(ty.clone());
        Ok(RealValue::new(addr as i64, residual))
    }

    // =========================================================================
    // Call dispatch
    // =========================================================================

    /// Dispatch a call whose callee materialized to a concrete address.
    ///
    /// The address itself is pinned as a trace constant. The strategy then
    /// decides: never-trace addresses and opaque names are invoked natively
    /// with a structurally identical call cloned into the trace; everything
    /// else resolves to a registered body and is inlined.
    fn exec_call(
        &mut self,
        frame: &mut Frame,
        func: &'s Function,
        iid: InstId,
        callee: RealValue,
        args: Vec<Value>,
    ) -> EngineResult<Value> {
        let addr = {
            let v = Value::Real(callee);
            self.get_const_int(&v)?
        } as usize;

        if !self.session.strategy().is_never_traced(addr) {
            let name = self.session.resolver().name_of(addr)?.to_string();
            let target = self.session.registry().find_function(&name)?;
            if self.session.strategy().traces_into(&name) {
                return self.inline_call(func, iid, target, args);
            }
        }
        self.native_call(frame, func, iid, addr, args)
    }

    /// Inline-interpret a callee: new residual scope, formals bound to the
    /// (bitcast-adjusted) argument values, body walked recursively, scope
    /// popped on every path, and the call instruction mapped to the
    /// (possibly bitcast-adjusted) return value.
    fn inline_call(
        &mut self,
        func: &'s Function,
        iid: InstId,
        target: FuncRef,
        args: Vec<Value>,
    ) -> EngineResult<Value> {
        if self.depth >= self.session.max_inline_depth() {
            return Err(EngineError::InlineDepthExceeded(
                self.session.max_inline_depth(),
            ));
        }
        self.depth += 1;
        self.trace.push_scope();
        let inlined = self.bind_and_run(target, args);
        self.trace.pop_scope()?;
        self.depth -= 1;
        let returned = inlined?;

        // Signatures do not have to align perfectly across modules; adjust
        // the returned residual to the type the call site expects.
        let mut real = returned.materialize()?;
        let expected = &func.inst(iid).ty;
        if let Some(residual) = real.residual.clone() {
            if !expected.is_void() && &self.trace.residual_ty(&residual) != expected {
                real.residual = Some(self.trace.bitcast(residual, expected.clone()));
            }
            self.trace
                .map_residual(Slot::Inst(iid), real.residual.clone().unwrap());
        }
        Ok(Value::Real(real))
    }

    /// Bind callee formals (adjusting residual types where they differ) in a
    /// fresh scope and run the body. Trailing arguments past the formals
    /// flow to the callee as its variadic list.
    fn bind_and_run(&mut self, target: FuncRef, args: Vec<Value>) -> EngineResult<Value> {
        let callee_fn = self.session.registry().function(target);
        let formals: Vec<Ty> = callee_fn.sig.params.clone();
        if args.len() < formals.len() {
            return Err(EngineError::ArgCountMismatch {
                name: callee_fn.name.clone(),
                expected: formals.len(),
                got: args.len(),
            });
        }

        let mut bound = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            if i >= formals.len() {
                bound.push(arg);
                continue;
            }
            let mut real = arg.materialize()?;
            let residual = real.residual.clone().ok_or_else(|| {
                EngineError::Consistency("void value passed as a call argument".to_string())
            })?;
            let residual = if self.trace.residual_ty(&residual) != formals[i] {
                self.trace.bitcast(residual, formals[i].clone())
            } else {
                residual
            };
            real.residual = Some(residual.clone());
            self.trace.map_residual(Slot::Arg(i as u32), residual);
            bound.push(Value::Real(real));
        }

        self.run_function(target, bound)
    }

    /// Invoke the resolved address directly with materialized scalars and
    /// clone a structurally identical call into the trace.
    fn native_call(
        &mut self,
        frame: &mut Frame,
        func: &'s Function,
        iid: InstId,
        addr: usize,
        args: Vec<Value>,
    ) -> EngineResult<Value> {
        let mut scalars: SmallVec<[i64; 8]> = SmallVec::new();
        for arg in &args {
            scalars.push(arg.materialize()?.runtime.scalar()?);
        }
        let result = dispatch_native(addr, &scalars)?;

        // Direct callees are imported so the cloned call links by name.
        if let Op::Call { callee, .. } = &func.inst(iid).op {
            if let ValueRef::Const(Const::Func(name)) = callee {
                let module = self.session.registry().module_of(frame.fref);
                let sig = module
                    .function(name)
                    .map(|f| f.sig.clone())
                    .ok_or_else(|| {
                        EngineError::Consistency(format!(
                            "direct call to '{}' without a local declaration",
                            name
                        ))
                    })?;
                self.trace.add_function(name, &sig);
            }
        }

        let residual = self.trace.add_inst(func, iid)?;
        Ok(Value::Real(RealValue {
            runtime: RuntimeValue::Immediate(result),
            residual: Some(residual),
        }))
    }

    // =========================================================================
    // Variadic emulation
    // =========================================================================

    /// Begin-varargs: lay the frame's trailing arguments out the way the
    /// native calling convention would have.
    ///
    /// The first six trailing arguments go to a fresh register-save area and
    /// the rest to a stack-save area. Both the concrete writes and matching
    /// residual stores are performed, then the caller-supplied va-list
    /// structure is patched: index zeroed, area pointers installed.
    fn exec_va_begin(
        &mut self,
        frame: &mut Frame,
        func: &'s Function,
        iid: InstId,
        args: &[Value],
    ) -> EngineResult<Value> {
        let tag = args
            .first()
            .ok_or_else(|| {
                EngineError::Consistency("begin-varargs needs a va-list operand".to_string())
            })?
            .materialize()?;
        let tag_ptr = tag.runtime.scalar()? as usize;
        let tag_residual = tag.residual.clone().ok_or_else(|| {
            EngineError::Consistency("begin-varargs va-list has no residual form".to_string())
        })?;

        // The operand must be a pointer to the {i32, i32, *stack, *reg}
        // va-list structure.
        let module = self.session.registry().module_of(frame.fref);
        let tag_operand = match &func.inst(iid).op {
            Op::Call { args, .. } => args[0].clone(),
            _ => unreachable!("va.begin reached from a non-call"),
        };
        let tag_ty = func.value_ty(module, &tag_operand)?;
        let fields = match tag_ty.pointee() {
            Some(Ty::Struct(fields))
                if fields.len() == 4
                    && fields[0] == Ty::Int(32)
                    && fields[1] == Ty::Int(32)
                    && fields[2].is_pointer()
                    && fields[3].is_pointer() =>
            {
                fields.clone()
            }
            _ => {
                return Err(EngineError::Consistency(format!(
                    "begin-varargs operand is not a va-list pointer: {}",
                    tag_ty
                )))
            }
        };
        let layout = struct_layout(&fields);
        let struct_ty = Ty::Struct(fields.clone());
        let vaargs = frame.vaargs.clone();

        // index = 0
        unsafe {
            ((tag_ptr + layout.offsets[0] as usize) as *mut i32).write_unaligned(0);
        }
        let index_slot = self.trace.gep(struct_ty.clone(), tag_residual.clone(), &[0, 0]);
        self.trace.store(ValueRef::const_int(32, 0), index_slot);

        if !vaargs.is_empty() {
            let nregs = vaargs.len().min(6);
            self.spill_area(
                tag_ptr + layout.offsets[3] as usize,
                &struct_ty,
                &tag_residual,
                3,
                &vaargs[..nregs],
            )?;
        }
        if vaargs.len() > 6 {
            self.spill_area(
                tag_ptr + layout.offsets[2] as usize,
                &struct_ty,
                &tag_residual,
                2,
                &vaargs[6..],
            )?;
        }

        Ok(Value::void())
    }

    /// Allocate one save area, populate it with `values`, and patch the
    /// va-list field at `field_addr` / struct index `field` to point at it —
    /// concretely and in the trace.
    fn spill_area(
        &mut self,
        field_addr: usize,
        struct_ty: &Ty,
        tag_residual: &ValueRef,
        field: i64,
        values: &[Value],
    ) -> EngineResult<()> {
        let area_ty = Ty::array(Ty::int(8), (values.len() * 8) as u64);
        let area = self.allocate(&area_ty)?;
        let area_addr = area.runtime.scalar()? as usize;
        let area_residual = area.residual.clone().unwrap();

        unsafe {
            (field_addr as *mut usize).write_unaligned(area_addr);
        }
        let area_base = self.trace.gep(area_ty.clone(), area_residual.clone(), &[0, 0]);
        let field_slot = self.trace.gep(struct_ty.clone(), tag_residual.clone(), &[0, field]);
        self.trace.store(area_base, field_slot);

        for (i, value) in values.iter().enumerate() {
            let real = value.materialize()?;
            let scalar = real.runtime.scalar()?;
            unsafe {
                ((area_addr + 8 * i) as *mut i64).write_unaligned(scalar);
            }

            let residual = real.residual.ok_or_else(|| {
                EngineError::Consistency("variadic argument has no residual form".to_string())
            })?;
            let slot = self
                .trace
                .gep(area_ty.clone(), area_residual.clone(), &[0, (8 * i) as i64]);
            let value_ty = self.trace.residual_ty(&residual);
            let slot = self.trace.bitcast(slot, Ty::ptr(value_ty));
            self.trace.store(residual, slot);
        }
        Ok(())
    }
}

// =============================================================================
// Concrete semantics helpers
// =============================================================================

/// Width-aware comparison; signed and unsigned predicates are distinct and
/// only the enumerated widths are accepted.
fn eval_cmp(pred: Pred, bits: u64, lhs: i64, rhs: i64) -> EngineResult<bool> {
    let unsupported = |what| EngineError::UnsupportedWidth { what, bits };
    Ok(match pred {
        Pred::Ult => match bits {
            64 => (lhs as u64) < (rhs as u64),
            32 => (lhs as u32) < (rhs as u32),
            _ => return Err(unsupported("unsigned compare")),
        },
        Pred::Slt => match bits {
            64 => lhs < rhs,
            32 => (lhs as i32) < (rhs as i32),
            _ => return Err(unsupported("signed compare")),
        },
        Pred::Ugt => match bits {
            64 => (lhs as u64) > (rhs as u64),
            32 => (lhs as u32) > (rhs as u32),
            _ => return Err(unsupported("unsigned compare")),
        },
        Pred::Sgt => match bits {
            64 => lhs > rhs,
            32 => (lhs as i32) > (rhs as i32),
            _ => return Err(unsupported("signed compare")),
        },
        Pred::Eq => match bits {
            64 => lhs == rhs,
            32 => (lhs as i32) == (rhs as i32),
            8 => (lhs as i8) == (rhs as i8),
            _ => return Err(unsupported("equality compare")),
        },
        Pred::Ne => match bits {
            64 => lhs != rhs,
            32 => (lhs as i32) != (rhs as i32),
            8 => (lhs as i8) != (rhs as i8),
            _ => return Err(unsupported("equality compare")),
        },
    })
}

/// Sized memory read with C sign-extension semantics.
fn load_scalar(addr: usize, size: u64) -> EngineResult<i64> {
    Ok(match size {
        1 => i64::from(unsafe { (addr as *const i8).read_unaligned() }),
        4 => i64::from(unsafe { (addr as *const i32).read_unaligned() }),
        8 => unsafe { (addr as *const i64).read_unaligned() },
        other => {
            return Err(EngineError::UnsupportedAccessSize {
                what: "load",
                size: other,
            })
        }
    })
}

/// Invoke a native address under the integer/pointer ABI subset: zero
/// through eight 64-bit scalar arguments, one 64-bit result.
fn dispatch_native(addr: usize, args: &[i64]) -> EngineResult<i64> {
    use std::mem::transmute;
    let a = args;
    Ok(match a.len() {
        0 => unsafe { transmute::<usize, extern "C" fn() -> i64>(addr)() },
        1 => unsafe { transmute::<usize, extern "C" fn(i64) -> i64>(addr)(a[0]) },
        2 => unsafe { transmute::<usize, extern "C" fn(i64, i64) -> i64>(addr)(a[0], a[1]) },
        3 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64) -> i64>(addr)(a[0], a[1], a[2])
        },
        4 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64) -> i64>(addr)(
                a[0], a[1], a[2], a[3],
            )
        },
        5 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64) -> i64>(addr)(
                a[0], a[1], a[2], a[3], a[4],
            )
        },
        6 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64>(addr)(
                a[0], a[1], a[2], a[3], a[4], a[5],
            )
        },
        7 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64, i64, i64) -> i64>(addr)(
                a[0], a[1], a[2], a[3], a[4], a[5], a[6],
            )
        },
        8 => unsafe {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64>(
                addr,
            )(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7])
        },
        n => return Err(EngineError::UnsupportedArgCount(n)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_widths_are_distinct() {
        // 0xFFFF_FFFF is -1 signed but large unsigned at 32 bits.
        let big = 0xFFFF_FFFFu32 as i64;
        assert!(eval_cmp(Pred::Slt, 32, big, 0).unwrap());
        assert!(!eval_cmp(Pred::Ult, 32, big, 0).unwrap());
        assert!(eval_cmp(Pred::Ugt, 32, big, 0).unwrap());

        assert!(eval_cmp(Pred::Eq, 8, 0x1_00, 0x2_00).unwrap());
        assert!(eval_cmp(Pred::Ne, 32, 1, 2).unwrap());
        assert!(matches!(
            eval_cmp(Pred::Slt, 16, 0, 1),
            Err(EngineError::UnsupportedWidth { .. })
        ));
        assert!(matches!(
            eval_cmp(Pred::Ult, 8, 0, 1),
            Err(EngineError::UnsupportedWidth { .. })
        ));
    }

    #[test]
    fn loads_sign_extend() {
        let bytes: [u8; 8] = [0xFF, 0x80, 0, 0, 0, 0, 0, 0x80];
        let addr = bytes.as_ptr() as usize;
        assert_eq!(load_scalar(addr, 1).unwrap(), -1);
        assert_eq!(load_scalar(addr, 4).unwrap(), 0x0000_80FFu32 as i64);
        assert_eq!(load_scalar(addr, 8).unwrap(), i64::MIN | 0x80FF);
        assert!(load_scalar(addr, 2).is_err());
    }

    #[test]
    fn native_dispatch_passes_arguments_in_order() {
        extern "C" fn weigh(a: i64, b: i64, c: i64) -> i64 {
            a * 100 + b * 10 + c
        }
        let addr = weigh as usize;
        assert_eq!(dispatch_native(addr, &[1, 2, 3]).unwrap(), 123);
        assert_eq!(
            dispatch_native(addr, &[0; 9]),
            Err(EngineError::UnsupportedArgCount(9))
        );
    }
}
