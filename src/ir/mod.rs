//! Typed SSA Intermediate Representation
//!
//! The in-memory program form the engine interprets and specializes. A
//! [`Module`] owns globals and functions; a [`Function`] is an arena of
//! instructions organized into basic blocks, each ending in exactly one
//! terminator. Values are produced by instructions, function parameters, or
//! constants (including constant address-computation expressions).
//!
//! Modules are constructed with the [`builder`] API, checked by [`verify`],
//! and cleaned up by the single fixed [`opt`] pass before native compilation.

pub mod builder;
pub mod opt;
pub mod types;
pub mod verify;

use std::fmt;

use smallvec::SmallVec;

pub use types::{sign_extend, struct_layout, FuncTy, StructLayout, Ty};

use crate::error::{EngineError, EngineResult};

/// Index of an instruction within its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

/// Index of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// A constant value, possibly a constant expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    /// Integer literal of the given width
    Int { bits: u32, value: i64 },
    /// Null pointer of the given pointer type
    NullPtr(Ty),
    /// Reference to a global variable (the value is the global's address)
    Global(String),
    /// Reference to a function (the value is the function's address)
    Func(String),
    /// Constant address computation over a constant base
    Gep {
        pointee: Ty,
        base: Box<Const>,
        indices: Vec<Const>,
    },
}

impl Const {
    pub fn int(bits: u32, value: i64) -> Const {
        Const::Int { bits, value }
    }

    /// Type of the constant. Global and function references need the module
    /// for their pointee types; unresolvable names degrade to `*i8`.
    pub fn ty(&self, module: &Module) -> Ty {
        match self {
            Const::Int { bits, .. } => Ty::Int(*bits),
            Const::NullPtr(ty) => ty.clone(),
            Const::Global(name) => match module.global(name) {
                Some(g) => Ty::ptr(g.ty.clone()),
                None => Ty::ptr(Ty::int(8)),
            },
            Const::Func(name) => match module.function(name) {
                Some(f) => Ty::ptr(Ty::func(f.sig.clone())),
                None => Ty::ptr(Ty::int(8)),
            },
            Const::Gep {
                pointee, indices, ..
            } => {
                let tail: Vec<Option<i64>> = indices[1..]
                    .iter()
                    .map(|c| match c {
                        Const::Int { value, .. } => Some(*value),
                        _ => None,
                    })
                    .collect();
                match gep_result_ty(pointee, &tail) {
                    Some(ty) => Ty::ptr(ty),
                    None => Ty::ptr(Ty::int(8)),
                }
            }
        }
    }
}

/// Reference to a value usable as an instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    /// Result of an instruction
    Inst(InstId),
    /// Function parameter
    Arg(u32),
    /// Constant
    Const(Const),
}

impl ValueRef {
    pub fn const_int(bits: u32, value: i64) -> ValueRef {
        ValueRef::Const(Const::int(bits, value))
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            ValueRef::Const(Const::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }
}

/// Comparison predicates. Signed and unsigned orderings are distinct
/// operations and are never conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pred {
    Eq,
    Ne,
    Ult,
    Slt,
    Ugt,
    Sgt,
}

/// Binary integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Shl,
    Lshr,
}

/// Value casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Bitcast,
    ZExt,
    SExt,
    Trunc,
}

/// Instruction payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Cmp {
        pred: Pred,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Bin {
        op: BinOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Select {
        cond: ValueRef,
        on_true: ValueRef,
        on_false: ValueRef,
    },
    /// Address computation: the first index scales by the pointee's
    /// allocation size, later indices walk struct fields and array elements.
    Gep {
        pointee: Ty,
        base: ValueRef,
        indices: SmallVec<[ValueRef; 4]>,
    },
    Load {
        ptr: ValueRef,
    },
    Store {
        value: ValueRef,
        ptr: ValueRef,
    },
    Cast {
        kind: CastKind,
        value: ValueRef,
    },
    /// Stack allocation of the given type; the result is a pointer to it
    Alloca {
        ty: Ty,
    },
    Call {
        callee: ValueRef,
        args: SmallVec<[ValueRef; 4]>,
    },
    Ret {
        value: Option<ValueRef>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: ValueRef,
        on_true: BlockId,
        on_false: BlockId,
    },
    Switch {
        value: ValueRef,
        cases: Vec<(i64, BlockId)>,
        default: BlockId,
    },
    Phi {
        incoming: Vec<(BlockId, ValueRef)>,
    },
    Unreachable,
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Ret { .. }
                | Op::Br { .. }
                | Op::CondBr { .. }
                | Op::Switch { .. }
                | Op::Unreachable
        )
    }

    /// Whether removing the instruction could change observable behavior.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Op::Store { .. } | Op::Call { .. }) || self.is_terminator()
    }

    /// Operand references, for verification and liveness walks.
    pub fn operands(&self) -> SmallVec<[&ValueRef; 4]> {
        let mut out: SmallVec<[&ValueRef; 4]> = SmallVec::new();
        match self {
            Op::Cmp { lhs, rhs, .. } | Op::Bin { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                out.push(cond);
                out.push(on_true);
                out.push(on_false);
            }
            Op::Gep { base, indices, .. } => {
                out.push(base);
                out.extend(indices.iter());
            }
            Op::Load { ptr } => out.push(ptr),
            Op::Store { value, ptr } => {
                out.push(value);
                out.push(ptr);
            }
            Op::Cast { value, .. } => out.push(value),
            Op::Alloca { .. } | Op::Unreachable | Op::Br { .. } => {}
            Op::Call { callee, args } => {
                out.push(callee);
                out.extend(args.iter());
            }
            Op::Ret { value } => out.extend(value.iter()),
            Op::CondBr { cond, .. } => out.push(cond),
            Op::Switch { value, .. } => out.push(value),
            Op::Phi { incoming } => out.extend(incoming.iter().map(|(_, v)| v)),
        }
        out
    }
}

/// An instruction: its operation and its result type.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Op,
    pub ty: Ty,
}

/// A basic block: an ordered list of instruction ids ending in a terminator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub insts: Vec<InstId>,
}

/// A function: signature plus (for definitions) an instruction arena and
/// basic blocks. A function with no blocks is a declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub sig: FuncTy,
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn declaration(name: impl Into<String>, sig: FuncTy) -> Function {
        Function {
            name: name.into(),
            sig,
            insts: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Type of a value reference in the context of this function.
    pub fn value_ty(&self, module: &Module, vr: &ValueRef) -> EngineResult<Ty> {
        match vr {
            ValueRef::Inst(id) => {
                let idx = id.0 as usize;
                if idx >= self.insts.len() {
                    return Err(EngineError::UndefinedValue(format!("v{}", id.0)));
                }
                Ok(self.insts[idx].ty.clone())
            }
            ValueRef::Arg(i) => self
                .sig
                .params
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| EngineError::UndefinedValue(format!("arg{}", i))),
            ValueRef::Const(c) => Ok(c.ty(module)),
        }
    }

    /// Render one instruction for diagnostics.
    pub fn render_inst(&self, id: InstId) -> String {
        let inst = self.inst(id);
        if inst.ty.is_void() {
            format!("{}", InstDisplay { inst })
        } else {
            format!("v{} = {}", id.0, InstDisplay { inst })
        }
    }
}

/// A global variable. The address of the global is the value; `ty` is the
/// pointee type. `local` globals carry their initializer into residual
/// modules; non-local globals resolve to a host address by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    pub init: Option<Vec<u8>>,
    pub is_const: bool,
    pub local: bool,
}

/// A translation unit: globals plus functions (definitions and declarations).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Module {
        Module {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn add_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }
}

/// Walk the trailing GEP indices over a pointee type. `tail` holds the
/// constant value of each index past the first, or `None` when dynamic;
/// struct fields require constants. Returns the final indexed type.
pub fn gep_result_ty(pointee: &Ty, tail: &[Option<i64>]) -> Option<Ty> {
    let mut ty = pointee;
    for idx in tail {
        match ty {
            Ty::Struct(fields) => {
                let field = usize::try_from((*idx)?).ok()?;
                ty = fields.get(field)?;
            }
            Ty::Array(elem, _) => ty = elem,
            _ => return None,
        }
    }
    Some(ty.clone())
}

/// Evaluate a binary operation on concrete 64-bit scalars. Width only
/// matters for the logical right shift, which is defined for 64-bit
/// operands; other widths return `None`.
pub fn eval_bin(op: BinOp, lhs: i64, rhs: i64, bits: u64) -> Option<i64> {
    Some(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Shl => lhs.wrapping_shl(rhs as u32),
        BinOp::Lshr => {
            if bits != 64 {
                return None;
            }
            ((lhs as u64) >> (rhs as u32 & 63)) as i64
        }
    })
}

/// Evaluate a cast on a concrete 64-bit scalar. Bitcast and truncate leave
/// the word unchanged; extensions are explicit per source width. Unsupported
/// widths return `None`.
pub fn eval_cast(kind: CastKind, from_bits: u64, value: i64) -> Option<i64> {
    match kind {
        CastKind::Bitcast | CastKind::Trunc => Some(value),
        CastKind::ZExt => match from_bits {
            1 | 8 => Some(i64::from(value as u8)),
            32 => Some(i64::from(value as u32) as i64),
            _ => None,
        },
        CastKind::SExt => match from_bits {
            8 => Some(i64::from(value as i8)),
            32 => Some(i64::from(value as i32)),
            _ => None,
        },
    }
}

// =============================================================================
// Display
// =============================================================================

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int { bits, value } => write!(f, "{}:i{}", value, bits),
            Const::NullPtr(_) => write!(f, "null"),
            Const::Global(name) => write!(f, "@{}", name),
            Const::Func(name) => write!(f, "&{}", name),
            Const::Gep {
                pointee,
                base,
                indices,
            } => {
                write!(f, "gep {} {}", pointee, base)?;
                for idx in indices {
                    write!(f, ", {}", idx)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Inst(id) => write!(f, "v{}", id.0),
            ValueRef::Arg(i) => write!(f, "arg{}", i),
            ValueRef::Const(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for Pred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pred::Eq => "eq",
            Pred::Ne => "ne",
            Pred::Ult => "ult",
            Pred::Slt => "slt",
            Pred::Ugt => "ugt",
            Pred::Sgt => "sgt",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Shl => "shl",
            BinOp::Lshr => "lshr",
        };
        write!(f, "{}", s)
    }
}

struct InstDisplay<'a> {
    inst: &'a Inst,
}

impl fmt::Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = &self.inst.ty;
        match &self.inst.op {
            Op::Cmp { pred, lhs, rhs } => write!(f, "cmp {} {}, {}", pred, lhs, rhs),
            Op::Bin { op, lhs, rhs } => write!(f, "{} {} {}, {}", op, ty, lhs, rhs),
            Op::Select {
                cond,
                on_true,
                on_false,
            } => write!(f, "select {}, {}, {}", cond, on_true, on_false),
            Op::Gep {
                pointee,
                base,
                indices,
            } => {
                write!(f, "gep {} {}", pointee, base)?;
                for idx in indices {
                    write!(f, ", {}", idx)?;
                }
                Ok(())
            }
            Op::Load { ptr } => write!(f, "load {} {}", ty, ptr),
            Op::Store { value, ptr } => write!(f, "store {}, {}", value, ptr),
            Op::Cast { kind, value } => {
                let name = match kind {
                    CastKind::Bitcast => "bitcast",
                    CastKind::ZExt => "zext",
                    CastKind::SExt => "sext",
                    CastKind::Trunc => "trunc",
                };
                write!(f, "{} {} to {}", name, value, ty)
            }
            Op::Alloca { ty: alloc_ty } => write!(f, "alloca {}", alloc_ty),
            Op::Call { callee, args } => {
                write!(f, "call {} {}(", ty, callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Op::Ret { value: Some(v) } => write!(f, "ret {}", v),
            Op::Ret { value: None } => write!(f, "ret void"),
            Op::Br { target } => write!(f, "br block{}", target.0),
            Op::CondBr {
                cond,
                on_true,
                on_false,
            } => write!(f, "condbr {}, block{}, block{}", cond, on_true.0, on_false.0),
            Op::Switch {
                value,
                cases,
                default,
            } => {
                write!(f, "switch {}, default block{} [", value, default.0)?;
                for (i, (case, target)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} -> block{}", case, target.0)?;
                }
                write!(f, "]")
            }
            Op::Phi { incoming } => {
                write!(f, "phi {} ", ty)?;
                for (i, (block, value)) in incoming.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[block{}: {}]", block.0, value)?;
                }
                Ok(())
            }
            Op::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}{}", self.name, SigDisplay { sig: &self.sig })?;
        if self.is_declaration() {
            return writeln!(f, ";");
        }
        writeln!(f, " {{")?;
        for (bi, block) in self.blocks.iter().enumerate() {
            writeln!(f, "block{}:", bi)?;
            for &iid in &block.insts {
                writeln!(f, "  {}", self.render_inst(iid))?;
            }
        }
        writeln!(f, "}}")
    }
}

struct SigDisplay<'a> {
    sig: &'a FuncTy,
}

impl fmt::Display for SigDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.sig.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        if self.sig.variadic {
            if !self.sig.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ") -> {}", self.sig.ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_semantics() {
        assert_eq!(eval_bin(BinOp::Add, i64::MAX, 1, 64), Some(i64::MIN));
        assert_eq!(eval_bin(BinOp::Lshr, -8, 1, 64), Some((u64::MAX / 2 - 3) as i64));
        assert_eq!(eval_bin(BinOp::Lshr, 16, 2, 32), None);
        assert_eq!(eval_bin(BinOp::Shl, 1, 4, 64), Some(16));
    }

    #[test]
    fn cast_semantics() {
        assert_eq!(eval_cast(CastKind::ZExt, 8, -1), Some(255));
        assert_eq!(eval_cast(CastKind::SExt, 8, 255), Some(-1));
        assert_eq!(eval_cast(CastKind::ZExt, 32, -1), Some(0xFFFF_FFFF));
        assert_eq!(eval_cast(CastKind::SExt, 32, 0x8000_0000u32 as i64), Some(i64::from(i32::MIN)));
        assert_eq!(eval_cast(CastKind::Trunc, 64, -7), Some(-7));
        assert_eq!(eval_cast(CastKind::ZExt, 16, 1), None);
    }

    #[test]
    fn gep_result_type_walk() {
        let s = Ty::Struct(vec![Ty::int(32), Ty::ptr(Ty::int(8))]);
        assert_eq!(gep_result_ty(&s, &[Some(1)]), Some(Ty::ptr(Ty::int(8))));
        let arr = Ty::array(Ty::int(32), 6);
        assert_eq!(gep_result_ty(&arr, &[None]), Some(Ty::int(32)));
        // dynamic struct index is not addressable
        assert_eq!(gep_result_ty(&s, &[None]), None);
    }
}
