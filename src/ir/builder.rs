//! IR Construction API
//!
//! Imperative builders for assembling modules in memory: create blocks,
//! switch between them, append typed instructions, terminate. Loading IR
//! from storage is outside the engine; this is how host glue and tests
//! produce the programs the interpreter consumes.

use smallvec::SmallVec;

use super::{
    gep_result_ty, BinOp, Block, BlockId, CastKind, Const, FuncTy, Function, Global, Inst, InstId,
    Module, Op, Pred, Ty, ValueRef,
};

/// Builds a [`Module`] out of globals and functions.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ModuleBuilder {
            module: Module::new(name),
        }
    }

    /// Add a global variable. `local` globals carry their initializer with
    /// them into residual modules; others resolve by name at link time.
    pub fn global(
        &mut self,
        name: impl Into<String>,
        ty: Ty,
        init: Option<Vec<u8>>,
        is_const: bool,
        local: bool,
    ) -> &mut Self {
        self.module.add_global(Global {
            name: name.into(),
            ty,
            init,
            is_const,
            local,
        });
        self
    }

    /// Declare an external function (no body).
    pub fn declare(&mut self, name: impl Into<String>, sig: FuncTy) -> &mut Self {
        self.module.add_function(Function::declaration(name, sig));
        self
    }

    /// Add a finished function definition.
    pub fn define(&mut self, function: Function) -> &mut Self {
        self.module.add_function(function);
        self
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

/// Builds one function definition instruction by instruction.
///
/// Instructions append to the current block; blocks are created eagerly and
/// selected with [`switch_to_block`](Self::switch_to_block). The entry block
/// exists from the start.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: FuncTy) -> Self {
        let mut func = Function::declaration(name, sig);
        func.blocks.push(Block::default());
        FunctionBuilder {
            func,
            current: BlockId(0),
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::default());
        id
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        assert!(
            (block.0 as usize) < self.func.blocks.len(),
            "switch to unknown block"
        );
        self.current = block;
    }

    pub fn arg(&self, index: u32) -> ValueRef {
        assert!(
            (index as usize) < self.func.sig.params.len(),
            "argument index out of range"
        );
        ValueRef::Arg(index)
    }

    pub fn iconst(&self, bits: u32, value: i64) -> ValueRef {
        ValueRef::const_int(bits, value)
    }

    fn push(&mut self, op: Op, ty: Ty) -> ValueRef {
        let id = InstId(self.func.insts.len() as u32);
        self.func.insts.push(Inst { op, ty });
        self.func.blocks[self.current.0 as usize].insts.push(id);
        ValueRef::Inst(id)
    }

    pub fn cmp(&mut self, pred: Pred, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(Op::Cmp { pred, lhs, rhs }, Ty::int(1))
    }

    pub fn bin(&mut self, op: BinOp, ty: Ty, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(Op::Bin { op, lhs, rhs }, ty)
    }

    pub fn add(&mut self, ty: Ty, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.bin(BinOp::Add, ty, lhs, rhs)
    }

    pub fn sub(&mut self, ty: Ty, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.bin(BinOp::Sub, ty, lhs, rhs)
    }

    pub fn mul(&mut self, ty: Ty, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.bin(BinOp::Mul, ty, lhs, rhs)
    }

    pub fn select(
        &mut self,
        ty: Ty,
        cond: ValueRef,
        on_true: ValueRef,
        on_false: ValueRef,
    ) -> ValueRef {
        self.push(
            Op::Select {
                cond,
                on_true,
                on_false,
            },
            ty,
        )
    }

    /// Address computation over `pointee` starting at `base`. The result type
    /// is a pointer to the type the trailing indices select; struct fields
    /// must be integer literals.
    pub fn gep(&mut self, pointee: Ty, base: ValueRef, indices: &[ValueRef]) -> ValueRef {
        assert!(!indices.is_empty(), "gep needs at least one index");
        let tail: Vec<Option<i64>> = indices[1..].iter().map(|v| v.as_const_int()).collect();
        let result = gep_result_ty(&pointee, &tail).expect("gep walks a non-aggregate type");
        let indices: SmallVec<[ValueRef; 4]> = indices.iter().cloned().collect();
        self.push(
            Op::Gep {
                pointee,
                base,
                indices,
            },
            Ty::ptr(result),
        )
    }

    pub fn load(&mut self, ty: Ty, ptr: ValueRef) -> ValueRef {
        self.push(Op::Load { ptr }, ty)
    }

    pub fn store(&mut self, value: ValueRef, ptr: ValueRef) {
        self.push(Op::Store { value, ptr }, Ty::Void);
    }

    pub fn cast(&mut self, kind: CastKind, to: Ty, value: ValueRef) -> ValueRef {
        self.push(Op::Cast { kind, value }, to)
    }

    pub fn bitcast(&mut self, to: Ty, value: ValueRef) -> ValueRef {
        self.cast(CastKind::Bitcast, to, value)
    }

    pub fn zext(&mut self, to: Ty, value: ValueRef) -> ValueRef {
        self.cast(CastKind::ZExt, to, value)
    }

    pub fn sext(&mut self, to: Ty, value: ValueRef) -> ValueRef {
        self.cast(CastKind::SExt, to, value)
    }

    pub fn trunc(&mut self, to: Ty, value: ValueRef) -> ValueRef {
        self.cast(CastKind::Trunc, to, value)
    }

    pub fn alloca(&mut self, ty: Ty) -> ValueRef {
        let ptr_ty = Ty::ptr(ty.clone());
        self.push(Op::Alloca { ty }, ptr_ty)
    }

    pub fn call(&mut self, ret: Ty, callee: ValueRef, args: &[ValueRef]) -> ValueRef {
        let args: SmallVec<[ValueRef; 4]> = args.iter().cloned().collect();
        self.push(Op::Call { callee, args }, ret)
    }

    /// Call a function by name.
    pub fn call_named(&mut self, ret: Ty, name: &str, args: &[ValueRef]) -> ValueRef {
        self.call(ret, ValueRef::Const(Const::Func(name.to_string())), args)
    }

    pub fn ret(&mut self, value: Option<ValueRef>) {
        self.push(Op::Ret { value }, Ty::Void);
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Op::Br { target }, Ty::Void);
    }

    pub fn cond_br(&mut self, cond: ValueRef, on_true: BlockId, on_false: BlockId) {
        self.push(
            Op::CondBr {
                cond,
                on_true,
                on_false,
            },
            Ty::Void,
        );
    }

    pub fn switch(&mut self, value: ValueRef, cases: Vec<(i64, BlockId)>, default: BlockId) {
        self.push(
            Op::Switch {
                value,
                cases,
                default,
            },
            Ty::Void,
        );
    }

    pub fn phi(&mut self, ty: Ty, incoming: Vec<(BlockId, ValueRef)>) -> ValueRef {
        self.push(Op::Phi { incoming }, ty)
    }

    /// Add an incoming edge to a phi after the fact, for loop-carried values
    /// whose definition follows the phi.
    pub fn add_phi_incoming(&mut self, phi: &ValueRef, from: BlockId, value: ValueRef) {
        let ValueRef::Inst(id) = phi else {
            panic!("phi incoming added to a non-instruction");
        };
        let Op::Phi { incoming } = &mut self.func.insts[id.0 as usize].op else {
            panic!("phi incoming added to a non-phi instruction");
        };
        incoming.push((from, value));
    }

    pub fn unreachable(&mut self) {
        self.push(Op::Unreachable, Ty::Void);
    }

    pub fn finish(self) -> Function {
        self.func
    }
}
