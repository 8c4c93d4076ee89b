//! The Fixed Optimization Pass
//!
//! One generic cleanup applied to a residual function between its two
//! verification runs: fold constant arithmetic, casts and selects, collapse
//! conditional branches whose condition folded to a literal, then drop
//! instructions nothing observes. The pass runs exactly once per trace;
//! there is no re-optimization.

use std::collections::{HashMap, HashSet};

use super::{eval_bin, eval_cast, sign_extend, Const, Function, InstId, Op, ValueRef};

/// Run the pass in place. Folded and dead instructions are unlinked from
/// their blocks; the instruction arena keeps its indices stable so remaining
/// operand references stay valid.
pub fn optimize(func: &mut Function) {
    let folded = fold_constants(func);
    substitute(func, &folded);
    fold_branches(func);
    eliminate_dead(func);
}

/// Walk blocks in order and compute literal results for instructions whose
/// operands are (possibly previously folded) integer literals.
fn fold_constants(func: &Function) -> HashMap<InstId, Const> {
    let mut folded: HashMap<InstId, Const> = HashMap::new();

    let resolve = |folded: &HashMap<InstId, Const>, vr: &ValueRef| -> Option<(u32, i64)> {
        let c = match vr {
            ValueRef::Inst(id) => folded.get(id)?.clone(),
            ValueRef::Const(c) => c.clone(),
            ValueRef::Arg(_) => return None,
        };
        match c {
            Const::Int { bits, value } => Some((bits, sign_extend(value, bits))),
            _ => None,
        }
    };

    for block in &func.blocks {
        for &iid in &block.insts {
            let inst = func.inst(iid);
            let result = match &inst.op {
                Op::Bin { op, lhs, rhs } => {
                    let (bits, lhs) = match resolve(&folded, lhs) {
                        Some(v) => v,
                        None => continue,
                    };
                    let (_, rhs) = match resolve(&folded, rhs) {
                        Some(v) => v,
                        None => continue,
                    };
                    eval_bin(*op, lhs, rhs, u64::from(bits)).map(|v| Const::int(bits, v))
                }
                Op::Cast { kind, value } => {
                    let (bits, v) = match resolve(&folded, value) {
                        Some(v) => v,
                        None => continue,
                    };
                    let to_bits = inst.ty.bit_size() as u32;
                    eval_cast(*kind, u64::from(bits), v).map(|v| Const::int(to_bits, v))
                }
                Op::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let (_, c) = match resolve(&folded, cond) {
                        Some(v) => v,
                        None => continue,
                    };
                    let pick = if c != 0 { on_true } else { on_false };
                    resolve(&folded, pick).map(|(bits, v)| Const::int(bits, v))
                }
                _ => None,
            };
            if let Some(c) = result {
                folded.insert(iid, c);
            }
        }
    }

    folded
}

/// Rewrite every operand that refers to a folded instruction into the
/// literal itself.
fn substitute(func: &mut Function, folded: &HashMap<InstId, Const>) {
    if folded.is_empty() {
        return;
    }
    let subst = |vr: &mut ValueRef| {
        if let ValueRef::Inst(id) = vr {
            if let Some(c) = folded.get(id) {
                *vr = ValueRef::Const(c.clone());
            }
        }
    };
    for inst in &mut func.insts {
        match &mut inst.op {
            Op::Cmp { lhs, rhs, .. } | Op::Bin { lhs, rhs, .. } => {
                subst(lhs);
                subst(rhs);
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                subst(cond);
                subst(on_true);
                subst(on_false);
            }
            Op::Gep { base, indices, .. } => {
                subst(base);
                indices.iter_mut().for_each(subst);
            }
            Op::Load { ptr } => subst(ptr),
            Op::Store { value, ptr } => {
                subst(value);
                subst(ptr);
            }
            Op::Cast { value, .. } => subst(value),
            Op::Call { callee, args } => {
                subst(callee);
                args.iter_mut().for_each(subst);
            }
            Op::Ret { value } => {
                if let Some(v) = value {
                    subst(v);
                }
            }
            Op::CondBr { cond, .. } => subst(cond),
            Op::Switch { value, .. } => subst(value),
            Op::Phi { incoming } => incoming.iter_mut().for_each(|(_, v)| subst(v)),
            Op::Alloca { .. } | Op::Br { .. } | Op::Unreachable => {}
        }
    }
}

/// Turn `condbr literal, a, b` into an unconditional branch. Blocks that
/// become unreachable stay in place; native translation skips them.
fn fold_branches(func: &mut Function) {
    for inst in &mut func.insts {
        if let Op::CondBr {
            cond,
            on_true,
            on_false,
        } = &inst.op
        {
            if let Some(c) = cond.as_const_int() {
                let target = if c != 0 { *on_true } else { *on_false };
                inst.op = Op::Br { target };
            }
        }
    }
}

/// Drop instructions that have no side effects and no remaining uses.
fn eliminate_dead(func: &mut Function) {
    let mut used: HashSet<InstId> = HashSet::new();
    let mut worklist: Vec<InstId> = Vec::new();

    for block in &func.blocks {
        for &iid in &block.insts {
            if func.inst(iid).op.has_side_effects() {
                worklist.push(iid);
            }
        }
    }
    while let Some(iid) = worklist.pop() {
        for operand in func.inst(iid).op.operands() {
            if let ValueRef::Inst(dep) = operand {
                if used.insert(*dep) {
                    worklist.push(*dep);
                }
            }
        }
    }

    let insts = &func.insts;
    for block in &mut func.blocks {
        block
            .insts
            .retain(|iid| used.contains(iid) || insts[iid.0 as usize].op.has_side_effects());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::verify::verify;
    use crate::ir::{BinOp, FuncTy, Ty};

    #[test]
    fn folds_constant_chains() {
        let mut f = FunctionBuilder::new("k", FuncTy::new(Ty::int(64), vec![]));
        let two = f.iconst(64, 2);
        let three = f.iconst(64, 3);
        let five = f.add(Ty::int(64), two, three);
        let ten = f.bin(BinOp::Shl, Ty::int(64), five, f.iconst(64, 1));
        f.ret(Some(ten));
        let mut func = f.finish();

        optimize(&mut func);
        verify(&func).unwrap();

        // Both adds folded away; only the return remains.
        assert_eq!(func.blocks[0].insts.len(), 1);
        let ret = func.inst(func.blocks[0].insts[0]);
        assert!(matches!(
            &ret.op,
            Op::Ret {
                value: Some(ValueRef::Const(Const::Int { value: 10, .. }))
            }
        ));
    }

    #[test]
    fn drops_dead_instructions() {
        let mut f = FunctionBuilder::new("dead", FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let x = f.arg(0);
        f.add(Ty::int(64), x.clone(), x.clone());
        let kept = f.mul(Ty::int(64), x.clone(), x.clone());
        f.ret(Some(kept));
        let mut func = f.finish();

        optimize(&mut func);
        verify(&func).unwrap();
        assert_eq!(func.blocks[0].insts.len(), 2);
    }

    #[test]
    fn folds_decided_branches() {
        let mut f = FunctionBuilder::new("decided", FuncTy::new(Ty::int(64), vec![]));
        let yes = f.create_block();
        let no = f.create_block();
        f.cond_br(f.iconst(1, 1), yes, no);
        f.switch_to_block(yes);
        f.ret(Some(f.iconst(64, 1)));
        f.switch_to_block(no);
        f.ret(Some(f.iconst(64, 0)));
        let mut func = f.finish();

        optimize(&mut func);
        verify(&func).unwrap();
        let entry_term = func.inst(*func.blocks[0].insts.last().unwrap());
        assert!(matches!(entry_term.op, Op::Br { .. }));
    }
}
