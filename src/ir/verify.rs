//! Structural Verification
//!
//! Checks the invariants the rest of the engine assumes: every block ends in
//! exactly one terminator, every operand refers to a defined value, branch
//! targets exist, phi incoming edges agree with the CFG, and returns agree
//! with the signature. Residual functions are verified before and after the
//! optimization pass; source modules are verified at registration.

use std::collections::HashSet;

use super::{Function, InstId, Op, ValueRef};
use crate::error::{EngineError, EngineResult};

/// Verify the structural well-formedness of a function definition.
pub fn verify(func: &Function) -> EngineResult<()> {
    if func.blocks.is_empty() {
        return Err(EngineError::VerifyFailed(format!(
            "{}: no basic blocks",
            func.name
        )));
    }

    // Instructions attached to some block are the defined set.
    let mut defined: HashSet<InstId> = HashSet::new();
    for block in &func.blocks {
        for &iid in &block.insts {
            if iid.0 as usize >= func.insts.len() {
                return Err(EngineError::VerifyFailed(format!(
                    "{}: block references missing instruction v{}",
                    func.name, iid.0
                )));
            }
            if !defined.insert(iid) {
                return Err(EngineError::VerifyFailed(format!(
                    "{}: instruction v{} attached twice",
                    func.name, iid.0
                )));
            }
        }
    }

    let n_blocks = func.blocks.len();
    let mut preds: Vec<HashSet<usize>> = vec![HashSet::new(); n_blocks];
    for (bi, block) in func.blocks.iter().enumerate() {
        let Some((&last, body)) = block.insts.split_last() else {
            return Err(EngineError::VerifyFailed(format!(
                "{}: block{} is empty",
                func.name, bi
            )));
        };
        if !func.inst(last).op.is_terminator() {
            return Err(EngineError::VerifyFailed(format!(
                "{}: block{} does not end in a terminator",
                func.name, bi
            )));
        }
        for &iid in body {
            if func.inst(iid).op.is_terminator() {
                return Err(EngineError::VerifyFailed(format!(
                    "{}: terminator in the middle of block{}",
                    func.name, bi
                )));
            }
        }

        let mut successors: Vec<u32> = Vec::new();
        match &func.inst(last).op {
            Op::Br { target } => successors.push(target.0),
            Op::CondBr {
                on_true, on_false, ..
            } => {
                successors.push(on_true.0);
                successors.push(on_false.0);
            }
            Op::Switch { cases, default, .. } => {
                successors.extend(cases.iter().map(|(_, b)| b.0));
                successors.push(default.0);
            }
            Op::Ret { value } => {
                let returns_value = value.is_some();
                if returns_value == func.sig.ret.is_void() {
                    return Err(EngineError::VerifyFailed(format!(
                        "{}: return disagrees with signature in block{}",
                        func.name, bi
                    )));
                }
            }
            Op::Unreachable => {}
            _ => unreachable!("is_terminator covered above"),
        }
        for succ in successors {
            if succ as usize >= n_blocks {
                return Err(EngineError::VerifyFailed(format!(
                    "{}: branch to missing block{} from block{}",
                    func.name, succ, bi
                )));
            }
            preds[succ as usize].insert(bi);
        }
    }

    // Operand validity and phi/CFG agreement.
    for (bi, block) in func.blocks.iter().enumerate() {
        for &iid in &block.insts {
            let inst = func.inst(iid);
            for operand in inst.op.operands() {
                match operand {
                    ValueRef::Inst(id) => {
                        if !defined.contains(id) {
                            return Err(EngineError::VerifyFailed(format!(
                                "{}: {} uses unattached value v{}",
                                func.name,
                                func.render_inst(iid),
                                id.0
                            )));
                        }
                    }
                    ValueRef::Arg(i) => {
                        if *i as usize >= func.sig.params.len() {
                            return Err(EngineError::VerifyFailed(format!(
                                "{}: {} uses missing parameter arg{}",
                                func.name,
                                func.render_inst(iid),
                                i
                            )));
                        }
                    }
                    ValueRef::Const(_) => {}
                }
            }

            if let Op::Phi { incoming } = &inst.op {
                if incoming.is_empty() {
                    return Err(EngineError::VerifyFailed(format!(
                        "{}: empty phi in block{}",
                        func.name, bi
                    )));
                }
                let mut seen: HashSet<usize> = HashSet::new();
                for (from, _) in incoming {
                    if !preds[bi].contains(&(from.0 as usize)) {
                        return Err(EngineError::VerifyFailed(format!(
                            "{}: phi in block{} names non-predecessor block{}",
                            func.name, bi, from.0
                        )));
                    }
                    seen.insert(from.0 as usize);
                }
                for pred in &preds[bi] {
                    if !seen.contains(pred) {
                        return Err(EngineError::VerifyFailed(format!(
                            "{}: phi in block{} misses predecessor block{}",
                            func.name, bi, pred
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{FuncTy, Pred, Ty};

    #[test]
    fn accepts_branching_function() {
        let mut f = FunctionBuilder::new("clamp", FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let neg = f.create_block();
        let pos = f.create_block();
        let zero = f.iconst(64, 0);
        let x = f.arg(0);
        let c = f.cmp(Pred::Slt, x.clone(), zero.clone());
        f.cond_br(c, neg, pos);
        f.switch_to_block(neg);
        f.ret(Some(zero));
        f.switch_to_block(pos);
        f.ret(Some(x));
        verify(&f.finish()).unwrap();
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut f = FunctionBuilder::new("open", FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let a = f.arg(0);
        f.add(Ty::int(64), a.clone(), a);
        let err = verify(&f.finish()).unwrap_err();
        assert!(matches!(err, EngineError::VerifyFailed(_)));
    }

    #[test]
    fn rejects_void_mismatch() {
        let mut f = FunctionBuilder::new("void_ret", FuncTy::new(Ty::int(64), vec![]));
        f.ret(None);
        assert!(verify(&f.finish()).is_err());
    }

    #[test]
    fn rejects_phi_from_non_predecessor() {
        let mut f = FunctionBuilder::new("bad_phi", FuncTy::new(Ty::int(64), vec![Ty::int(64)]));
        let next = f.create_block();
        let other = f.create_block();
        f.br(next);
        f.switch_to_block(next);
        let x = f.arg(0);
        let p = f.phi(Ty::int(64), vec![(other, x)]);
        f.ret(Some(p));
        f.switch_to_block(other);
        f.unreachable();
        assert!(verify(&f.finish()).is_err());
    }
}
