//! Module well-formedness checking.
//!
//! [`verify`] first runs the upgrade pass, a pure in-place normalization that
//! merges duplicate external declarations left behind by careless producers,
//! then collects every structural violation it can find instead of stopping
//! at the first. Verification failure is fatal: the pipeline never lowers a
//! module that did not pass.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::debug;

use crate::error::VerificationError;

use super::{FuncId, Function, InstKind, Module, Type, Value};

/// One verification finding, tied to the function it occurred in when there
/// is one.
#[derive(Debug, Clone)]
pub struct Violation {
    pub function: Option<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "in @{name}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Upgrade, then check. Returns all violations at once.
pub fn verify(module: &mut Module) -> Result<(), VerificationError> {
    upgrade(module);
    let violations = check(module);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(VerificationError { violations })
    }
}

/// Merge duplicate function entries that denote the same external symbol.
///
/// Within a name group, declarations whose signature matches the canonical
/// entry (the definition if there is exactly one, otherwise the earliest
/// declaration) are removed and every call site is rewritten to the
/// canonical entry. Entries that do not match stay behind for [`check`] to
/// report. The pass is idempotent and independent of declaration order.
pub fn upgrade(module: &mut Module) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, func) in module.functions.iter().enumerate() {
        groups.entry(func.name.clone()).or_default().push(i);
    }

    // Old index -> canonical old index, for entries being removed.
    let mut merged: HashMap<usize, usize> = HashMap::new();
    for indices in groups.values() {
        if indices.len() < 2 {
            continue;
        }
        let definitions: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| !module.functions[i].is_declaration())
            .collect();
        let canonical = match definitions.len() {
            0 => indices[0],
            1 => definitions[0],
            // Multiple definitions: ambiguous, leave for check().
            _ => continue,
        };
        for &i in indices {
            if i != canonical
                && module.functions[i].is_declaration()
                && module.functions[i].sig == module.functions[canonical].sig
            {
                merged.insert(i, canonical);
            }
        }
    }

    if merged.is_empty() {
        return;
    }
    debug!("upgrade: merging {} duplicate declaration(s)", merged.len());

    // Compact the function list and compute the old -> new index map.
    let mut new_index = vec![usize::MAX; module.functions.len()];
    let mut next = 0usize;
    for old in 0..module.functions.len() {
        if !merged.contains_key(&old) {
            new_index[old] = next;
            next += 1;
        }
    }
    for (&old, &canon) in &merged {
        new_index[old] = new_index[canon];
    }

    let mut kept = Vec::with_capacity(next);
    for (old, func) in module.functions.drain(..).enumerate() {
        if !merged.contains_key(&old) {
            kept.push(func);
        }
    }
    module.functions = kept;

    for func in &mut module.functions {
        for inst in &mut func.insts {
            if let InstKind::Call { callee, .. } = &mut inst.kind {
                let old = callee.0 as usize;
                if old < new_index.len() && new_index[old] != usize::MAX {
                    *callee = FuncId(new_index[old] as u32);
                }
            }
        }
    }
}

fn check(module: &Module) -> Vec<Violation> {
    let mut violations = Vec::new();

    // Symbol names must be unique across functions and globals.
    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();
    let names = module
        .functions
        .iter()
        .map(|f| f.name.as_str())
        .chain(module.globals.iter().map(|g| g.name.as_str()));
    for name in names {
        if !seen.insert(name) && reported.insert(name) {
            violations.push(Violation {
                function: None,
                message: format!("duplicate symbol '@{name}'"),
            });
        }
    }

    for func in &module.functions {
        if func.is_declaration() {
            if !func.insts.is_empty() {
                violations.push(Violation {
                    function: Some(func.name.clone()),
                    message: "declaration carries instructions".to_string(),
                });
            }
            continue;
        }
        check_function(module, func, &mut violations);
    }

    violations
}

fn check_function(module: &Module, func: &Function, violations: &mut Vec<Violation>) {
    let mut violate = |message: String| {
        violations.push(Violation {
            function: Some(func.name.clone()),
            message,
        });
    };

    // Where each arena instruction is listed: (block, position).
    let mut placement: Vec<Option<(usize, usize)>> = vec![None; func.insts.len()];
    for (b, block) in func.blocks.iter().enumerate() {
        if block.insts.is_empty() {
            violate(format!("block '{}' is empty", block.name));
        }
        for (pos, id) in block.insts.iter().enumerate() {
            let index = id.0 as usize;
            if index >= func.insts.len() {
                violate(format!(
                    "block '{}' references instruction %{} outside the arena",
                    block.name, id.0
                ));
                continue;
            }
            if placement[index].is_some() {
                violate(format!("instruction %{} appears in more than one block", id.0));
                continue;
            }
            placement[index] = Some((b, pos));

            let kind = &func.insts[index].kind;
            let last = pos + 1 == block.insts.len();
            if kind.is_terminator() && !last {
                violate(format!(
                    "terminator in the middle of block '{}'",
                    block.name
                ));
            }
            if last && !kind.is_terminator() {
                violate(format!(
                    "block '{}' does not end in a terminator",
                    block.name
                ));
            }
            for target in kind.successors() {
                if target.0 as usize >= func.blocks.len() {
                    violate(format!(
                        "branch in block '{}' targets unknown block #{}",
                        block.name, target.0
                    ));
                } else if target.0 == 0 {
                    // The entry block holds the parameter setup and must not
                    // be re-entered.
                    violate(format!(
                        "branch in block '{}' targets the entry block",
                        block.name
                    ));
                }
            }
        }
    }

    let (reachable, dominators) = block_dominators(func);

    for (b, block) in func.blocks.iter().enumerate() {
        for (pos, id) in block.insts.iter().enumerate() {
            let index = id.0 as usize;
            if index >= func.insts.len() || placement[index] != Some((b, pos)) {
                // Already reported above.
                continue;
            }
            let kind = &func.insts[index].kind;

            for operand in kind.operands() {
                check_operand(
                    module, func, &placement, &reachable, &dominators, b, pos, block, index,
                    operand, &mut violate,
                );
            }

            match kind {
                InstKind::IAdd { ty, lhs, rhs } | InstKind::ISub { ty, lhs, rhs } => {
                    if !ty.is_int() {
                        violate(format!("%{index}: non-integer arithmetic type {ty}"));
                    } else {
                        for v in [lhs, rhs] {
                            expect_type(module, func, *v, *ty, index, &mut violate);
                        }
                    }
                }
                InstKind::ICmp { ty, lhs, rhs, .. } => {
                    if !ty.is_int() {
                        violate(format!("%{index}: non-integer comparison type {ty}"));
                    } else {
                        for v in [lhs, rhs] {
                            expect_type(module, func, *v, *ty, index, &mut violate);
                        }
                    }
                }
                InstKind::Call { callee, args } => {
                    check_call(module, func, *callee, args, index, &mut violate);
                }
                InstKind::Ret { value } => match (func.sig.ret, value) {
                    (Type::Void, Some(_)) => {
                        violate(format!("%{index}: returns a value from a void function"))
                    }
                    (Type::Void, None) => {}
                    (_, None) => violate(format!(
                        "%{index}: missing return value for {} function",
                        func.sig.ret
                    )),
                    (expected, Some(v)) => {
                        expect_type(module, func, *v, expected, index, &mut violate)
                    }
                },
                InstKind::CondBr { cond, .. } => {
                    expect_type(module, func, *cond, Type::I8, index, &mut violate);
                }
                _ => {}
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn check_operand(
    module: &Module,
    func: &Function,
    placement: &[Option<(usize, usize)>],
    reachable: &[bool],
    dominators: &[HashSet<usize>],
    block_index: usize,
    pos: usize,
    block: &super::Block,
    index: usize,
    operand: Value,
    violate: &mut impl FnMut(String),
) {
    match operand {
        Value::Param(i) => {
            if i as usize >= func.sig.params.len() {
                violate(format!(
                    "%{index}: references parameter {i} but the function has {}",
                    func.sig.params.len()
                ));
            }
        }
        Value::Inst(def) => {
            let def_index = def.0 as usize;
            let Some(Some((def_block, def_pos))) = placement.get(def_index) else {
                violate(format!(
                    "%{index}: operand %{} is not defined in any block",
                    def.0
                ));
                return;
            };
            if func.value_type(module, operand) == Type::Void {
                violate(format!("%{index}: operand %{} has no value", def.0));
                return;
            }
            // Dominance is vacuous in unreachable code.
            if !reachable[block_index] {
                return;
            }
            let ok = if *def_block == block_index {
                *def_pos < pos
            } else {
                dominators[block_index].contains(def_block)
            };
            if !ok {
                violate(format!(
                    "%{index}: operand %{} does not dominate its use in block '{}'",
                    def.0, block.name
                ));
            }
        }
    }
}

fn expect_type(
    module: &Module,
    func: &Function,
    value: Value,
    expected: Type,
    index: usize,
    violate: &mut impl FnMut(String),
) {
    let actual = func.value_type(module, value);
    // Void operands are reported by the operand check already.
    if actual != Type::Void && actual != expected {
        violate(format!(
            "%{index}: operand type mismatch: expected {expected}, got {actual}"
        ));
    }
}

fn check_call(
    module: &Module,
    func: &Function,
    callee: FuncId,
    args: &[Value],
    index: usize,
    violate: &mut impl FnMut(String),
) {
    let Some(callee_fn) = module.functions.get(callee.0 as usize) else {
        violate(format!("%{index}: calls unknown function #{}", callee.0));
        return;
    };
    let sig = &callee_fn.sig;
    let fixed = sig.params.len();
    if sig.variadic {
        if args.len() < fixed {
            violate(format!(
                "%{index}: call to @{} expects at least {fixed} argument(s), got {}",
                callee_fn.name,
                args.len()
            ));
        }
    } else if args.len() != fixed {
        violate(format!(
            "%{index}: call to @{} expects {fixed} argument(s), got {}",
            callee_fn.name,
            args.len()
        ));
    }
    for (i, arg) in args.iter().enumerate().take(fixed.min(args.len())) {
        let expected = sig.params[i];
        let actual = func.value_type(module, *arg);
        if actual != Type::Void && actual != expected {
            violate(format!(
                "%{index}: argument {i} of call to @{}: expected {expected}, got {actual}",
                callee_fn.name
            ));
        }
    }
}

/// Reachability from the entry block and the dominator sets of every
/// reachable block, computed with the classic iterative dataflow.
fn block_dominators(func: &Function) -> (Vec<bool>, Vec<HashSet<usize>>) {
    let n = func.blocks.len();
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|block| {
            block
                .insts
                .last()
                .and_then(|id| func.insts.get(id.0 as usize))
                .map(|inst| {
                    inst.kind
                        .successors()
                        .into_iter()
                        .map(|b| b.0 as usize)
                        .filter(|&b| b < n)
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();

    let mut reachable = vec![false; n];
    let mut stack = vec![0usize];
    while let Some(b) = stack.pop() {
        if b >= n || reachable[b] {
            continue;
        }
        reachable[b] = true;
        stack.extend(successors[b].iter().copied());
    }

    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (b, succs) in successors.iter().enumerate() {
        if reachable[b] {
            for &s in succs {
                predecessors[s].push(b);
            }
        }
    }

    let all: HashSet<usize> = (0..n).filter(|&b| reachable[b]).collect();
    let mut dominators: Vec<HashSet<usize>> = (0..n)
        .map(|b| {
            if b == 0 {
                [0].into_iter().collect()
            } else {
                all.clone()
            }
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            if !reachable[b] {
                continue;
            }
            let mut new: Option<HashSet<usize>> = None;
            for &p in &predecessors[b] {
                new = Some(match new {
                    None => dominators[p].clone(),
                    Some(acc) => acc.intersection(&dominators[p]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(b);
            if new != dominators[b] {
                dominators[b] = new;
                changed = true;
            }
        }
    }

    (reachable, dominators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{Inst, IntPredicate, Linkage, Signature};

    #[test]
    fn upgrade_merges_identical_declarations() {
        let mut mb = ModuleBuilder::new("m");
        let puts = mb.declare_function("puts", Signature::new(Type::I32, vec![Type::Ptr]));
        let hello = mb.add_global_string("s", "hi");
        {
            let mut fb = mb.define_function("main", Signature::new(Type::I64, vec![]), Linkage::External);
            let s = fb.global_addr(hello);
            fb.call(puts, &[s]);
            let zero = fb.iconst(Type::I64, 0);
            fb.ret(Some(zero));
        }
        let mut module = mb.finish();

        // A second producer appended its own declaration of the same symbol
        // and a call that references it.
        module.functions.push(Function {
            name: "puts".to_string(),
            sig: Signature::new(Type::I32, vec![Type::Ptr]),
            linkage: Linkage::External,
            blocks: Vec::new(),
            insts: Vec::new(),
        });
        let dup = FuncId(module.functions.len() as u32 - 1);
        if let Some(main) = module.find_function("main") {
            let func = &mut module.functions[main.0 as usize];
            for inst in &mut func.insts {
                if let InstKind::Call { callee, .. } = &mut inst.kind {
                    *callee = dup;
                }
            }
        }

        assert!(verify(&mut module).is_ok());
        assert_eq!(
            module.functions.iter().filter(|f| f.name == "puts").count(),
            1
        );
        // The rewritten call targets the surviving declaration.
        let main = module.find_function("main").unwrap();
        let callee = module.function(main).insts.iter().find_map(|i| match &i.kind {
            InstKind::Call { callee, .. } => Some(*callee),
            _ => None,
        });
        assert_eq!(callee, module.find_function("puts"));
    }

    #[test]
    fn mismatched_duplicate_is_still_a_violation() {
        let mut module = Module::new("m");
        for sig in [
            Signature::new(Type::I32, vec![Type::Ptr]),
            Signature::new(Type::I64, vec![Type::Ptr]),
        ] {
            module.functions.push(Function {
                name: "puts".to_string(),
                sig,
                linkage: Linkage::External,
                blocks: Vec::new(),
                insts: Vec::new(),
            });
        }
        let err = verify(&mut module).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.message.contains("duplicate symbol '@puts'")));
    }

    #[test]
    fn loop_carried_values_dominate() {
        // entry -> header; header -> body | exit; body -> header
        let mut mb = ModuleBuilder::new("m");
        let mut fb = mb.define_function(
            "count",
            Signature::new(Type::I64, vec![Type::I64]),
            Linkage::External,
        );
        let header = fb.create_block("header");
        let body = fb.create_block("body");
        let exit = fb.create_block("exit");

        let limit = fb.iconst(Type::I64, 10);
        fb.br(header);

        fb.switch_to_block(header);
        let cmp = fb.icmp(IntPredicate::Slt, Type::I64, fb.param(0), limit);
        fb.cond_br(cmp, body, exit);

        fb.switch_to_block(body);
        fb.br(header);

        fb.switch_to_block(exit);
        fb.ret(Some(limit));

        let mut module = mb.finish();
        assert!(verify(&mut module).is_ok());
    }

    #[test]
    fn use_before_def_in_same_block() {
        let mut module = Module::new("m");
        module.functions.push(Function {
            name: "bad".to_string(),
            sig: Signature::new(Type::I64, vec![]),
            linkage: Linkage::External,
            blocks: vec![super::super::Block {
                name: "entry".to_string(),
                insts: vec![crate::ir::InstId(0), crate::ir::InstId(1)],
            }],
            insts: vec![
                Inst {
                    kind: InstKind::Ret {
                        value: Some(Value::Inst(crate::ir::InstId(1))),
                    },
                },
                Inst {
                    kind: InstKind::IConst {
                        ty: Type::I64,
                        value: 3,
                    },
                },
            ],
        });
        let err = verify(&mut module).unwrap_err();
        assert!(err.violations.iter().any(|v| v
            .message
            .contains("terminator in the middle of block 'entry'")));
        assert!(err
            .violations
            .iter()
            .any(|v| v.message.contains("does not dominate its use")));
    }

    #[test]
    fn branching_back_to_the_entry_block_is_rejected() {
        let mut mb = ModuleBuilder::new("m");
        let mut fb = mb.define_function(
            "spin",
            Signature::new(Type::Void, vec![]),
            Linkage::External,
        );
        let again = fb.create_block("again");
        fb.br(again);
        fb.switch_to_block(again);
        fb.br(crate::ir::BlockId(0));

        let mut module = mb.finish();
        let err = verify(&mut module).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.message.contains("targets the entry block")));
    }
}
