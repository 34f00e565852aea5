//! Linear-scan register allocation.
//!
//! Blocks are linearized in reverse post-order, so a definition always
//! precedes its uses linearly except across loop back edges. Each virtual
//! register gets one interval covering every mention; intervals live into a
//! loop are extended to the back edge so their registers survive repeated
//! iterations. Values live across a call are placed in callee-saved
//! registers, everything else draws from a caller-saved pool, and exhausted
//! pools fall back to spill slots.
//!
//! `r11` and `rax` are reserved as spill scratch registers and never enter
//! a pool: an instruction touches at most two spilled operands, and mov
//! does not disturb the flags, so reloads can sit between a cmp and its
//! consumer.

use log::trace;

use crate::codegen::mir::{MReg, MachFunction, MachInst, PhysReg};
use crate::codegen::{CodegenError, StorageAllocator};

use super::abi::{self, R10, R11, RAX};

const LEAF_POOL: [PhysReg; 7] = [
    abi::RCX,
    abi::RDX,
    abi::RSI,
    abi::RDI,
    abi::R8,
    abi::R9,
    R10,
];

/// In a function that makes calls the argument registers are written by
/// call setup, so only `r10` is safely reusable without call-crossing
/// analysis of the setup moves.
const CALL_SAFE_POOL: [PhysReg; 1] = [R10];

const CALLEE_POOL: [PhysReg; 5] = [abi::RBX, abi::R12, abi::R13, abi::R14, abi::R15];

const SCRATCH1: PhysReg = R11;
const SCRATCH2: PhysReg = RAX;

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
enum Assign {
    Reg(PhysReg),
    Slot(u32),
}

pub struct X64RegAlloc;

impl StorageAllocator for X64RegAlloc {
    fn allocate_function(&self, func: &mut MachFunction) -> Result<(), CodegenError> {
        allocate(func)
    }
}

fn allocate(func: &mut MachFunction) -> Result<(), CodegenError> {
    let order = block_order(func);
    let n = func.blocks.len();

    // Linear start position of every block under `order`.
    let mut block_start = vec![0usize; n];
    let mut pos = 0usize;
    for &b in &order {
        block_start[b] = pos;
        pos += func.blocks[b].insts.len();
    }

    // One interval per virtual register, spanning every mention.
    let mut intervals: Vec<Option<Interval>> = vec![None; func.vreg_count as usize];
    let mut call_positions = Vec::new();
    let mut backedges: Vec<(usize, usize)> = Vec::new();
    // Positions where the entry copies read the argument registers.
    let mut arg_read_pos: [Option<usize>; 16] = [None; 16];

    let mut pos = 0usize;
    for &b in &order {
        for inst in &func.blocks[b].insts {
            let mut touch = |reg: MReg| {
                if let MReg::Virtual(v) = reg {
                    let slot = &mut intervals[v as usize];
                    match slot {
                        Some(iv) => {
                            iv.start = iv.start.min(pos);
                            iv.end = iv.end.max(pos);
                        }
                        None => *slot = Some(Interval { start: pos, end: pos }),
                    }
                }
            };
            inst.for_each_use(&mut touch);
            inst.for_each_def(&mut touch);

            match inst {
                MachInst::Call { .. } => call_positions.push(pos),
                MachInst::Jmp { target } | MachInst::JCc { target, .. } => {
                    if *target < n && block_start[*target] <= pos {
                        backedges.push((pos, block_start[*target]));
                    }
                }
                MachInst::MovRR {
                    src: MReg::Phys(src),
                    ..
                } => {
                    if (src.0 as usize) < 16 && arg_read_pos[src.0 as usize].is_none() {
                        arg_read_pos[src.0 as usize] = Some(pos);
                    }
                }
                _ => {}
            }
            pos += 1;
        }
    }

    // Values live into a loop must keep their register until the back edge.
    let mut changed = true;
    while changed {
        changed = false;
        for &(branch_pos, head_start) in &backedges {
            for interval in intervals.iter_mut().flatten() {
                if interval.start < head_start
                    && interval.end >= head_start
                    && interval.end < branch_pos
                {
                    interval.end = branch_pos;
                    changed = true;
                }
            }
        }
    }

    let mut sorted: Vec<(u32, Interval)> = intervals
        .iter()
        .enumerate()
        .filter_map(|(v, iv)| iv.map(|iv| (v as u32, iv)))
        .collect();
    sorted.sort_by_key(|&(v, iv)| (iv.start, v));

    let mut assignments: Vec<Option<Assign>> = vec![None; func.vreg_count as usize];
    let mut active: Vec<(usize, PhysReg)> = Vec::new();
    let mut in_use = [false; 16];
    let mut callee_used = [false; 16];
    let mut next_slot = 0u32;

    for &(vreg, interval) in &sorted {
        active.retain(|&(end, reg)| {
            if end < interval.start {
                in_use[reg.0 as usize] = false;
                false
            } else {
                true
            }
        });

        let crosses_call = call_positions
            .iter()
            .any(|&c| interval.start < c && c < interval.end);
        let pool: &[PhysReg] = if crosses_call {
            &CALLEE_POOL
        } else if func.makes_calls {
            &CALL_SAFE_POOL
        } else {
            &LEAF_POOL
        };

        let chosen = pool.iter().copied().find(|reg| {
            if in_use[reg.0 as usize] {
                return false;
            }
            // Never hand out an argument register that an entry copy still
            // has to read after this interval starts.
            match arg_read_pos[reg.0 as usize] {
                Some(read) => read <= interval.start,
                None => true,
            }
        });

        match chosen {
            Some(reg) => {
                trace!("v{vreg} [{}, {}] -> {:?}", interval.start, interval.end, reg);
                in_use[reg.0 as usize] = true;
                if CALLEE_POOL.contains(&reg) {
                    callee_used[reg.0 as usize] = true;
                }
                active.push((interval.end, reg));
                assignments[vreg as usize] = Some(Assign::Reg(reg));
            }
            None => {
                trace!(
                    "v{vreg} [{}, {}] -> spill slot {next_slot}",
                    interval.start,
                    interval.end
                );
                assignments[vreg as usize] = Some(Assign::Slot(next_slot));
                next_slot += 1;
            }
        }
    }

    func.frame.spill_slots = next_slot;
    func.frame.saved_regs = CALLEE_POOL
        .iter()
        .copied()
        .filter(|reg| callee_used[reg.0 as usize])
        .collect();

    rewrite(func, &assignments);

    // Nothing virtual may survive.
    let mut leftover = None;
    for block in &func.blocks {
        for inst in &block.insts {
            let mut check = |reg: MReg| {
                if let MReg::Virtual(v) = reg {
                    leftover = Some(v);
                }
            };
            inst.for_each_use(&mut check);
            inst.for_each_def(&mut check);
        }
    }
    if let Some(v) = leftover {
        return Err(CodegenError::RegisterAllocation {
            reason: format!("virtual register v{v} survived allocation in @{}", func.name),
        });
    }
    Ok(())
}

/// Replace virtual registers by their assignments, inserting reloads before
/// and spill stores after instructions that touch spilled values.
fn rewrite(func: &mut MachFunction, assignments: &[Option<Assign>]) {
    for block in &mut func.blocks {
        let old = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(old.len());

        for mut inst in old {
            let mut spilled_uses: Vec<(u32, u32)> = Vec::new();
            let mut spilled_def: Option<(u32, u32)> = None;
            inst.for_each_use(|reg| {
                if let MReg::Virtual(v) = reg {
                    if let Some(Assign::Slot(slot)) = assignments[v as usize] {
                        if !spilled_uses.iter().any(|&(u, _)| u == v) {
                            spilled_uses.push((v, slot));
                        }
                    }
                }
            });
            inst.for_each_def(|reg| {
                if let MReg::Virtual(v) = reg {
                    if let Some(Assign::Slot(slot)) = assignments[v as usize] {
                        spilled_def = Some((v, slot));
                    }
                }
            });

            // The defined value owns scratch1; remaining spilled uses take
            // what is left. At most two distinct spilled operands exist.
            let mut temps: Vec<(u32, PhysReg)> = Vec::new();
            if let Some((v, _)) = spilled_def {
                temps.push((v, SCRATCH1));
            }
            for &(v, _) in &spilled_uses {
                if temps.iter().any(|&(t, _)| t == v) {
                    continue;
                }
                let reg = if temps.is_empty() { SCRATCH1 } else { SCRATCH2 };
                temps.push((v, reg));
            }

            for &(v, slot) in &spilled_uses {
                if let Some(&(_, reg)) = temps.iter().find(|&&(t, _)| t == v) {
                    out.push(MachInst::Reload {
                        dst: MReg::Phys(reg),
                        slot,
                    });
                }
            }

            inst.map_regs(|reg| match reg {
                MReg::Virtual(v) => match assignments[v as usize] {
                    Some(Assign::Reg(phys)) => MReg::Phys(phys),
                    Some(Assign::Slot(_)) => temps
                        .iter()
                        .find(|&&(t, _)| t == v)
                        .map(|&(_, r)| MReg::Phys(r))
                        .unwrap_or(reg),
                    None => reg,
                },
                phys => phys,
            });

            out.push(inst);
            if let Some((_, slot)) = spilled_def {
                out.push(MachInst::Spill {
                    slot,
                    src: MReg::Phys(SCRATCH1),
                });
            }
        }

        block.insts = out;
    }
}

/// Reverse post-order over the branch targets, unreachable blocks appended
/// in index order.
fn block_order(func: &MachFunction) -> Vec<usize> {
    let n = func.blocks.len();
    let succs: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|block| {
            let mut targets = Vec::new();
            for inst in &block.insts {
                match inst {
                    MachInst::Jmp { target } | MachInst::JCc { target, .. } => {
                        if *target < n {
                            targets.push(*target);
                        }
                    }
                    _ => {}
                }
            }
            targets
        })
        .collect();

    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    if n > 0 {
        visited[0] = true;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((b, ci)) = stack.pop() {
            if ci < succs[b].len() {
                stack.push((b, ci + 1));
                let next = succs[b][ci];
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            } else {
                post.push(b);
            }
        }
    }
    let mut order: Vec<usize> = post.into_iter().rev().collect();
    for b in 0..n {
        if !visited[b] {
            order.push(b);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::mir::{CondCode, MachBlock, OpSize, SymRef};
    use crate::ir::{FuncId, Linkage};

    fn phys_of(inst: &MachInst) -> PhysReg {
        let mut found = None;
        inst.for_each_def(|r| {
            if let MReg::Phys(p) = r {
                found = Some(p);
            }
        });
        found.expect("instruction defines a physical register")
    }

    #[test]
    fn leaf_function_stays_in_caller_saved_registers() {
        let mut func = MachFunction::new("leaf", Linkage::External, 1);
        let a = func.new_vreg();
        let b = func.new_vreg();
        func.blocks[0].insts = vec![
            MachInst::MovImm {
                dst: a,
                size: OpSize::S64,
                imm: 1,
            },
            MachInst::MovImm {
                dst: b,
                size: OpSize::S64,
                imm: 2,
            },
            MachInst::Add {
                dst: a,
                src: b,
                size: OpSize::S64,
            },
            MachInst::MovRR {
                dst: MReg::Phys(abi::RAX),
                src: a,
                size: OpSize::S64,
            },
            MachInst::Ret,
        ];

        allocate(&mut func).unwrap();
        assert_eq!(func.frame.spill_slots, 0);
        assert!(func.frame.saved_regs.is_empty());
        assert_eq!(phys_of(&func.blocks[0].insts[0]), abi::RCX);
        assert_eq!(phys_of(&func.blocks[0].insts[1]), abi::RDX);
    }

    #[test]
    fn call_crossing_value_gets_a_callee_saved_register() {
        let mut func = MachFunction::new("crossing", Linkage::External, 1);
        func.makes_calls = true;
        let v = func.new_vreg();
        func.blocks[0].insts = vec![
            MachInst::MovImm {
                dst: v,
                size: OpSize::S64,
                imm: 7,
            },
            MachInst::Call {
                sym: SymRef::Func(FuncId(0)),
            },
            MachInst::MovRR {
                dst: MReg::Phys(abi::RDI),
                src: v,
                size: OpSize::S64,
            },
            MachInst::Ret,
        ];

        allocate(&mut func).unwrap();
        assert_eq!(phys_of(&func.blocks[0].insts[0]), abi::RBX);
        assert_eq!(func.frame.saved_regs, vec![abi::RBX]);
    }

    #[test]
    fn exhausted_pool_spills_and_reloads() {
        let mut func = MachFunction::new("spilly", Linkage::External, 1);
        func.makes_calls = true;
        let vregs: Vec<MReg> = (0..6).map(|_| func.new_vreg()).collect();
        let mut insts = Vec::new();
        for (i, &v) in vregs.iter().enumerate() {
            insts.push(MachInst::MovImm {
                dst: v,
                size: OpSize::S64,
                imm: i as i64,
            });
        }
        insts.push(MachInst::Call {
            sym: SymRef::Func(FuncId(0)),
        });
        // All six values are still needed after the call; only five
        // callee-saved registers exist.
        for &v in &vregs {
            insts.push(MachInst::MovRR {
                dst: MReg::Phys(abi::RDI),
                src: v,
                size: OpSize::S64,
            });
        }
        insts.push(MachInst::Ret);
        func.blocks[0].insts = insts;

        allocate(&mut func).unwrap();
        assert_eq!(func.frame.spill_slots, 1);
        assert_eq!(func.frame.saved_regs.len(), 5);
        assert!(func
            .blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i, MachInst::Spill { .. })));
        assert!(func
            .blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i, MachInst::Reload { .. })));
    }

    #[test]
    fn loop_extends_intervals_to_the_back_edge() {
        // b0 defines two values, b1 loops over them while defining a third.
        let mut func = MachFunction::new("looped", Linkage::External, 3);
        let a = func.new_vreg();
        let b = func.new_vreg();
        let c = func.new_vreg();
        func.blocks[0] = MachBlock {
            insts: vec![
                MachInst::MovImm {
                    dst: a,
                    size: OpSize::S64,
                    imm: 1,
                },
                MachInst::MovImm {
                    dst: b,
                    size: OpSize::S64,
                    imm: 2,
                },
                MachInst::Jmp { target: 1 },
            ],
        };
        func.blocks[1] = MachBlock {
            insts: vec![
                MachInst::Add {
                    dst: b,
                    src: a,
                    size: OpSize::S64,
                },
                MachInst::MovImm {
                    dst: c,
                    size: OpSize::S64,
                    imm: 9,
                },
                MachInst::Test {
                    lhs: c,
                    rhs: c,
                    size: OpSize::S64,
                },
                MachInst::JCc {
                    cc: CondCode::Ne,
                    target: 1,
                },
                MachInst::Jmp { target: 2 },
            ],
        };
        func.blocks[2] = MachBlock {
            insts: vec![MachInst::Ret],
        };

        allocate(&mut func).unwrap();
        let ra = phys_of(&func.blocks[0].insts[0]);
        let rb = phys_of(&func.blocks[0].insts[1]);
        let rc = phys_of(&func.blocks[1].insts[1]);
        assert_ne!(rc, ra);
        assert_ne!(rc, rb);
        assert_ne!(ra, rb);
    }
}
