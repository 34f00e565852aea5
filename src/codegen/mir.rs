//! Machine-level IR shared by the selection, allocation, and emission
//! stages.
//!
//! Instructions use virtual registers straight out of selection; register
//! allocation rewrites every [`MReg::Virtual`] into an [`MReg::Phys`] or a
//! spill slot access before the emitter runs. Block indices mirror the
//! source function's block indices so branch targets carry over unchanged.

use crate::ir::{FuncId, GlobalId, Linkage};

/// A physical general-purpose register, numbered in the classic x86 encoder
/// order (`rax` = 0 .. `r15` = 15). Other architectures would carry their
/// own numbering behind the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg(pub u8);

/// A register operand before and after allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MReg {
    Virtual(u32),
    Phys(PhysReg),
}

impl MReg {
    pub fn as_virtual(self) -> Option<u32> {
        match self {
            MReg::Virtual(v) => Some(v),
            MReg::Phys(_) => None,
        }
    }
}

/// Operand width in bytes is `1 << (self as u8)` starting at one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    S8,
    S16,
    S32,
    S64,
}

/// Branch and set conditions, signed flavors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
}

/// How a symbol address is materialized into a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    /// `lea reg, [rip + sym]`, the position-independent form.
    PcRel,
    /// 32-bit absolute immediate, valid under the small code model.
    Abs32,
    /// Sign-extended 32-bit absolute immediate. The kernel code model links
    /// in the top 2 GiB, where addresses only fit sign-extended.
    Abs32S,
    /// Full 64-bit absolute immediate.
    Abs64,
}

/// A symbol an instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymRef {
    Global(GlobalId),
    Func(FuncId),
}

/// Machine instructions. Two-address arithmetic: `dst` is also the left
/// operand.
#[derive(Debug, Clone, PartialEq)]
pub enum MachInst {
    MovImm { dst: MReg, size: OpSize, imm: i64 },
    MovRR { dst: MReg, src: MReg, size: OpSize },
    /// Load the address of `sym` into `dst` using `mode`.
    LoadSymAddr { dst: MReg, sym: SymRef, mode: AddrMode },
    Add { dst: MReg, src: MReg, size: OpSize },
    Sub { dst: MReg, src: MReg, size: OpSize },
    Cmp { lhs: MReg, rhs: MReg, size: OpSize },
    /// Set the 8-bit `dst` to 0 or 1 from the flags.
    SetCc { cc: CondCode, dst: MReg },
    /// Zero-extend the low byte of `src` into the full `dst`.
    MovZx8 { dst: MReg, src: MReg },
    Test { lhs: MReg, rhs: MReg, size: OpSize },
    Call { sym: SymRef },
    Ret,
    /// Unconditional jump to a block index of the owning function.
    Jmp { target: usize },
    JCc { cc: CondCode, target: usize },
    /// Store `src` to the numbered spill slot.
    Spill { slot: u32, src: MReg },
    /// Load the numbered spill slot into `dst`.
    Reload { dst: MReg, slot: u32 },
    Trap,
}

impl MachInst {
    /// Visit every register this instruction reads.
    pub fn for_each_use(&self, mut f: impl FnMut(MReg)) {
        match self {
            MachInst::MovRR { src, .. }
            | MachInst::MovZx8 { src, .. }
            | MachInst::Spill { src, .. } => f(*src),
            MachInst::Add { dst, src, .. } | MachInst::Sub { dst, src, .. } => {
                f(*dst);
                f(*src);
            }
            MachInst::Cmp { lhs, rhs, .. } | MachInst::Test { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            MachInst::MovImm { .. }
            | MachInst::LoadSymAddr { .. }
            | MachInst::SetCc { .. }
            | MachInst::Call { .. }
            | MachInst::Ret
            | MachInst::Jmp { .. }
            | MachInst::JCc { .. }
            | MachInst::Reload { .. }
            | MachInst::Trap => {}
        }
    }

    /// Visit every register this instruction writes.
    pub fn for_each_def(&self, mut f: impl FnMut(MReg)) {
        match self {
            MachInst::MovImm { dst, .. }
            | MachInst::MovRR { dst, .. }
            | MachInst::LoadSymAddr { dst, .. }
            | MachInst::Add { dst, .. }
            | MachInst::Sub { dst, .. }
            | MachInst::SetCc { dst, .. }
            | MachInst::MovZx8 { dst, .. }
            | MachInst::Reload { dst, .. } => f(*dst),
            MachInst::Cmp { .. }
            | MachInst::Test { .. }
            | MachInst::Call { .. }
            | MachInst::Ret
            | MachInst::Jmp { .. }
            | MachInst::JCc { .. }
            | MachInst::Spill { .. }
            | MachInst::Trap => {}
        }
    }

    /// Rewrite every register operand in place.
    pub fn map_regs(&mut self, mut f: impl FnMut(MReg) -> MReg) {
        match self {
            MachInst::MovImm { dst, .. }
            | MachInst::LoadSymAddr { dst, .. }
            | MachInst::SetCc { dst, .. }
            | MachInst::Reload { dst, .. } => *dst = f(*dst),
            MachInst::MovRR { dst, src, .. }
            | MachInst::Add { dst, src, .. }
            | MachInst::Sub { dst, src, .. }
            | MachInst::MovZx8 { dst, src } => {
                *dst = f(*dst);
                *src = f(*src);
            }
            MachInst::Cmp { lhs, rhs, .. } | MachInst::Test { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            MachInst::Spill { src, .. } => *src = f(*src),
            MachInst::Call { .. }
            | MachInst::Ret
            | MachInst::Jmp { .. }
            | MachInst::JCc { .. }
            | MachInst::Trap => {}
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, MachInst::Call { .. })
    }
}

/// A machine basic block. Index within [`MachFunction::blocks`] equals the
/// source block index.
#[derive(Debug, Clone, Default)]
pub struct MachBlock {
    pub insts: Vec<MachInst>,
}

/// Frame facts the emitter needs to build prologue and epilogue.
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub spill_slots: u32,
    /// Callee-saved registers in push order.
    pub saved_regs: Vec<PhysReg>,
}

/// One selected function, before or after register allocation.
#[derive(Debug, Clone)]
pub struct MachFunction {
    pub name: String,
    pub linkage: Linkage,
    pub blocks: Vec<MachBlock>,
    pub vreg_count: u32,
    pub frame: FrameInfo,
    /// Whether any instruction is a call. Drives register pool choice and
    /// stack alignment.
    pub makes_calls: bool,
}

impl MachFunction {
    pub fn new(name: impl Into<String>, linkage: Linkage, block_count: usize) -> Self {
        MachFunction {
            name: name.into(),
            linkage,
            blocks: vec![MachBlock::default(); block_count],
            vreg_count: 0,
            frame: FrameInfo::default(),
            makes_calls: false,
        }
    }

    pub fn new_vreg(&mut self) -> MReg {
        let v = self.vreg_count;
        self.vreg_count += 1;
        MReg::Virtual(v)
    }
}

/// Every defined function of a module after selection, in definition order.
#[derive(Debug, Clone, Default)]
pub struct LoweredModule {
    pub funcs: Vec<MachFunction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_address_arithmetic_reads_its_destination() {
        let inst = MachInst::Add {
            dst: MReg::Virtual(0),
            src: MReg::Virtual(1),
            size: OpSize::S64,
        };
        let mut uses = Vec::new();
        inst.for_each_use(|r| uses.push(r));
        assert_eq!(uses, vec![MReg::Virtual(0), MReg::Virtual(1)]);
        let mut defs = Vec::new();
        inst.for_each_def(|r| defs.push(r));
        assert_eq!(defs, vec![MReg::Virtual(0)]);
    }

    #[test]
    fn map_regs_rewrites_all_operands() {
        let mut inst = MachInst::MovRR {
            dst: MReg::Virtual(3),
            src: MReg::Virtual(4),
            size: OpSize::S32,
        };
        inst.map_regs(|r| match r {
            MReg::Virtual(v) => MReg::Phys(PhysReg(v as u8)),
            phys => phys,
        });
        assert_eq!(
            inst,
            MachInst::MovRR {
                dst: MReg::Phys(PhysReg(3)),
                src: MReg::Phys(PhysReg(4)),
                size: OpSize::S32,
            }
        );
    }
}
