//! System V x86-64 ABI facts: argument registers, preserved registers, and
//! the frame layout used by the emitter.
//!
//! Frames are rbp-based. The prologue pushes `rbp`, saves the used
//! callee-saved registers, then reserves spill space rounded so `rsp` stays
//! 16-byte aligned at every call site. Spill slot `i` lives at
//! `[rbp - saved * 8 - (i + 1) * 8]`.

use crate::codegen::mir::{FrameInfo, PhysReg};

pub const RAX: PhysReg = PhysReg(0);
pub const RCX: PhysReg = PhysReg(1);
pub const RDX: PhysReg = PhysReg(2);
pub const RBX: PhysReg = PhysReg(3);
pub const RSP: PhysReg = PhysReg(4);
pub const RBP: PhysReg = PhysReg(5);
pub const RSI: PhysReg = PhysReg(6);
pub const RDI: PhysReg = PhysReg(7);
pub const R8: PhysReg = PhysReg(8);
pub const R9: PhysReg = PhysReg(9);
pub const R10: PhysReg = PhysReg(10);
pub const R11: PhysReg = PhysReg(11);
pub const R12: PhysReg = PhysReg(12);
pub const R13: PhysReg = PhysReg(13);
pub const R14: PhysReg = PhysReg(14);
pub const R15: PhysReg = PhysReg(15);

/// Integer argument registers, in assignment order.
pub const GP_ARG_REGS: [PhysReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Integer return register.
pub const RET_REG: PhysReg = RAX;

/// Registers a callee must preserve. `rbp` is excluded; it is always the
/// frame pointer here.
pub const CALLEE_SAVED: [PhysReg; 5] = [RBX, R12, R13, R14, R15];

/// Registers clobbered by a call.
pub const CALLER_SAVED: [PhysReg; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Bytes to subtract from `rsp` after the pushes. Covers the spill slots
/// and re-aligns the stack to 16 when an odd number of registers was
/// pushed on top of the return address and `rbp`.
pub fn frame_reserve_bytes(frame: &FrameInfo) -> u32 {
    let mut bytes = align_up(frame.spill_slots * 8, 16);
    if frame.saved_regs.len() % 2 == 1 {
        bytes += 8;
    }
    bytes
}

/// `rbp`-relative displacement of a spill slot.
pub fn spill_slot_offset(frame: &FrameInfo, slot: u32) -> i32 {
    -((frame.saved_regs.len() as i32 + slot as i32 + 1) * 8)
}
