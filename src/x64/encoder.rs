//! x86-64 machine code emission on top of iced's `CodeAssembler`.
//!
//! One encoder instance per function. Block labels are created lazily so
//! forward branches work, and [`X64Encoder::finalize`] assembles at base
//! address zero and turns the recorded symbol references into section
//! relocations for the object writer.
//!
//! Instructions that carry a relocation (calls, RIP-relative leas, absolute
//! address moves) are emitted as raw bytes with a zero placeholder. The
//! block encoder never rewrites raw data, so the patch site offsets stay
//! exact.

use std::collections::HashMap;

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};
use thiserror::Error;

use crate::codegen::mir::{CondCode, FrameInfo, OpSize, PhysReg, SymRef};
use crate::codegen::CodegenError;
use crate::emit::RelocKind;

use super::abi;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("register r{0} is not encodable")]
    InvalidRegister(u8),

    #[error("{0}")]
    Assembly(String),
}

impl From<IcedError> for EncodingError {
    fn from(err: IcedError) -> Self {
        EncodingError::Assembly(err.to_string())
    }
}

impl From<EncodingError> for CodegenError {
    fn from(err: EncodingError) -> Self {
        CodegenError::Encoding {
            reason: err.to_string(),
        }
    }
}

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

fn gp64(reg: PhysReg) -> Result<AsmRegister64, EncodingError> {
    GP64.get(reg.0 as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg.0))
}

fn gp32(reg: PhysReg) -> Result<AsmRegister32, EncodingError> {
    GP32.get(reg.0 as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg.0))
}

fn gp16(reg: PhysReg) -> Result<AsmRegister16, EncodingError> {
    GP16.get(reg.0 as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg.0))
}

fn gp8(reg: PhysReg) -> Result<AsmRegister8, EncodingError> {
    GP8.get(reg.0 as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg.0))
}

/// A relocation against the final code buffer of one function.
#[derive(Debug, Clone, Copy)]
pub struct CodeReloc {
    /// Byte offset of the patch site within the function.
    pub offset: u32,
    pub sym: SymRef,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Assembled bytes of one function plus its pending relocations.
#[derive(Debug, Clone)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<CodeReloc>,
}

struct PendingReloc {
    /// Index into the assembler's instruction list.
    inst_index: usize,
    /// Patch site offset within that instruction.
    delta: u32,
    sym: SymRef,
    kind: RelocKind,
    addend: i64,
}

pub struct X64Encoder {
    asm: CodeAssembler,
    block_labels: HashMap<usize, CodeLabel>,
    pending_relocs: Vec<PendingReloc>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        Ok(X64Encoder {
            asm: CodeAssembler::new(64)?,
            block_labels: HashMap::new(),
            pending_relocs: Vec::new(),
        })
    }

    fn block_label(&mut self, block: usize) -> CodeLabel {
        if let Some(label) = self.block_labels.get(&block) {
            return *label;
        }
        let label = self.asm.create_label();
        self.block_labels.insert(block, label);
        label
    }

    /// Bind the label of `block` to the current position.
    pub fn place_block(&mut self, block: usize) -> Result<(), EncodingError> {
        let mut label = self.block_label(block);
        self.asm.set_label(&mut label)?;
        self.block_labels.insert(block, label);
        Ok(())
    }

    pub fn prologue(&mut self, frame: &FrameInfo) -> Result<(), EncodingError> {
        self.asm.push(rbp)?;
        self.asm.mov(rbp, rsp)?;
        for &reg in &frame.saved_regs {
            self.asm.push(gp64(reg)?)?;
        }
        let reserve = abi::frame_reserve_bytes(frame);
        if reserve != 0 {
            self.asm.sub(rsp, reserve as i32)?;
        }
        Ok(())
    }

    /// Tear the frame down and return. Emitted at every `ret` site.
    pub fn epilogue_ret(&mut self, frame: &FrameInfo) -> Result<(), EncodingError> {
        let reserve = abi::frame_reserve_bytes(frame);
        if reserve != 0 {
            self.asm.add(rsp, reserve as i32)?;
        }
        for &reg in frame.saved_regs.iter().rev() {
            self.asm.pop(gp64(reg)?)?;
        }
        self.asm.pop(rbp)?;
        self.asm.ret()?;
        Ok(())
    }

    pub fn mov_ri(&mut self, dst: PhysReg, size: OpSize, imm: i64) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.mov(gp8(dst)?, imm as i32)?,
            OpSize::S16 => self.asm.mov(gp16(dst)?, imm as i32)?,
            OpSize::S32 => self.asm.mov(gp32(dst)?, imm as i32)?,
            OpSize::S64 => self.asm.mov(gp64(dst)?, imm)?,
        }
        Ok(())
    }

    pub fn mov_rr(&mut self, dst: PhysReg, src: PhysReg, size: OpSize) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.mov(gp8(dst)?, gp8(src)?)?,
            OpSize::S16 => self.asm.mov(gp16(dst)?, gp16(src)?)?,
            OpSize::S32 => self.asm.mov(gp32(dst)?, gp32(src)?)?,
            OpSize::S64 => self.asm.mov(gp64(dst)?, gp64(src)?)?,
        }
        Ok(())
    }

    pub fn add_rr(&mut self, dst: PhysReg, src: PhysReg, size: OpSize) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.add(gp8(dst)?, gp8(src)?)?,
            OpSize::S16 => self.asm.add(gp16(dst)?, gp16(src)?)?,
            OpSize::S32 => self.asm.add(gp32(dst)?, gp32(src)?)?,
            OpSize::S64 => self.asm.add(gp64(dst)?, gp64(src)?)?,
        }
        Ok(())
    }

    pub fn sub_rr(&mut self, dst: PhysReg, src: PhysReg, size: OpSize) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.sub(gp8(dst)?, gp8(src)?)?,
            OpSize::S16 => self.asm.sub(gp16(dst)?, gp16(src)?)?,
            OpSize::S32 => self.asm.sub(gp32(dst)?, gp32(src)?)?,
            OpSize::S64 => self.asm.sub(gp64(dst)?, gp64(src)?)?,
        }
        Ok(())
    }

    pub fn cmp_rr(&mut self, lhs: PhysReg, rhs: PhysReg, size: OpSize) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.cmp(gp8(lhs)?, gp8(rhs)?)?,
            OpSize::S16 => self.asm.cmp(gp16(lhs)?, gp16(rhs)?)?,
            OpSize::S32 => self.asm.cmp(gp32(lhs)?, gp32(rhs)?)?,
            OpSize::S64 => self.asm.cmp(gp64(lhs)?, gp64(rhs)?)?,
        }
        Ok(())
    }

    pub fn test_rr(&mut self, lhs: PhysReg, rhs: PhysReg, size: OpSize) -> Result<(), EncodingError> {
        match size {
            OpSize::S8 => self.asm.test(gp8(lhs)?, gp8(rhs)?)?,
            OpSize::S16 => self.asm.test(gp16(lhs)?, gp16(rhs)?)?,
            OpSize::S32 => self.asm.test(gp32(lhs)?, gp32(rhs)?)?,
            OpSize::S64 => self.asm.test(gp64(lhs)?, gp64(rhs)?)?,
        }
        Ok(())
    }

    pub fn setcc(&mut self, cc: CondCode, dst: PhysReg) -> Result<(), EncodingError> {
        let dst = gp8(dst)?;
        match cc {
            CondCode::E => self.asm.sete(dst)?,
            CondCode::Ne => self.asm.setne(dst)?,
            CondCode::L => self.asm.setl(dst)?,
            CondCode::Le => self.asm.setle(dst)?,
            CondCode::G => self.asm.setg(dst)?,
            CondCode::Ge => self.asm.setge(dst)?,
        }
        Ok(())
    }

    /// `movzx dst32, src8`; writing the 32-bit register clears the rest.
    pub fn movzx8(&mut self, dst: PhysReg, src: PhysReg) -> Result<(), EncodingError> {
        self.asm.movzx(gp32(dst)?, gp8(src)?)?;
        Ok(())
    }

    pub fn jmp_block(&mut self, target: usize) -> Result<(), EncodingError> {
        let label = self.block_label(target);
        self.asm.jmp(label)?;
        Ok(())
    }

    pub fn jcc_block(&mut self, cc: CondCode, target: usize) -> Result<(), EncodingError> {
        let label = self.block_label(target);
        match cc {
            CondCode::E => self.asm.je(label)?,
            CondCode::Ne => self.asm.jne(label)?,
            CondCode::L => self.asm.jl(label)?,
            CondCode::Le => self.asm.jle(label)?,
            CondCode::G => self.asm.jg(label)?,
            CondCode::Ge => self.asm.jge(label)?,
        }
        Ok(())
    }

    /// `call rel32` against `sym`, patched by the linker through a PLT32
    /// relocation.
    pub fn call_sym(&mut self, sym: SymRef) -> Result<(), EncodingError> {
        self.pending_relocs.push(PendingReloc {
            inst_index: self.asm.instructions().len(),
            delta: 1,
            sym,
            kind: RelocKind::Plt32,
            addend: -4,
        });
        self.asm.db(&[0xe8, 0, 0, 0, 0])?;
        Ok(())
    }

    /// Materialize the address of `sym` into `dst`.
    pub fn load_sym_addr(
        &mut self,
        dst: PhysReg,
        sym: SymRef,
        kind: RelocKind,
    ) -> Result<(), EncodingError> {
        if dst.0 >= 16 {
            return Err(EncodingError::InvalidRegister(dst.0));
        }
        let reg = dst.0;
        let inst_index = self.asm.instructions().len();
        match kind {
            // lea dst, [rip + 0]
            RelocKind::Pc32 | RelocKind::Plt32 => {
                let rex = 0x48 | if reg >= 8 { 0x04 } else { 0 };
                let modrm = 0x05 | ((reg & 7) << 3);
                self.pending_relocs.push(PendingReloc {
                    inst_index,
                    delta: 3,
                    sym,
                    kind: RelocKind::Pc32,
                    addend: -4,
                });
                self.asm.db(&[rex, 0x8d, modrm, 0, 0, 0, 0])?;
            }
            // mov dst32, imm32
            RelocKind::Abs32 => {
                self.pending_relocs.push(PendingReloc {
                    inst_index,
                    delta: if reg >= 8 { 2 } else { 1 },
                    sym,
                    kind,
                    addend: 0,
                });
                let opcode = 0xb8 + (reg & 7);
                if reg >= 8 {
                    self.asm.db(&[0x41, opcode, 0, 0, 0, 0])?;
                } else {
                    self.asm.db(&[opcode, 0, 0, 0, 0])?;
                }
            }
            // mov dst, imm32 sign-extended to 64 bits
            RelocKind::Abs32S => {
                let rex = 0x48 | if reg >= 8 { 0x01 } else { 0 };
                self.pending_relocs.push(PendingReloc {
                    inst_index,
                    delta: 3,
                    sym,
                    kind,
                    addend: 0,
                });
                self.asm.db(&[rex, 0xc7, 0xc0 | (reg & 7), 0, 0, 0, 0])?;
            }
            // movabs dst, imm64
            RelocKind::Abs64 => {
                let rex = 0x48 | if reg >= 8 { 0x01 } else { 0 };
                self.pending_relocs.push(PendingReloc {
                    inst_index,
                    delta: 2,
                    sym,
                    kind,
                    addend: 0,
                });
                self.asm
                    .db(&[rex, 0xb8 + (reg & 7), 0, 0, 0, 0, 0, 0, 0, 0])?;
            }
        }
        Ok(())
    }

    pub fn spill_store(
        &mut self,
        frame: &FrameInfo,
        slot: u32,
        src: PhysReg,
    ) -> Result<(), EncodingError> {
        let disp = abi::spill_slot_offset(frame, slot);
        self.asm.mov(qword_ptr(rbp + disp), gp64(src)?)?;
        Ok(())
    }

    pub fn spill_load(
        &mut self,
        frame: &FrameInfo,
        dst: PhysReg,
        slot: u32,
    ) -> Result<(), EncodingError> {
        let disp = abi::spill_slot_offset(frame, slot);
        self.asm.mov(gp64(dst)?, qword_ptr(rbp + disp))?;
        Ok(())
    }

    pub fn trap(&mut self) -> Result<(), EncodingError> {
        self.asm.ud2()?;
        Ok(())
    }

    /// Assemble at base zero and resolve the pending symbol references to
    /// function-relative relocations.
    pub fn finalize(mut self) -> Result<EncodedFunction, EncodingError> {
        let result = self
            .asm
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        let offsets = result.inner.new_instruction_offsets;
        let code = result.inner.code_buffer;

        let mut relocs = Vec::with_capacity(self.pending_relocs.len());
        for pending in self.pending_relocs.drain(..) {
            // Raw data is never rewritten by the block encoder, so its
            // offset entry is always valid.
            let inst_offset = offsets.get(pending.inst_index).copied().ok_or_else(|| {
                EncodingError::Assembly(format!(
                    "no encoded offset for instruction #{}",
                    pending.inst_index
                ))
            })?;
            relocs.push(CodeReloc {
                offset: inst_offset + pending.delta,
                sym: pending.sym,
                kind: pending.kind,
                addend: pending.addend,
            });
        }
        Ok(EncodedFunction { code, relocs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FuncId;

    #[test]
    fn call_site_gets_a_plt_relocation() {
        let mut enc = X64Encoder::new().unwrap();
        enc.call_sym(SymRef::Func(FuncId(0))).unwrap();
        let out = enc.finalize().unwrap();
        assert_eq!(out.code, vec![0xe8, 0, 0, 0, 0]);
        assert_eq!(out.relocs.len(), 1);
        assert_eq!(out.relocs[0].offset, 1);
        assert_eq!(out.relocs[0].kind, RelocKind::Plt32);
        assert_eq!(out.relocs[0].addend, -4);
    }

    #[test]
    fn rip_relative_lea_encoding() {
        let mut enc = X64Encoder::new().unwrap();
        enc.load_sym_addr(abi::RDI, SymRef::Func(FuncId(0)), RelocKind::Pc32)
            .unwrap();
        enc.load_sym_addr(abi::R9, SymRef::Func(FuncId(0)), RelocKind::Pc32)
            .unwrap();
        let out = enc.finalize().unwrap();
        // lea rdi, [rip+0] then lea r9, [rip+0]
        assert_eq!(
            out.code,
            vec![0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x4c, 0x8d, 0x0d, 0, 0, 0, 0]
        );
        assert_eq!(out.relocs[0].offset, 3);
        assert_eq!(out.relocs[1].offset, 10);
    }

    #[test]
    fn prologue_epilogue_bracket_the_frame() {
        let frame = FrameInfo {
            spill_slots: 0,
            saved_regs: vec![abi::RBX],
        };
        let mut enc = X64Encoder::new().unwrap();
        enc.prologue(&frame).unwrap();
        enc.epilogue_ret(&frame).unwrap();
        let out = enc.finalize().unwrap();
        // push rbp; mov rbp, rsp; push rbx
        assert_eq!(&out.code[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(out.code[4], 0x53);
        assert_eq!(*out.code.last().unwrap(), 0xc3);
    }

    #[test]
    fn forward_and_backward_branches_resolve() {
        let mut enc = X64Encoder::new().unwrap();
        enc.place_block(0).unwrap();
        enc.mov_ri(abi::RAX, OpSize::S64, 1).unwrap();
        enc.jmp_block(1).unwrap();
        enc.place_block(1).unwrap();
        enc.cmp_rr(abi::RAX, abi::RCX, OpSize::S64).unwrap();
        enc.jcc_block(CondCode::L, 0).unwrap();
        enc.epilogue_ret(&FrameInfo::default()).unwrap();
        assert!(enc.finalize().is_ok());
    }

    #[test]
    fn sign_extended_absolute_mov_encoding() {
        let mut enc = X64Encoder::new().unwrap();
        enc.load_sym_addr(abi::RDI, SymRef::Func(FuncId(0)), RelocKind::Abs32S)
            .unwrap();
        enc.load_sym_addr(abi::R9, SymRef::Func(FuncId(0)), RelocKind::Abs32S)
            .unwrap();
        let out = enc.finalize().unwrap();
        // mov rdi, imm32 then mov r9, imm32, both sign-extending
        assert_eq!(
            out.code,
            vec![0x48, 0xc7, 0xc7, 0, 0, 0, 0, 0x49, 0xc7, 0xc1, 0, 0, 0, 0]
        );
        assert_eq!(out.relocs[0].offset, 3);
        assert_eq!(out.relocs[0].kind, RelocKind::Abs32S);
        assert_eq!(out.relocs[1].offset, 10);
    }

    #[test]
    fn spill_moves_are_frame_relative() {
        let frame = FrameInfo {
            spill_slots: 2,
            saved_regs: vec![abi::RBX],
        };
        let mut enc = X64Encoder::new().unwrap();
        enc.spill_store(&frame, 0, abi::RCX).unwrap();
        enc.spill_load(&frame, abi::RDX, 1).unwrap();
        enc.spill_store(&frame, 0, abi::R11).unwrap();
        let out = enc.finalize().unwrap();
        // mov [rbp-16], rcx; mov rdx, [rbp-24]; mov [rbp-16], r11
        assert_eq!(
            out.code,
            vec![
                0x48, 0x89, 0x4d, 0xf0, //
                0x48, 0x8b, 0x55, 0xe8, //
                0x4c, 0x89, 0x5d, 0xf0,
            ]
        );
    }
}
