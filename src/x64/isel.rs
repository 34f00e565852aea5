//! Instruction selection for x86-64.
//!
//! Direct one-pass lowering: every IR instruction expands to a short fixed
//! pattern over fresh virtual registers, and the allocator cleans up
//! afterwards. Arguments and return values move through the System V
//! registers at full width; comparison results are zero-extended at the
//! definition so later copies can stay 64-bit.

use log::trace;

use crate::codegen::mir::{
    AddrMode, MReg, MachFunction, MachInst, OpSize, SymRef,
};
use crate::codegen::{CodegenError, InstSelector, MachineModuleInfo, OpLegalizer};
use crate::ir::{FuncId, InstKind, Module, Type, Value};
use crate::target::machine::MachineConfig;
use crate::target::{CodeModel, RelocModel};

use super::abi;
use super::cond_code;

/// Arguments beyond the six integer registers would need stack passing.
pub const MAX_REG_ARGS: usize = 6;

/// Rejects functions the selector cannot lower.
pub struct X64Legalizer;

impl OpLegalizer for X64Legalizer {
    fn check_function(&self, module: &Module, func: FuncId) -> Result<(), CodegenError> {
        let func = module.function(func);
        if func.sig.variadic {
            return Err(CodegenError::VariadicDefinition {
                function: func.name.clone(),
            });
        }
        if func.sig.params.len() > MAX_REG_ARGS {
            return Err(CodegenError::TooManyArgs {
                function: func.name.clone(),
                count: func.sig.params.len(),
                max: MAX_REG_ARGS,
            });
        }
        for inst in &func.insts {
            if let InstKind::Call { args, .. } = &inst.kind {
                if args.len() > MAX_REG_ARGS {
                    return Err(CodegenError::TooManyArgs {
                        function: func.name.clone(),
                        count: args.len(),
                        max: MAX_REG_ARGS,
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct X64Selector {
    reloc: RelocModel,
    code_model: CodeModel,
}

impl X64Selector {
    pub fn new(config: &MachineConfig) -> Self {
        X64Selector {
            reloc: config.reloc_model,
            code_model: config.code_model,
        }
    }

    /// How global addresses are materialized under the configured models.
    fn addr_mode(&self) -> AddrMode {
        match self.reloc {
            RelocModel::Pic | RelocModel::DynamicNoPic | RelocModel::Default => AddrMode::PcRel,
            RelocModel::Static => match self.code_model {
                CodeModel::Small | CodeModel::Default => AddrMode::Abs32,
                CodeModel::Kernel => AddrMode::Abs32S,
                CodeModel::Medium | CodeModel::Large => AddrMode::Abs64,
            },
        }
    }
}

impl InstSelector for X64Selector {
    fn select_function(
        &self,
        module: &Module,
        func: FuncId,
        _info: &MachineModuleInfo,
    ) -> Result<MachFunction, CodegenError> {
        let func = module.function(func);
        trace!("selecting {} blocks of @{}", func.blocks.len(), func.name);

        let mut mf = MachFunction::new(&func.name, func.linkage, func.blocks.len());

        let param_regs: Vec<MReg> = (0..func.sig.params.len()).map(|_| mf.new_vreg()).collect();

        // Which instruction results are consumed anywhere.
        let mut used = vec![false; func.insts.len()];
        for inst in &func.insts {
            for operand in inst.kind.operands() {
                if let Value::Inst(id) = operand {
                    if let Some(flag) = used.get_mut(id.0 as usize) {
                        *flag = true;
                    }
                }
            }
        }

        // Result registers, assigned up front so cross-block operands
        // resolve regardless of block order.
        let mut results: Vec<Option<MReg>> = vec![None; func.insts.len()];
        for (index, inst) in func.insts.iter().enumerate() {
            let defines = match &inst.kind {
                InstKind::IConst { .. }
                | InstKind::GlobalAddr { .. }
                | InstKind::IAdd { .. }
                | InstKind::ISub { .. }
                | InstKind::ICmp { .. } => true,
                InstKind::Call { callee, .. } => {
                    module.function(*callee).sig.ret != Type::Void && used[index]
                }
                _ => false,
            };
            if defines {
                results[index] = Some(mf.new_vreg());
            }
        }

        let value_of = |value: Value| -> Result<MReg, CodegenError> {
            match value {
                Value::Param(i) => param_regs
                    .get(i as usize)
                    .copied()
                    .ok_or_else(|| CodegenError::Internal(format!("no register for param {i}"))),
                Value::Inst(id) => results
                    .get(id.0 as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        CodegenError::Internal(format!("no machine value for %{}", id.0))
                    }),
            }
        };

        for (b, block) in func.blocks.iter().enumerate() {
            let mut out = Vec::new();

            if b == 0 {
                for (i, &vreg) in param_regs.iter().enumerate() {
                    let src = abi::GP_ARG_REGS.get(i).copied().ok_or_else(|| {
                        CodegenError::TooManyArgs {
                            function: func.name.clone(),
                            count: func.sig.params.len(),
                            max: MAX_REG_ARGS,
                        }
                    })?;
                    out.push(MachInst::MovRR {
                        dst: vreg,
                        src: MReg::Phys(src),
                        size: OpSize::S64,
                    });
                }
            }

            for id in &block.insts {
                let index = id.0 as usize;
                match &func.insts[index].kind {
                    InstKind::IConst { ty, value } => {
                        if let Some(dst) = results[index] {
                            out.push(MachInst::MovImm {
                                dst,
                                size: op_size(*ty),
                                imm: *value,
                            });
                        }
                    }
                    InstKind::GlobalAddr { global } => {
                        if let Some(dst) = results[index] {
                            out.push(MachInst::LoadSymAddr {
                                dst,
                                sym: SymRef::Global(*global),
                                mode: self.addr_mode(),
                            });
                        }
                    }
                    InstKind::IAdd { ty, lhs, rhs } => {
                        if let Some(dst) = results[index] {
                            out.push(MachInst::MovRR {
                                dst,
                                src: value_of(*lhs)?,
                                size: op_size(*ty),
                            });
                            out.push(MachInst::Add {
                                dst,
                                src: value_of(*rhs)?,
                                size: op_size(*ty),
                            });
                        }
                    }
                    InstKind::ISub { ty, lhs, rhs } => {
                        if let Some(dst) = results[index] {
                            out.push(MachInst::MovRR {
                                dst,
                                src: value_of(*lhs)?,
                                size: op_size(*ty),
                            });
                            out.push(MachInst::Sub {
                                dst,
                                src: value_of(*rhs)?,
                                size: op_size(*ty),
                            });
                        }
                    }
                    InstKind::ICmp { pred, ty, lhs, rhs } => {
                        if let Some(dst) = results[index] {
                            let flag = mf.new_vreg();
                            out.push(MachInst::Cmp {
                                lhs: value_of(*lhs)?,
                                rhs: value_of(*rhs)?,
                                size: op_size(*ty),
                            });
                            out.push(MachInst::SetCc {
                                cc: cond_code(*pred),
                                dst: flag,
                            });
                            out.push(MachInst::MovZx8 { dst, src: flag });
                        }
                    }
                    InstKind::Call { callee, args } => {
                        let callee_fn = module.function(*callee);
                        for (i, arg) in args.iter().enumerate() {
                            let dst = abi::GP_ARG_REGS.get(i).copied().ok_or_else(|| {
                                CodegenError::TooManyArgs {
                                    function: func.name.clone(),
                                    count: args.len(),
                                    max: MAX_REG_ARGS,
                                }
                            })?;
                            out.push(MachInst::MovRR {
                                dst: MReg::Phys(dst),
                                src: value_of(*arg)?,
                                size: OpSize::S64,
                            });
                        }
                        if callee_fn.sig.variadic {
                            // Variadic callees expect the vector register
                            // count in al.
                            out.push(MachInst::MovImm {
                                dst: MReg::Phys(abi::RAX),
                                size: OpSize::S32,
                                imm: 0,
                            });
                        }
                        out.push(MachInst::Call {
                            sym: SymRef::Func(*callee),
                        });
                        mf.makes_calls = true;
                        if let Some(dst) = results[index] {
                            out.push(MachInst::MovRR {
                                dst,
                                src: MReg::Phys(abi::RET_REG),
                                size: OpSize::S64,
                            });
                        }
                    }
                    InstKind::Ret { value } => {
                        if let Some(value) = value {
                            out.push(MachInst::MovRR {
                                dst: MReg::Phys(abi::RET_REG),
                                src: value_of(*value)?,
                                size: OpSize::S64,
                            });
                        }
                        out.push(MachInst::Ret);
                    }
                    InstKind::Br { target } => {
                        out.push(MachInst::Jmp {
                            target: target.0 as usize,
                        });
                    }
                    InstKind::CondBr {
                        cond,
                        then_dest,
                        else_dest,
                    } => {
                        let cond = value_of(*cond)?;
                        out.push(MachInst::Test {
                            lhs: cond,
                            rhs: cond,
                            size: OpSize::S8,
                        });
                        out.push(MachInst::JCc {
                            cc: crate::codegen::mir::CondCode::Ne,
                            target: then_dest.0 as usize,
                        });
                        out.push(MachInst::Jmp {
                            target: else_dest.0 as usize,
                        });
                    }
                    InstKind::Unreachable => {
                        out.push(MachInst::Trap);
                    }
                }
            }

            mf.blocks[b].insts = out;
        }

        Ok(mf)
    }
}

fn op_size(ty: Type) -> OpSize {
    match ty {
        Type::I8 => OpSize::S8,
        Type::I16 => OpSize::S16,
        Type::I32 => OpSize::S32,
        Type::I64 | Type::Ptr => OpSize::S64,
        // Void values never reach selection.
        Type::Void => OpSize::S64,
    }
}
