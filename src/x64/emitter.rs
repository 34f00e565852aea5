//! The object-emission stage for x86-64.
//!
//! Encodes every allocated function, lays globals into `.rodata` and code
//! into `.text`, and rewrites the encoder's function-relative relocations
//! into section-relative ones. Symbols for defined functions are created
//! when their code is appended; relocations are added afterwards so calls
//! may reference functions emitted later in the module.

use log::debug;
use object::Architecture;

use crate::codegen::mir::{
    AddrMode, LoweredModule, MReg, MachFunction, MachInst, PhysReg, SymRef,
};
use crate::codegen::{CodegenError, MachineEmitter};
use crate::emit::{ObjectBuilder, RelocKind};
use crate::ir::Module;
use crate::target::machine::MachineConfig;
use crate::target::ObjectFormat;

use super::encoder::{EncodedFunction, EncodingError, X64Encoder};

pub struct X64Emitter {
    format: ObjectFormat,
}

impl X64Emitter {
    pub fn new(config: &MachineConfig) -> Self {
        X64Emitter {
            format: config.object_format,
        }
    }
}

impl MachineEmitter for X64Emitter {
    fn emit_module(&self, module: &Module, lowered: &LoweredModule) -> Result<Vec<u8>, CodegenError> {
        let mut builder = ObjectBuilder::new(self.format, Architecture::X86_64, &module.name);

        let mut global_syms = Vec::with_capacity(module.globals.len());
        for global in &module.globals {
            let (sym, _) = builder.define_rodata(
                &global.name,
                global.linkage,
                &global.bytes,
                global.align as u64,
            );
            global_syms.push(sym);
        }

        let defined: Vec<_> = module.defined_functions().collect();
        if defined.len() != lowered.funcs.len() {
            return Err(CodegenError::Internal(format!(
                "selected {} functions for {} definitions",
                lowered.funcs.len(),
                defined.len()
            )));
        }

        let mut func_syms = vec![None; module.functions.len()];
        let mut encoded = Vec::with_capacity(lowered.funcs.len());
        for ((id, _), func) in defined.iter().zip(&lowered.funcs) {
            let out = encode_function(func)?;
            debug!("@{}: {} bytes of code", func.name, out.code.len());
            let (sym, offset) = builder.define_text(&func.name, func.linkage, &out.code);
            func_syms[id.0 as usize] = Some(sym);
            encoded.push((offset, out));
        }
        for (index, func) in module.functions.iter().enumerate() {
            if func.is_declaration() {
                func_syms[index] = Some(builder.declare_extern(&func.name));
            }
        }

        for (offset, out) in &encoded {
            for reloc in &out.relocs {
                let symbol = match reloc.sym {
                    SymRef::Global(g) => {
                        global_syms.get(g.0 as usize).copied().ok_or_else(|| {
                            CodegenError::Internal(format!(
                                "relocation against unknown global #{}",
                                g.0
                            ))
                        })?
                    }
                    SymRef::Func(f) => func_syms
                        .get(f.0 as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| {
                            CodegenError::Internal(format!(
                                "relocation against unknown function #{}",
                                f.0
                            ))
                        })?,
                };
                builder.add_text_reloc(
                    offset + u64::from(reloc.offset),
                    symbol,
                    reloc.kind,
                    reloc.addend,
                )?;
            }
        }

        Ok(builder.finish()?)
    }
}

fn encode_function(func: &MachFunction) -> Result<EncodedFunction, EncodingError> {
    let mut enc = X64Encoder::new()?;
    enc.prologue(&func.frame)?;
    for (b, block) in func.blocks.iter().enumerate() {
        enc.place_block(b)?;
        for inst in &block.insts {
            emit_inst(&mut enc, func, inst)?;
        }
    }
    enc.finalize()
}

fn emit_inst(enc: &mut X64Encoder, func: &MachFunction, inst: &MachInst) -> Result<(), EncodingError> {
    match inst {
        MachInst::MovImm { dst, size, imm } => enc.mov_ri(phys(*dst)?, *size, *imm),
        MachInst::MovRR { dst, src, size } => enc.mov_rr(phys(*dst)?, phys(*src)?, *size),
        MachInst::LoadSymAddr { dst, sym, mode } => {
            enc.load_sym_addr(phys(*dst)?, *sym, reloc_kind(*mode))
        }
        MachInst::Add { dst, src, size } => enc.add_rr(phys(*dst)?, phys(*src)?, *size),
        MachInst::Sub { dst, src, size } => enc.sub_rr(phys(*dst)?, phys(*src)?, *size),
        MachInst::Cmp { lhs, rhs, size } => enc.cmp_rr(phys(*lhs)?, phys(*rhs)?, *size),
        MachInst::Test { lhs, rhs, size } => enc.test_rr(phys(*lhs)?, phys(*rhs)?, *size),
        MachInst::SetCc { cc, dst } => enc.setcc(*cc, phys(*dst)?),
        MachInst::MovZx8 { dst, src } => enc.movzx8(phys(*dst)?, phys(*src)?),
        MachInst::Call { sym } => enc.call_sym(*sym),
        MachInst::Ret => enc.epilogue_ret(&func.frame),
        MachInst::Jmp { target } => enc.jmp_block(*target),
        MachInst::JCc { cc, target } => enc.jcc_block(*cc, *target),
        MachInst::Spill { slot, src } => enc.spill_store(&func.frame, *slot, phys(*src)?),
        MachInst::Reload { dst, slot } => enc.spill_load(&func.frame, phys(*dst)?, *slot),
        MachInst::Trap => enc.trap(),
    }
}

fn phys(reg: MReg) -> Result<PhysReg, EncodingError> {
    match reg {
        MReg::Phys(p) => Ok(p),
        MReg::Virtual(v) => Err(EncodingError::Assembly(format!(
            "virtual register v{v} reached the encoder"
        ))),
    }
}

fn reloc_kind(mode: AddrMode) -> RelocKind {
    match mode {
        AddrMode::PcRel => RelocKind::Pc32,
        AddrMode::Abs32 => RelocKind::Abs32,
        AddrMode::Abs32S => RelocKind::Abs32S,
        AddrMode::Abs64 => RelocKind::Abs64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Linkage;
    use crate::target::machine::MachineConfig;
    use crate::target::{
        CodeModel, OptLevel, RelocModel, TargetOptions, TargetTriple,
    };
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn config() -> MachineConfig {
        MachineConfig {
            triple: TargetTriple::parse("x86_64-unknown-linux-gnu"),
            cpu: "generic".to_string(),
            features: String::new(),
            reloc_model: RelocModel::Pic,
            code_model: CodeModel::Default,
            opt_level: OptLevel::None,
            options: TargetOptions::default(),
            object_format: ObjectFormat::Elf,
        }
    }

    #[test]
    fn empty_module_emits_a_parseable_object() {
        let module = Module::new("empty");
        let emitter = X64Emitter::new(&config());
        let bytes = emitter
            .emit_module(&module, &LoweredModule::default())
            .unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.format(), object::BinaryFormat::Elf);
    }

    #[test]
    fn single_return_function_round_trips() {
        let mut module = Module::new("m");
        module.functions.push(crate::ir::Function {
            name: "nop".to_string(),
            sig: crate::ir::Signature::new(crate::ir::Type::Void, vec![]),
            linkage: Linkage::External,
            blocks: vec![crate::ir::Block {
                name: "entry".to_string(),
                insts: vec![crate::ir::InstId(0)],
            }],
            insts: vec![crate::ir::Inst {
                kind: crate::ir::InstKind::Ret { value: None },
            }],
        });

        let mut lowered = LoweredModule::default();
        let mut mf = MachFunction::new("nop", Linkage::External, 1);
        mf.blocks[0].insts = vec![MachInst::Ret];
        lowered.funcs.push(mf);

        let emitter = X64Emitter::new(&config());
        let bytes = emitter.emit_module(&module, &lowered).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        // push rbp; mov rbp, rsp; pop rbp; ret
        assert_eq!(text.data().unwrap(), &[0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3]);
        assert!(file.symbols().any(|s| s.name() == Ok("nop")));
    }
}
