//! The x86-64 backend.
//!
//! System V ABI, ELF objects, instructions encoded with iced-x86. The stage
//! implementations live in their own modules: [`isel`] legalizes and selects,
//! [`regalloc`] assigns storage, [`emitter`] encodes and lays out the object.
//! [`abi`] and [`encoder`] carry the register and encoding plumbing they
//! share.

pub mod abi;
pub mod emitter;
pub mod encoder;
pub mod isel;
pub mod regalloc;

use crate::codegen::mir::CondCode;
use crate::codegen::BackendStages;
use crate::error::ConfigError;
use crate::ir::IntPredicate;
use crate::target::machine::MachineConfig;
use crate::target::registry::TargetBackend;
use crate::target::{Arch, DataLayout, Endian, FileKind, ObjectFormat, Os, TargetTriple};

pub use emitter::X64Emitter;
pub use isel::{X64Legalizer, X64Selector};
pub use regalloc::X64RegAlloc;

/// The signed-compare condition codes for each IR predicate.
fn cond_code(pred: IntPredicate) -> CondCode {
    match pred {
        IntPredicate::Eq => CondCode::E,
        IntPredicate::Ne => CondCode::Ne,
        IntPredicate::Slt => CondCode::L,
        IntPredicate::Sle => CondCode::Le,
        IntPredicate::Sgt => CondCode::G,
        IntPredicate::Sge => CondCode::Ge,
    }
}

pub struct X64Backend;

impl TargetBackend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn supports(&self, triple: &TargetTriple) -> bool {
        triple.arch == Arch::X86_64
    }

    fn data_layout(&self, _triple: &TargetTriple) -> DataLayout {
        DataLayout {
            descriptor: "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128".to_string(),
            endian: Endian::Little,
            pointer_size: 8,
            pointer_align: 8,
            stack_align: 16,
        }
    }

    fn object_format(&self, triple: &TargetTriple) -> ObjectFormat {
        match triple.os {
            Os::Darwin => ObjectFormat::MachO,
            Os::Windows => ObjectFormat::Coff,
            _ => ObjectFormat::Elf,
        }
    }

    fn supported_file_kinds(&self) -> &'static [FileKind] {
        &[FileKind::Object]
    }

    fn validate_config(&self, config: &MachineConfig) -> Result<(), ConfigError> {
        if config.object_format != ObjectFormat::Elf {
            return Err(ConfigError::UnsupportedObjectFormat {
                triple: config.triple.to_string(),
                format: config.object_format,
                backend: self.name(),
            });
        }
        Ok(())
    }

    fn create_stages(&self, config: &MachineConfig) -> Result<BackendStages, ConfigError> {
        Ok(BackendStages {
            legalizer: Box::new(X64Legalizer),
            selector: Box::new(X64Selector::new(config)),
            allocator: Box::new(X64RegAlloc),
            emitter: Box::new(X64Emitter::new(config)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::registry::ResolvedTarget;
    use crate::target::{CodeModel, OptLevel, RelocModel, TargetOptions};

    #[test]
    fn supports_exactly_x86_64() {
        let backend = X64Backend;
        assert!(backend.supports(&TargetTriple::parse("x86_64-unknown-linux-gnu")));
        assert!(backend.supports(&TargetTriple::parse("amd64-freebsd")));
        assert!(!backend.supports(&TargetTriple::parse("aarch64-unknown-linux-gnu")));
    }

    #[test]
    fn non_elf_targets_are_rejected_at_configuration() {
        let backend = X64Backend;
        let triple = TargetTriple::parse("x86_64-apple-darwin");
        assert_eq!(backend.object_format(&triple), ObjectFormat::MachO);

        let err = crate::target::machine::TargetMachine::configure(
            ResolvedTarget {
                backend: &backend,
                triple,
            },
            "generic",
            "",
            TargetOptions::default(),
            RelocModel::Default,
            CodeModel::Default,
            OptLevel::None,
        )
        .unwrap_err();
        match err {
            ConfigError::UnsupportedObjectFormat { format, backend, .. } => {
                assert_eq!(format, ObjectFormat::MachO);
                assert_eq!(backend, "x86-64");
            }
            other => panic!("expected UnsupportedObjectFormat, got {other}"),
        }
    }
}
