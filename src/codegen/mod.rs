//! The target-independent codegen pipeline.
//!
//! A [`Pipeline`] owns one compilation of one module: a fixed sequence of
//! five tagged stages, each behind a narrow trait the target backend
//! implements. The sequence itself never varies per target; what varies is
//! the stage implementations a backend hands out when the machine is
//! configured. A stage failure aborts the run and reports which stage died.

pub mod mir;

use std::fmt;

use log::debug;

use thiserror::Error;

use crate::emit::{ArtifactFile, ObjectArtifact, ObjectError};
use crate::error::BackendError;
use crate::ir::{FuncId, Module};
use crate::target::machine::MachineConfig;
use crate::target::FileKind;

use mir::{LoweredModule, MachFunction};

/// The five pipeline stages, in execution order. Stage tags show up in
/// error messages and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Attributes,
    Lowering,
    Selection,
    Allocation,
    Emission,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Attributes => "function-attributes",
            StageKind::Lowering => "lowering-context",
            StageKind::Selection => "instruction-selection",
            StageKind::Allocation => "register-allocation",
            StageKind::Emission => "object-emission",
        };
        f.write_str(name)
    }
}

/// Failure inside a pipeline stage. The pipeline wraps this in
/// [`BackendError::Stage`] together with the stage tag.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("@{function} passes {count} arguments, the backend supports at most {max}")]
    TooManyArgs {
        function: String,
        count: usize,
        max: usize,
    },

    #[error("@{function} is variadic; variadic definitions are not supported")]
    VariadicDefinition { function: String },

    #[error("register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("instruction encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("module '{module}' has no data layout")]
    MissingDataLayout { module: String },

    /// A stage observed state its predecessors should have made impossible.
    #[error("internal: {0}")]
    Internal(String),

    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// Per-function subtarget attributes, resolved before selection runs.
#[derive(Debug, Clone)]
pub struct FunctionAttrs {
    pub name: String,
    pub target_cpu: String,
    pub target_features: String,
}

/// Output of the function-attributes stage: one entry per defined function,
/// in definition order, parallel to [`LoweredModule::funcs`].
#[derive(Debug, Clone, Default)]
pub struct MachineModuleInfo {
    pub attrs: Vec<FunctionAttrs>,
}

/// Checks that a function only uses operations the target can lower.
pub trait OpLegalizer {
    fn check_function(&self, module: &Module, func: FuncId) -> Result<(), CodegenError>;
}

/// Turns one IR function into virtual-register machine code.
pub trait InstSelector {
    fn select_function(
        &self,
        module: &Module,
        func: FuncId,
        info: &MachineModuleInfo,
    ) -> Result<MachFunction, CodegenError>;
}

/// Assigns physical registers and spill slots; after this no virtual
/// register remains.
pub trait StorageAllocator {
    fn allocate_function(&self, func: &mut MachFunction) -> Result<(), CodegenError>;
}

/// Encodes the allocated module into object file bytes.
pub trait MachineEmitter {
    fn emit_module(&self, module: &Module, lowered: &LoweredModule) -> Result<Vec<u8>, CodegenError>;
}

/// The stage implementations one backend provides for one configured
/// machine. Built by the backend when the pipeline is created, fixed for
/// the lifetime of the run.
pub struct BackendStages {
    pub legalizer: Box<dyn OpLegalizer>,
    pub selector: Box<dyn InstSelector>,
    pub allocator: Box<dyn StorageAllocator>,
    pub emitter: Box<dyn MachineEmitter>,
}

/// One configured compilation, ready to consume a verified module.
pub struct Pipeline<'a> {
    pub(crate) stages: BackendStages,
    pub(crate) config: &'a MachineConfig,
    pub(crate) sink: ArtifactFile,
    pub(crate) file_kind: FileKind,
}

impl Pipeline<'_> {
    /// Run all five stages over `module` and write the artifact.
    ///
    /// The sink is discarded on any failure, so a dead run leaves no
    /// partial file behind.
    pub fn run(mut self, module: &Module) -> Result<ObjectArtifact, BackendError> {
        debug!(
            "compiling '{}' for {} ({} output)",
            module.name, self.config.triple, self.file_kind
        );

        let info = self
            .function_attributes(module)
            .map_err(|source| BackendError::Stage {
                stage: StageKind::Attributes,
                source,
            })?;

        for (id, func) in module.defined_functions() {
            debug!("lowering context for @{}", func.name);
            self.stages
                .legalizer
                .check_function(module, id)
                .map_err(|source| BackendError::Stage {
                    stage: StageKind::Lowering,
                    source,
                })?;
        }

        let mut lowered = LoweredModule::default();
        for (id, func) in module.defined_functions() {
            debug!("selecting @{}", func.name);
            let selected = self
                .stages
                .selector
                .select_function(module, id, &info)
                .map_err(|source| BackendError::Stage {
                    stage: StageKind::Selection,
                    source,
                })?;
            lowered.funcs.push(selected);
        }

        for func in &mut lowered.funcs {
            debug!("allocating registers in @{}", func.name);
            self.stages
                .allocator
                .allocate_function(func)
                .map_err(|source| BackendError::Stage {
                    stage: StageKind::Allocation,
                    source,
                })?;
        }

        let bytes = self
            .stages
            .emitter
            .emit_module(module, &lowered)
            .map_err(|source| BackendError::Stage {
                stage: StageKind::Emission,
                source,
            })?;

        self.sink.write_all(&bytes)?;
        let path = self.sink.keep()?;
        debug!("wrote {} bytes to {}", bytes.len(), path.display());

        Ok(ObjectArtifact {
            path,
            size: bytes.len() as u64,
            format: self.config.object_format,
        })
    }

    /// The function-attributes stage: resolve cpu and feature strings for
    /// every defined function and make sure the module carries a layout.
    fn function_attributes(&self, module: &Module) -> Result<MachineModuleInfo, CodegenError> {
        if module.data_layout().is_none() {
            return Err(CodegenError::MissingDataLayout {
                module: module.name.clone(),
            });
        }
        let attrs = module
            .defined_functions()
            .map(|(_, func)| FunctionAttrs {
                name: func.name.clone(),
                target_cpu: self.config.cpu.clone(),
                target_features: self.config.features.clone(),
            })
            .collect();
        Ok(MachineModuleInfo { attrs })
    }
}
