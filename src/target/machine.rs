//! Target machine configuration.
//!
//! [`TargetMachine::configure`] pairs a resolved backend with one validated
//! set of code generation options. Everything policy-like happens here, once:
//! relocation model resolution, OS compatibility, object format validation.
//! The pipeline built by [`TargetMachine::create_pipeline`] can then assume a
//! consistent configuration and never re-checks it.

use crate::codegen::Pipeline;
use crate::emit::ArtifactFile;
use crate::error::ConfigError;
use crate::target::registry::{ResolvedTarget, TargetBackend};
use crate::target::{
    CodeModel, DataLayout, FileKind, ObjectFormat, OptLevel, Os, RelocModel, TargetOptions,
    TargetTriple,
};

/// The full, validated option set one compilation runs under.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub triple: TargetTriple,
    pub cpu: String,
    pub features: String,
    /// Already resolved; never `Default` after configuration.
    pub reloc_model: RelocModel,
    pub code_model: CodeModel,
    pub opt_level: OptLevel,
    pub options: TargetOptions,
    pub object_format: ObjectFormat,
}

/// A backend bound to a validated configuration.
pub struct TargetMachine<'r> {
    backend: &'r dyn TargetBackend,
    config: MachineConfig,
    layout: DataLayout,
}

impl std::fmt::Debug for TargetMachine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetMachine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<'r> TargetMachine<'r> {
    /// Validate the requested options against the resolved target and bind
    /// them. Fails before any lowering if the combination is unusable.
    pub fn configure(
        resolved: ResolvedTarget<'r>,
        cpu: &str,
        features: &str,
        options: TargetOptions,
        reloc_model: RelocModel,
        code_model: CodeModel,
        opt_level: OptLevel,
    ) -> Result<Self, ConfigError> {
        let ResolvedTarget { backend, triple } = resolved;
        let reloc_model = resolve_reloc_model(&triple.os, reloc_model)?;
        let object_format = backend.object_format(&triple);
        let layout = backend.data_layout(&triple);

        let config = MachineConfig {
            triple,
            cpu: cpu.to_string(),
            features: features.to_string(),
            reloc_model,
            code_model,
            opt_level,
            options,
            object_format,
        };
        backend.validate_config(&config)?;

        Ok(TargetMachine {
            backend,
            config,
            layout,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The layout the driver must attach to the module before compiling it.
    pub fn data_layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Build the stage pipeline writing to `sink`.
    ///
    /// `sink` is consumed either way; if the backend cannot produce
    /// `file_kind` the sink drops here and its file is removed, so a failed
    /// request leaves nothing on disk.
    pub fn create_pipeline(
        &self,
        sink: ArtifactFile,
        file_kind: FileKind,
    ) -> Result<Pipeline<'_>, ConfigError> {
        if !self.backend.supported_file_kinds().contains(&file_kind) {
            return Err(ConfigError::UnsupportedFileKind {
                triple: self.config.triple.to_string(),
                kind: file_kind,
            });
        }
        let stages = self.backend.create_stages(&self.config)?;
        Ok(Pipeline {
            stages,
            config: &self.config,
            sink,
            file_kind,
        })
    }
}

/// AIX only runs position-independent code; everywhere else `Default` means
/// PIC so default-configured objects link against PIE toolchains.
fn resolve_reloc_model(os: &Os, model: RelocModel) -> Result<RelocModel, ConfigError> {
    match model {
        RelocModel::Default => Ok(RelocModel::Pic),
        RelocModel::Pic => Ok(RelocModel::Pic),
        RelocModel::Static | RelocModel::DynamicNoPic if *os == Os::Aix => {
            Err(ConfigError::IncompatibleRelocModel {
                os: os.clone(),
                model,
            })
        }
        explicit => Ok(explicit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_resolves_to_pic() {
        let model = resolve_reloc_model(&Os::Linux, RelocModel::Default).unwrap();
        assert_eq!(model, RelocModel::Pic);
    }

    #[test]
    fn explicit_models_pass_through_on_linux() {
        let model = resolve_reloc_model(&Os::Linux, RelocModel::Static).unwrap();
        assert_eq!(model, RelocModel::Static);
    }

    #[test]
    fn aix_rejects_static_relocation() {
        let err = resolve_reloc_model(&Os::Aix, RelocModel::Static).unwrap_err();
        match err {
            ConfigError::IncompatibleRelocModel { os, model } => {
                assert_eq!(os, Os::Aix);
                assert_eq!(model, RelocModel::Static);
            }
            other => panic!("expected IncompatibleRelocModel, got {other}"),
        }
    }

    #[test]
    fn aix_accepts_pic_and_default() {
        assert_eq!(
            resolve_reloc_model(&Os::Aix, RelocModel::Pic).unwrap(),
            RelocModel::Pic
        );
        assert_eq!(
            resolve_reloc_model(&Os::Aix, RelocModel::Default).unwrap(),
            RelocModel::Pic
        );
    }
}
