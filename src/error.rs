//! Error types for the backend.
//!
//! One fatal taxonomy, surfaced through [`BackendError`]: target resolution,
//! machine configuration, module verification, pipeline stages, artifact
//! emission and linking. Warnings are not errors and go through
//! [`crate::diagnostics::Diagnostics`] instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::codegen::{CodegenError, StageKind};
use crate::ir::verifier::Violation;
use crate::target::{FileKind, ObjectFormat, Os, RelocModel};

/// Top-level error for a compilation run.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The triple did not resolve to any registered backend.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// A codegen stage failed; the tag names the stage.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageKind,
        source: CodegenError,
    },

    #[error(transparent)]
    Emission(#[from] EmissionError),

    /// The external linker was invoked and did not produce an executable.
    #[error("linker '{linker}' failed: {detail}")]
    Link { linker: String, detail: String },
}

/// Target machine configuration rejected before any lowering runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid relocation model: {os} only supports position-independent code, got {model}")]
    IncompatibleRelocModel { os: Os, model: RelocModel },

    #[error("target '{triple}' does not support generation of {kind} output")]
    UnsupportedFileKind { triple: String, kind: FileKind },

    #[error("target '{triple}' uses the {format} object format, which the {backend} backend cannot write")]
    UnsupportedObjectFormat {
        triple: String,
        format: ObjectFormat,
        backend: &'static str,
    },
}

/// The module failed structural verification. Always fatal; the pipeline
/// never sees a module that did not pass.
#[derive(Error, Debug)]
#[error("module verification failed with {} violation(s)", .violations.len())]
pub struct VerificationError {
    pub violations: Vec<Violation>,
}

/// I/O failures around the output artifact.
#[derive(Error, Debug)]
pub enum EmissionError {
    #[error("could not create '{path}': {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result alias used throughout the driver-facing API.
pub type BackendResult<T> = Result<T, BackendError>;
