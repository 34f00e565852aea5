//! The compilation driver.
//!
//! Owns the fixed order of a run: resolve the target, verify the module,
//! configure the machine, attach the layout, run the pipeline, optionally
//! hand the object to a system linker. The driver is the only place that
//! talks to [`Diagnostics`]; verification violations and ignored-option
//! warnings surface here, stage failures come back as errors from the
//! pipeline itself.

use std::io;
use std::path::Path;
use std::process::Command;

use log::info;

use crate::diagnostics::Diagnostics;
use crate::emit::{ArtifactFile, ObjectArtifact};
use crate::error::{BackendError, BackendResult, EmissionError};
use crate::ir::{verifier, Module};
use crate::target::machine::TargetMachine;
use crate::target::registry::BackendRegistry;
use crate::target::{CodeModel, FileKind, FloatAbi, OptLevel, RelocModel, TargetOptions};

/// Everything a caller can ask of one compilation.
///
/// An empty `triple` selects the host. The defaults mirror an invocation
/// with no flags: generic cpu, no features, default models, object output.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub triple: String,
    pub cpu: String,
    pub features: String,
    pub reloc_model: RelocModel,
    pub code_model: CodeModel,
    pub opt_level: OptLevel,
    pub file_kind: FileKind,
    pub options: TargetOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            triple: String::new(),
            cpu: "generic".to_string(),
            features: String::new(),
            reloc_model: RelocModel::Default,
            code_model: CodeModel::Default,
            opt_level: OptLevel::None,
            file_kind: FileKind::Object,
            options: TargetOptions::default(),
        }
    }
}

pub struct Driver<'a> {
    registry: &'a BackendRegistry,
    diags: &'a Diagnostics,
}

impl<'a> Driver<'a> {
    pub fn new(registry: &'a BackendRegistry, diags: &'a Diagnostics) -> Self {
        Driver { registry, diags }
    }

    /// Compile `module` to an object file at `output`.
    ///
    /// The module is verified first; a module that fails verification is
    /// reported violation by violation and never reaches the pipeline. On
    /// success the module carries the target triple and data layout it was
    /// compiled under.
    pub fn compile(
        &self,
        module: &mut Module,
        opts: &CompileOptions,
        output: &Path,
    ) -> BackendResult<ObjectArtifact> {
        let resolved = self.registry.resolve(&opts.triple)?;
        module.triple = resolved.triple.to_string();
        info!("compiling '{}' for {}", module.name, module.triple);

        if let Err(err) = verifier::verify(module) {
            for violation in &err.violations {
                self.diags.error(violation);
            }
            return Err(err.into());
        }

        let machine = TargetMachine::configure(
            resolved,
            &opts.cpu,
            &opts.features,
            opts.options.clone(),
            opts.reloc_model,
            opts.code_model,
            opts.opt_level,
        )?;
        module.set_data_layout(machine.data_layout().clone());

        self.warn_ignored_options(opts);

        let sink = ArtifactFile::create(output)?;
        let pipeline = machine.create_pipeline(sink, opts.file_kind)?;
        let artifact = pipeline.run(module)?;
        info!(
            "wrote {} ({} bytes, {})",
            artifact.path.display(),
            artifact.size,
            artifact.format
        );
        Ok(artifact)
    }

    /// Options that are accepted but have no effect draw a warning each, so
    /// a caller can tell requested from honored.
    fn warn_ignored_options(&self, opts: &CompileOptions) {
        if opts.opt_level != OptLevel::None {
            self.diags.warning(format!(
                "optimization level '{}' requested; this backend only runs the unoptimized pipeline",
                opts.opt_level
            ));
        }
        if opts.options.relax_all && opts.file_kind != FileKind::Object {
            self.diags
                .warning("relax-all ignored: output is not an object file");
        }
        if opts.options.float_abi == FloatAbi::Soft {
            self.diags
                .warning("soft float ABI ignored: the target always uses its hardware float ABI");
        }
        if !opts.options.integrated_assembler {
            self.diags
                .warning("no-integrated-as ignored: object output is encoded directly");
        }
    }

    /// Write the module's textual rendering to `path`. Debugging output
    /// only; nothing reads it back.
    pub fn dump_ir(&self, module: &Module, path: &Path) -> BackendResult<()> {
        std::fs::write(path, module.to_string()).map_err(|source| {
            BackendError::Emission(EmissionError::Write {
                path: path.to_path_buf(),
                source,
            })
        })
    }

    /// Turn a compiled object into an executable with the system C compiler.
    ///
    /// Tries `cc`, `gcc` and `clang` in that order and uses the first one
    /// that exists. The C compiler is used rather than `ld` directly so the
    /// platform's startup files and default libraries come in for free.
    pub fn link(&self, artifact: &ObjectArtifact, exe: &Path) -> BackendResult<()> {
        const LINKERS: [&str; 3] = ["cc", "gcc", "clang"];

        for linker in LINKERS {
            let run = Command::new(linker)
                .arg(&artifact.path)
                .arg("-o")
                .arg(exe)
                .output();
            match run {
                Ok(out) if out.status.success() => {
                    info!("linked {} with {}", exe.display(), linker);
                    return Ok(());
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    return Err(BackendError::Link {
                        linker: linker.to_string(),
                        detail: format!("{}; {}", out.status, stderr.trim()),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(BackendError::Link {
                        linker: linker.to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }
        Err(BackendError::Link {
            linker: LINKERS.join(", "),
            detail: "no system C compiler found to drive the link".to_string(),
        })
    }

    /// Compile and link in one go.
    pub fn compile_and_link(
        &self,
        module: &mut Module,
        opts: &CompileOptions,
        object: &Path,
        exe: &Path,
    ) -> BackendResult<ObjectArtifact> {
        let artifact = self.compile(module, opts, object)?;
        self.link(&artifact, exe)?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{Linkage, Signature, Type};

    #[test]
    fn invalid_modules_never_reach_the_pipeline() {
        let mut mb = ModuleBuilder::new("broken");
        let fb = mb.define_function(
            "empty",
            Signature::new(Type::Void, vec![]),
            Linkage::External,
        );
        drop(fb); // entry block left without a terminator
        let mut module = mb.finish();

        let registry = BackendRegistry::with_native_backends();
        let diags = Diagnostics::new(Box::new(Vec::<u8>::new()));
        let driver = Driver::new(&registry, &diags);

        let out = std::env::temp_dir().join(format!("ingot-driver-test-{}.o", std::process::id()));
        let err = driver
            .compile(
                &mut module,
                &CompileOptions {
                    triple: "x86_64-unknown-linux-gnu".to_string(),
                    ..CompileOptions::default()
                },
                &out,
            )
            .unwrap_err();

        assert!(matches!(err, BackendError::Verification(_)));
        assert!(diags.error_count() > 0);
        assert!(!out.exists(), "verification failure must not create output");
    }
}
