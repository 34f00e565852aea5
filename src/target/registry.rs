//! Backend registration and target resolution.
//!
//! A [`BackendRegistry`] owns the set of available [`TargetBackend`]s and is
//! handed to the driver explicitly. Nothing registers itself through global
//! state; a host that only wants x86-64 constructs a registry with exactly
//! that backend and an unsupported triple fails resolution immediately.

use crate::codegen::BackendStages;
use crate::error::{BackendError, ConfigError};
use crate::target::machine::MachineConfig;
use crate::target::{DataLayout, FileKind, ObjectFormat, TargetTriple};

/// One native code generator, selectable by target triple.
///
/// A backend answers the static questions about a target (layout, object
/// format, producible outputs) and builds the stage set that compiles for
/// it. Implementations carry no per-module state.
pub trait TargetBackend {
    /// Short name used in diagnostics, e.g. `"x86-64"`.
    fn name(&self) -> &'static str;

    /// Whether this backend can compile for `triple`.
    fn supports(&self, triple: &TargetTriple) -> bool;

    /// The memory layout this backend guarantees for `triple`.
    fn data_layout(&self, triple: &TargetTriple) -> DataLayout;

    /// The container format objects for `triple` would use.
    fn object_format(&self, triple: &TargetTriple) -> ObjectFormat;

    /// The output kinds this backend can produce.
    fn supported_file_kinds(&self) -> &'static [FileKind];

    /// Reject configurations this backend cannot honor. Runs once at machine
    /// configuration; stages may assume a validated config.
    fn validate_config(&self, _config: &MachineConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Build the stage set for one compilation under `config`.
    fn create_stages(&self, config: &MachineConfig) -> Result<BackendStages, ConfigError>;
}

/// The backends available to one driver instance.
pub struct BackendRegistry {
    backends: Vec<Box<dyn TargetBackend>>,
}

impl BackendRegistry {
    /// An empty registry. Every resolution fails until backends are added.
    pub fn new() -> Self {
        BackendRegistry {
            backends: Vec::new(),
        }
    }

    /// A registry with every backend compiled into this crate.
    pub fn with_native_backends() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::x64::X64Backend));
        registry
    }

    pub fn register(&mut self, backend: Box<dyn TargetBackend>) {
        self.backends.push(backend);
    }

    /// Resolve a triple string to a backend. An empty string means the host.
    ///
    /// Triple parsing itself never fails; unrecognized components parse to
    /// their `Unknown` forms and simply match no backend. The error names
    /// the normalized triple.
    pub fn resolve(&self, triple: &str) -> Result<ResolvedTarget<'_>, BackendError> {
        let triple = if triple.is_empty() {
            TargetTriple::host()
        } else {
            TargetTriple::parse(triple)
        };
        match self.backends.iter().find(|b| b.supports(&triple)) {
            Some(backend) => Ok(ResolvedTarget {
                backend: backend.as_ref(),
                triple,
            }),
            None => Err(BackendError::UnknownTarget(triple.to_string())),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_native_backends()
    }
}

/// A triple paired with the backend that will compile for it.
pub struct ResolvedTarget<'r> {
    pub backend: &'r dyn TargetBackend,
    pub triple: TargetTriple,
}

impl std::fmt::Debug for ResolvedTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTarget")
            .field("backend", &self.backend.name())
            .field("triple", &self.triple)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Arch, Endian};

    struct Stub {
        name: &'static str,
        arch: Arch,
    }

    impl TargetBackend for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, triple: &TargetTriple) -> bool {
            triple.arch == self.arch
        }

        fn data_layout(&self, _triple: &TargetTriple) -> DataLayout {
            DataLayout {
                descriptor: "e".to_string(),
                endian: Endian::Little,
                pointer_size: 8,
                pointer_align: 8,
                stack_align: 16,
            }
        }

        fn object_format(&self, _triple: &TargetTriple) -> ObjectFormat {
            ObjectFormat::Elf
        }

        fn supported_file_kinds(&self) -> &'static [FileKind] {
            &[FileKind::Object]
        }

        fn create_stages(&self, _config: &MachineConfig) -> Result<BackendStages, ConfigError> {
            unimplemented!("stub backend builds no stages")
        }
    }

    #[test]
    fn unknown_triples_fail_resolution() {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(Stub {
            name: "a64",
            arch: Arch::Aarch64,
        }));
        let err = registry.resolve("sparc64-unknown-linux-gnu").unwrap_err();
        match err {
            BackendError::UnknownTarget(t) => assert!(t.starts_with("sparc64")),
            other => panic!("expected UnknownTarget, got {other}"),
        }
    }

    #[test]
    fn first_supporting_backend_wins() {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(Stub {
            name: "first",
            arch: Arch::X86_64,
        }));
        registry.register(Box::new(Stub {
            name: "second",
            arch: Arch::X86_64,
        }));
        let resolved = registry.resolve("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(resolved.backend.name(), "first");
        assert_eq!(resolved.triple.arch, Arch::X86_64);
    }

    #[test]
    fn empty_triple_means_the_host() {
        struct Everything;
        impl TargetBackend for Everything {
            fn name(&self) -> &'static str {
                "any"
            }
            fn supports(&self, _triple: &TargetTriple) -> bool {
                true
            }
            fn data_layout(&self, _triple: &TargetTriple) -> DataLayout {
                DataLayout {
                    descriptor: String::new(),
                    endian: Endian::Little,
                    pointer_size: 8,
                    pointer_align: 8,
                    stack_align: 16,
                }
            }
            fn object_format(&self, _triple: &TargetTriple) -> ObjectFormat {
                ObjectFormat::Elf
            }
            fn supported_file_kinds(&self) -> &'static [FileKind] {
                &[FileKind::Object]
            }
            fn create_stages(&self, _config: &MachineConfig) -> Result<BackendStages, ConfigError> {
                unimplemented!()
            }
        }

        let mut registry = BackendRegistry::new();
        registry.register(Box::new(Everything));
        let resolved = registry.resolve("").unwrap();
        assert_eq!(resolved.triple, TargetTriple::host());
    }
}
