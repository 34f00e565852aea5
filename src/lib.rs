//! Ingot - a small ahead-of-time native code generator.
//!
//! Ingot takes an in-memory IR module, verifies it, lowers it through a fixed
//! five-stage pipeline and writes a relocatable object file ready for the
//! system linker. The only implemented target is x86-64 System V emitting ELF
//! objects; the target surface is a trait so further backends plug into the
//! same driver.
//!
//! # Primary Usage
//!
//! ```ignore
//! use ingot::diagnostics::Diagnostics;
//! use ingot::driver::{CompileOptions, Driver};
//! use ingot::ir::builder::ModuleBuilder;
//! use ingot::target::registry::BackendRegistry;
//!
//! let mut mb = ModuleBuilder::new("demo");
//! // ... build functions and globals ...
//! let mut module = mb.finish();
//!
//! let registry = BackendRegistry::with_native_backends();
//! let diags = Diagnostics::stderr();
//! let driver = Driver::new(&registry, &diags);
//! let artifact = driver.compile(&mut module, &CompileOptions::default(), "demo.o".as_ref())?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - module representation, builder, printer and verifier
//! - [`target`] - triples, machine configuration and the backend registry
//! - [`codegen`] - the stage interfaces, pipeline and machine IR
//! - [`x64`] - the x86-64 implementation of the stages
//! - [`emit`] - object file construction and the output sink
//! - [`driver`] - the fixed compile/link sequence over all of the above

pub mod codegen;
pub mod diagnostics;
pub mod driver;
pub mod emit;
pub mod error;
pub mod ir;
pub mod target;
pub mod x64;

pub use diagnostics::Diagnostics;
pub use driver::{CompileOptions, Driver};
pub use emit::ObjectArtifact;
pub use error::{BackendError, BackendResult};
pub use ir::builder::ModuleBuilder;
pub use ir::Module;
pub use target::registry::BackendRegistry;
