//! Hello-world demo driver.
//!
//! Builds the canonical module in memory (a `main` that hands a constant
//! string to `puts` and returns 0), compiles it for the requested target and
//! optionally links the object into an executable. Every compilation knob is
//! exposed as a flag so the one demo module can exercise each configuration
//! path.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ingot::diagnostics::Diagnostics;
use ingot::driver::{CompileOptions, Driver};
use ingot::ir::builder::ModuleBuilder;
use ingot::ir::{Linkage, Signature, Type};
use ingot::target::registry::BackendRegistry;
use ingot::target::{CodeModel, FileKind, FloatAbi, OptLevel, RelocModel, TargetOptions};
use ingot::{BackendResult, Module};

#[derive(Parser)]
#[command(
    name = "ingot-hello",
    about = "Compile the built-in hello-world module to a native object file"
)]
struct Args {
    /// Target triple; empty selects the host.
    #[arg(long, default_value = "")]
    triple: String,

    /// Target CPU name.
    #[arg(long, default_value = "generic")]
    cpu: String,

    /// Comma-separated target feature string.
    #[arg(long, default_value = "")]
    features: String,

    /// Relocation model: default, static, pic or dynamic-no-pic.
    #[arg(long, default_value = "default")]
    relocation_model: RelocModel,

    /// Code model: default, small, kernel, medium or large.
    #[arg(long, default_value = "default")]
    code_model: CodeModel,

    /// Optimization level: none, less, default or aggressive (0-3).
    #[arg(long, default_value = "none")]
    opt_level: OptLevel,

    /// Float ABI: default, soft or hard.
    #[arg(long, default_value = "default")]
    float_abi: FloatAbi,

    /// Output kind: object or assembly.
    #[arg(long, default_value = "object")]
    filetype: FileKind,

    /// Path of the object file to write.
    #[arg(short, long, default_value = "hello.o")]
    output: PathBuf,

    /// Also write the module's textual IR to this path before compiling.
    #[arg(long, value_name = "PATH")]
    emit_ir: Option<PathBuf>,

    /// Link the object into an executable at this path.
    #[arg(long, value_name = "PATH")]
    exe: Option<PathBuf>,

    /// Relax all branches to long form.
    #[arg(long)]
    relax_all: bool,

    /// Do not use the integrated assembler.
    #[arg(long)]
    no_integrated_as: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let registry = BackendRegistry::with_native_backends();
    let diags = Diagnostics::stderr();
    let driver = Driver::new(&registry, &diags);

    match run(&driver, &args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            diags.error(err);
            ExitCode::FAILURE
        }
    }
}

fn run(driver: &Driver, args: &Args) -> BackendResult<()> {
    let mut module = hello_module();

    if let Some(path) = &args.emit_ir {
        driver.dump_ir(&module, path)?;
    }

    let opts = CompileOptions {
        triple: args.triple.clone(),
        cpu: args.cpu.clone(),
        features: args.features.clone(),
        reloc_model: args.relocation_model,
        code_model: args.code_model,
        opt_level: args.opt_level,
        file_kind: args.filetype,
        options: TargetOptions {
            float_abi: args.float_abi,
            relax_all: args.relax_all,
            integrated_assembler: !args.no_integrated_as,
        },
    };

    let artifact = driver.compile(&mut module, &opts, &args.output)?;
    println!(
        "wrote {} ({} bytes, {})",
        artifact.path.display(),
        artifact.size,
        artifact.format
    );

    if let Some(exe) = &args.exe {
        driver.link(&artifact, exe)?;
        println!("linked {}", exe.display());
    }
    Ok(())
}

/// `main() -> i64 { puts("Hello World!\n"); ret 0 }`
fn hello_module() -> Module {
    let mut mb = ModuleBuilder::new("hello");
    let text = mb.add_global_string("hello_str", "Hello World!\n");
    let puts = mb.declare_function("puts", Signature::new(Type::I32, vec![Type::Ptr]));

    let mut fb = mb.define_function("main", Signature::new(Type::I64, vec![]), Linkage::External);
    let addr = fb.global_addr(text);
    fb.call(puts, &[addr]);
    let zero = fb.iconst(Type::I64, 0);
    fb.ret(Some(zero));

    mb.finish()
}
