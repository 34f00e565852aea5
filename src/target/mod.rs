//! Target descriptions: triples, codegen configuration enums and data layout.
//!
//! A [`TargetTriple`] is parsed from the canonical dashed form
//! (`arch-vendor-os-env`) and resolved against a [`registry::BackendRegistry`]
//! to find a backend that can generate code for it. The configuration enums
//! mirror the classic codegen surface: relocation model, code model,
//! optimization level, float ABI and output file kind.

pub mod machine;
pub mod registry;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::ir::Type;

pub use machine::{MachineConfig, TargetMachine};
pub use registry::{BackendRegistry, ResolvedTarget, TargetBackend};

/// Instruction set architecture of a triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
    PowerPc64,
    Unknown(String),
}

impl FromStr for Arch {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "x86_64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            "riscv64" => Self::Riscv64,
            "powerpc64" | "ppc64" => Self::PowerPc64,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Riscv64 => write!(f, "riscv64"),
            Self::PowerPc64 => write!(f, "powerpc64"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Vendor component of a triple. Mostly cosmetic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vendor {
    Unknown,
    Pc,
    Apple,
    Ibm,
    Other(String),
}

impl Vendor {
    fn parse_known(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "pc" => Some(Self::Pc),
            "apple" => Some(Self::Apple),
            "ibm" => Some(Self::Ibm),
            _ => None,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Pc => write!(f, "pc"),
            Self::Apple => write!(f, "apple"),
            Self::Ibm => write!(f, "ibm"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Operating system component of a triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    FreeBsd,
    NetBsd,
    Darwin,
    Windows,
    Aix,
    /// Bare metal, the `none` OS token.
    None,
    Unknown(String),
}

impl Os {
    fn parse_known(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(Self::Linux),
            "freebsd" => Some(Self::FreeBsd),
            "netbsd" => Some(Self::NetBsd),
            "darwin" | "macos" => Some(Self::Darwin),
            "windows" => Some(Self::Windows),
            "aix" => Some(Self::Aix),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::FreeBsd => write!(f, "freebsd"),
            Self::NetBsd => write!(f, "netbsd"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
            Self::Aix => write!(f, "aix"),
            Self::None => write!(f, "none"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Environment/ABI component of a triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Environment {
    Unknown,
    Gnu,
    Musl,
    Msvc,
    Other(String),
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Gnu => write!(f, "gnu"),
            Self::Musl => write!(f, "musl"),
            Self::Msvc => write!(f, "msvc"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl Environment {
    fn parse(s: &str) -> Self {
        match s {
            "unknown" => Self::Unknown,
            "gnu" => Self::Gnu,
            "musl" => Self::Musl,
            "msvc" => Self::Msvc,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A parsed target triple.
///
/// Parsing is lenient: unrecognized tokens land in the `Unknown`/`Other`
/// variants and resolution against the registry decides whether the triple is
/// actually usable. `Display` renders the canonical dashed form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetTriple {
    pub arch: Arch,
    pub vendor: Vendor,
    pub os: Os,
    pub env: Environment,
}

impl TargetTriple {
    /// Parse a dashed triple. Never fails structurally; unknown components
    /// are preserved as-is so error messages can echo them back.
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.split('-').collect();
        let arch = parts
            .first()
            .map(|p| Arch::from_str(p).unwrap_or_else(|_| Arch::Unknown(p.to_string())))
            .unwrap_or_else(|| Arch::Unknown(String::new()));

        let (vendor, os, env) = match parts.len() {
            0 | 1 => (Vendor::Unknown, Os::Unknown(String::new()), Environment::Unknown),
            2 => {
                let os = Os::parse_known(parts[1])
                    .unwrap_or_else(|| Os::Unknown(parts[1].to_string()));
                (Vendor::Unknown, os, Environment::Unknown)
            }
            3 => {
                // Either arch-vendor-os or arch-os-env.
                if let Some(vendor) = Vendor::parse_known(parts[1]) {
                    let os = Os::parse_known(parts[2])
                        .unwrap_or_else(|| Os::Unknown(parts[2].to_string()));
                    (vendor, os, Environment::Unknown)
                } else {
                    let os = Os::parse_known(parts[1])
                        .unwrap_or_else(|| Os::Unknown(parts[1].to_string()));
                    (Vendor::Unknown, os, Environment::parse(parts[2]))
                }
            }
            _ => {
                let vendor = Vendor::parse_known(parts[1])
                    .unwrap_or_else(|| Vendor::Other(parts[1].to_string()));
                let os = Os::parse_known(parts[2])
                    .unwrap_or_else(|| Os::Unknown(parts[2].to_string()));
                (vendor, os, Environment::parse(&parts[3..].join("-")))
            }
        };

        Self {
            arch,
            vendor,
            os,
            env,
        }
    }

    /// The triple of the machine this crate was compiled for.
    pub fn host() -> Self {
        let arch = if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else if cfg!(target_arch = "powerpc64") {
            Arch::PowerPc64
        } else {
            Arch::Unknown("unknown".to_string())
        };

        let (vendor, os, env) = if cfg!(target_os = "linux") {
            let env = if cfg!(target_env = "musl") {
                Environment::Musl
            } else {
                Environment::Gnu
            };
            (Vendor::Unknown, Os::Linux, env)
        } else if cfg!(target_os = "freebsd") {
            (Vendor::Unknown, Os::FreeBsd, Environment::Unknown)
        } else if cfg!(target_os = "netbsd") {
            (Vendor::Unknown, Os::NetBsd, Environment::Unknown)
        } else if cfg!(target_os = "macos") {
            (Vendor::Apple, Os::Darwin, Environment::Unknown)
        } else if cfg!(target_os = "windows") {
            (Vendor::Pc, Os::Windows, Environment::Msvc)
        } else {
            (
                Vendor::Unknown,
                Os::Unknown("unknown".to_string()),
                Environment::Unknown,
            )
        };

        Self {
            arch,
            vendor,
            os,
            env,
        }
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.vendor, self.os)?;
        if self.env != Environment::Unknown {
            write!(f, "-{}", self.env)?;
        }
        Ok(())
    }
}

/// A configuration flag string was not recognized.
#[derive(Error, Debug)]
#[error("unknown {kind} '{value}'")]
pub struct InvalidFlag {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! flag_enum {
    ($name:ident, $kind:literal, { $($token:literal $(| $alias:literal)* => $variant:ident),+ $(,)? }) => {
        impl FromStr for $name {
            type Err = InvalidFlag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($token $(| $alias)* => Ok(Self::$variant),)+
                    _ => Err(InvalidFlag {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $token),)+
                }
            }
        }
    };
}

/// How symbol addresses may be materialized in the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocModel {
    /// Resolved to the platform default at machine configuration.
    Default,
    Static,
    Pic,
    DynamicNoPic,
}

flag_enum!(RelocModel, "relocation model", {
    "default" => Default,
    "static" => Static,
    "pic" => Pic,
    "dynamic-no-pic" => DynamicNoPic,
});

/// Assumptions about how far apart code and data may live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeModel {
    Default,
    Small,
    Kernel,
    Medium,
    Large,
}

flag_enum!(CodeModel, "code model", {
    "default" => Default,
    "small" => Small,
    "kernel" => Kernel,
    "medium" => Medium,
    "large" => Large,
});

/// Requested optimization level. This system always runs the unoptimized
/// pipeline; anything above `None` is accepted and warned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    None,
    Less,
    Default,
    Aggressive,
}

flag_enum!(OptLevel, "optimization level", {
    "none" | "0" => None,
    "less" | "1" => Less,
    "default" | "2" => Default,
    "aggressive" | "3" => Aggressive,
});

/// Float ABI selection. Carried through the configuration; the x86-64
/// backend has a single hardware float ABI and warns on `Soft`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatAbi {
    Default,
    Soft,
    Hard,
}

flag_enum!(FloatAbi, "float ABI", {
    "default" => Default,
    "soft" => Soft,
    "hard" => Hard,
});

/// Kind of output the pipeline should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Assembly,
    Object,
}

flag_enum!(FileKind, "file type", {
    "assembly" | "asm" => Assembly,
    "object" | "obj" => Object,
});

/// Container format of the emitted object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    MachO,
    Coff,
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elf => write!(f, "ELF"),
            Self::MachO => write!(f, "Mach-O"),
            Self::Coff => write!(f, "COFF"),
        }
    }
}

/// Miscellaneous machine options carried alongside the model enums.
#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub float_abi: FloatAbi,
    /// Relax all branches to long form. Only meaningful for object output;
    /// requesting it for anything else draws a warning.
    pub relax_all: bool,
    pub integrated_assembler: bool,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            float_abi: FloatAbi::Default,
            relax_all: false,
            integrated_assembler: true,
        }
    }
}

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Memory layout assumptions the backend guarantees.
///
/// The descriptor string is the compact textual form; the parsed fields are
/// what lowering actually consumes. Attached to the module by the driver
/// before the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub descriptor: String,
    pub endian: Endian,
    /// Pointer size in bytes.
    pub pointer_size: u32,
    pub pointer_align: u32,
    pub stack_align: u32,
}

impl DataLayout {
    /// Size of a first-class type in bytes. `Void` has no size.
    pub fn type_size(&self, ty: Type) -> u32 {
        match ty {
            Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 => 4,
            Type::I64 => 8,
            Type::Ptr => self.pointer_size,
            Type::Void => 0,
        }
    }

    /// ABI alignment of a first-class type in bytes.
    pub fn type_align(&self, ty: Type) -> u32 {
        match ty {
            Type::Ptr => self.pointer_align,
            other => self.type_size(other).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_triple() {
        let t = TargetTriple::parse("x86_64-unknown-linux-gnu");
        assert_eq!(t.arch, Arch::X86_64);
        assert_eq!(t.vendor, Vendor::Unknown);
        assert_eq!(t.os, Os::Linux);
        assert_eq!(t.env, Environment::Gnu);
        assert_eq!(t.to_string(), "x86_64-unknown-linux-gnu");
    }

    #[test]
    fn parse_three_part_triples() {
        // vendor present
        let t = TargetTriple::parse("powerpc64-ibm-aix");
        assert_eq!(t.arch, Arch::PowerPc64);
        assert_eq!(t.vendor, Vendor::Ibm);
        assert_eq!(t.os, Os::Aix);

        // vendor omitted
        let t = TargetTriple::parse("x86_64-linux-musl");
        assert_eq!(t.vendor, Vendor::Unknown);
        assert_eq!(t.os, Os::Linux);
        assert_eq!(t.env, Environment::Musl);
    }

    #[test]
    fn parse_keeps_unknown_tokens() {
        let t = TargetTriple::parse("m68k-unknown-linux");
        assert_eq!(t.arch, Arch::Unknown("m68k".to_string()));
        assert_eq!(t.to_string(), "m68k-unknown-linux");
    }

    #[test]
    fn host_triple_is_parseable() {
        let host = TargetTriple::host();
        let reparsed = TargetTriple::parse(&host.to_string());
        assert_eq!(host, reparsed);
    }

    #[test]
    fn flag_parsing() {
        assert_eq!("pic".parse::<RelocModel>().unwrap(), RelocModel::Pic);
        assert_eq!(
            "dynamic-no-pic".parse::<RelocModel>().unwrap(),
            RelocModel::DynamicNoPic
        );
        assert_eq!("large".parse::<CodeModel>().unwrap(), CodeModel::Large);
        assert_eq!("0".parse::<OptLevel>().unwrap(), OptLevel::None);
        assert_eq!("obj".parse::<FileKind>().unwrap(), FileKind::Object);
        assert_eq!("asm".parse::<FileKind>().unwrap(), FileKind::Assembly);

        let err = "sloppy".parse::<RelocModel>().unwrap_err();
        assert_eq!(err.to_string(), "unknown relocation model 'sloppy'");
    }
}
