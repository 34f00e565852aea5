//! Relocatable object construction and the on-disk artifact.
//!
//! [`ObjectBuilder`] is a thin layer over `object::write::Object` that the
//! machine emitter feeds sections, symbols and relocations. [`ArtifactFile`]
//! owns the output path with remove-on-drop semantics: if the pipeline dies
//! mid-run, no truncated object is left on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use thiserror::Error;

use crate::error::EmissionError;
use crate::ir::Linkage;
use crate::target::ObjectFormat;

/// Failure while laying out the object file.
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("object file layout failed: {0}")]
    Layout(#[from] object::write::Error),
}

/// Relocation kinds the emitter can request against the text section.
///
/// On ELF x86-64 these map to `R_X86_64_PLT32`, `R_X86_64_PC32`,
/// `R_X86_64_32`, `R_X86_64_32S` and `R_X86_64_64` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Plt32,
    Pc32,
    Abs32,
    Abs32S,
    Abs64,
}

/// Accumulates one module's sections and symbols, then serializes them.
pub struct ObjectBuilder {
    obj: Object<'static>,
}

impl ObjectBuilder {
    pub fn new(format: ObjectFormat, arch: Architecture, module_name: &str) -> Self {
        let binary = match format {
            ObjectFormat::Elf => BinaryFormat::Elf,
            ObjectFormat::MachO => BinaryFormat::MachO,
            ObjectFormat::Coff => BinaryFormat::Coff,
        };
        let mut obj = Object::new(binary, arch, Endianness::Little);
        obj.add_file_symbol(module_name.as_bytes().to_vec());
        ObjectBuilder { obj }
    }

    /// Append `code` to `.text` and define a function symbol over it.
    /// Returns the symbol and the section offset the code landed at.
    pub fn define_text(&mut self, name: &str, linkage: Linkage, code: &[u8]) -> (SymbolId, u64) {
        let section = self.obj.section_id(StandardSection::Text);
        let offset = self.obj.append_section_data(section, code, 16);
        let symbol = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: scope_for(linkage),
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        (symbol, offset)
    }

    /// Append `data` to `.rodata` and define a data symbol over it.
    pub fn define_rodata(
        &mut self,
        name: &str,
        linkage: Linkage,
        data: &[u8],
        align: u64,
    ) -> (SymbolId, u64) {
        let section = self.obj.section_id(StandardSection::ReadOnlyData);
        let offset = self.obj.append_section_data(section, data, align.max(1));
        let symbol = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: data.len() as u64,
            kind: SymbolKind::Data,
            scope: scope_for(linkage),
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        (symbol, offset)
    }

    /// An undefined symbol the linker must resolve.
    pub fn declare_extern(&mut self, name: &str) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    /// Record a relocation in `.text` at `offset` against `symbol`.
    pub fn add_text_reloc(
        &mut self,
        offset: u64,
        symbol: SymbolId,
        kind: RelocKind,
        addend: i64,
    ) -> Result<(), ObjectError> {
        let flags = match kind {
            RelocKind::Plt32 => RelocationFlags::Generic {
                kind: RelocationKind::PltRelative,
                encoding: RelocationEncoding::X86Branch,
                size: 32,
            },
            RelocKind::Pc32 => RelocationFlags::Generic {
                kind: RelocationKind::Relative,
                encoding: RelocationEncoding::Generic,
                size: 32,
            },
            RelocKind::Abs32 => RelocationFlags::Generic {
                kind: RelocationKind::Absolute,
                encoding: RelocationEncoding::Generic,
                size: 32,
            },
            RelocKind::Abs32S => RelocationFlags::Generic {
                kind: RelocationKind::Absolute,
                encoding: RelocationEncoding::X86Signed,
                size: 32,
            },
            RelocKind::Abs64 => RelocationFlags::Generic {
                kind: RelocationKind::Absolute,
                encoding: RelocationEncoding::Generic,
                size: 64,
            },
        };
        let section = self.obj.section_id(StandardSection::Text);
        self.obj.add_relocation(
            section,
            Relocation {
                offset,
                symbol,
                addend,
                flags,
            },
        )?;
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>, ObjectError> {
        Ok(self.obj.write()?)
    }
}

fn scope_for(linkage: Linkage) -> SymbolScope {
    match linkage {
        Linkage::External => SymbolScope::Dynamic,
        Linkage::Internal => SymbolScope::Compilation,
    }
}

/// The output file, removed on drop unless [`ArtifactFile::keep`] was
/// called.
pub struct ArtifactFile {
    path: PathBuf,
    file: Option<File>,
    kept: bool,
}

impl ArtifactFile {
    pub fn create(path: &Path) -> Result<Self, EmissionError> {
        let file = File::create(path).map_err(|source| EmissionError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ArtifactFile {
            path: path.to_path_buf(),
            file: Some(file),
            kept: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), EmissionError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes).map_err(|source| EmissionError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Flush and release the file, keeping it on disk.
    pub fn keep(mut self) -> Result<PathBuf, EmissionError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|source| EmissionError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        self.kept = true;
        Ok(self.path.clone())
    }
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        if !self.kept {
            // Close before removing so this also behaves on Windows.
            self.file.take();
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// What a successful pipeline run produced.
#[derive(Debug, Clone)]
pub struct ObjectArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub format: ObjectFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ingot-emit-{}-{name}", std::process::id()))
    }

    #[test]
    fn artifact_is_removed_unless_kept() {
        let path = scratch_path("drop.o");
        {
            let mut artifact = ArtifactFile::create(&path).unwrap();
            artifact.write_all(b"partial").unwrap();
        }
        assert!(!path.exists());

        let kept = {
            let mut artifact = ArtifactFile::create(&path).unwrap();
            artifact.write_all(b"done").unwrap();
            artifact.keep().unwrap()
        };
        assert!(kept.exists());
        assert_eq!(fs::read(&kept).unwrap(), b"done");
        fs::remove_file(&kept).unwrap();
    }

    #[test]
    fn builder_defines_symbols_and_relocs() {
        let mut builder = ObjectBuilder::new(ObjectFormat::Elf, Architecture::X86_64, "m");
        let code = [0xc3u8];
        let (_, offset) = builder.define_text("f", Linkage::External, &code);
        let callee = builder.declare_extern("g");
        builder
            .add_text_reloc(offset, callee, RelocKind::Plt32, -4)
            .unwrap();
        let bytes = builder.finish().unwrap();

        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &code);
        assert!(file.symbols().any(|s| s.name() == Ok("f")));
        assert!(file
            .symbols()
            .any(|s| s.name() == Ok("g") && s.is_undefined()));
        assert_eq!(text.relocations().count(), 1);
    }
}
