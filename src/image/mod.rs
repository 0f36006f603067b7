//! kernel image mapping and segment lookup
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use goblin::mach::constants::cputype::CPU_TYPE_X86_64;
use goblin::mach::header::{SIZEOF_HEADER_32, SIZEOF_HEADER_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use goblin::Object;
use memmap2::{Mmap, MmapOptions};

pub const DEFAULT_KERNEL_PATH: &str = "/System/Library/Kernels/kernel";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to open {path} for reading: {source}")]
    OpenError { path: String, source: std::io::Error },

    #[error("Failed to stat({path}): {source}")]
    StatError { path: String, source: std::io::Error },

    #[error("Failed to map {path} to memory: {reason}")]
    MapError { path: String, reason: String },

    #[error("Goblin Error: {0}")]
    GoblinError(#[from] goblin::error::Error),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to get unslid kernel base address from binary")]
    NoSegment,
}

impl Error {
    /// Whether the failure comes from the host rather than the image contents
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            Error::OpenError { .. } | Error::StatError { .. } | Error::MapError { .. }
        )
    }
}

/// A read-only mapping of the on-disk kernel, unmapped on drop
pub struct KernelImage {
    path: PathBuf,
    map: Mmap,
}

impl KernelImage {
    pub fn open(path: impl AsRef<Path>) -> Result<KernelImage, Error> {
        let path = path.as_ref().to_path_buf();
        let shown = || path.display().to_string();

        let file = File::open(&path)
            .map_err(|source| Error::OpenError { path: shown(), source })?;
        let len = file.metadata()
            .map_err(|source| Error::StatError { path: shown(), source })?
            .len();
        if len == 0 {
            return Err(Error::MapError { path: shown(), reason: "file is empty".into() });
        }

        let map = unsafe { MmapOptions::new().map(&file) }
            .map_err(|e| Error::MapError { path: shown(), reason: e.to_string() })?;

        Ok(KernelImage { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn segment(&self) -> Result<Segment, Error> {
        locate_segment(&self.map)
    }
}

impl Deref for KernelImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

/// Link-time placement of the first loadable segment of a kernel image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

fn segname(raw: &[u8; 16]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn first_macho_segment(macho: &MachO) -> Result<Segment, Error> {
    let header_size = if macho.is_64 { SIZEOF_HEADER_64 } else { SIZEOF_HEADER_32 };
    let table_end = header_size + macho.header.sizeofcmds as usize;

    for lc in macho.load_commands.iter() {
        if lc.offset < header_size || lc.offset + lc.command.cmdsize() > table_end {
            break;
        }
        match &lc.command {
            CommandVariant::Segment64(seg) => {
                return Ok(Segment {
                    name: segname(&seg.segname),
                    base: seg.vmaddr,
                    size: seg.vmsize,
                })
            }
            CommandVariant::Segment32(seg) => {
                return Ok(Segment {
                    name: segname(&seg.segname),
                    base: seg.vmaddr as u64,
                    size: seg.vmsize as u64,
                })
            }
            _ => {}
        }
    }
    Err(Error::NoSegment)
}

fn first_elf_segment(elf: &Elf) -> Result<Segment, Error> {
    elf.program_headers
        .iter()
        .find(|ph| ph.p_type == PT_LOAD)
        .map(|ph| Segment {
            name: "PT_LOAD".to_string(),
            base: ph.p_vaddr,
            size: ph.p_memsz,
        })
        .ok_or(Error::NoSegment)
}

/// Find the unslid base address and size of the first segment in `data`
///
/// Universal Mach-O images are narrowed to their x86_64 slice first.
pub fn locate_segment(data: &[u8]) -> Result<Segment, Error> {
    match Object::parse(data)? {
        Object::Mach(Mach::Binary(macho)) => first_macho_segment(&macho),
        Object::Mach(Mach::Fat(fat)) => {
            let arch = fat.find_cputype(CPU_TYPE_X86_64)?.ok_or_else(|| {
                Error::UnsupportedFormat("universal image without an x86_64 slice".into())
            })?;
            let macho = MachO::parse(arch.slice(data), 0)?;
            first_macho_segment(&macho)
        }
        Object::Elf(elf) => first_elf_segment(&elf),
        Object::Unknown(magic) => Err(Error::UnsupportedFormat(format!("magic {magic:#x}"))),
        _ => Err(Error::UnsupportedFormat("not a Mach-O or ELF kernel".into())),
    }
}
