//! ELF64 validation and parsing for extension images
//!
//! Extensions are position-independent, statically linked, freestanding
//! executables with a deliberately narrow shape: exactly one read/execute
//! and one read/write PT_LOAD segment (never both W and X), a
//! non-executable PT_GNU_STACK, at most one PT_TLS of at most a page, at
//! most one RELA section holding only `R_X86_64_RELATIVE` relocations, and
//! none of the legacy `.init`/`.fini`/`.ctors`/`.dtors` machinery.
//! Everything outside that shape is refused as unsupported.
//!
//! All access into the file is checked span indexing; the walk itself is
//! the only bit-exact surface.

use crate::error;
use crate::status::{MkError, MkResult};
use heapless::Vec;
use nanovisor_hal::memory::PAGE_SIZE;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_SYSV: u8 = 0;

const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_TLS: u32 = 7;
pub const PT_GNU_STACK: u32 = 0x6474_E551;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

const SHT_RELA: u32 = 4;

const R_X86_64_RELATIVE: u32 = 8;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const RELA_SIZE: usize = 24;

const BANNED_SECTIONS: [&[u8]; 4] = [b".init", b".fini", b".ctors", b".dtors"];

/// One PT_LOAD or PT_TLS segment
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub flags: u32,
}

/// A `R_X86_64_RELATIVE` relocation: write `addend` at `offset`
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub offset: u64,
    pub addend: u64,
}

/// The parsed, validated image descriptor
pub struct ElfImage<'a> {
    file: &'a [u8],
    /// the entry point
    pub entry: u64,
    /// the PT_LOAD segments: one RX, one RW
    pub segments: Vec<Segment, 2>,
    /// the PT_TLS segment, if any
    pub tls: Option<Segment>,
    /// file offset and entry count of the RELA table, if any
    rela: Option<(usize, usize)>,
    /// vaddr and size of .eh_frame, honored and recorded
    pub eh_frame: Option<(u64, u64)>,
}

fn read_u16(file: &[u8], offset: usize) -> MkResult<u16> {
    let bytes = file.get(offset..offset + 2).ok_or(MkError::Unsupported)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(file: &[u8], offset: usize) -> MkResult<u32> {
    let bytes = file.get(offset..offset + 4).ok_or(MkError::Unsupported)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(file: &[u8], offset: usize) -> MkResult<u64> {
    let bytes = file.get(offset..offset + 8).ok_or(MkError::Unsupported)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl<'a> ElfImage<'a> {
    /// Validates `file` against the extension image constraints and
    /// returns its descriptor. Every violation is `MkError::Unsupported`.
    pub fn parse(file: &'a [u8]) -> MkResult<Self> {
        if file.len() < EHDR_SIZE {
            error!("ELF file is truncated");
            return Err(MkError::Unsupported);
        }

        if &file[0..4] != b"\x7FELF" {
            error!("not an ELF file");
            return Err(MkError::Unsupported);
        }

        if file[EI_CLASS] != ELFCLASS64
            || file[EI_DATA] != ELFDATA2LSB
            || file[EI_VERSION] != EV_CURRENT
            || file[EI_OSABI] != ELFOSABI_SYSV
        {
            error!("ELF ident is not 64-bit little-endian SysV");
            return Err(MkError::Unsupported);
        }

        if read_u16(file, 16)? != ET_DYN {
            error!("ELF type is not ET_DYN");
            return Err(MkError::Unsupported);
        }

        if read_u16(file, 18)? != EM_X86_64 {
            error!("ELF machine is not x86_64");
            return Err(MkError::Unsupported);
        }

        if read_u32(file, 20)? != u32::from(EV_CURRENT) {
            error!("ELF version is not 1");
            return Err(MkError::Unsupported);
        }

        if read_u32(file, 48)? != 0 {
            error!("ELF flags are not 0");
            return Err(MkError::Unsupported);
        }

        let entry = read_u64(file, 24)?;
        if entry == 0 {
            error!("ELF entry point is missing");
            return Err(MkError::Unsupported);
        }

        let mut image = Self {
            file,
            entry,
            segments: Vec::new(),
            tls: None,
            rela: None,
            eh_frame: None,
        };

        image.parse_phdrs()?;
        image.parse_shdrs()?;

        Ok(image)
    }

    fn parse_phdrs(&mut self) -> MkResult<()> {
        let file = self.file;

        let phoff = read_u64(file, 32)? as usize;
        let phentsize = read_u16(file, 54)? as usize;
        let phnum = read_u16(file, 56)? as usize;

        if phentsize != PHDR_SIZE || phnum == 0 {
            error!("ELF program header table is malformed");
            return Err(MkError::Unsupported);
        }

        let mut found_rx = false;
        let mut found_rw = false;
        let mut found_gnu_stack = false;

        for i in 0..phnum {
            let base = phoff + i * PHDR_SIZE;
            let p_type = read_u32(file, base)?;
            let p_flags = read_u32(file, base + 4)?;
            let seg = Segment {
                offset: read_u64(file, base + 8)?,
                vaddr: read_u64(file, base + 16)?,
                filesz: read_u64(file, base + 32)?,
                memsz: read_u64(file, base + 40)?,
                flags: p_flags,
            };

            match p_type {
                PT_LOAD => {
                    if (p_flags & PF_X) != 0 && (p_flags & PF_W) != 0 {
                        error!("ELF load segment is both writable and executable");
                        return Err(MkError::Unsupported);
                    }

                    if (p_flags & PF_X) != 0 {
                        if found_rx {
                            error!("ELF file has more than one RE load segment");
                            return Err(MkError::Unsupported);
                        }
                        found_rx = true;
                    } else if (p_flags & PF_W) != 0 {
                        if found_rw {
                            error!("ELF file has more than one RW load segment");
                            return Err(MkError::Unsupported);
                        }
                        found_rw = true;
                    } else {
                        error!("ELF load segment is neither RE nor RW");
                        return Err(MkError::Unsupported);
                    }

                    let file_end = seg.offset.checked_add(seg.filesz).ok_or(MkError::Unsupported)?;
                    if file_end > file.len() as u64 || seg.filesz > seg.memsz {
                        error!("ELF load segment does not fit its file");
                        return Err(MkError::Unsupported);
                    }

                    if read_u64(file, base + 48)? != PAGE_SIZE as u64 {
                        error!("ELF load segment alignment is not one page");
                        return Err(MkError::Unsupported);
                    }

                    self.segments.push(seg).map_err(|_| MkError::Unsupported)?;
                }
                PT_GNU_STACK => {
                    if (p_flags & PF_X) != 0 {
                        error!("executable stacks are not supported");
                        return Err(MkError::Unsupported);
                    }
                    found_gnu_stack = true;
                }
                PT_TLS => {
                    if self.tls.is_some() {
                        error!("ELF file has more than one TLS segment");
                        return Err(MkError::Unsupported);
                    }

                    if (p_flags & PF_X) != 0 {
                        error!("executable TLS blocks are not supported");
                        return Err(MkError::Unsupported);
                    }

                    let file_end = seg.offset.checked_add(seg.filesz).ok_or(MkError::Unsupported)?;
                    if file_end > file.len() as u64 || seg.memsz > PAGE_SIZE as u64 {
                        error!("ELF TLS segment is malformed");
                        return Err(MkError::Unsupported);
                    }

                    self.tls = Some(seg);
                }
                _ => {}
            }
        }

        if !found_rx || !found_rw {
            error!("ELF file needs exactly one RE and one RW load segment");
            return Err(MkError::Unsupported);
        }

        if !found_gnu_stack {
            error!("PT_GNU_STACK segment missing from ELF file");
            return Err(MkError::Unsupported);
        }

        Ok(())
    }

    fn parse_shdrs(&mut self) -> MkResult<()> {
        let file = self.file;

        let shoff = read_u64(file, 40)? as usize;
        if shoff == 0 {
            return Ok(());
        }

        let shentsize = read_u16(file, 58)? as usize;
        let shnum = read_u16(file, 60)? as usize;
        let shstrndx = read_u16(file, 62)? as usize;

        if shentsize != SHDR_SIZE || shstrndx >= shnum {
            error!("ELF section header table is malformed");
            return Err(MkError::Unsupported);
        }

        let strtab_off = read_u64(file, shoff + shstrndx * SHDR_SIZE + 24)? as usize;
        let strtab_size = read_u64(file, shoff + shstrndx * SHDR_SIZE + 32)? as usize;
        let strtab = file
            .get(strtab_off..strtab_off.checked_add(strtab_size).ok_or(MkError::Unsupported)?)
            .ok_or(MkError::Unsupported)?;

        for i in 0..shnum {
            let base = shoff + i * SHDR_SIZE;
            let sh_name = read_u32(file, base)? as usize;
            let sh_type = read_u32(file, base + 4)?;

            let name = section_name(strtab, sh_name);
            if BANNED_SECTIONS.iter().any(|&banned| name == banned) {
                error!("legacy init/fini sections are not supported");
                return Err(MkError::Unsupported);
            }

            if name == b".eh_frame" {
                let addr = read_u64(file, base + 16)?;
                let size = read_u64(file, base + 32)?;
                self.eh_frame = Some((addr, size));
            }

            if sh_type == SHT_RELA {
                if self.rela.is_some() {
                    error!("ELF file has more than one RELA section");
                    return Err(MkError::Unsupported);
                }

                let offset = read_u64(file, base + 24)? as usize;
                let size = read_u64(file, base + 32)? as usize;
                let entsize = read_u64(file, base + 56)? as usize;

                if entsize != RELA_SIZE || size % RELA_SIZE != 0 {
                    error!("ELF RELA section is malformed");
                    return Err(MkError::Unsupported);
                }

                let count = size / RELA_SIZE;
                for j in 0..count {
                    let r_info = read_u64(file, offset + j * RELA_SIZE + 8)?;
                    if (r_info & 0xFFFF_FFFF) as u32 != R_X86_64_RELATIVE {
                        error!("relocation type {:#x} is not supported", r_info);
                        return Err(MkError::Unsupported);
                    }
                }

                self.rela = Some((offset, count));
            }
        }

        Ok(())
    }

    /// Number of relocations in the RELA table.
    pub fn relocation_count(&self) -> usize {
        self.rela.map(|(_, count)| count).unwrap_or(0)
    }

    /// The i-th relocation.
    pub fn relocation(&self, i: usize) -> MkResult<Relocation> {
        let (offset, count) = self.rela.ok_or(MkError::Unsupported)?;
        if i >= count {
            return Err(MkError::Unsupported);
        }

        let base = offset + i * RELA_SIZE;
        Ok(Relocation {
            offset: read_u64(self.file, base)?,
            addend: read_u64(self.file, base + 16)?,
        })
    }

    /// The file bytes backing a segment.
    pub fn segment_bytes(&self, seg: &Segment) -> MkResult<&'a [u8]> {
        self.file
            .get(seg.offset as usize..(seg.offset + seg.filesz) as usize)
            .ok_or(MkError::Unsupported)
    }
}

fn section_name(strtab: &[u8], offset: usize) -> &[u8] {
    let Some(tail) = strtab.get(offset..) else {
        return &[];
    };

    match tail.iter().position(|&b| b == 0) {
        Some(end) => &tail[..end],
        None => tail,
    }
}
