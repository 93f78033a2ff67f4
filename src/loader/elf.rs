use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{ExecError, LoadedImage, Loader};
use crate::config::{PAGE_SIZE, USER_SPACE_END};
use crate::error::SysError;
use crate::fs::{FileSystem, OpenFlags};
use crate::memory::address_space::AddressSpace;
use crate::memory::paging::MapPermission;
use crate::memory::{page_round_down, page_round_up, PhysMemory};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8    = 2;
const ELFDATA2LSB: u8   = 1;
const ET_EXEC: u16      = 2;
const EM_X86_64: u16    = 62;
const PT_LOAD: u32      = 1;
const PF_X: u32         = 1;
const PF_W: u32         = 2;

const EHDR_SIZE: usize  = 64;
const PHDR_SIZE: usize  = 56;

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE { return Err(ExecError::InvalidFormat); }
        if data[0..4] != ELF_MAGIC { return Err(ExecError::InvalidFormat); }
        if data[4] != ELFCLASS64 { return Err(ExecError::UnsupportedArch); }
        if data[5] != ELFDATA2LSB { return Err(ExecError::UnsupportedArch); }

        let e_type = le_u16(data, 16);
        let e_machine = le_u16(data, 18);
        if e_type != ET_EXEC { return Err(ExecError::UnsupportedType); }
        if e_machine != EM_X86_64 { return Err(ExecError::UnsupportedArch); }

        Ok(Elf64Ehdr {
            e_entry: le_u64(data, 24),
            e_phoff: le_u64(data, 32),
            e_phentsize: le_u16(data, 54),
            e_phnum: le_u16(data, 56),
        })
    }

    fn program_headers(&self, data: &[u8]) -> Result<Vec<Elf64Phdr>, ExecError> {
        if (self.e_phentsize as usize) < PHDR_SIZE && self.e_phnum > 0 {
            return Err(ExecError::InvalidFormat);
        }
        (0..self.e_phnum as usize)
            .map(|i| {
                let off = (self.e_phoff as usize)
                    .checked_add(i * self.e_phentsize as usize)
                    .ok_or(ExecError::InvalidFormat)?;
                Elf64Phdr::parse(data.get(off..).ok_or(ExecError::InvalidFormat)?)
            })
            .collect()
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE { return Err(ExecError::InvalidFormat); }
        Ok(Elf64Phdr {
            p_type: le_u32(data, 0),
            p_flags: le_u32(data, 4),
            p_offset: le_u64(data, 8),
            p_vaddr: le_u64(data, 16),
            p_filesz: le_u64(data, 32),
            p_memsz: le_u64(data, 40),
        })
    }

    fn permission(&self) -> MapPermission {
        let mut perm = MapPermission::U | MapPermission::R;
        if self.p_flags & PF_W != 0 { perm |= MapPermission::W; }
        if self.p_flags & PF_X != 0 { perm |= MapPermission::X; }
        perm
    }

    /// Checks the segment fits the file and user space.
    fn validate(&self, file_len: usize) -> Result<u64, ExecError> {
        if self.p_filesz > self.p_memsz { return Err(ExecError::BadSegment); }
        let file_end = self.p_offset.checked_add(self.p_filesz).ok_or(ExecError::BadSegment)?;
        if file_end > file_len as u64 { return Err(ExecError::BadSegment); }
        let end = self.p_vaddr.checked_add(self.p_memsz).ok_or(ExecError::BadSegment)?;
        if self.p_vaddr < PAGE_SIZE as u64 || end > USER_SPACE_END {
            return Err(ExecError::BadSegment);
        }
        Ok(end)
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF Loader
// ══════════════════════════════════════════════════════════════

/// Loads static ELF64 x86_64 executables from the file system.
pub struct ElfLoader {
    fs: Arc<dyn FileSystem>,
}

impl ElfLoader {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        ElfLoader { fs }
    }

    fn read_file_all(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let inode = self.fs.open(path, OpenFlags::RDONLY).map_err(|_| ExecError::FileNotFound)?;
        let mut data = Vec::new();
        let mut chunk = vec![0u8; PAGE_SIZE];
        loop {
            let n = inode.read_at(data.len(), &mut chunk).map_err(|_| ExecError::ReadError)?;
            if n == 0 { break; }
            data.extend_from_slice(&chunk[..n]);
        }
        if data.is_empty() { return Err(ExecError::InvalidFormat); }
        Ok(data)
    }
}

fn map_err(e: SysError) -> ExecError {
    match e {
        SysError::NoMemory => ExecError::MemoryError,
        _ => ExecError::BadSegment,
    }
}

impl Loader for ElfLoader {
    fn load(
        &self,
        path: &str,
        space: &mut AddressSpace,
        mem: &dyn PhysMemory,
    ) -> Result<LoadedImage, ExecError> {
        let file_data = self.read_file_all(path)?;
        let ehdr = Elf64Ehdr::parse(&file_data)?;
        let phdrs = ehdr.program_headers(&file_data)?;

        let mut load_end: u64 = 0;
        let mut loaded = 0;
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let seg_end = phdr.validate(file_data.len())?;
            load_end = load_end.max(seg_end);
            loaded += 1;

            let mut va = page_round_down(phdr.p_vaddr);
            while va < page_round_up(seg_end) {
                // Neighbouring segments may share a boundary page.
                if !space.is_mapped(va) {
                    space.map_page(va, phdr.permission(), mem).map_err(map_err)?;
                }
                va += PAGE_SIZE as u64;
            }

            let start = phdr.p_offset as usize;
            let bytes = &file_data[start..start + phdr.p_filesz as usize];
            space.write_kernel(mem, phdr.p_vaddr, bytes).map_err(map_err)?;
        }
        if loaded == 0 { return Err(ExecError::InvalidFormat); }

        log::debug!("ELF: '{}' loaded, entry={:#x} end={:#x}", path, ehdr.e_entry, load_end);
        Ok(LoadedImage { entry: ehdr.e_entry, image_end: page_round_up(load_end) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{elf_image, empty_space, phys_window, MemFs, Segment};
    use alloc::boxed::Box;

    fn fixture(image: Vec<u8>) -> (ElfLoader, &'static crate::memory::frame_allocator::FramePool) {
        let fs = Arc::new(MemFs::new());
        fs.add_file("/bin/prog", &image);
        let pool = Box::leak(Box::new(phys_window(64)));
        (ElfLoader::new(fs), pool)
    }

    #[test]
    fn loads_segments_with_their_permissions() {
        let image = elf_image(0x40_1000, &[
            Segment { vaddr: 0x40_1000, flags: PF_X | 4, data: b"\x90\x90\xc3", memsz: 3 },
            Segment { vaddr: 0x40_3000, flags: PF_W | 4, data: b"data", memsz: 0x2000 },
        ]);
        let (loader, pool) = fixture(image);
        let mut space = empty_space(pool);

        let img = loader.load("/bin/prog", &mut space, pool).unwrap();
        assert_eq!(img.entry, 0x40_1000);
        assert_eq!(img.image_end, 0x40_5000);

        let (_, text) = space.translate(0x40_1000).unwrap();
        assert!(text.contains(MapPermission::X) && !text.contains(MapPermission::W));
        let (_, data) = space.translate(0x40_3000).unwrap();
        assert!(data.contains(MapPermission::W) && !data.contains(MapPermission::X));

        let mut buf = [0xffu8; 8];
        space.copy_in(pool, &mut buf, 0x40_3000).unwrap();
        assert_eq!(&buf, b"data\0\0\0\0");
        // bss page is mapped and zeroed.
        space.copy_in(pool, &mut buf, 0x40_4ff8).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn rejects_missing_files_and_bad_headers() {
        let (loader, pool) = fixture(b"\x7fELF garbage".to_vec());
        let mut space = empty_space(pool);
        assert_eq!(loader.load("/nope", &mut space, pool), Err(ExecError::FileNotFound));
        assert_eq!(loader.load("/bin/prog", &mut space, pool), Err(ExecError::InvalidFormat));
    }

    #[test]
    fn rejects_segments_outside_user_space() {
        let image = elf_image(0x1000, &[
            Segment { vaddr: USER_SPACE_END - 0x1000, flags: 4, data: b"", memsz: 0x2000 },
        ]);
        let (loader, pool) = fixture(image);
        let mut space = empty_space(pool);
        assert_eq!(loader.load("/bin/prog", &mut space, pool), Err(ExecError::BadSegment));
    }

    #[test]
    fn image_without_load_segments_is_invalid() {
        let (loader, pool) = fixture(elf_image(0x1000, &[]));
        let mut space = empty_space(pool);
        assert_eq!(loader.load("/bin/prog", &mut space, pool), Err(ExecError::InvalidFormat));
    }
}
