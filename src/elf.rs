// elf.rs
// Static ELF32 loader
//
// Only what a statically-linked RV32IMAC executable needs: no relocation,
// no dynamic section, no symbol table. PT_LOAD segments are copied into a
// fresh address space one freshly mapped physical page at a time, since a
// segment's bytes need not be contiguous in the physical pages backing it.

use core::fmt;

use crate::paging::{phys_to_ptr, Paging, Table};
use crate::palloc::PAGE_SIZE;

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const DATA_LE: u8 = 1;
const EI_VERSION_CURRENT: u8 = 1;
const EM_RISCV: u16 = 0x00f3;
const ET_EXEC: u16 = 2;
const EV_CURRENT: u32 = 1;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    InvalidMagic,
    UnsupportedBinary,
    SegmentOffsetOutsideBinary,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::InvalidMagic => write!(f, "not an ELF image"),
            ElfError::UnsupportedBinary => write!(f, "unsupported ELF binary"),
            ElfError::SegmentOffsetOutsideBinary => write!(f, "segment offset outside binary"),
        }
    }
}

struct Ehdr {
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_flags: u32,
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

fn read_u16(bin: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bin.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(bin: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bin.get(off..off + 4)?.try_into().ok()?))
}

fn parse_ehdr(bin: &[u8]) -> Result<Ehdr, ElfError> {
    if bin.len() < EHDR_SIZE {
        return Err(ElfError::InvalidMagic);
    }
    if bin[0..4] != MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    let class = bin[4];
    let data = bin[5];
    let ident_version = bin[6];
    if class != CLASS_32 || data != DATA_LE || ident_version != EI_VERSION_CURRENT {
        return Err(ElfError::UnsupportedBinary);
    }

    let e_type = read_u16(bin, 16).ok_or(ElfError::InvalidMagic)?;
    let e_machine = read_u16(bin, 18).ok_or(ElfError::InvalidMagic)?;
    let e_version = read_u32(bin, 20).ok_or(ElfError::InvalidMagic)?;
    if e_machine != EM_RISCV || e_version != EV_CURRENT || e_type != ET_EXEC {
        return Err(ElfError::UnsupportedBinary);
    }

    Ok(Ehdr {
        e_entry: read_u32(bin, 24).ok_or(ElfError::InvalidMagic)?,
        e_phoff: read_u32(bin, 28).ok_or(ElfError::InvalidMagic)?,
        e_phentsize: read_u16(bin, 42).ok_or(ElfError::InvalidMagic)?,
        e_phnum: read_u16(bin, 44).ok_or(ElfError::InvalidMagic)?,
    })
}

fn parse_phdr(bin: &[u8], off: usize) -> Result<Phdr, ElfError> {
    let end = off.checked_add(PHDR_SIZE).ok_or(ElfError::SegmentOffsetOutsideBinary)?;
    if end > bin.len() {
        return Err(ElfError::SegmentOffsetOutsideBinary);
    }
    Ok(Phdr {
        p_type: read_u32(bin, off).unwrap(),
        p_offset: read_u32(bin, off + 4).unwrap(),
        p_vaddr: read_u32(bin, off + 8).unwrap(),
        p_filesz: read_u32(bin, off + 16).unwrap(),
        p_flags: read_u32(bin, off + 24).unwrap(),
    })
}

/// Copy `segment[0..filesz]` from `bin` at `p_offset` into the address
/// space rooted at `root`, starting at virtual address `vaddr`, mapping
/// fresh pages as needed. Splits the copy at every page boundary so each
/// `memcpy` call targets a single physical page (the source range in
/// `bin` need not itself be page-aligned).
fn copy_segment(
    paging: &mut Paging,
    root: *mut Table,
    bin: &[u8],
    p_offset: u32,
    vaddr: u32,
    filesz: u32,
    r: bool,
    w: bool,
    x: bool,
) -> Result<(), ElfError> {
    let start = p_offset as usize;
    let end = start
        .checked_add(filesz as usize)
        .ok_or(ElfError::SegmentOffsetOutsideBinary)?;
    if end > bin.len() {
        return Err(ElfError::SegmentOffsetOutsideBinary);
    }

    let mut copied: u32 = 0;
    while copied < filesz {
        let va = vaddr.wrapping_add(copied);
        let page_base = va & !(PAGE_SIZE as u32 - 1);
        let page_off = va - page_base;
        let room_in_page = PAGE_SIZE as u32 - page_off;
        let chunk = (filesz - copied).min(room_in_page);

        let phys = paging.create_page(root, page_base, r, w, x, true);
        let dest_base = phys_to_ptr(phys);
        let dest = unsafe { dest_base.add(page_off as usize) };
        let src = &bin[start + copied as usize..start + copied as usize + chunk as usize];
        unsafe { crate::cpu::memcpy(dest, src.as_ptr(), chunk as usize) };

        copied += chunk;
    }
    Ok(())
}

/// Load a static ELF32 RV32 executable into `root`, returning its entry
/// point. See spec §4.4 for the exact validation sequence.
pub fn load(paging: &mut Paging, root: *mut Table, bin: &[u8]) -> Result<u32, ElfError> {
    let ehdr = parse_ehdr(bin)?;

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let ph = parse_phdr(bin, off)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        let perms = ph.p_flags & (PF_R | PF_W | PF_X);
        if perms == 0 {
            continue;
        }
        let mut r = ph.p_flags & PF_R != 0;
        let w = ph.p_flags & PF_W != 0;
        let x = ph.p_flags & PF_X != 0;
        if w && !r {
            r = true;
        }
        if ph.p_filesz > 0 {
            copy_segment(paging, root, bin, ph.p_offset, ph.p_vaddr, ph.p_filesz, r, w, x)?;
        }
        // p_memsz > p_filesz: BSS growth left unmapped in this MVP.
    }

    Ok(ehdr.e_entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palloc::PageAllocator;

    extern crate std;
    use std::boxed::Box;
    use std::vec::Vec;

    fn build_ehdr(e_entry: u32, phoff: u32, phnum: u16) -> [u8; EHDR_SIZE] {
        let mut h = [0u8; EHDR_SIZE];
        h[0..4].copy_from_slice(&MAGIC);
        h[4] = CLASS_32;
        h[5] = DATA_LE;
        h[6] = EI_VERSION_CURRENT;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        h[20..24].copy_from_slice(&EV_CURRENT.to_le_bytes());
        h[24..28].copy_from_slice(&e_entry.to_le_bytes());
        h[28..32].copy_from_slice(&phoff.to_le_bytes());
        h[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        h[44..46].copy_from_slice(&phnum.to_le_bytes());
        h
    }

    fn build_phdr(p_type: u32, offset: u32, vaddr: u32, filesz: u32, flags: u32) -> [u8; PHDR_SIZE] {
        let mut p = [0u8; PHDR_SIZE];
        p[0..4].copy_from_slice(&p_type.to_le_bytes());
        p[4..8].copy_from_slice(&offset.to_le_bytes());
        p[8..12].copy_from_slice(&vaddr.to_le_bytes());
        p[16..20].copy_from_slice(&filesz.to_le_bytes());
        p[20..24].copy_from_slice(&filesz.to_le_bytes());
        p[24..28].copy_from_slice(&flags.to_le_bytes());
        p
    }

    fn new_allocator() -> (Box<[u8; PAGE_SIZE * 64]>, PageAllocator) {
        let region = Box::new([0u8; PAGE_SIZE * 64]);
        let start = region.as_ptr() as usize;
        let mut pa = PageAllocator::new();
        pa.init(start, PAGE_SIZE * 64);
        (region, pa)
    }

    #[test]
    fn rejects_bad_magic() {
        let bin = [0u8; EHDR_SIZE].to_vec();
        assert_eq!(parse_ehdr(&bin).unwrap_err(), ElfError::InvalidMagic);
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut bin = build_ehdr(0x1000, EHDR_SIZE as u32, 0).to_vec();
        bin[18..20].copy_from_slice(&0xBEEFu16.to_le_bytes());
        assert_eq!(parse_ehdr(&bin).unwrap_err(), ElfError::UnsupportedBinary);
    }

    #[test]
    fn loads_single_segment_and_copies_bytes() {
        let (_region, mut pa) = new_allocator();
        let mut paging = Paging::new(&mut pa);
        let root = paging.create_root();

        let payload: &[u8] = b"hello, kernel!!!";
        let phoff = EHDR_SIZE as u32;
        let data_off = phoff + PHDR_SIZE as u32;
        let vaddr = 0x2000_0000u32;

        let mut bin = build_ehdr(vaddr, phoff, 1).to_vec();
        bin.extend_from_slice(&build_phdr(PT_LOAD, data_off, vaddr, payload.len() as u32, PF_R | PF_X));
        bin.extend_from_slice(payload);

        let entry = load(&mut paging, root, &bin).unwrap();
        assert_eq!(entry, vaddr);

        for (i, b) in payload.iter().enumerate() {
            let phys = paging.phys_from_virt(root, vaddr + i as u32).unwrap();
            let ptr = phys_to_ptr(phys);
            let byte = unsafe { ptr.read() };
            assert_eq!(byte, *b);
        }
    }

    #[test]
    fn segment_straddling_page_boundary_copies_correctly() {
        let (_region, mut pa) = new_allocator();
        let mut paging = Paging::new(&mut pa);
        let root = paging.create_root();

        let mut payload = Vec::new();
        for i in 0..(PAGE_SIZE + 64) {
            payload.push((i % 251) as u8);
        }
        let phoff = EHDR_SIZE as u32;
        let data_off = phoff + PHDR_SIZE as u32;
        let vaddr = 0x3000_0F00u32; // offset into a page, forces a split

        let mut bin = build_ehdr(vaddr, phoff, 1).to_vec();
        bin.extend_from_slice(&build_phdr(PT_LOAD, data_off, vaddr, payload.len() as u32, PF_R | PF_W));
        bin.extend_from_slice(&payload);

        load(&mut paging, root, &bin).unwrap();

        for (i, b) in payload.iter().enumerate() {
            let phys = paging.phys_from_virt(root, vaddr + i as u32).unwrap();
            let ptr = phys_to_ptr(phys);
            let byte = unsafe { ptr.read() };
            assert_eq!(byte, *b, "mismatch at offset {i}");
        }
    }

    #[test]
    fn skips_zero_permission_segments() {
        let (_region, mut pa) = new_allocator();
        let mut paging = Paging::new(&mut pa);
        let root = paging.create_root();

        let phoff = EHDR_SIZE as u32;
        let data_off = phoff + PHDR_SIZE as u32;
        let vaddr = 0x4000_0000u32;

        let mut bin = build_ehdr(0, phoff, 1).to_vec();
        bin.extend_from_slice(&build_phdr(PT_LOAD, data_off, vaddr, 4, 0));
        bin.extend_from_slice(&[1, 2, 3, 4]);

        load(&mut paging, root, &bin).unwrap();
        assert!(paging.phys_from_virt(root, vaddr).is_err());
    }

    #[test]
    fn out_of_range_segment_offset_is_rejected() {
        let (_region, mut pa) = new_allocator();
        let mut paging = Paging::new(&mut pa);
        let root = paging.create_root();

        let phoff = EHDR_SIZE as u32;
        let mut bin = build_ehdr(0, phoff, 1).to_vec();
        bin.extend_from_slice(&build_phdr(PT_LOAD, 0xFFFF_FF00, 0x1000, 16, PF_R));

        assert_eq!(
            load(&mut paging, root, &bin).unwrap_err(),
            ElfError::SegmentOffsetOutsideBinary
        );
    }
}
