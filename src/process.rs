// process.rs
// The process record and the fixed-capacity pool of them
//
// A process record is exactly one page: the trap stub jumps `sp` to
// `record_base + PAGE_SIZE` using a compile-time constant, so the record's
// size and the offset of every field the stub touches (`saved`, `pc`,
// `fault_cause`, `magic`, `stack`) must be fixed and known at compile
// time. `ProcessHeader` mirrors every field of `Process` except `stack`;
// sizing `stack` as `PAGE_SIZE - size_of::<ProcessHeader>()` and asserting
// the total below is what gives us that guarantee on any target.

use core::mem::MaybeUninit;

use crate::cpu::NUM_SAVED_REGS;
use crate::elf::{self, ElfError};
use crate::list::Elem;
use crate::paging::{Paging, Table};
use crate::palloc::PageAllocator;

/// Cheap corruption guard the trap stub checks before trusting a
/// `mscratch` pointer.
pub const MAGIC: u16 = 0x242;

pub const NAME_LEN: usize = 16;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    Running,
    Ready,
    Blocked,
    Dying,
}

#[repr(C)]
struct ProcessHeader {
    allelem: Elem,
    elem: Elem,
    id: u16,
    name: [u8; NAME_LEN],
    state: ProcessState,
    saved: [u32; NUM_SAVED_REGS],
    pc: u32,
    fault_cause: u32,
    page_table: *mut Table,
    magic: u16,
}

const HEADER_BYTES: usize = core::mem::size_of::<ProcessHeader>();
pub const STACK_BYTES: usize = crate::palloc::PAGE_SIZE - HEADER_BYTES;

#[repr(C)]
pub struct Process {
    pub allelem: Elem,
    pub elem: Elem,
    pub id: u16,
    pub name: [u8; NAME_LEN],
    pub state: ProcessState,
    pub saved: [u32; NUM_SAVED_REGS],
    pub pc: u32,
    pub fault_cause: u32,
    pub page_table: *mut Table,
    pub magic: u16,
    pub stack: [u8; STACK_BYTES],
}

const _: () = assert!(core::mem::size_of::<Process>() == crate::palloc::PAGE_SIZE);

impl Process {
    /// Address one past the end of this record's kernel stack — the value
    /// the trap stub loads into `sp`/`fp` on entry.
    pub fn kernel_stack_top(&self) -> usize {
        self as *const Process as usize + crate::palloc::PAGE_SIZE
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("<invalid>")
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }
}

/// A mapping installed at process-creation time in addition to the ELF's
/// own LOAD segments (typically UART).
pub struct ExtraMapping {
    pub va: u32,
    pub phys: u64,
    pub r: bool,
    pub w: bool,
    pub x: bool,
}

#[derive(Debug)]
pub enum CreateError {
    Elf(ElfError),
    PoolExhausted,
}

impl From<ElfError> for CreateError {
    fn from(e: ElfError) -> Self {
        CreateError::Elf(e)
    }
}

/// Number of stack-growth pages reserved immediately below the initial
/// `sp` so the first few stack faults are cheap (the rest grows on
/// demand via the page-fault handler, per spec).
const INITIAL_STACK_PAGES: usize = 1;

pub const MAX_PROCESSES: usize = 4096;

/// Fixed-capacity pool the scheduler's `create` allocates out of. Process
/// records are never freed back to the pool (spec non-goal: memory
/// reclamation on process exit), so this is a simple bump allocator over
/// static storage rather than a freelist.
pub struct ProcessPool {
    records: [MaybeUninit<Process>; MAX_PROCESSES],
    next_free: usize,
    next_id: u16,
}

impl ProcessPool {
    pub const fn new() -> Self {
        ProcessPool {
            records: unsafe { MaybeUninit::uninit().assume_init() },
            next_free: 0,
            next_id: 1,
        }
    }

    /// Allocate the next record, give it a fresh id, and fully
    /// zero/initialise every field a caller can observe. Returns a raw
    /// pointer rather than a reference because the record outlives any
    /// borrow of the pool (it will be threaded onto intrusive lists that
    /// alias the pool for the kernel's lifetime).
    fn take_slot(&mut self) -> Option<*mut Process> {
        if self.next_free >= MAX_PROCESSES {
            return None;
        }
        let slot = &mut self.records[self.next_free];
        self.next_free += 1;
        let ptr = slot.as_mut_ptr();
        unsafe {
            (*ptr).allelem = Elem::new();
            (*ptr).elem = Elem::new();
            (*ptr).id = self.next_id;
            (*ptr).name = [0u8; NAME_LEN];
            (*ptr).state = ProcessState::Ready;
            (*ptr).saved = [0u32; NUM_SAVED_REGS];
            (*ptr).pc = 0;
            (*ptr).fault_cause = 0;
            (*ptr).page_table = core::ptr::null_mut();
            (*ptr).magic = MAGIC;
        }
        self.next_id = self.next_id.wrapping_add(1);
        Some(ptr)
    }

    /// Allocate a bare record without going through ELF loading. Only
    /// exposed for tests that exercise scheduler list transitions without
    /// needing a real address space.
    #[cfg(test)]
    pub fn take_bare_for_test(&mut self) -> Option<*mut Process> {
        self.take_slot()
    }

    /// Create a process from an embedded ELF image: allocate a record,
    /// build a fresh root page table, load the binary into it, install
    /// `mappings`, and stamp the record so the trap stub will accept it.
    ///
    /// The returned process starts in `ProcessState::Ready`; the caller
    /// (the scheduler) is responsible for placing it on the correct ready
    /// queue.
    pub fn create(
        &mut self,
        allocator: &mut PageAllocator,
        name: &str,
        binary: &[u8],
        mappings: &[ExtraMapping],
    ) -> Result<*mut Process, CreateError> {
        let ptr = self.take_slot().ok_or(CreateError::PoolExhausted)?;
        let mut paging = Paging::new(allocator);
        let root = paging.create_root();

        let entry = elf::load(&mut paging, root, binary)?;

        for m in mappings {
            paging.set_mapping(root, m.va, m.phys, m.r, m.w, m.x, true);
        }

        // Demand-grown user stack: map just the top page so the process
        // has somewhere to start; the fault handler grows the rest.
        let initial_sp = u32::MAX;
        for i in 0..INITIAL_STACK_PAGES {
            let va = initial_sp.wrapping_sub((crate::palloc::PAGE_SIZE * (i + 1)) as u32);
            let page_va = crate::palloc::align_down(va as usize, crate::palloc::PAGE_SIZE) as u32;
            paging.create_page(root, page_va, true, true, false, true);
        }

        unsafe {
            (*ptr).set_name(name);
            (*ptr).pc = entry;
            (*ptr).page_table = root;
            (*ptr).saved[crate::cpu::Reg::Sp as usize] = initial_sp;
            (*ptr).state = ProcessState::Ready;
            log::info!("created process {} '{}', entry=0x{:08x}", (*ptr).id, (*ptr).name_str(), entry);
        }
        Ok(ptr)
    }

    /// Create the idle process from its own embedded binary. Identical to
    /// `create` except the scheduler never places it on a ready queue.
    pub fn create_idle(
        &mut self,
        allocator: &mut PageAllocator,
        binary: &[u8],
    ) -> Result<*mut Process, CreateError> {
        self.create(allocator, "idle", binary, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_record_is_exactly_one_page() {
        assert_eq!(core::mem::size_of::<Process>(), crate::palloc::PAGE_SIZE);
    }

    #[test]
    fn stack_field_ends_at_page_boundary() {
        let offset = core::mem::offset_of!(Process, stack);
        assert_eq!(offset + STACK_BYTES, crate::palloc::PAGE_SIZE);
    }

    #[test]
    fn name_is_zero_padded_and_truncated() {
        let mut pool = ProcessPool::new();
        let ptr = pool.take_slot().unwrap();
        let p = unsafe { &mut *ptr };
        p.set_name("init");
        assert_eq!(p.name_str(), "init");
        assert_eq!(&p.name[4..], &[0u8; NAME_LEN - 4]);

        p.set_name("a_name_much_longer_than_sixteen_bytes");
        assert_eq!(p.name.len(), NAME_LEN);
    }

    #[test]
    fn fresh_slots_get_distinct_ids() {
        let mut pool = ProcessPool::new();
        let a = unsafe { &*pool.take_slot().unwrap() };
        let b = unsafe { &*pool.take_slot().unwrap() };
        assert_ne!(a.id, b.id);
    }
}
