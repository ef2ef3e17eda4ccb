// cpu.rs
// RV32 register file layout and small CSR helpers
//
// The ordering in `Reg` is the trap stub's ABI: it is baked into the
// hand-written assembly in `trap.rs` as compile-time offsets into
// `Process::saved`. Changing the order here without changing the
// assembly is a silent, dangerous bug.

/// The frequency of the QEMU `virt` machine's `mtime` counter.
pub const FREQ: u64 = 10_000_000;
/// One second's worth of `mtime` ticks between preemptions.
pub const CONTEXT_SWITCH_TICKS: u64 = FREQ;

#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg {
    Ra = 0,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0, // 9
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2, // 17
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11, // 26
    T3,
    T4,
    T5,
    T6, // 30
}

/// Number of entries in `Process::saved`.
pub const NUM_SAVED_REGS: usize = 31;

/// `mstatus.MPP` privilege-mode encoding.
#[repr(usize)]
#[derive(Clone, Copy)]
pub enum CpuMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

/// `satp.MODE` field. Sv32 is the only mode this kernel ever installs.
#[repr(usize)]
#[derive(Clone, Copy)]
pub enum SatpMode {
    Off = 0,
    Sv32 = 1,
}

/// Build the 32-bit `satp` value for Sv32: bit 31 is MODE, bits 30:22 are
/// the 9-bit ASID, bits 21:0 are the PPN of the root page table.
pub const fn build_satp(mode: SatpMode, asid: usize, root_phys: usize) -> usize {
    (mode as usize) << 31 | (asid & 0x1ff) << 22 | (root_phys >> 12) & 0x3f_ffff
}

#[inline(always)]
pub fn mhartid_read() -> usize {
    riscv::register::mhartid::read()
}

#[inline(always)]
pub fn wfi() {
    unsafe { riscv::asm::wfi() };
}

#[inline(always)]
pub fn sfence_vma_all() {
    unsafe { riscv::asm::sfence_vma_all() };
}

/// Copy `bytes` from `src` to `dest`, one byte at a time. Used by the ELF
/// loader, which must never assume the two ranges are aligned the same
/// way (a segment copy can straddle a page boundary on one side and not
/// the other).
///
/// SAFETY: `dest` and `src` must each be valid for `bytes` reads/writes
/// and must not overlap.
pub unsafe fn memcpy(dest: *mut u8, src: *const u8, bytes: usize) {
    for i in 0..bytes {
        dest.add(i).write(src.add(i).read());
    }
}
