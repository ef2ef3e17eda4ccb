// trap.rs
// Machine-mode trap stub, handler registry, and dispatch
//
// `mscratch` always points at the currently running `Process` record
// (except inside the save/restore brackets below). The stub trusts that
// pointer only after checking it against the kernel-heap range and the
// record's magic sentinel; a failure there means something has corrupted
// `mscratch` (most plausibly a user stack overflow) and we panic on the
// kernel stack rather than saving registers through a bad pointer.

use core::arch::global_asm;

use crate::cpu::NUM_SAVED_REGS;
use crate::process::Process;

/// Exceptions occupy 0..16; interrupts are OR'd with `INTERRUPT_BIT` (bit
/// 63 of `mcause`, folded down to a flag here since we only ever look at
/// the low 4 bits of the cause).
pub const INTERRUPT_BIT: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum TrapKind {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EcallFromU = 8,
    EcallFromS = 9,
    EcallFromM = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,

    SupervisorSoftwareInterrupt = 16 + 1,
    MachineSoftwareInterrupt = 16 + 3,
    SupervisorTimerInterrupt = 16 + 5,
    MachineTimerInterrupt = 16 + 7,
    SupervisorExternalInterrupt = 16 + 9,
    MachineExternalInterrupt = 16 + 11,
}

impl TrapKind {
    /// Decode `mcause`: bit 31 (RV32) is the interrupt flag, bits 3:0 are
    /// the cause number.
    pub fn decode(mcause: usize) -> Option<TrapKind> {
        let is_interrupt = mcause >> 31 & 1 == 1;
        let num = mcause & 0xf;
        let code = if is_interrupt { INTERRUPT_BIT + num } else { num };
        TrapKind::from_code(code)
    }

    fn from_code(code: usize) -> Option<TrapKind> {
        use TrapKind::*;
        Some(match code {
            0 => InstructionAddressMisaligned,
            1 => InstructionAccessFault,
            2 => IllegalInstruction,
            3 => Breakpoint,
            4 => LoadAddressMisaligned,
            5 => LoadAccessFault,
            6 => StoreAddressMisaligned,
            7 => StoreAccessFault,
            8 => EcallFromU,
            9 => EcallFromS,
            11 => EcallFromM,
            12 => InstructionPageFault,
            13 => LoadPageFault,
            15 => StorePageFault,
            x if x == 16 + 1 => SupervisorSoftwareInterrupt,
            x if x == 16 + 3 => MachineSoftwareInterrupt,
            x if x == 16 + 5 => SupervisorTimerInterrupt,
            x if x == 16 + 7 => MachineTimerInterrupt,
            x if x == 16 + 9 => SupervisorExternalInterrupt,
            x if x == 16 + 11 => MachineExternalInterrupt,
            _ => return None,
        })
    }

    fn slot(self) -> usize {
        self as usize
    }
}

const NUM_SLOTS: usize = 16 + 16;

pub type Handler = fn(&mut Process, fault_cause: usize);

/// One handler per trap kind. `register` panics on a duplicate
/// registration: two handlers racing for the same trap kind is a build
/// bug, not a runtime condition.
pub struct HandlerTable {
    handlers: [Option<Handler>; NUM_SLOTS],
}

impl HandlerTable {
    pub const fn new() -> Self {
        HandlerTable { handlers: [None; NUM_SLOTS] }
    }

    pub fn register(&mut self, kind: TrapKind, handler: Handler) {
        let slot = kind.slot();
        assert!(self.handlers[slot].is_none(), "duplicate handler registration for {:?}", kind);
        self.handlers[slot] = Some(handler);
    }

    pub fn get(&self, kind: TrapKind) -> Option<Handler> {
        self.handlers[kind.slot()]
    }
}

/// Called from the trap stub with the process that was interrupted.
/// `running.pc`/`running.fault_cause` have already been stamped from
/// `mepc`/`mtval` by the stub. Reads `mcause` itself, looks up and
/// invokes the registered handler (panicking if none is registered —
/// an unhandled trap kind is a kernel bug), then asks the scheduler for
/// the next process and installs its page table and `mscratch`.
///
/// # Safety
/// `running` must be a valid, page-sized `Process` record currently
/// installed in `mscratch` by the stub.
#[no_mangle]
pub unsafe extern "C" fn trap_handler(running: *mut Process) -> *mut Process {
    let mcause = riscv::register::mcause::read().bits();
    let kind = TrapKind::decode(mcause)
        .unwrap_or_else(|| panic!("unrecognised mcause 0x{:08x}", mcause));

    let handler = crate::kernel_state()
        .handlers
        .get(kind)
        .unwrap_or_else(|| panic!("no handler registered for {:?}", kind));

    handler(&mut *running, (*running).fault_cause as usize);

    let next = crate::kernel_state().scheduler.next(running);
    let paging = crate::paging::Paging::new(&mut crate::kernel_state().allocator);
    paging.enable((*next).page_table);
    next
}

/// Timer handler: spec §4.6. Mark the process `Ready` (the scheduler's
/// `next` call, driven from the stub's return path, will re-enqueue it)
/// and program the next tick.
pub fn timer_handler(running: &mut Process, _fault_cause: usize) {
    running.state = crate::process::ProcessState::Ready;
    let wake = crate::timer::offset(1);
    crate::timer::set(wake);
}

/// Panic path entered directly from the trap stub when `mscratch` fails
/// validation. Never returns.
#[no_mangle]
pub extern "C" fn invalid_running(pc: usize, bad_ptr: usize) -> ! {
    panic!("invalid running-process pointer 0x{:08x} at pc 0x{:08x}", bad_ptr, pc);
}

// ---------------------------------------------------------------------
// Hand-written trap stub
//
// Register save order matches `cpu::Reg` exactly: ra, sp, gp, tp, t0-t2,
// s0, s1, a0-a7, s2-s11, t3-t6 (31 registers) — every non-zero register
// in the file, so there is no register left over to use as a scratch
// for the `mscratch` validation dance without first getting its real
// value out of the way. `x31` (t6) is spilled to `sscratch`; `t4`/`t5`
// are spilled to `stvec`/`sepc`, two S-mode CSRs this kernel never uses
// for trap delivery (it runs entirely in M-mode), borrowed purely as
// scratch storage the same way `sscratch` is. All three are pulled back
// out and written into `saved[]` once the real save pass begins, so the
// trapped process's t4/t5/t6 round-trip untouched.
//
// Offsets into `Process` (`saved`, `pc`, `fault_cause`, `magic`,
// `stack`) are filled in by `process::offsets` at build time via the
// `offs` symbols below, since `core::mem::offset_of!` values aren't
// usable directly inside `global_asm!`.
// ---------------------------------------------------------------------

#[no_mangle]
pub static TRAP_SAVED_OFFSET: usize = core::mem::offset_of!(Process, saved);
#[no_mangle]
pub static TRAP_PC_OFFSET: usize = core::mem::offset_of!(Process, pc);
#[no_mangle]
pub static TRAP_FAULT_CAUSE_OFFSET: usize = core::mem::offset_of!(Process, fault_cause);
#[no_mangle]
pub static TRAP_MAGIC_OFFSET: usize = core::mem::offset_of!(Process, magic);
#[no_mangle]
pub static TRAP_PROCESS_SIZE: usize = crate::palloc::PAGE_SIZE;
#[no_mangle]
pub static TRAP_MAGIC_VALUE: usize = crate::process::MAGIC as usize;

#[cfg(not(test))]
global_asm!(
    r#"
.section .text
.align 2
.global trap_stub
trap_stub:
    csrw sscratch, t6
    csrr t6, mscratch

    // t4/t5 still hold the trapped process's real values here; park them
    // in unused S-mode CSRs before clobbering them for validation.
    csrw stvec, t4
    csrw sepc,  t5

    // Validate: high nibble of [base, base+size) must lie in [0x8,0xB],
    // and the record's magic sentinel must match.
    srli t5, t6, 28
    li   t4, 0x8
    blt  t5, t4, trap_stub_bad
    li   t4, 0xB
    bgt  t5, t4, trap_stub_bad

    li   t4, TRAP_PROCESS_SIZE
    add  t4, t6, t4
    addi t4, t4, -1
    srli t5, t4, 28
    li   t4, 0x8
    blt  t5, t4, trap_stub_bad
    li   t4, 0xB
    bgt  t5, t4, trap_stub_bad

    lhu  t4, TRAP_MAGIC_OFFSET(t6)
    li   t5, 0x242
    bne  t4, t5, trap_stub_bad

    // Save general-purpose registers into process->saved[], canonical
    // order. t4 is now free to use as the addressing register: its real
    // value is parked in stvec and gets written out below along with
    // t5 (sepc) and t6 (sscratch).
    mv   t4, t6
    addi t4, t4, TRAP_SAVED_OFFSET
    sw   ra,   0*4(t4)
    sw   sp,   1*4(t4)
    sw   gp,   2*4(t4)
    sw   tp,   3*4(t4)
    sw   t0,   4*4(t4)
    sw   t1,   5*4(t4)
    sw   t2,   6*4(t4)
    sw   s0,   7*4(t4)
    sw   s1,   8*4(t4)
    sw   a0,   9*4(t4)
    sw   a1,  10*4(t4)
    sw   a2,  11*4(t4)
    sw   a3,  12*4(t4)
    sw   a4,  13*4(t4)
    sw   a5,  14*4(t4)
    sw   a6,  15*4(t4)
    sw   a7,  16*4(t4)
    sw   s2,  17*4(t4)
    sw   s3,  18*4(t4)
    sw   s4,  19*4(t4)
    sw   s5,  20*4(t4)
    sw   s6,  21*4(t4)
    sw   s7,  22*4(t4)
    sw   s8,  23*4(t4)
    sw   s9,  24*4(t4)
    sw   s10, 25*4(t4)
    sw   s11, 26*4(t4)
    sw   t3,  27*4(t4)

    csrr t5, sscratch
    sw   t5,  30*4(t4)
    csrr t5, stvec
    sw   t5,  28*4(t4)
    csrr t5, sepc
    sw   t5,  29*4(t4)

    csrw mscratch, t6

    csrr t4, mepc
    sw   t4, TRAP_PC_OFFSET(t6)
    csrr t4, mtval
    sw   t4, TRAP_FAULT_CAUSE_OFFSET(t6)

    addi sp, t6, TRAP_PROCESS_SIZE
    mv   fp, sp

    mv   a0, t6
    call trap_handler
    mv   t6, a0

    csrw mscratch, t6
    lw   t4, TRAP_PC_OFFSET(t6)
    csrw mepc, t4

    addi t4, t6, TRAP_SAVED_OFFSET
    lw   ra,   0*4(t4)
    lw   sp,   1*4(t4)
    lw   gp,   2*4(t4)
    lw   tp,   3*4(t4)
    lw   t0,   4*4(t4)
    lw   t1,   5*4(t4)
    lw   t2,   6*4(t4)
    lw   s0,   7*4(t4)
    lw   s1,   8*4(t4)
    lw   a0,   9*4(t4)
    lw   a1,  10*4(t4)
    lw   a2,  11*4(t4)
    lw   a3,  12*4(t4)
    lw   a4,  13*4(t4)
    lw   a5,  14*4(t4)
    lw   a6,  15*4(t4)
    lw   a7,  16*4(t4)
    lw   s2,  17*4(t4)
    lw   s3,  18*4(t4)
    lw   s4,  19*4(t4)
    lw   s5,  20*4(t4)
    lw   s6,  21*4(t4)
    lw   s7,  22*4(t4)
    lw   s8,  23*4(t4)
    lw   s9,  24*4(t4)
    lw   s10, 25*4(t4)
    lw   s11, 26*4(t4)
    lw   t3,  27*4(t4)
    lw   t5,  29*4(t4)
    lw   t6,  30*4(t4)
    lw   t4,  28*4(t4)
    mret

trap_stub_bad:
    csrr a0, mepc
    mv   a1, t6
    call invalid_running
"#
);

extern "C" {
    /// Entry point installed in `mtvec` by `kinit`. Defined above in
    /// `global_asm!`; declared here so Rust code can take its address.
    pub fn trap_stub();
}

const _: () = assert!(NUM_SAVED_REGS == 31);
