// Minimal preemptive microkernel for RV32IMA + Zicsr on QEMU `virt`.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

#[cfg(not(test))]
use core::panic::PanicInfo;

pub mod cpu;
pub mod elf;
pub mod list;
pub mod logger;
pub mod paging;
pub mod palloc;
pub mod process;
pub mod sched;
pub mod syscon;
pub mod timer;
pub mod trap;
pub mod uart;

use paging::Paging;
use palloc::PageAllocator;
use process::ExtraMapping;
use sched::Scheduler;
use trap::HandlerTable;

extern "C" {
    static _heap_start: u8;
    static _heap_size: u8;
}

/// UART's agreed-upon virtual address in every user process, per spec §6.
const USER_UART_VA: u32 = 0x5000;

/// All kernel-global, single-hart mutable state. The kernel never runs
/// concurrently on more than one hart (the boot assembly parks every hart
/// but 0), so a single `static mut` behind one accessor function is
/// sufficient; there is no SMP synchronisation story here (spec non-goal).
pub struct KernelState {
    pub allocator: PageAllocator,
    pub scheduler: Scheduler,
    pub handlers: HandlerTable,
}

static mut KERNEL: KernelState = KernelState {
    allocator: PageAllocator::new(),
    scheduler: Scheduler::new(),
    handlers: HandlerTable::new(),
};

/// # Safety
/// Must only be called after boot has parked every hart but 0: there is
/// no locking protecting this reference.
pub fn kernel_state() -> &'static mut KernelState {
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) }
}

static IDLE_BINARY: &[u8] = include_bytes!(env!("MICROKERNEL_IDLE_BIN"));
static INIT_BINARY: &[u8] = include_bytes!(env!("MICROKERNEL_INIT_BIN"));

/// Point `mtvec` at the trap stub in DIRECT mode. Broken out into its own
/// `#[cfg(not(test))]` function because the stub only exists under a real
/// target build (`trap::trap_stub` is defined by a `global_asm!` block
/// that is itself `#[cfg(not(test))]`); host test builds get a no-op so
/// `kinit`'s body doesn't need to branch on cfg internally.
#[cfg(not(test))]
unsafe fn install_trap_vector() {
    riscv::register::mtvec::write(trap::trap_stub as usize, riscv::register::mtvec::TrapMode::Direct);
}

#[cfg(test)]
unsafe fn install_trap_vector() {}

#[no_mangle]
extern "C" fn kinit(_fdtb_ptr: usize) -> ! {
    // Install the trap base before anything else can fault or interrupt.
    unsafe { install_trap_vector() };

    uart::Uart::new(uart::UART_BASE).init();
    logger::init();

    let heap_start = unsafe { core::ptr::addr_of!(_heap_start) as usize };
    let heap_size = unsafe { core::ptr::addr_of!(_heap_size) as usize };
    kernel_state().allocator.init(heap_start, heap_size);

    kernel_state()
        .handlers
        .register(trap::TrapKind::MachineTimerInterrupt, trap::timer_handler);
    kernel_state()
        .handlers
        .register(trap::TrapKind::LoadPageFault, page_fault_handler);
    kernel_state()
        .handlers
        .register(trap::TrapKind::StorePageFault, page_fault_handler);

    log::info!("handlers registered: timer, load-page-fault, store-page-fault");

    kernel_state()
        .scheduler
        .init(&mut kernel_state().allocator, IDLE_BINARY)
        .expect("failed to create idle process");

    let uart_mapping = ExtraMapping { va: USER_UART_VA, phys: uart::UART_BASE as u64, r: true, w: true, x: false };
    let init = kernel_state()
        .scheduler
        .create(&mut kernel_state().allocator, "init", INIT_BINARY, &[uart_mapping])
        .expect("failed to create init process");
    log::info!("init process created, entry=0x{:08x}", unsafe { (*init).pc });

    let wake = timer::offset(1);
    timer::set(wake);

    // Arm the machine-timer interrupt and enable M-mode interrupts
    // globally; everything up to here must be ready before the first
    // tick can land in `trap_handler`.
    unsafe {
        riscv::register::mie::set_mtimer();
        riscv::register::mstatus::set_mie();
    }

    launch(init);
}

/// Fault handler for load/store page faults: grows the user stack if the
/// fault falls within the stack-growth policy (spec §4.3), otherwise this
/// MVP treats it as an unrecoverable condition and panics (the intended
/// design, per spec §7, is to mark the process `Dying` instead).
fn page_fault_handler(running: &mut process::Process, fault_cause: usize) {
    let fault_addr = fault_cause as u32;
    let sp = running.saved[cpu::Reg::Sp as usize];
    if paging::should_grow_stack(fault_addr, sp) {
        let page_va = fault_addr & !(palloc::PAGE_SIZE as u32 - 1);
        log::info!("process {} growing stack: mapping page 0x{:08x}", running.id, page_va);
        let mut paging = Paging::new(&mut kernel_state().allocator);
        paging.create_page(running.page_table, page_va, true, true, false, true);
    } else {
        panic!("unrecoverable page fault at 0x{:08x}, sp=0x{:08x}", fault_addr, sp);
    }
}

/// One-shot, non-trap-mediated entry into user mode for the very first
/// process. Never returns.
fn launch(init: *mut process::Process) -> ! {
    unsafe {
        let paging = Paging::new(&mut kernel_state().allocator);
        paging.enable((*init).page_table);

        core::arch::asm!(
            "csrw mscratch, {running}",
            "csrw mepc, {pc}",
            "csrc mstatus, {mpp_mask}",
            "mv t6, {running}",
            "addi t6, t6, {saved_off}",
            // Disable PMP: one NAPOT region spanning the full address
            // space with R/W/X set, so U-mode isn't denied by default
            // (with zero PMP entries configured, M-mode always passes
            // but S/U-mode accesses are denied until something matches).
            "li t0, 0xFFFFFFFF",
            "csrw pmpaddr0, t0",
            "li t0, 0x1F",
            "csrw pmpcfg0, t0",
            "lw ra,   0*4(t6)",
            "lw sp,   1*4(t6)",
            "lw gp,   2*4(t6)",
            "lw tp,   3*4(t6)",
            "lw t0,   4*4(t6)",
            "lw t1,   5*4(t6)",
            "lw t2,   6*4(t6)",
            "lw s0,   7*4(t6)",
            "lw s1,   8*4(t6)",
            "lw a0,   9*4(t6)",
            "lw a1,  10*4(t6)",
            "lw a2,  11*4(t6)",
            "lw a3,  12*4(t6)",
            "lw a4,  13*4(t6)",
            "lw a5,  14*4(t6)",
            "lw a6,  15*4(t6)",
            "lw a7,  16*4(t6)",
            "lw s2,  17*4(t6)",
            "lw s3,  18*4(t6)",
            "lw s4,  19*4(t6)",
            "lw s5,  20*4(t6)",
            "lw s6,  21*4(t6)",
            "lw s7,  22*4(t6)",
            "lw s8,  23*4(t6)",
            "lw s9,  24*4(t6)",
            "lw s10, 25*4(t6)",
            "lw s11, 26*4(t6)",
            "lw t3,  27*4(t6)",
            "lw t4,  28*4(t6)",
            "lw t5,  29*4(t6)",
            "lw t6,  30*4(t6)",
            "mret",
            running = in(reg) init,
            pc = in(reg) (*init).pc,
            mpp_mask = const 3usize << 11,
            saved_off = const core::mem::offset_of!(process::Process, saved),
            options(noreturn)
        );
    }
}

#[no_mangle]
extern "C" fn kinit_hart(_hartid: usize) {
    // Non-zero harts park in WFI in the boot assembly; nothing to do
    // here until SMP is in scope (non-goal).
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        crate::println!("panic at {}:{}: {}", location.file(), location.line(), info.message());
    } else {
        crate::println!("panic (no location information)");
    }
    syscon::poweroff();
}
