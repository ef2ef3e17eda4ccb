#![no_std]
#![no_main]

demos::entry!(main);

/// Jumps straight into unmapped memory, triggering an instruction page
/// fault (or access fault) on the very first fetch at the target — this
/// kernel's MVP has no handler for that path and panics, pending a
/// future `Dying`-state redesign that would kill the process instead.
extern "C" fn main() -> ! {
    unsafe {
        let bad: extern "C" fn() -> ! = core::mem::transmute(0xDEAD_0000usize);
        bad();
    }
}
