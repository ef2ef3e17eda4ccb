#![no_std]
#![no_main]

demos::entry!(main);

extern "C" fn main() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}
