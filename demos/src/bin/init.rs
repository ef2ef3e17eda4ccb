#![no_std]
#![no_main]

use demos::uart_write_str;

demos::entry!(main);

extern "C" fn main() -> ! {
    uart_write_str("init: hello from user mode\r\n");
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}
