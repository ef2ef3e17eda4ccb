#![no_std]
#![no_main]

use demos::uart_put;

demos::entry!(main);

extern "C" fn main() -> ! {
    loop {
        for _ in 0..1_000_000u32 {
            core::hint::spin_loop();
        }
        uart_put(b'B');
    }
}
