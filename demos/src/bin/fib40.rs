#![no_std]
#![no_main]

demos::entry!(main);

fn fib(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.wrapping_add(b);
        a = b;
        b = next;
    }
    a
}

extern "C" fn main() -> ! {
    loop {
        let _ = core::hint::black_box(fib(40));
    }
}
