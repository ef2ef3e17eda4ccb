// build.rs
// Links against memory.x and cross-builds the embedded user programs
// (from the `demos` workspace member) into ELF32 executables the kernel
// pulls in with `include_bytes!`.

use std::env;
use std::path::PathBuf;
use std::process::Command;

const TARGET_TRIPLE: &str = "riscv32ima-unknown-none-elf";

fn main() {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rustc-link-arg=-Tmemory.x");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let demos_dir = manifest_dir.join("demos");

    for name in ["idle", "init"] {
        let elf_path = build_demo(&demos_dir, name);
        let env_name = format!("MICROKERNEL_{}_BIN", name.to_uppercase());
        println!("cargo:rustc-env={}={}", env_name, elf_path.display());
        println!("cargo:rerun-if-changed={}", demos_dir.join("src").join(format!("{name}.rs")).display());
    }
}

/// Cross-build one demo binary and hand back its ELF path unmodified.
/// `elf::load` requires genuine ELF32 headers (spec §4.4/§6), so this
/// must not run the result through `objcopy -O binary` — that strips the
/// headers `elf::load` hard-requires and produces a flat image it would
/// reject with `InvalidMagic`.
fn build_demo(demos_dir: &PathBuf, name: &str) -> PathBuf {
    let status = Command::new("cargo")
        .args(["build", "--release", "--target", TARGET_TRIPLE, "--bin", name])
        .current_dir(demos_dir)
        .status()
        .unwrap_or_else(|e| panic!("failed to invoke cargo for demo `{name}`: {e}"));
    assert!(status.success(), "building demo `{name}` failed");

    demos_dir.join("target").join(TARGET_TRIPLE).join("release").join(name)
}
