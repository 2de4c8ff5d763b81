//! Architecture-specific context switching
//!
//! A fiber suspends by saving its callee-saved registers and loading the
//! worker's, and resumes by the converse. Only the System V callee-saved
//! set is switched; everything else is dead across the call boundary.

/// Saved registers for a voluntary switch (callee-saved per the
/// System V AMD64 ABI). Offsets are fixed for the assembly below.
#[repr(C)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{context_switch, init_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
