//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use super::SavedRegs;
use std::arch::naked_asm;

/// Initialize a new fiber's context.
///
/// Sets up the registers so that the first switch into them begins
/// execution in the entry trampoline, which calls `entry_fn(entry_arg)`
/// and then the fiber-finished hook.
///
/// # Safety
///
/// `regs` must point to valid SavedRegs memory and `stack_top` must be
/// the top of a live mapping.
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // The trampoline starts 16-byte aligned; its own `call`s then give
    // every callee the ABI-required entry alignment (rsp % 16 == 8).
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument, then the
/// termination hook. The hook switches away and never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym crate::fiber::fiber_finished,
    );
}

/// Switch contexts: save callee-saved registers into `old`, load from
/// `new`, and continue wherever `new` last saved.
///
/// # Safety
///
/// Both pointers must reference valid SavedRegs; `new` must have been
/// initialized by `init_context` or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the saved RIP
        "jmp rax",
        // Resume point for the context saved above
        "1:",
        "ret",
    );
}
