//! x86_64 context switching
//!
//! Inline assembly per the System V AMD64 ABI: rsp, rbx, rbp and r12-r15 are
//! callee-saved; the resume address is kept alongside them and jumped to
//! explicitly.

use std::arch::naked_asm;

/// Callee-saved register file, field offsets fixed by the asm below.
#[repr(C)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
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

/// Prepare a fresh context so the first switch into it runs
/// `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to writable `SavedRegs`; `stack_top` must be the high
/// end of a mapped stack region.
#[inline]
pub unsafe fn init(regs: *mut SavedRegs, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // 16-byte alignment per the ABI, minus 8 to model the return slot a
    // `call` would have pushed.
    let aligned_sp = ((stack_top as usize) & !0xF) - 8;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {returned}",
        "ud2",
        returned = sym super::entry_returned,
    );
}

/// Save callee-saved registers into `save` and resume from `load`.
///
/// Returns when some later switch restores `save`.
///
/// # Safety
///
/// Both pointers must be valid; `load` must hold a register file prepared by
/// `init` or by a previous switch out.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save to *rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from *rsi
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved side
        "1:",
        "ret",
    );
}

/// Read the time-stamp counter.
#[inline]
pub fn cycles() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}
