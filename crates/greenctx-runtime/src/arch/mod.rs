//! Architecture-specific context switching
//!
//! Each backend provides the same surface: a `SavedRegs` register file, an
//! `init` that prepares a fresh context to enter its trampoline, a naked
//! `switch` that saves the callee-saved state of the caller and restores
//! another context's, and a `cycles` counter read for profiling.
//!
//! Only callee-saved registers travel across a switch; everything else is
//! dead at a call boundary by the platform ABI.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{cycles, init, switch, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{cycles, init, switch, SavedRegs};
    } else {
        compile_error!("unsupported architecture (x86_64 and aarch64 only)");
    }
}

/// Called if a context's entry shim ever returns into the trampoline.
///
/// The shim switches back to the reactor itself and never returns; reaching
/// this is a runtime bug, not a user error.
pub(crate) extern "C" fn entry_returned() {
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // A minimal self-contained switch exercise: enter a fresh context on its
    // own stack, have it write a marker and switch straight back.
    thread_local! {
        static HOST: Cell<*mut SavedRegs> = const { Cell::new(std::ptr::null_mut()) };
        static MARK: Cell<usize> = const { Cell::new(0) };
    }

    extern "C" fn probe_entry(arg: usize) {
        MARK.with(|m| m.set(arg));
        let host = HOST.with(|h| h.get());
        let mut own = SavedRegs::zeroed();
        unsafe { switch(&mut own, host) };
        unreachable!();
    }

    #[test]
    fn test_switch_round_trip() {
        let stack = crate::stack::Stack::new(64 * 1024).expect("stack");
        let mut host = SavedRegs::zeroed();
        let mut guest = SavedRegs::zeroed();

        HOST.with(|h| h.set(&mut host));
        unsafe {
            init(&mut guest, stack.top(), probe_entry as usize, 0xC0FFEE);
            switch(&mut host, &guest);
        }
        assert_eq!(MARK.with(|m| m.get()), 0xC0FFEE);
    }

    #[test]
    fn test_cycles_monotonic_enough() {
        let a = cycles();
        let b = cycles();
        // Counters can be coarse but never move backwards in one thread.
        assert!(b >= a);
    }
}
