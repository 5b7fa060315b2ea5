//! Context stacks
//!
//! Each context owns one mmap'd region: a single PROT_NONE guard page at the
//! low end, then the usable stack. Stacks grow downward, so an overflow runs
//! into the guard page and faults instead of corrupting a neighbor. The
//! region is reserved with MAP_NORESERVE; the kernel commits pages on first
//! touch.

use greenctx_core::{Result, StackError};

/// Page granularity assumed for rounding and the guard page
pub const PAGE_SIZE: usize = 4096;

/// Guard region at the low end of every stack
pub const GUARD_SIZE: usize = PAGE_SIZE;

/// Smallest usable stack the runtime will allocate
pub const MIN_STACK_SIZE: usize = 16 * 1024;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        // mmap-backed implementation below
    } else {
        compile_error!("unsupported platform (unix only)");
    }
}

/// An owned, guarded context stack
pub struct Stack {
    base: *mut u8,
    total: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> Result<Stack> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::TooSmall.into());
        }
        let usable = round_up(size);
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocFailed.into());
        }

        // Everything above the guard page becomes readable/writable; the
        // guard page keeps its PROT_NONE from the initial mapping.
        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(GUARD_SIZE) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(StackError::ProtectFailed.into());
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the stack; execution begins here and grows down.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between the top and the guard page.
    #[inline]
    pub fn usable(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
            self.base = std::ptr::null_mut();
        }
    }
}

fn round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenctx_core::Error;

    #[test]
    fn test_alloc_and_layout() {
        let s = Stack::new(MIN_STACK_SIZE).expect("stack");
        assert!(s.usable() >= MIN_STACK_SIZE);
        assert_eq!(s.usable() % PAGE_SIZE, 0);
        assert_eq!(s.top() as usize % 16, 0, "top must be ABI-alignable");
    }

    #[test]
    fn test_rounding() {
        let s = Stack::new(MIN_STACK_SIZE + 1).expect("stack");
        assert_eq!(s.usable(), MIN_STACK_SIZE + PAGE_SIZE);
    }

    #[test]
    fn test_too_small() {
        match Stack::new(1024) {
            Err(Error::Stack(StackError::TooSmall)) => {}
            other => panic!("expected TooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_writable_to_the_top() {
        let s = Stack::new(MIN_STACK_SIZE).expect("stack");
        unsafe {
            // Touch the highest and lowest usable bytes.
            *s.top().sub(1) = 0xAB;
            *s.top().sub(s.usable()) = 0xCD;
            assert_eq!(*s.top().sub(1), 0xAB);
        }
    }
}
