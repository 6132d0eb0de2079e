use corosensei::stack::DefaultStack;

use crate::error::{Result, RuntimeError};

struct FreeStack {
    stack: Box<DefaultStack>,
    size: usize,
}

/// Recycler of fixed-capacity coroutine stacks.
///
/// A completed coroutine's stack goes back on the free list rather than to
/// the OS, so a workload that churns through short-lived coroutines touches
/// the allocator once per stack, not once per spawn. The free list is
/// capped (`max_pooled`); past the cap a released stack is simply freed.
pub(crate) struct StackPool {
    free: Vec<FreeStack>,
    max_pooled: usize,
    in_use: usize,
    reuses: u64,
}

impl StackPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Vec::new(),
            max_pooled,
            in_use: 0,
            reuses: 0,
        }
    }

    /// Hand out a stack of at least `size` bytes, recycled when possible.
    /// Returns the stack together with its actual capacity (the release
    /// call needs it back).
    pub fn acquire(&mut self, size: usize) -> Result<(Box<DefaultStack>, usize)> {
        if let Some(pos) = self.free.iter().position(|f| f.size >= size) {
            let f = self.free.swap_remove(pos);
            self.in_use += 1;
            self.reuses += 1;
            return Ok((f.stack, f.size));
        }
        let stack = DefaultStack::new(size).map_err(|_| RuntimeError::OutOfMemory)?;
        self.in_use += 1;
        Ok((Box::new(stack), size))
    }

    /// Return a stack to the free list without releasing its memory, unless
    /// the list is already at its cap.
    pub fn release(&mut self, stack: Box<DefaultStack>, size: usize) {
        self.in_use = self.in_use.saturating_sub(1);
        if self.free.len() < self.max_pooled {
            self.free.push(FreeStack { stack, size });
        }
    }

    /// Drop every pooled stack. For long-running hosts that want the memory
    /// back after a spawn-heavy phase.
    pub fn shrink(&mut self) {
        self.free.clear();
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    pub fn reuses(&self) -> u64 {
        self.reuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 64 * 1024;

    #[test]
    fn acquire_allocates_then_recycles() {
        let mut pool = StackPool::new(8);
        let (stack, size) = pool.acquire(SIZE).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.reuses(), 0);

        pool.release(stack, size);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.pooled(), 1);

        let (_stack, _) = pool.acquire(SIZE).unwrap();
        assert_eq!(pool.reuses(), 1);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn smaller_requests_reuse_bigger_stacks() {
        let mut pool = StackPool::new(8);
        let (stack, size) = pool.acquire(2 * SIZE).unwrap();
        pool.release(stack, size);

        let (_stack, actual) = pool.acquire(SIZE).unwrap();
        assert_eq!(actual, 2 * SIZE);
        assert_eq!(pool.reuses(), 1);
    }

    #[test]
    fn free_list_respects_cap() {
        let mut pool = StackPool::new(2);
        let stacks: Vec<_> = (0..4).map(|_| pool.acquire(SIZE).unwrap()).collect();
        assert_eq!(pool.in_use(), 4);
        for (stack, size) in stacks {
            pool.release(stack, size);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn shrink_clears_free_list() {
        let mut pool = StackPool::new(8);
        let (stack, size) = pool.acquire(SIZE).unwrap();
        pool.release(stack, size);
        assert_eq!(pool.pooled(), 1);
        pool.shrink();
        assert_eq!(pool.pooled(), 0);
    }
}
