//! The thread-pool collaborator and the disjoint-write output window.

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::marker::PhantomData;

/// Run `body(i)` for every `i < n`.
///
/// With `Some(pool)` the iterations run on that pool; with `None` they run
/// as a plain serial loop with identical per-iteration semantics. Bodies
/// must write disjoint output regions.
pub fn parallel_for<F>(pool: Option<&rayon::ThreadPool>, n: usize, body: F)
where
    F: Fn(usize) + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| (0..n).into_par_iter().for_each(|i| body(i))),
        None => (0..n).for_each(|i| body(i)),
    }
}

/// A shared window over a caller-owned output slice.
///
/// Tiles running in parallel each own a disjoint set of indices, so plain
/// stores need no synchronization. Bounds are checked in debug builds; the
/// window never outlives the borrowed slice.
pub(crate) struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T: Copy> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// `i` is in bounds and no other tile writes index `i`.
    #[inline]
    pub unsafe fn store(&self, i: usize, v: T) {
        debug_assert!(i < self.len);
        *self.ptr.add(i) = v;
    }

    /// # Safety
    /// `i` is in bounds and any write to index `i` happened in this tile.
    #[inline]
    pub unsafe fn load(&self, i: usize) -> T {
        debug_assert!(i < self.len);
        *self.ptr.add(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_and_pooled_agree() {
        let n = 97;
        let mut serial = vec![0usize; n];
        {
            let out = SharedSlice::new(&mut serial);
            parallel_for(None, n, |i| unsafe { out.store(i, i * i) });
        }

        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let mut pooled = vec![0usize; n];
        {
            let out = SharedSlice::new(&mut pooled);
            parallel_for(Some(&pool), n, |i| unsafe { out.store(i, i * i) });
        }
        assert_eq!(serial, pooled);
    }
}
