//! Typed memory pools with deferred release
//!
//! Buffers are expensive to obtain from the driver, so freed regions are
//! parked in per-(flavor, size) buckets and handed back out on the next
//! matching request.  Requested sizes round up to a power of two with a
//! 64-byte floor, which keeps the bucket count small.
//!
//! A free that happens while a kernel may still be reading the buffer is
//! recorded in the active stream's pending list; the region only becomes
//! reusable once the stream's work has completed.  This removes
//! synchronization from the hot path.

use crate::error::{Error, Result};
use crate::state::{AllocInfo, State};
use crate::types::AllocType;

/// Rounds an allocation request to a power of two with a 64-byte floor
pub fn round_size(size: usize) -> usize {
    size.max(64).next_power_of_two()
}

impl State {
    /// Allocates memory of the given flavor
    pub fn malloc(&mut self, ty: AllocType, size: usize) -> Result<*mut u8> {
        let size = round_size(size);
        let (device, _) = self.active_stream_key();
        let driver = self.devices[device as usize].driver;

        // Fast path: recycle a buffer from the matching bucket
        let recycled = self.alloc_free.get_mut(&(ty, size)).and_then(|bucket| {
            let pos = bucket.iter().position(|&(_, d)| d == driver)?;
            Some(bucket.swap_remove(pos).0)
        });

        let ptr = match recycled {
            Some(ptr) => ptr as *mut u8,
            None => {
                let ptr = self.drivers[driver].alloc(ty, size).or_else(|| {
                    // Retry once after returning every unused region
                    self.malloc_trim();
                    self.drivers[driver].alloc(ty, size)
                });
                match ptr {
                    Some(ptr) => ptr,
                    None => return Err(Error::AllocationFailure(ty, size)),
                }
            }
        };

        self.alloc_used
            .insert(ptr as usize, AllocInfo { ty, size, driver });
        self.alloc_usage[ty.index()] += size;
        self.alloc_watermark[ty.index()] =
            self.alloc_watermark[ty.index()].max(self.alloc_usage[ty.index()]);
        log::trace!("malloc({}, {}): {:p}", ty.name(), size, ptr);
        Ok(ptr)
    }

    /// Returns a buffer to the pool
    ///
    /// The release is deferred via the active stream's pending list until
    /// its outstanding work completes.
    pub fn free(&mut self, ptr: *mut u8) -> Result<()> {
        let info = self
            .alloc_used
            .remove(&(ptr as usize))
            .ok_or(Error::UnknownPointer(ptr as usize))?;
        self.alloc_usage[info.ty.index()] -= info.size;
        self.active_stream()
            .alloc_pending
            .push((info.ty, info.size, ptr, info.driver));
        log::trace!("free({:p}): {} bytes deferred", ptr, info.size);
        Ok(())
    }

    /// Moves pending releases of the active stream into the reuse pools
    ///
    /// Called once the stream's event has completed (after synchronization
    /// or at the end of an evaluation pass).
    pub fn release_pending(&mut self) {
        let pending = std::mem::take(&mut self.active_stream().alloc_pending);
        for (ty, size, ptr, driver) in pending {
            self.alloc_free
                .entry((ty, size))
                .or_default()
                .push((ptr as usize, driver));
        }
    }

    /// Migrates an allocation to a different memory flavor
    ///
    /// Allocates the target region, enqueues a copy on the current stream
    /// and schedules the release of the old region.
    pub fn malloc_migrate(&mut self, ptr: *mut u8, ty: AllocType) -> Result<*mut u8> {
        let info = *self
            .alloc_used
            .get(&(ptr as usize))
            .ok_or(Error::UnknownPointer(ptr as usize))?;
        if info.ty == ty {
            return Ok(ptr);
        }
        let new = self.malloc(ty, info.size)?;
        unsafe {
            self.drivers[info.driver].memcpy_async(new, ptr, info.size);
        }
        self.free(ptr)?;
        Ok(new)
    }

    /// Releases all unused buffers back to the driver
    pub fn malloc_trim(&mut self) {
        let free = std::mem::take(&mut self.alloc_free);
        let mut count = 0usize;
        for ((ty, size), bucket) in free {
            for (ptr, driver) in bucket {
                unsafe {
                    self.drivers[driver].release(ty, ptr as *mut u8, size);
                }
                count += 1;
            }
        }
        if count > 0 {
            log::debug!("malloc_trim(): released {} buffers", count);
        }
    }

    /// Hints a managed buffer toward a specific device
    pub fn malloc_prefetch(&mut self, ptr: *mut u8, device: i32) -> Result<()> {
        let info = *self
            .alloc_used
            .get(&(ptr as usize))
            .ok_or(Error::UnknownPointer(ptr as usize))?;
        if !matches!(
            info.ty,
            AllocType::Managed | AllocType::ManagedReadMostly
        ) {
            return Err(Error::UnknownPointer(ptr as usize));
        }
        self.drivers[info.driver].prefetch(ptr, device);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(0), 64);
        assert_eq!(round_size(1), 64);
        assert_eq!(round_size(64), 64);
        assert_eq!(round_size(65), 128);
        assert_eq!(round_size(4096), 4096);
        assert_eq!(round_size(4097), 8192);
    }
}
