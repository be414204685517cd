//! Device drivers
//!
//! The core talks to every execution target through the [`Driver`] trait:
//! raw buffer management, host/device copies, bulk primitives, kernel
//! compilation and launch.  Two implementations ship with the crate:
//!
//! - [`reference`] — a host-memory device that honors the CUDA-like driver
//!   contract by compiling the PTX dialect to fixed-size instruction records
//!   and interpreting them per lane.  It keeps the full pipeline usable (and
//!   testable) on machines without a GPU, in the same spirit as an
//!   interpreted VM living next to a JIT.
//! - [`llvm`] — MCJIT through `libLLVM`, loaded dynamically at runtime
//!   (feature `llvm`).
//!
//! Bindings to real CUDA hardware are external: any crate can implement
//! `Driver` with [`Backend::Cuda`](crate::Backend::Cuda) and register it at
//! initialization time.

use crate::cache::Payload;
use crate::error::Result;
use crate::types::{AllocType, Backend, ReductionType, VarType};
use std::any::Any;
use std::sync::Arc;

#[cfg(feature = "llvm")]
pub mod llvm;
pub mod reference;

/// A compiled kernel, opaque to the core
///
/// Drivers downcast through [`Kernel::as_any`] at launch time; handing a
/// kernel to a driver that did not produce it is an invariant violation.
pub trait Kernel: Send + Sync {
    /// Returns `self` for driver-side downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Result of compiling one kernel
pub struct Compiled {
    /// The executable artifact
    pub kernel: Arc<dyn Kernel>,
    /// Payload bytes and function offset for the on-disk cache, when the
    /// driver produces a relocatable artifact
    pub payload: Option<(Vec<u8>, u32)>,
}

/// Interface between the core and one execution target
///
/// All pointer-taking methods are `unsafe`: the caller guarantees that the
/// pointers were produced by this driver (or point to valid host memory for
/// host-side arguments) and stay alive for the duration of the call.
#[allow(clippy::missing_safety_doc)]
pub trait Driver: Send {
    /// Code generation dialect understood by this driver
    fn backend(&self) -> Backend;

    /// Short human-readable name ("reference", "llvm", ...)
    fn name(&self) -> &'static str;

    /// Number of devices exposed by this driver
    fn device_count(&self) -> u32 {
        1
    }

    /// Allocates `size` bytes of the given flavor; `None` on exhaustion
    fn alloc(&mut self, ty: AllocType, size: usize) -> Option<*mut u8>;

    /// Returns a buffer obtained from [`Driver::alloc`]
    unsafe fn release(&mut self, ty: AllocType, ptr: *mut u8, size: usize);

    /// Copies a host region into a device buffer
    unsafe fn copy_to_device(&mut self, dst: *mut u8, src: *const u8, size: usize);

    /// Copies a device region back to host memory
    unsafe fn copy_from_device(&mut self, dst: *mut u8, src: *const u8, size: usize);

    /// Synchronous device-to-device copy
    unsafe fn memcpy(&mut self, dst: *mut u8, src: *const u8, size: usize);

    /// Asynchronous device-to-device copy, ordered on the active stream
    unsafe fn memcpy_async(&mut self, dst: *mut u8, src: *const u8, size: usize);

    /// Fills `size` elements at `ptr` with the element bytes in `src`
    unsafe fn fill(&mut self, ty: VarType, ptr: *mut u8, size: u32, src: &[u8]);

    /// Horizontal reduction of `size` elements into one output element
    unsafe fn reduce(
        &mut self,
        ty: VarType,
        rtype: ReductionType,
        ptr: *const u8,
        size: u32,
        out: *mut u8,
    );

    /// Exclusive prefix sum over `u32` values
    unsafe fn scan(&mut self, input: *const u32, out: *mut u32, size: u32);

    /// Returns `true` iff every byte mask in `values` is nonzero
    unsafe fn all(&mut self, values: *const u8, size: u32) -> bool;

    /// Returns `true` iff at least one byte mask in `values` is nonzero
    unsafe fn any(&mut self, values: *const u8, size: u32) -> bool;

    /// Builds a permutation grouping `values` by bucket; returns the number
    /// of nonempty buckets.  `perm` receives `size` indices, `offsets`
    /// receives `bucket_count + 1` cumulative positions.
    unsafe fn mkperm(
        &mut self,
        values: *const u32,
        size: u32,
        bucket_count: u32,
        perm: *mut u32,
        offsets: *mut u32,
    ) -> u32;

    /// Hints a managed buffer toward the given device (no-op by default)
    fn prefetch(&mut self, _ptr: *mut u8, _device: i32) {}

    /// Compiles IR text; `name` is the unique kernel name already substituted
    /// into the text
    fn compile(&mut self, ir: &str, name: &str) -> Result<Compiled>;

    /// Recreates a kernel from an on-disk cache payload without re-parsing
    /// the IR; `None` rejects the payload (treated as a cache miss)
    fn load(&mut self, payload: Payload) -> Option<Arc<dyn Kernel>>;

    /// Enqueues a kernel launch over `size` lanes
    ///
    /// `params[0]` is the lane count, followed by one pointer per kernel
    /// parameter, in the order recorded by the code generator.
    unsafe fn launch(
        &mut self,
        kernel: &dyn Kernel,
        size: u32,
        params: &[u64],
        parallel: bool,
    ) -> Result<()>;

    /// Blocks until all enqueued work has completed
    fn sync(&mut self);
}
