//! Public operations surface
//!
//! [`Jit`] owns the complete compiler state behind one mutex; every
//! operation locks on entry and unlocks on exit.  Long-running driver work
//! (compilation, kernel execution) happens below this lock as well — one
//! compile amortizes over millions of array elements, so contention is not
//! a concern, and the CSE/allocator tables must be observed atomically.
//!
//! ```
//! use filament::{Jit, VarType};
//!
//! let jit = Jit::new();
//! jit.init(false, true);
//!
//! let a = jit.var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let b = jit.var_copy_from_host(VarType::Float32, &[10.0f32, 20.0, 30.0, 40.0]).unwrap();
//! let c = jit.trace_append_2(VarType::Float32, "add.$t1 $r1, $r2, $r3", a, b).unwrap();
//! jit.eval().unwrap();
//! assert_eq!(jit.var_read::<f32>(c, 2).unwrap(), 33.0);
//! ```

use crate::driver::reference::ReferenceDriver;
use crate::error::{Error, Result};
use crate::logging;
use crate::state::{Device, KernelStats, State, ACTIVE_STREAM};
use crate::types::{AllocType, ReductionType, VarType};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// The JIT compiler
///
/// All operations are methods on this type; the contained state is guarded
/// by a single mutex, making `Jit` freely shareable across threads.
#[derive(Default)]
pub struct Jit {
    state: Mutex<State>,
    cv: Condvar,
}

impl Jit {
    /// Builds an uninitialized compiler; call [`Jit::init`] before use
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let mut guard = self.state.lock().unwrap();
        while guard.init_pending {
            guard = self.cv.wait(guard).unwrap();
        }
        guard
    }

    fn locked(&self) -> Result<MutexGuard<'_, State>> {
        let guard = self.lock();
        if !guard.initialized || guard.devices.is_empty() {
            return Err(Error::Uninitialized);
        }
        Ok(guard)
    }

    ////////////////////////////////////////////////////////////////////////
    // Lifecycle

    /// Initializes the requested backends
    ///
    /// `cuda` enables the CUDA-like device path (served by the built-in
    /// reference device when no hardware driver is registered); `llvm`
    /// attempts to load `libLLVM` for the CPU backend.
    pub fn init(&self, llvm: bool, cuda: bool) {
        let mut state = self.lock();
        Self::init_locked(&mut state, llvm, cuda);
    }

    /// Launches initialization on a separate thread
    ///
    /// Public operations issued before setup completes block as usual on
    /// the state mutex.
    pub fn init_async(self: &Arc<Self>, llvm: bool, cuda: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.init_pending {
                return;
            }
            state.init_pending = true;
        }
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            let mut state = this.state.lock().unwrap();
            Self::init_locked(&mut state, llvm, cuda);
            state.init_pending = false;
            drop(state);
            this.cv.notify_all();
        });
    }

    fn init_locked(state: &mut State, llvm: bool, cuda: bool) {
        if state.initialized {
            return;
        }
        // Index 0 is the "no dependency" sentinel
        state.variable_index = state.variable_index.max(1);
        state.cache_dir = crate::cache::cache_dir();
        if cuda {
            let driver = Box::new(ReferenceDriver);
            let count = crate::driver::Driver::device_count(driver.as_ref());
            let slot = state.drivers.len();
            state.drivers.push(driver);
            for id in 0..count {
                state.devices.push(Device {
                    driver: slot,
                    id,
                    block_count: 0,
                    thread_count: 128,
                });
            }
        }
        state.llvm_version = -1;
        #[cfg(feature = "llvm")]
        if llvm {
            if let Some(driver) = crate::driver::llvm::McjitDriver::new() {
                state.llvm_target.cpu = driver.target_cpu.clone();
                state.llvm_target.features = driver.target_features.clone();
                state.llvm_target.vector_width = driver.vector_width;
                state.llvm_version = driver.version_major;
                let slot = state.drivers.len();
                state.drivers.push(Box::new(driver));
                state.devices.push(Device {
                    driver: slot,
                    id: 0,
                    block_count: 0,
                    thread_count: 1,
                });
            }
        }
        #[cfg(not(feature = "llvm"))]
        let _ = llvm;
        state.initialized = true;
        log::info!(
            "init(): {} device(s) available",
            state.devices.len()
        );
    }

    /// Releases all resources
    ///
    /// With `light == true` only unused pools are trimmed; otherwise the
    /// variable store is torn down (leaked references are reported) and
    /// the compiler returns to the uninitialized state.
    pub fn shutdown(&self, light: bool) {
        let mut state = self.lock();
        Self::shutdown_locked(&mut state, light);
    }

    fn shutdown_locked(state: &mut State, light: bool) {
        if !state.initialized {
            return;
        }
        for d in &mut state.drivers {
            d.sync();
        }
        state.release_pending();
        if light {
            state.malloc_trim();
            return;
        }

        let indices: Vec<u32> = state.variables.keys().copied().collect();
        if !indices.is_empty() {
            log::warn!(
                "shutdown(): {} variable(s) are still referenced",
                indices.len()
            );
        }
        for i in indices {
            let v = state.variables.remove(&i).unwrap();
            if v.free_variable && v.is_materialized() && !v.direct_pointer {
                let _ = state.free(v.data);
            }
        }
        state.variable_from_key.clear();
        state.variable_from_ptr.clear();
        state.live.clear();
        state.dirty.clear();
        state.scheduled.clear();
        state.se_trace.clear();
        state.scatter_by_target.clear();
        state.loops.clear();
        state.kernels.clear();
        state.registry = Default::default();
        state.release_pending();
        state.malloc_trim();
        state.drivers.clear();
        state.devices.clear();
        state.streams.clear();
        state.initialized = false;
        log::info!("shutdown(): done");
    }

    /// Checks whether the CPU (LLVM) backend is available
    pub fn has_llvm(&self) -> bool {
        self.lock()
            .drivers
            .iter()
            .any(|d| d.backend() == crate::Backend::Llvm)
    }

    /// Checks whether a CUDA-like device is available
    pub fn has_cuda(&self) -> bool {
        self.lock()
            .drivers
            .iter()
            .any(|d| d.backend() == crate::Backend::Cuda)
    }

    ////////////////////////////////////////////////////////////////////////
    // Devices and streams

    /// Number of available devices
    pub fn device_count(&self) -> u32 {
        self.lock().devices.len() as u32
    }

    /// Selects the active device and stream of the calling thread
    pub fn device_set(&self, device: u32, stream: u32) -> Result<()> {
        let state = self.locked()?;
        if device as usize >= state.devices.len() {
            return Err(Error::UnknownIndex(device));
        }
        drop(state);
        ACTIVE_STREAM.with(|c| c.set((device, stream)));
        Ok(())
    }

    /// Waits for all work on the active stream
    pub fn sync_stream(&self) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().sync();
        state.release_pending();
        Ok(())
    }

    /// Waits for all work on the active device
    pub fn sync_device(&self) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().sync();
        state.release_pending();
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Allocator

    /// Allocates memory of the given flavor
    pub fn malloc(&self, ty: AllocType, size: usize) -> Result<*mut u8> {
        self.locked()?.malloc(ty, size)
    }

    /// Returns an allocation to the pool
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        self.locked()?.free(ptr)
    }

    /// Migrates an allocation to a different memory flavor
    pub fn malloc_migrate(&self, ptr: *mut u8, ty: AllocType) -> Result<*mut u8> {
        self.locked()?.malloc_migrate(ptr, ty)
    }

    /// Releases all unused pooled memory back to the drivers
    pub fn malloc_trim(&self) -> Result<()> {
        self.locked()?.malloc_trim();
        Ok(())
    }

    /// Hints a managed allocation toward a device
    pub fn malloc_prefetch(&self, ptr: *mut u8, device: i32) -> Result<()> {
        self.locked()?.malloc_prefetch(ptr, device)
    }

    /// Current and peak memory usage of one allocation flavor
    pub fn malloc_usage(&self, ty: AllocType) -> (usize, usize) {
        let state = self.lock();
        (
            state.alloc_usage[ty.index()],
            state.alloc_watermark[ty.index()],
        )
    }

    ////////////////////////////////////////////////////////////////////////
    // Variables

    /// Increases the external reference count of a variable
    pub fn var_inc_ref_ext(&self, index: u32) -> Result<()> {
        let mut state = self.locked()?;
        state.var(index)?;
        state.inc_ref_ext(index);
        Ok(())
    }

    /// Decreases the external reference count of a variable
    pub fn var_dec_ref_ext(&self, index: u32) -> Result<()> {
        let mut state = self.locked()?;
        state.var(index)?;
        state.dec_ref_ext(index);
        Ok(())
    }

    /// Queries the external reference count
    pub fn var_ext_ref(&self, index: u32) -> Result<u32> {
        Ok(self.locked()?.var(index)?.ref_count_ext)
    }

    /// Queries the internal reference count
    pub fn var_int_ref(&self, index: u32) -> Result<u32> {
        Ok(self.locked()?.var(index)?.ref_count_int)
    }

    /// Queries the device pointer (null until materialized)
    pub fn var_ptr(&self, index: u32) -> Result<*mut u8> {
        self.locked()?.var_ptr(index)
    }

    /// Queries the number of entries
    pub fn var_size(&self, index: u32) -> Result<u32> {
        self.locked()?.var_size(index)
    }

    /// Queries the label of a variable
    pub fn var_label(&self, index: u32) -> Result<Option<String>> {
        Ok(self.locked()?.var_label(index)?.map(str::to_string))
    }

    /// Assigns a label to a variable
    pub fn var_set_label(&self, index: u32, label: &str) -> Result<()> {
        self.locked()?.var_set_label(index, label)
    }

    /// Registers an existing buffer as a variable
    ///
    /// With `free == true` the buffer is returned to the pool when the
    /// variable dies.
    pub fn var_map(
        &self,
        ty: VarType,
        ptr: *mut u8,
        size: u32,
        free: bool,
    ) -> Result<u32> {
        self.locked()?.var_map(ty, ptr, size, free)
    }

    /// Registers a pointer literal that keeps `parent` alive
    pub fn var_copy_ptr(&self, ptr: *const u8, parent: u32) -> Result<u32> {
        self.locked()?.var_copy_ptr(ptr, parent)
    }

    /// Copies host values onto the device and registers the result
    pub fn var_copy_from_host<T: IntoBytes + Immutable>(
        &self,
        ty: VarType,
        values: &[T],
    ) -> Result<u32> {
        self.locked()?
            .var_copy_from_host(ty, values.as_bytes(), values.len() as u32)
    }

    /// Reads one element, materializing the variable first if necessary
    pub fn var_read<T: FromBytes + IntoBytes>(
        &self,
        index: u32,
        offset: usize,
    ) -> Result<T> {
        let mut out = T::new_zeroed();
        self.locked()?.var_read(index, offset, out.as_mut_bytes())?;
        Ok(out)
    }

    /// Overwrites one element in place
    pub fn var_write<T: IntoBytes + Immutable>(
        &self,
        index: u32,
        offset: usize,
        value: T,
    ) -> Result<()> {
        self.locked()?.var_write(index, offset, value.as_bytes())
    }

    /// Migrates the storage of a variable
    pub fn var_migrate(&self, index: u32, ty: AllocType) -> Result<()> {
        self.locked()?.var_migrate(index, ty)
    }

    /// Marks a statement as a scatter with the given target
    pub fn var_mark_scatter(&self, index: u32, target: u32) -> Result<()> {
        self.locked()?.var_mark_scatter(index, target)
    }

    /// Checks whether a variable is the canonical literal zero
    pub fn var_is_literal_zero(&self, index: u32) -> Result<bool> {
        self.locked()?.var_is_literal_zero(index)
    }

    /// Checks whether a variable is the canonical literal one
    pub fn var_is_literal_one(&self, index: u32) -> Result<bool> {
        self.locked()?.var_is_literal_one(index)
    }

    /// Returns a human-readable summary of all live variables
    pub fn var_whos(&self) -> String {
        self.lock().var_whos()
    }

    ////////////////////////////////////////////////////////////////////////
    // Trace

    /// Appends a statement with no operands
    pub fn trace_append_0(&self, ty: VarType, cmd: &str, size: u32) -> Result<u32> {
        self.locked()?.trace_append_0(ty, cmd, size)
    }

    /// Appends a statement with one operand
    pub fn trace_append_1(&self, ty: VarType, cmd: &str, a1: u32) -> Result<u32> {
        self.locked()?.trace_append(ty, cmd, &[a1], 1)
    }

    /// Appends a statement with two operands
    pub fn trace_append_2(
        &self,
        ty: VarType,
        cmd: &str,
        a1: u32,
        a2: u32,
    ) -> Result<u32> {
        self.locked()?.trace_append(ty, cmd, &[a1, a2], 1)
    }

    /// Appends a statement with three operands
    pub fn trace_append_3(
        &self,
        ty: VarType,
        cmd: &str,
        a1: u32,
        a2: u32,
        a3: u32,
    ) -> Result<u32> {
        self.locked()?.trace_append(ty, cmd, &[a1, a2, a3], 1)
    }

    /// Appends a statement with four operands
    pub fn trace_append_4(
        &self,
        ty: VarType,
        cmd: &str,
        a1: u32,
        a2: u32,
        a3: u32,
        a4: u32,
    ) -> Result<u32> {
        self.locked()?.trace_append(ty, cmd, &[a1, a2, a3, a4], 1)
    }

    ////////////////////////////////////////////////////////////////////////
    // Materialization

    /// Evaluates everything in the live set
    pub fn eval(&self) -> Result<()> {
        self.locked()?.eval()
    }

    /// Evaluates the sub-graph rooted at one variable
    pub fn var_eval(&self, index: u32) -> Result<()> {
        self.locked()?.var_eval(index)
    }

    /// Marks a variable for evaluation during the next `eval`
    pub fn var_schedule(&self, index: u32) -> Result<()> {
        self.locked()?.var_schedule(index)
    }

    /// Counters describing kernel compilations and cache hits
    pub fn kernel_stats(&self) -> KernelStats {
        self.lock().kernel_stats
    }

    ////////////////////////////////////////////////////////////////////////
    // Bulk operations

    /// Fills `size` elements at `ptr` with one value
    ///
    /// # Safety
    /// `ptr` must reference a device buffer with room for `size` elements.
    pub unsafe fn fill<T: IntoBytes + Immutable>(
        &self,
        ty: VarType,
        ptr: *mut u8,
        size: u32,
        value: T,
    ) -> Result<()> {
        if std::mem::size_of::<T>() != ty.size() {
            return Err(Error::TypeMismatch(format!(
                "fill element has {} bytes, {:?} needs {}",
                std::mem::size_of::<T>(),
                ty,
                ty.size()
            )));
        }
        let mut state = self.locked()?;
        state.active_driver().fill(ty, ptr, size, value.as_bytes());
        Ok(())
    }

    /// Synchronous device-to-device copy
    ///
    /// # Safety
    /// Both regions must be valid for `size` bytes.
    pub unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().memcpy(dst, src, size);
        Ok(())
    }

    /// Asynchronous device-to-device copy on the active stream
    ///
    /// # Safety
    /// Both regions must be valid for `size` bytes until the stream syncs.
    pub unsafe fn memcpy_async(
        &self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().memcpy_async(dst, src, size);
        Ok(())
    }

    /// Horizontal reduction over a device buffer
    ///
    /// # Safety
    /// `ptr` must hold `size` elements of `ty`; `out` room for one element.
    pub unsafe fn reduce(
        &self,
        ty: VarType,
        rtype: ReductionType,
        ptr: *const u8,
        size: u32,
        out: *mut u8,
    ) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().reduce(ty, rtype, ptr, size, out);
        Ok(())
    }

    /// Exclusive prefix sum over `u32` values
    ///
    /// # Safety
    /// Both buffers must hold `size` elements.
    pub unsafe fn scan(&self, input: *const u32, out: *mut u32, size: u32) -> Result<()> {
        let mut state = self.locked()?;
        state.active_driver().scan(input, out, size);
        Ok(())
    }

    /// Checks whether all byte masks are nonzero
    ///
    /// # Safety
    /// `values` must hold `size` bytes.
    pub unsafe fn all(&self, values: *const u8, size: u32) -> Result<bool> {
        let mut state = self.locked()?;
        Ok(state.active_driver().all(values, size))
    }

    /// Checks whether any byte mask is nonzero
    ///
    /// # Safety
    /// `values` must hold `size` bytes.
    pub unsafe fn any(&self, values: *const u8, size: u32) -> Result<bool> {
        let mut state = self.locked()?;
        Ok(state.active_driver().any(values, size))
    }

    /// Builds a permutation grouping values by bucket
    ///
    /// # Safety
    /// `values`/`perm` must hold `size` entries and `offsets` must hold
    /// `bucket_count + 1` entries.
    pub unsafe fn mkperm(
        &self,
        values: *const u32,
        size: u32,
        bucket_count: u32,
        perm: *mut u32,
        offsets: *mut u32,
    ) -> Result<u32> {
        let mut state = self.locked()?;
        Ok(state
            .active_driver()
            .mkperm(values, size, bucket_count, perm, offsets))
    }

    ////////////////////////////////////////////////////////////////////////
    // Logging

    /// Sets the maximum level printed to stderr by the crate logger
    pub fn log_set_stderr(&self, level: logging::LevelFilter) {
        logging::set_stderr_level(level);
    }

    /// Registers a log callback for records at or below `level`
    pub fn set_log_callback(
        &self,
        level: logging::LevelFilter,
        callback: Option<logging::LogCallback>,
    ) {
        logging::set_callback(level, callback);
    }

    /// Emits a log record through the crate's logging facade
    pub fn log(&self, level: logging::Level, msg: &str) {
        log::log!(level, "{}", msg);
    }

    ////////////////////////////////////////////////////////////////////////
    // Loops

    /// Opens a symbolic loop; see [`State::var_loop_start`]
    pub fn var_loop_start(
        &self,
        name: Option<&str>,
        indices: &mut [u32],
    ) -> Result<u32> {
        self.locked()?.var_loop_start(name, indices)
    }

    /// Records the loop condition
    pub fn var_loop_cond(&self, loop_: u32, active: u32) -> Result<u32> {
        self.locked()?.var_loop_cond(loop_, active)
    }

    /// Closes a symbolic loop; `false` requests one re-recording
    pub fn var_loop_end(
        &self,
        loop_: u32,
        cond: u32,
        indices: &mut [u32],
        checkpoint: u64,
    ) -> Result<bool> {
        self.locked()?.var_loop_end(loop_, cond, indices, checkpoint)
    }

    /// Monotone side-effect counter, used as the loop checkpoint
    pub fn side_effect_counter(&self) -> u64 {
        self.lock().se_counter
    }

    ////////////////////////////////////////////////////////////////////////
    // Registry

    /// Registers an instance pointer under a domain
    pub fn registry_put(&self, domain: &str, ptr: *mut u8) -> Result<u32> {
        Ok(self.locked()?.registry.put(domain, ptr))
    }

    /// Removes a registered instance pointer
    pub fn registry_remove(&self, ptr: *mut u8) -> Result<()> {
        self.locked()?.registry.remove(ptr)
    }

    /// Returns the ID of a registered pointer (0 when absent)
    pub fn registry_get_id(&self, ptr: *const u8) -> u32 {
        self.lock().registry.get_id(ptr)
    }

    /// Returns the domain of a registered pointer
    pub fn registry_get_domain(&self, ptr: *const u8) -> Option<String> {
        self.lock().registry.get_domain(ptr).map(str::to_string)
    }

    /// Returns the pointer registered under `(domain, id)`
    pub fn registry_get_ptr(&self, domain: &str, id: u32) -> *mut u8 {
        self.lock().registry.get_ptr(domain, id)
    }

    /// Returns the largest ID handed out within a domain
    pub fn registry_get_max(&self, domain: &str) -> u32 {
        self.lock().registry.get_max(domain)
    }

    /// Shrinks registry domains by dropping trailing unused IDs
    pub fn registry_trim(&self) {
        self.lock().registry.trim()
    }

    ////////////////////////////////////////////////////////////////////////
    // CPU target configuration

    /// Overrides the CPU code generation target
    pub fn llvm_set_target(
        &self,
        cpu: &str,
        features: &str,
        vector_width: u32,
    ) -> Result<()> {
        let mut state = self.locked()?;
        state.llvm_target.cpu = cpu.to_string();
        state.llvm_target.features = features.to_string();
        state.llvm_target.vector_width = vector_width.max(1);
        Ok(())
    }

    /// Major version of the loaded LLVM library (-1 when absent)
    pub fn llvm_version_major(&self) -> i32 {
        self.lock().llvm_version
    }

    /// Checks whether the CPU target provides a feature at a vector width
    pub fn llvm_if_at_least(&self, vector_width: u32, feature: &str) -> bool {
        let state = self.lock();
        state.llvm_target.vector_width >= vector_width
            && state.llvm_target.features.contains(feature)
    }

    /// Enables or disables parallel dispatch of CPU kernels
    pub fn parallel_set_dispatch(&self, enable: bool) {
        self.lock().parallel_dispatch = enable;
    }

    /// Checks whether parallel dispatch is enabled
    pub fn parallel_dispatch(&self) -> bool {
        self.lock().parallel_dispatch
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            Self::shutdown_locked(&mut state, false);
        }
    }
}
