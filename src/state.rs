//! The full JIT compiler state
//!
//! Everything lives in one [`State`] record guarded by a single mutex (owned
//! by [`Jit`](crate::Jit)).  The CSE map, the allocator pools, and the
//! live/dirty sets must be observed atomically, so the lock is deliberately
//! coarse; one kernel compilation amortizes over millions of array elements.

use crate::driver::{Driver, Kernel};
use crate::loops::LoopData;
use crate::registry::Registry;
use crate::types::{AllocType, Backend};
use crate::variable::{Variable, VariableKey};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// A device known to the compiler
pub struct Device {
    /// Index into [`State::drivers`]
    pub driver: usize,
    /// Device ordinal within its driver
    pub id: u32,
    /// Launch configuration: number of blocks
    pub block_count: u32,
    /// Launch configuration: threads per block
    pub thread_count: u32,
}

/// An ordered queue of device operations
pub struct Stream {
    /// Device index associated with this stream
    pub device: u32,
    /// Index of this stream on its device
    pub stream: u32,
    /// Memory regions that become reusable once the running kernel finishes
    pub alloc_pending: Vec<(AllocType, usize, *mut u8, usize)>,
}

/// Bookkeeping for one allocator-managed region
#[derive(Copy, Clone, Debug)]
pub struct AllocInfo {
    /// Flavor of the region
    pub ty: AllocType,
    /// Rounded size in bytes
    pub size: usize,
    /// Driver that produced the region
    pub driver: usize,
}

/// One entry of the in-memory kernel table
pub struct KernelEntry {
    /// The executable artifact
    pub kernel: Arc<dyn Kernel>,
    /// Number of times this entry was reused
    pub hits: u32,
}

/// Counters describing how kernels were obtained
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Kernels compiled from IR text
    pub compiled: u32,
    /// Kernels found in the in-memory table
    pub memory_hits: u32,
    /// Kernels recreated from the on-disk cache
    pub disk_hits: u32,
    /// Kernel launches issued
    pub launches: u32,
}

/// CPU code generation target, configured via
/// [`llvm_set_target`](crate::Jit::llvm_set_target)
pub struct LlvmTarget {
    /// Target CPU name (e.g. `skylake`)
    pub cpu: String,
    /// Target feature string (e.g. `+avx2`)
    pub features: String,
    /// Number of lanes processed per loop iteration
    pub vector_width: u32,
}

impl Default for LlvmTarget {
    fn default() -> Self {
        Self {
            cpu: String::new(),
            features: String::new(),
            vector_width: 1,
        }
    }
}

thread_local! {
    /// Active (device, stream) pair; threads that never call
    /// `device_set` inherit the default stream of device 0.
    pub static ACTIVE_STREAM: Cell<(u32, u32)> = const { Cell::new((0, 0)) };
}

/// Records the full JIT compiler state
#[derive(Default)]
pub struct State {
    /// Set once driver setup has completed
    pub initialized: bool,

    /// Set while an asynchronous initialization is in flight
    pub init_pending: bool,

    /// Major version of the loaded LLVM library (-1 when absent)
    pub llvm_version: i32,

    /// Loaded drivers; device indices refer into this table
    pub drivers: Vec<Box<dyn Driver>>,

    /// Available devices across all drivers
    pub devices: Vec<Device>,

    /// Maps (device index, stream index) pairs to stream records
    pub streams: HashMap<(u32, u32), Stream>,

    /// Stores the mapping from variable indices to variables
    pub variables: HashMap<u32, Variable>,

    /// Maps a key characterizing a variable to its index (CSE)
    pub variable_from_key: HashMap<VariableKey, u32>,

    /// Maps data pointers to the variable owning the buffer
    pub variable_from_ptr: HashMap<usize, u32>,

    /// Current variable index; monotonically increasing, never reused
    pub variable_index: u32,

    /// Current CSE scope; bumped at symbolic loop boundaries
    pub scope: u32,

    /// Externally referenced variables and statements with side effects
    pub live: HashSet<u32>,

    /// Targets of scatter operations that have not yet executed
    pub dirty: Vec<u32>,

    /// Variables explicitly marked for evaluation
    pub scheduled: Vec<u32>,

    /// Monotone side-effect counter, used as the loop recorder checkpoint
    pub se_counter: u64,

    /// Side-effect nodes recorded since the last flush
    pub se_trace: Vec<(u64, u32)>,

    /// Scatter statements per dirty target
    pub scatter_by_target: HashMap<u32, Vec<u32>>,

    /// Loop recorder side-structures, keyed by the owning variable
    pub loops: HashMap<u32, LoopData>,

    /// Map of currently allocated memory regions
    pub alloc_used: HashMap<usize, AllocInfo>,

    /// Map of currently unused memory regions, bucketed by (flavor, size);
    /// entries remember the driver that produced them
    pub alloc_free: HashMap<(AllocType, usize), Vec<(usize, usize)>>,

    /// Current memory usage per flavor
    pub alloc_usage: [usize; AllocType::COUNT],

    /// Maximum memory usage per flavor
    pub alloc_watermark: [usize; AllocType::COUNT],

    /// In-memory kernel table, keyed by (backend, IR hash)
    pub kernels: HashMap<(Backend, u32), KernelEntry>,

    /// Counter used to generate unique kernel names
    pub kernel_id: u32,

    /// Kernel acquisition statistics
    pub kernel_stats: KernelStats,

    /// Pointer/ID registry
    pub registry: Registry,

    /// Dispatch CPU kernels over multiple worker threads?
    pub parallel_dispatch: bool,

    /// CPU code generation target
    pub llvm_target: LlvmTarget,

    /// On-disk kernel cache directory (`$HOME/.filament`)
    pub cache_dir: Option<PathBuf>,
}

// Raw buffer pointers in `variables` / `alloc_*` are owned by the state and
// only touched while the surrounding mutex is held.
unsafe impl Send for State {}

impl State {
    /// Returns the active (device, stream) pair of the calling thread
    ///
    /// A selection that outlived its device (e.g. across a shutdown and
    /// re-initialization) falls back to the default stream of device 0.
    pub fn active_stream_key(&self) -> (u32, u32) {
        let (device, stream) = ACTIVE_STREAM.with(|c| c.get());
        if (device as usize) < self.devices.len() {
            (device, stream)
        } else {
            (0, 0)
        }
    }

    /// Returns the stream record for the calling thread, creating it on
    /// first use
    pub fn active_stream(&mut self) -> &mut Stream {
        let key = self.active_stream_key();
        self.streams.entry(key).or_insert_with(|| Stream {
            device: key.0,
            stream: key.1,
            alloc_pending: Vec::new(),
        })
    }

    /// Returns the driver of the given device
    pub fn device_driver(&mut self, device: u32) -> &mut Box<dyn Driver> {
        let driver = self.devices[device as usize].driver;
        &mut self.drivers[driver]
    }

    /// Returns the driver of the active device
    pub fn active_driver(&mut self) -> &mut Box<dyn Driver> {
        let (device, _) = self.active_stream_key();
        self.device_driver(device)
    }

    /// Returns a driver matching the given dialect, preferring the active
    /// device's driver
    pub fn backend_driver(&mut self, backend: Backend) -> &mut Box<dyn Driver> {
        let (device, _) = self.active_stream_key();
        let active = self.devices[device as usize].driver;
        let driver = if self.drivers[active].backend() == backend {
            active
        } else {
            match self.drivers.iter().position(|d| d.backend() == backend) {
                Some(i) => i,
                None => active,
            }
        };
        &mut self.drivers[driver]
    }

    /// Returns the code generation dialect of the active device
    pub fn active_backend(&self) -> Backend {
        let (device, _) = self.active_stream_key();
        let driver = self.devices[device as usize].driver;
        self.drivers[driver].backend()
    }

    /// Opens a new CSE scope
    ///
    /// Nodes created in different scopes never deduplicate against each
    /// other, even when their keys otherwise match.
    pub fn new_scope(&mut self) -> u32 {
        self.scope += 1;
        self.scope
    }
}
