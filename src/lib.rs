//! Just-in-time tracing compiler for array programs
//!
//! Filament lazily records array operations as nodes of an SSA instruction
//! graph.  Nothing executes at trace time: each operation is a textual
//! statement template plus operand references, deduplicated on the fly
//! through value numbering.  When a result is actually needed, the
//! scheduler gathers every live computation, fuses connected nodes of equal
//! size into kernels, emits PTX (GPU) or LLVM IR (CPU), compiles through a
//! hash-keyed on-disk cache, and runs the result over all array lanes at
//! once.
//!
//! The typical workflow is trace → [`eval`](Jit::eval) → read:
//!
//! ```
//! use filament::{Jit, VarType};
//!
//! let jit = Jit::new();
//! jit.init(false, true);
//!
//! // Nothing runs yet; `x` and `y` are nodes in the instruction graph
//! let x = jit.var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0]).unwrap();
//! let y = jit.trace_append_2(VarType::Float32, "mul.$t1 $r1, $r2, $r3", x, x).unwrap();
//!
//! // One fused kernel computes and materializes `y`
//! jit.eval().unwrap();
//! assert_eq!(jit.var_read::<f32>(y, 2).unwrap(), 9.0);
//! ```
//!
//! Devices are pluggable through the [`driver::Driver`] trait.  The crate
//! ships a host-side reference device honoring the CUDA-like contract
//! (always available) and an MCJIT-based CPU device that loads `libLLVM`
//! at runtime (feature `llvm`, on by default).

mod alloc;
mod api;
pub mod cache;
mod codegen;
pub mod driver;
mod error;
mod eval;
pub mod logging;
mod loops;
mod registry;
mod state;
mod trace;
mod types;
mod variable;

pub use api::Jit;
pub use error::{Error, Result};
pub use state::KernelStats;
pub use types::{AllocType, Backend, ReductionType, VarKind, VarType};
