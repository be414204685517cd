//! Module containing the universal error type
use crate::types::{AllocType, Backend};
use thiserror::Error;

/// Universal error type for Filament
///
/// Recoverable conditions are surfaced through this enum; invariant
/// violations (memory corruption, `mmap` failure) go through the fatal path
/// instead and terminate the process with a logged diagnostic.
#[derive(Error, Debug)]
pub enum Error {
    #[error("the JIT compiler is not initialized")]
    Uninitialized,

    #[error("operands have incompatible backends ({0:?} vs. {1:?})")]
    BackendMismatch(Backend, Backend),

    #[error("operands have incompatible sizes ({0} vs. {1})")]
    SizeMismatch(u32, u32),

    #[error("operation template is incompatible with its operands: {0}")]
    TypeMismatch(String),

    #[error("r{0} does not reference an existing variable")]
    UnknownIndex(u32),

    #[error("pointer {0:#x} is not managed by the allocator")]
    UnknownPointer(usize),

    #[error("could not allocate {1} bytes of {name} memory", name = .0.name())]
    AllocationFailure(AllocType, usize),

    #[error("kernel compilation failed: {0}")]
    CompilationFailure(String),

    #[error("r{0} has pending scatter operations and cannot be read here")]
    DirtyRead(u32),

    #[error("invalid loop state: {0}")]
    LoopStateInvalid(String),

    #[error(
        "loop state variable {0} was presumed constant, but changed \
         while re-recording the loop"
    )]
    LoopStateInconsistent(usize),
}

/// Crate-wide result shorthand
pub type Result<T> = std::result::Result<T, Error>;

/// Terminates the process after an invariant violation.
///
/// Continuing after one of these would leave the variable store in an
/// inconsistent state, so there is no recovery path.
macro_rules! fatal {
    ($($t:tt)*) => {{
        log::error!($($t)*);
        eprintln!("filament: fatal error: {}", format_args!($($t)*));
        std::process::abort();
    }};
}
pub(crate) use fatal;
