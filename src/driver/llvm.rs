//! CPU backend via LLVM MCJIT
//!
//! `libLLVM` is loaded dynamically at runtime (set `FILAMENT_LIBLLVM_PATH`
//! to override the library path) and driven through its C API.  The JIT
//! memory manager is replaced with a single pre-sized bump buffer so that
//! the emitted code ends up contiguous and can be copied verbatim into the
//! on-disk kernel cache; the buffer is sized from the IR text, which is in
//! practice much larger than the resulting machine code.  Should a kernel
//! ever overflow the buffer anyway, compilation is retried once with twice
//! the space.

use crate::cache::{ExecMap, Payload};
use crate::driver::{Compiled, Driver, Kernel};
use crate::error::{Error, Result};
use crate::types::{AllocType, Backend, ReductionType, VarType};
use libloading::Library;
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::sync::Arc;

type LlvmBool = c_int;
type Opaque = *mut c_void;

#[repr(C)]
struct McjitCompilerOptions {
    opt_level: c_uint,
    code_model: c_int,
    no_frame_pointer_elim: LlvmBool,
    enable_fast_isel: LlvmBool,
    mcjmm: Opaque,
}

const CODE_MODEL_SMALL: c_int = 3;

macro_rules! llvm_api {
    ($($name:ident: fn($($arg:ty),*) -> $ret:ty;)*) => {
        #[allow(non_snake_case)]
        struct Api {
            _lib: Library,
            $($name: unsafe extern "C" fn($($arg),*) -> $ret,)*
        }

        impl Api {
            #[allow(non_snake_case)]
            unsafe fn load(lib: Library) -> Option<Self> {
                $(
                    let $name = *lib
                        .get::<unsafe extern "C" fn($($arg),*) -> $ret>(
                            concat!("LLVM", stringify!($name), "\0").as_bytes(),
                        )
                        .map_err(|_| {
                            log::warn!(
                                "llvm: could not find symbol \"LLVM{}\"",
                                stringify!($name)
                            );
                        })
                        .ok()?;
                )*
                Some(Self { _lib: lib, $($name,)* })
            }
        }
    };
}

llvm_api! {
    LinkInMCJIT: fn() -> ();
    InitializeX86TargetInfo: fn() -> ();
    InitializeX86Target: fn() -> ();
    InitializeX86TargetMC: fn() -> ();
    InitializeX86AsmPrinter: fn() -> ();
    GetGlobalContext: fn() -> Opaque;
    ModuleCreateWithName: fn(*const c_char) -> Opaque;
    CreateSimpleMCJITMemoryManager:
        fn(Opaque, Opaque, Opaque, Opaque, Opaque) -> Opaque;
    CreateMCJITCompilerForModule:
        fn(*mut Opaque, Opaque, *mut McjitCompilerOptions, usize, *mut *mut c_char)
            -> LlvmBool;
    CreateMemoryBufferWithMemoryRange:
        fn(*const c_char, usize, *const c_char, LlvmBool) -> Opaque;
    ParseIRInContext:
        fn(Opaque, Opaque, *mut Opaque, *mut *mut c_char) -> LlvmBool;
    AddModule: fn(Opaque, Opaque) -> ();
    RemoveModule: fn(Opaque, Opaque, *mut Opaque, *mut *mut c_char) -> LlvmBool;
    DisposeModule: fn(Opaque) -> ();
    GetFunctionAddress: fn(Opaque, *const c_char) -> u64;
    DisposeMessage: fn(*mut c_char) -> ();
    GetDefaultTargetTriple: fn() -> *mut c_char;
    GetHostCPUName: fn() -> *mut c_char;
    GetHostCPUFeatures: fn() -> *mut c_char;
    DisposeExecutionEngine: fn(Opaque) -> ();
}

/// Bump allocator backing the MCJIT memory manager
struct Bump {
    mem: Vec<u8>,
    offset: usize,
    overflow: bool,
}

impl Bump {
    fn new() -> Self {
        Self {
            mem: Vec::new(),
            offset: 0,
            overflow: false,
        }
    }

    fn reserve(&mut self, size: usize) {
        if self.mem.len() < size {
            self.mem = vec![0u8; size];
        }
        self.offset = 0;
        self.overflow = false;
    }
}

unsafe extern "C" fn bump_allocate(
    opaque: Opaque,
    size: usize,
    align: c_uint,
    _id: c_uint,
    name: *const c_char,
) -> *mut u8 {
    let bump = &mut *(opaque as *mut Bump);
    let align = if align == 0 { 16 } else { align as usize };
    let aligned = (bump.offset + align - 1) / align * align;
    if !name.is_null() {
        log::trace!(
            "llvm: allocating section {:?} ({} bytes, align {})",
            CStr::from_ptr(name),
            size,
            align
        );
    }
    if aligned + size > bump.mem.len() {
        bump.overflow = true;
        return std::ptr::null_mut();
    }
    // Zero-fill the alignment padding
    bump.mem[bump.offset..aligned].fill(0);
    bump.offset = aligned + size;
    bump.mem.as_mut_ptr().add(aligned)
}

unsafe extern "C" fn bump_allocate_data(
    opaque: Opaque,
    size: usize,
    align: c_uint,
    id: c_uint,
    name: *const c_char,
    _read_only: LlvmBool,
) -> *mut u8 {
    bump_allocate(opaque, size, align, id, name)
}

unsafe extern "C" fn bump_finalize(_opaque: Opaque, _err: *mut *mut c_char) -> LlvmBool {
    0
}

unsafe extern "C" fn bump_destroy(_opaque: Opaque) {}

/// A kernel compiled to native code
pub struct McjitKernel {
    map: ExecMap,
    func_offset: u32,
    size: usize,
}

impl McjitKernel {
    fn func(&self) -> unsafe extern "C" fn(*const u64, u64, u64) {
        unsafe {
            std::mem::transmute(self.map.as_ptr().add(self.func_offset as usize))
        }
    }
}

impl Kernel for McjitKernel {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// CPU device driven through LLVM MCJIT
pub struct McjitDriver {
    api: Api,
    engine: Opaque,
    context: Opaque,
    bump: *mut Bump,
    /// Host CPU name reported by LLVM
    pub target_cpu: String,
    /// Host feature string reported by LLVM
    pub target_features: String,
    /// Widest vector ISA found in the feature string
    pub vector_width: u32,
    /// LLVM major version, parsed from the library name when possible
    pub version_major: i32,
}

unsafe impl Send for McjitDriver {}

impl McjitDriver {
    /// Attempts to load `libLLVM` and stand up an MCJIT engine
    ///
    /// Returns `None` (with a logged warning) when the library or any
    /// required symbol is missing; the caller falls back to other devices.
    pub fn new() -> Option<Self> {
        let path = std::env::var("FILAMENT_LIBLLVM_PATH")
            .unwrap_or_else(|_| "libLLVM.so".to_string());
        let lib = match unsafe { Library::new(&path) } {
            Ok(lib) => lib,
            Err(e) => {
                log::warn!(
                    "llvm: {} could not be loaded ({}); disabling the LLVM \
                     backend. Set FILAMENT_LIBLLVM_PATH to specify its path.",
                    path,
                    e
                );
                return None;
            }
        };
        let api = unsafe { Api::load(lib)? };

        unsafe {
            (api.LinkInMCJIT)();
            (api.InitializeX86TargetInfo)();
            (api.InitializeX86Target)();
            (api.InitializeX86TargetMC)();
            (api.InitializeX86AsmPrinter)();
        }

        let context = unsafe { (api.GetGlobalContext)() };
        if context.is_null() {
            log::warn!("llvm: could not obtain a context");
            return None;
        }

        let bump = Box::into_raw(Box::new(Bump::new()));
        type AllocFn = unsafe extern "C" fn(
            Opaque,
            usize,
            c_uint,
            c_uint,
            *const c_char,
        ) -> *mut u8;
        type AllocDataFn = unsafe extern "C" fn(
            Opaque,
            usize,
            c_uint,
            c_uint,
            *const c_char,
            LlvmBool,
        ) -> *mut u8;
        type FinalizeFn = unsafe extern "C" fn(Opaque, *mut *mut c_char) -> LlvmBool;
        type DestroyFn = unsafe extern "C" fn(Opaque);
        let mcjmm = unsafe {
            (api.CreateSimpleMCJITMemoryManager)(
                bump as Opaque,
                bump_allocate as AllocFn as usize as Opaque,
                bump_allocate_data as AllocDataFn as usize as Opaque,
                bump_finalize as FinalizeFn as usize as Opaque,
                bump_destroy as DestroyFn as usize as Opaque,
            )
        };

        let mut options = McjitCompilerOptions {
            opt_level: 3,
            code_model: CODE_MODEL_SMALL,
            no_frame_pointer_elim: 0,
            enable_fast_isel: 0,
            mcjmm,
        };
        let module_name = CString::new("filament").unwrap();
        let module = unsafe { (api.ModuleCreateWithName)(module_name.as_ptr()) };
        let mut engine: Opaque = std::ptr::null_mut();
        let mut error: *mut c_char = std::ptr::null_mut();
        let rv = unsafe {
            (api.CreateMCJITCompilerForModule)(
                &mut engine,
                module,
                &mut options,
                std::mem::size_of::<McjitCompilerOptions>(),
                &mut error,
            )
        };
        if rv != 0 {
            let msg = unsafe { CStr::from_ptr(error) };
            log::warn!("llvm: could not create MCJIT: {:?}", msg);
            unsafe { (api.DisposeMessage)(error) };
            return None;
        }

        let take_message = |p: *mut c_char| -> String {
            let s = unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned();
            unsafe { (api.DisposeMessage)(p) };
            s
        };
        let triple = take_message(unsafe { (api.GetDefaultTargetTriple)() });
        let target_cpu = take_message(unsafe { (api.GetHostCPUName)() });
        let target_features = take_message(unsafe { (api.GetHostCPUFeatures)() });

        let mut vector_width = 1;
        if target_features.contains("+sse4.2") {
            vector_width = 4;
        }
        if target_features.contains("+avx") {
            vector_width = 8;
        }
        if target_features.contains("+avx512f") {
            vector_width = 16;
        }

        log::info!(
            "llvm: found {}, cpu={}, vector width={}",
            triple,
            target_cpu,
            vector_width
        );

        Some(Self {
            api,
            engine,
            context,
            bump,
            target_cpu,
            target_features,
            vector_width,
            version_major: -1,
        })
    }

    fn compile_once(&mut self, ir: &str, name: &str) -> Result<Option<McjitKernel>> {
        let bump = unsafe { &mut *self.bump };
        if bump.mem.len() <= ir.len() {
            bump.reserve(ir.len().max(4096));
        }
        bump.offset = 0;
        bump.overflow = false;

        let cname = CString::new(name).unwrap();
        let buf = unsafe {
            (self.api.CreateMemoryBufferWithMemoryRange)(
                ir.as_ptr() as *const c_char,
                ir.len(),
                cname.as_ptr(),
                0,
            )
        };
        if buf.is_null() {
            return Err(Error::CompilationFailure(
                "could not create a memory buffer".to_string(),
            ));
        }

        // The buffer is consumed by the parse call
        let mut module: Opaque = std::ptr::null_mut();
        let mut error: *mut c_char = std::ptr::null_mut();
        unsafe {
            (self.api.ParseIRInContext)(self.context, buf, &mut module, &mut error)
        };
        if !error.is_null() {
            let msg = unsafe { CStr::from_ptr(error) }
                .to_string_lossy()
                .into_owned();
            unsafe { (self.api.DisposeMessage)(error) };
            return Err(Error::CompilationFailure(msg));
        }

        unsafe { (self.api.AddModule)(self.engine, module) };
        let func = unsafe { (self.api.GetFunctionAddress)(self.engine, cname.as_ptr()) };

        let mut out = None;
        let bump = unsafe { &mut *self.bump };
        if !bump.overflow && func != 0 {
            let base = bump.mem.as_ptr() as u64;
            if func < base || func >= base + bump.offset as u64 {
                return Err(Error::CompilationFailure(format!(
                    "kernel \"{}\" landed outside the managed buffer",
                    name
                )));
            }
            let func_offset = (func - base) as u32;
            let mut map = ExecMap::new(bump.offset);
            map.as_mut_slice()[..bump.offset]
                .copy_from_slice(&bump.mem[..bump.offset]);
            map.make_executable();
            out = Some(McjitKernel {
                map,
                func_offset,
                size: bump.offset,
            });
        }

        let mut error: *mut c_char = std::ptr::null_mut();
        let mut module_out: Opaque = std::ptr::null_mut();
        unsafe {
            (self.api.RemoveModule)(self.engine, module, &mut module_out, &mut error);
            if !error.is_null() {
                (self.api.DisposeMessage)(error);
            }
            (self.api.DisposeModule)(module_out);
        }
        Ok(out)
    }
}

impl Drop for McjitDriver {
    fn drop(&mut self) {
        unsafe {
            (self.api.DisposeExecutionEngine)(self.engine);
            drop(Box::from_raw(self.bump));
        }
    }
}

const ALLOC_ALIGN: usize = 64;

impl Driver for McjitDriver {
    fn backend(&self) -> Backend {
        Backend::Llvm
    }

    fn name(&self) -> &'static str {
        "llvm"
    }

    fn alloc(&mut self, _ty: AllocType, size: usize) -> Option<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(size, ALLOC_ALIGN).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    unsafe fn release(&mut self, _ty: AllocType, ptr: *mut u8, size: usize) {
        let layout =
            std::alloc::Layout::from_size_align_unchecked(size, ALLOC_ALIGN);
        std::alloc::dealloc(ptr, layout);
    }

    unsafe fn copy_to_device(&mut self, dst: *mut u8, src: *const u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }

    unsafe fn copy_from_device(
        &mut self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }

    unsafe fn memcpy(&mut self, dst: *mut u8, src: *const u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }

    unsafe fn memcpy_async(&mut self, dst: *mut u8, src: *const u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }

    unsafe fn fill(&mut self, ty: VarType, ptr: *mut u8, size: u32, src: &[u8]) {
        let esize = ty.size();
        for i in 0..size as usize {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(i * esize), esize);
        }
    }

    unsafe fn reduce(
        &mut self,
        ty: VarType,
        rtype: ReductionType,
        ptr: *const u8,
        size: u32,
        out: *mut u8,
    ) {
        crate::driver::reference::ReferenceDriver::default()
            .reduce(ty, rtype, ptr, size, out)
    }

    unsafe fn scan(&mut self, input: *const u32, out: *mut u32, size: u32) {
        crate::driver::reference::ReferenceDriver::default()
            .scan(input, out, size)
    }

    unsafe fn all(&mut self, values: *const u8, size: u32) -> bool {
        (0..size as usize).all(|i| *values.add(i) != 0)
    }

    unsafe fn any(&mut self, values: *const u8, size: u32) -> bool {
        (0..size as usize).any(|i| *values.add(i) != 0)
    }

    unsafe fn mkperm(
        &mut self,
        values: *const u32,
        size: u32,
        bucket_count: u32,
        perm: *mut u32,
        offsets: *mut u32,
    ) -> u32 {
        crate::driver::reference::ReferenceDriver::default()
            .mkperm(values, size, bucket_count, perm, offsets)
    }

    fn compile(&mut self, ir: &str, name: &str) -> Result<Compiled> {
        // One retry with a doubled buffer when the sections overflow the
        // size heuristic
        for attempt in 0..2 {
            match self.compile_once(ir, name)? {
                Some(kernel) => {
                    let payload = kernel.map.as_slice()[..kernel.size].to_vec();
                    let func_offset = kernel.func_offset;
                    return Ok(Compiled {
                        kernel: Arc::new(kernel),
                        payload: Some((payload, func_offset)),
                    });
                }
                None => {
                    let bump = unsafe { &mut *self.bump };
                    let grown = (bump.mem.len() * 2).max(ir.len() * 2);
                    log::debug!(
                        "llvm: sections overflowed the code buffer \
                         (attempt {}); growing to {} bytes",
                        attempt,
                        grown
                    );
                    bump.reserve(grown);
                }
            }
        }
        Err(Error::CompilationFailure(format!(
            "kernel \"{}\" did not fit the JIT code buffer",
            name
        )))
    }

    fn load(&mut self, payload: Payload) -> Option<Arc<dyn Kernel>> {
        let size = payload.size;
        let func_offset = payload.func_offset;
        Some(Arc::new(McjitKernel {
            map: payload.map,
            func_offset,
            size,
        }))
    }

    unsafe fn launch(
        &mut self,
        kernel: &dyn Kernel,
        size: u32,
        params: &[u64],
        parallel: bool,
    ) -> Result<()> {
        let kernel = kernel
            .as_any()
            .downcast_ref::<McjitKernel>()
            .ok_or_else(|| {
                Error::CompilationFailure(
                    "kernel was not produced by the LLVM device".to_string(),
                )
            })?;
        let func = kernel.func();
        if parallel && size > 4096 {
            use rayon::prelude::*;
            const CHUNK: u64 = 1024;
            let blocks = (u64::from(size) + CHUNK - 1) / CHUNK;
            let params_ptr = params.as_ptr() as usize;
            (0..blocks).into_par_iter().for_each(|b| {
                let start = b * CHUNK;
                let end = (start + CHUNK).min(u64::from(size));
                unsafe { func(params_ptr as *const u64, start, end) };
            });
        } else {
            func(params.as_ptr(), 0, u64::from(size));
        }
        Ok(())
    }

    fn sync(&mut self) {}
}
