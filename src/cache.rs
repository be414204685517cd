//! Hash-keyed on-disk caching of compiled kernels
//!
//! Cache files live in `$HOME/.filament/`, one per kernel, named by the
//! 32-bit hash of the IR text.  The file layout is little-endian:
//!
//! | Offset | Type       | Meaning                               |
//! |--------|------------|---------------------------------------|
//! | 0      | `u8`       | format version (currently 1)          |
//! | 1      | `u32`      | length of the IR text                 |
//! | 5      | `u32`      | length of the compiled payload        |
//! | 9      | `u32`      | function offset within the payload    |
//! | 13     | bytes      | the IR text, verbatim                 |
//! | ...    | bytes      | the relocated payload                 |
//!
//! A stored kernel is only trusted when the embedded IR matches the current
//! kernel byte for byte; version, size, or text mismatches are silently
//! treated as misses and recompilation proceeds.

use crate::error::fatal;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Version number for cache files
pub const CACHE_VERSION: u8 = 1;

const PAGE_SIZE: usize = 4096;

/// 32-bit FNV-1a hash of the IR text
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Returns the cache directory, creating it on first use
pub fn cache_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let dir = Path::new(&home).join(".filament");
    if !dir.is_dir() {
        log::info!("cache: creating directory \"{}\"", dir.display());
        std::fs::create_dir_all(&dir).ok()?;
    }
    Some(dir)
}

/// An anonymous memory mapping holding one compiled kernel payload
///
/// The mapping starts out read-write for population and is switched to
/// read+execute before use.
pub struct ExecMap {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for ExecMap {}
unsafe impl Sync for ExecMap {}

impl ExecMap {
    /// Builds a new read-write mapping that can hold at least `len` bytes
    pub fn new(len: usize) -> Self {
        let len = (len.max(1) + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            fatal!(
                "ExecMap::new(): could not mmap() {} bytes: {}",
                len,
                std::io::Error::last_os_error()
            );
        }
        Self { ptr, len }
    }

    /// Switches the mapping to read+execute
    pub fn make_executable(&self) {
        let rv = unsafe {
            libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_EXEC)
        };
        if rv == -1 {
            fatal!(
                "ExecMap::make_executable(): mprotect() failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Views the mapped region as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// Views the mapped region as a mutable byte slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    /// Returns the base pointer of the mapping
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }
}

impl Drop for ExecMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len as libc::size_t);
        }
    }
}

/// A kernel payload recovered from the cache
pub struct Payload {
    /// The executable mapping holding the payload bytes
    pub map: ExecMap,
    /// Number of meaningful bytes within the mapping
    pub size: usize,
    /// Entry point offset within the payload
    pub func_offset: u32,
}

impl Payload {
    /// The payload bytes
    pub fn code(&self) -> &[u8] {
        &self.map.as_slice()[..self.size]
    }

    /// Pointer to the kernel entry point
    pub fn func_ptr(&self) -> *const u8 {
        unsafe { self.map.as_ptr().add(self.func_offset as usize) }
    }
}

fn read_u32(f: &mut File) -> Option<u32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf).ok()?;
    Some(u32::from_le_bytes(buf))
}

/// Attempts to load a previously compiled kernel
///
/// Returns `None` on any mismatch; the caller recompiles.
pub fn load(dir: &Path, hash: u32, ir: &[u8]) -> Option<Payload> {
    let path = dir.join(format!("{:08x}.bin", hash));
    let mut f = File::open(&path).ok()?;

    let mut version = [0u8; 1];
    f.read_exact(&mut version).ok()?;
    let ir_size = read_u32(&mut f)? as usize;
    let payload_size = read_u32(&mut f)? as usize;
    let func_offset = read_u32(&mut f)?;

    if version[0] != CACHE_VERSION
        || ir_size != ir.len()
        || func_offset as usize >= payload_size
    {
        return None;
    }

    // Byte-exact comparison against the current kernel doubles as the
    // collision check for the 32-bit hash
    let mut remain = &ir[..];
    let mut scratch = [0u8; 1024];
    while !remain.is_empty() {
        let n = remain.len().min(scratch.len());
        f.read_exact(&mut scratch[..n]).ok()?;
        if scratch[..n] != remain[..n] {
            return None;
        }
        remain = &remain[n..];
    }

    let mut map = ExecMap::new(payload_size);
    f.read_exact(&mut map.as_mut_slice()[..payload_size]).ok()?;
    map.make_executable();

    log::debug!(
        "cache: loaded kernel {:08x} ({} bytes) from \"{}\"",
        hash,
        payload_size,
        path.display()
    );
    Some(Payload {
        map,
        size: payload_size,
        func_offset,
    })
}

/// Writes a freshly compiled kernel to the cache
///
/// Racing compilations of the same kernel are benign: the file is created
/// exclusively and `EEXIST` is ignored.
pub fn store(dir: &Path, hash: u32, ir: &[u8], payload: &[u8], func_offset: u32) {
    let path = dir.join(format!("{:08x}.bin", hash));
    let mut f = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return,
        Err(e) => {
            log::warn!("cache: could not create \"{}\": {}", path.display(), e);
            return;
        }
    };

    let write_all = |f: &mut File, data: &[u8]| -> std::io::Result<()> {
        f.write_all(data)
    };

    let result = write_all(&mut f, &[CACHE_VERSION])
        .and_then(|_| write_all(&mut f, &(ir.len() as u32).to_le_bytes()))
        .and_then(|_| write_all(&mut f, &(payload.len() as u32).to_le_bytes()))
        .and_then(|_| write_all(&mut f, &func_offset.to_le_bytes()))
        .and_then(|_| write_all(&mut f, ir))
        .and_then(|_| write_all(&mut f, payload));
    match result {
        Ok(()) => log::debug!(
            "cache: stored kernel {:08x} ({} bytes) in \"{}\"",
            hash,
            payload.len(),
            path.display()
        ),
        Err(e) => {
            log::warn!("cache: could not write \"{}\": {}", path.display(), e);
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fnv() {
        // Standard FNV-1a test vectors
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_roundtrip() {
        let dir = std::env::temp_dir().join("filament-cache-test");
        std::fs::create_dir_all(&dir).unwrap();
        let ir = b"define void @filament_00000000() { ret void }";
        let payload = vec![0xc3u8; 100];
        let hash = fnv1a32(ir);
        let path = dir.join(format!("{:08x}.bin", hash));
        let _ = std::fs::remove_file(&path);

        assert!(load(&dir, hash, ir).is_none());
        store(&dir, hash, ir, &payload, 4);
        let p = load(&dir, hash, ir).expect("cache entry");
        assert_eq!(p.code(), &payload[..]);
        assert_eq!(p.func_offset, 4);

        // A different kernel with the same hash slot must be rejected
        let other = b"define void @filament_00000000() { unreachable }";
        assert!(load(&dir, hash, other).is_none());
        let _ = std::fs::remove_file(&path);
    }
}
