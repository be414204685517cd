//! SSA node table with dual reference counting and value numbering
//!
//! Every traced operation becomes a [`Variable`]: one assignment in SSA
//! form.  Variables are shared aggressively — identical expressions
//! deduplicate through [`VariableKey`] — so their lifetime is governed by
//! *two* counters: external references held by the application, and internal
//! references held by other variables that name this one as a dependency.
//! A node is destroyed when both counters reach zero; destruction releases
//! the internal counts of its dependencies, which is what keeps the graph
//! leak-free without a cycle collector.

use crate::error::{fatal, Error, Result};
use crate::state::State;
use crate::types::{Backend, VarKind, VarType};
use std::fmt::Write;
use std::sync::Arc;

/// Central variable data structure: one assignment in SSA form
pub struct Variable {
    /// Intermediate language statement, absent once materialized
    pub cmd: Option<Arc<str>>,

    /// Data type of this variable
    pub ty: VarType,

    /// Node kind; everything except loop machinery is `Expression`
    pub kind: VarKind,

    /// Compilation backend this variable belongs to
    pub backend: Backend,

    /// Number of entries
    pub size: u32,

    /// Dependencies of this instruction
    pub dep: [u32; 3],

    /// Extra dependency that is not used in arithmetic (scatter/gather,
    /// loop state)
    pub extra_dep: u32,

    /// Associated label (for debugging)
    pub label: Option<String>,

    /// Pointer to device memory, null until materialized
    pub data: *mut u8,

    /// External reference count (held by the application)
    pub ref_count_ext: u32,

    /// Internal reference count (dependencies within the graph)
    pub ref_count_int: u32,

    /// Size of the instruction subtree (scheduling heuristic)
    pub tsize: u32,

    /// CSE scope this variable was created in
    pub scope: u32,

    /// Depends on loop phi nodes (only meaningful while recording)
    pub symbolic: bool,

    /// Does the instruction have side effects (e.g. scatter)?
    pub side_effect: bool,

    /// A variable is dirty if there are pending scatters targeting it
    pub dirty: bool,

    /// Free `data` once the variable is no longer referenced?
    pub free_variable: bool,

    /// Is this a pointer literal rather than an array holding a pointer?
    pub direct_pointer: bool,
}

impl Default for Variable {
    fn default() -> Self {
        Self {
            cmd: None,
            ty: VarType::Invalid,
            kind: VarKind::Expression,
            backend: Backend::Cuda,
            size: 0,
            dep: [0; 3],
            extra_dep: 0,
            label: None,
            data: std::ptr::null_mut(),
            ref_count_ext: 0,
            ref_count_int: 0,
            tsize: 1,
            scope: 0,
            symbolic: false,
            side_effect: false,
            dirty: false,
            free_variable: true,
            direct_pointer: false,
        }
    }
}

impl Variable {
    /// Checks whether the variable is backed by device memory
    pub fn is_materialized(&self) -> bool {
        !self.data.is_null()
    }

    /// Iterates over all dependencies, including the extra one
    pub fn iter_deps(&self) -> impl Iterator<Item = u32> + '_ {
        self.dep
            .iter()
            .copied()
            .chain(std::iter::once(self.extra_dep))
            .filter(|&d| d != 0)
    }
}

/// Abbreviated version of [`Variable`], used as the value numbering key
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct VariableKey {
    cmd: Arc<str>,
    ty: VarType,
    size: u32,
    dep: [u32; 3],
    extra_dep: u32,
    scope: u32,
}

impl VariableKey {
    /// Builds the key of a CSE-eligible variable
    ///
    /// Side-effecting statements, dirty variables, materialized variables,
    /// and loop machinery never enter the key space.
    pub fn new(v: &Variable) -> Option<Self> {
        if v.side_effect || v.dirty || v.kind != VarKind::Expression {
            return None;
        }
        let cmd = v.cmd.as_ref()?.clone();
        Some(Self {
            cmd,
            ty: v.ty,
            size: v.size,
            dep: v.dep,
            extra_dep: v.extra_dep,
            scope: v.scope,
        })
    }

    fn mentions(&self, index: u32) -> bool {
        self.dep.contains(&index) || self.extra_dep == index
    }
}

/// Canonical broadcast statement for the literal constants 0 and 1
///
/// Trace-time simplification and the literal predicates compare statements
/// against these templates byte-for-byte, so every front-end producing
/// literals must use the exact same spellings.
pub fn literal_cmd(backend: Backend, ty: VarType, one: bool) -> Option<String> {
    if backend != Backend::Cuda {
        // The LLVM dialect spells constants inline; no canonical form yet
        return None;
    }
    let imm: String = match (ty, one) {
        (VarType::Float16, false) => "0x0000".into(),
        (VarType::Float16, true) => "0x3c00".into(),
        (VarType::Float32, false) => "0f00000000".into(),
        (VarType::Float32, true) => "0f3f800000".into(),
        (VarType::Float64, false) => "0d0000000000000000".into(),
        (VarType::Float64, true) => "0d3ff0000000000000".into(),
        (VarType::Bool, false) => "0".into(),
        (VarType::Bool, true) => "1".into(),
        (VarType::Int8 | VarType::UInt8, v) => format!("0x{:02x}", v as u32),
        (VarType::Int16 | VarType::UInt16, v) => format!("0x{:04x}", v as u32),
        (VarType::Int32 | VarType::UInt32, v) => format!("0x{:08x}", v as u32),
        (VarType::Int64 | VarType::UInt64 | VarType::Pointer, v) => {
            format!("0x{:016x}", v as u64)
        }
        _ => return None,
    };
    Some(format!("mov.$t1 $r1, {}", imm))
}

impl State {
    /// Looks up a variable by index
    pub fn var(&self, index: u32) -> Result<&Variable> {
        self.variables
            .get(&index)
            .ok_or(Error::UnknownIndex(index))
    }

    /// Looks up a variable by index, mutably
    pub fn var_mut(&mut self, index: u32) -> Result<&mut Variable> {
        self.variables
            .get_mut(&index)
            .ok_or(Error::UnknownIndex(index))
    }

    /// Registers a new variable, or an existing one via value numbering
    ///
    /// On a fresh insert, one internal reference is taken on every
    /// dependency and the returned handle carries one external reference.
    /// On a CSE hit the dependencies are untouched and the existing
    /// variable's external count is bumped instead.
    pub fn var_new(&mut self, mut v: Variable, cse: bool) -> u32 {
        v.scope = self.scope;
        v.tsize = 1;
        for d in v.dep.iter().chain(std::iter::once(&v.extra_dep)) {
            if *d != 0 {
                if let Some(dv) = self.variables.get(d) {
                    v.tsize = v.tsize.saturating_add(dv.tsize);
                }
            }
        }

        let key = if cse { VariableKey::new(&v) } else { None };
        if let Some(key) = &key {
            if let Some(&existing) = self.variable_from_key.get(key) {
                log::trace!("var_new(): deduplicated to r{}", existing);
                self.inc_ref_ext(existing);
                return existing;
            }
        }

        let index = self.variable_index;
        self.variable_index = self.variable_index.wrapping_add(1);

        let deps: Vec<u32> = v.iter_deps().collect();
        for d in deps {
            self.inc_ref_int(d);
        }

        v.ref_count_ext = 1;
        self.live.insert(index);
        if let Some(key) = key {
            self.variable_from_key.insert(key, index);
        }
        log::trace!(
            "var_new(r{}): size {}, {}",
            index,
            v.size,
            v.cmd.as_deref().unwrap_or("<data>")
        );
        self.variables.insert(index, v);
        index
    }

    /// Increases the external reference count of a variable
    pub fn inc_ref_ext(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        match self.variables.get_mut(&index) {
            Some(v) => {
                v.ref_count_ext += 1;
                if v.ref_count_ext == 1 {
                    self.live.insert(index);
                }
            }
            None => fatal!("inc_ref_ext(r{}): unknown variable", index),
        }
    }

    /// Increases the internal reference count of a variable
    pub fn inc_ref_int(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        match self.variables.get_mut(&index) {
            Some(v) => v.ref_count_int += 1,
            None => fatal!("inc_ref_int(r{}): unknown variable", index),
        }
    }

    /// Decreases the external reference count of a variable
    pub fn dec_ref_ext(&mut self, index: u32) {
        self.dec_ref(index, true);
    }

    /// Decreases the internal reference count of a variable
    pub fn dec_ref_int(&mut self, index: u32) {
        self.dec_ref(index, false);
    }

    fn dec_ref(&mut self, index: u32, ext: bool) {
        // Releasing one node can cascade through its whole subtree; an
        // explicit worklist keeps deep graphs off the call stack.
        let mut work = vec![(index, ext)];
        while let Some((index, ext)) = work.pop() {
            if index == 0 {
                continue;
            }
            let v = match self.variables.get_mut(&index) {
                Some(v) => v,
                None => fatal!("dec_ref(r{}): unknown variable", index),
            };
            if ext {
                if v.ref_count_ext == 0 {
                    fatal!("dec_ref_ext(r{}): reference count underflow", index);
                }
                v.ref_count_ext -= 1;
                if v.ref_count_ext == 0 {
                    self.live.remove(&index);
                }
            } else {
                if v.ref_count_int == 0 {
                    fatal!("dec_ref_int(r{}): reference count underflow", index);
                }
                v.ref_count_int -= 1;
            }
            let v = &self.variables[&index];
            if v.ref_count_ext == 0 && v.ref_count_int == 0 {
                self.destroy(index, &mut work);
            }
        }
    }

    /// Erases a variable whose reference counts reached zero
    fn destroy(&mut self, index: u32, work: &mut Vec<(u32, bool)>) {
        let v = self.variables.remove(&index).unwrap();
        log::trace!("destroy(r{})", index);

        if let Some(key) = VariableKey::new(&v) {
            if self.variable_from_key.get(&key) == Some(&index) {
                self.variable_from_key.remove(&key);
            }
        }
        if v.is_materialized() && !v.direct_pointer {
            self.variable_from_ptr.remove(&(v.data as usize));
        }
        for d in v.iter_deps() {
            work.push((d, false));
        }
        if v.free_variable && v.is_materialized() && !v.direct_pointer {
            if let Err(err) = self.free(v.data) {
                log::warn!("destroy(r{}): {}", index, err);
            }
        }
        self.live.remove(&index);

        // Loop side-structures die with the node that owns them
        if let Some(ld) = self.loops.remove(&index) {
            for r in ld.release_list() {
                work.push((r, true));
            }
        }
    }

    /// Queries the label of a variable
    pub fn var_label(&self, index: u32) -> Result<Option<&str>> {
        Ok(self.var(index)?.label.as_deref())
    }

    /// Assigns a descriptive label to a variable
    pub fn var_set_label(&mut self, index: u32, label: &str) -> Result<()> {
        self.var_mut(index)?.label = if label.is_empty() {
            None
        } else {
            Some(label.to_string())
        };
        Ok(())
    }

    /// Registers an existing buffer as a variable
    pub fn var_map(
        &mut self,
        ty: VarType,
        ptr: *mut u8,
        size: u32,
        free: bool,
    ) -> Result<u32> {
        if ptr.is_null() || size == 0 {
            return Err(Error::SizeMismatch(size, 1));
        }
        let v = Variable {
            ty,
            size,
            data: ptr,
            free_variable: free,
            backend: self.active_backend(),
            ..Default::default()
        };
        let index = self.var_new(v, false);
        self.variable_from_ptr.insert(ptr as usize, index);
        Ok(index)
    }

    /// Copies a host memory region onto the device and registers it
    pub fn var_copy_from_host(
        &mut self,
        ty: VarType,
        data: &[u8],
        size: u32,
    ) -> Result<u32> {
        let bytes = ty.size() * size as usize;
        if size == 0 || data.len() != bytes {
            return Err(Error::SizeMismatch(size, data.len() as u32));
        }
        let ptr = self.malloc(crate::AllocType::Device, bytes)?;
        unsafe {
            self.active_driver().copy_to_device(ptr, data.as_ptr(), bytes);
        }
        self.var_map(ty, ptr, size, true)
    }

    /// Registers a pointer literal, keeping `parent` alive through an
    /// extra dependency
    pub fn var_copy_ptr(&mut self, ptr: *const u8, parent: u32) -> Result<u32> {
        let backend = self.var(parent)?.backend;
        let v = Variable {
            ty: VarType::Pointer,
            size: 1,
            data: ptr as *mut u8,
            direct_pointer: true,
            free_variable: false,
            extra_dep: parent,
            backend,
            ..Default::default()
        };
        Ok(self.var_new(v, false))
    }

    /// Queries the data pointer of a variable (null until materialized)
    pub fn var_ptr(&self, index: u32) -> Result<*mut u8> {
        Ok(self.var(index)?.data)
    }

    /// Queries the size of a variable
    pub fn var_size(&self, index: u32) -> Result<u32> {
        Ok(self.var(index)?.size)
    }

    /// Checks whether a statement is the canonical literal zero
    pub fn var_is_literal_zero(&self, index: u32) -> Result<bool> {
        let v = self.var(index)?;
        Ok(match (&v.cmd, literal_cmd(v.backend, v.ty, false)) {
            (Some(cmd), Some(lit)) => **cmd == lit,
            _ => false,
        })
    }

    /// Checks whether a statement is the canonical literal one
    pub fn var_is_literal_one(&self, index: u32) -> Result<bool> {
        let v = self.var(index)?;
        Ok(match (&v.cmd, literal_cmd(v.backend, v.ty, true)) {
            (Some(cmd), Some(lit)) => **cmd == lit,
            _ => false,
        })
    }

    /// Reads one element of a variable, materializing it first if needed
    pub fn var_read(&mut self, index: u32, offset: usize, dst: &mut [u8]) -> Result<()> {
        if self.var(index)?.dirty {
            self.eval()?;
        }
        if !self.var(index)?.is_materialized() {
            if self.var(index)?.cmd.is_some() {
                self.var_eval(index)?;
            } else {
                let ty = self.var(index)?.ty;
                return Err(Error::TypeMismatch(format!(
                    "r{} ({:?}) has neither data nor a statement",
                    index, ty
                )));
            }
        }
        let v = self.var(index)?;
        let esize = v.ty.size();
        if offset >= v.size as usize || dst.len() != esize {
            return Err(Error::SizeMismatch(offset as u32, v.size));
        }
        let src = unsafe { v.data.add(offset * esize) };
        let backend = v.backend;
        unsafe {
            self.backend_driver(backend)
                .copy_from_device(dst.as_mut_ptr(), src, esize);
        }
        Ok(())
    }

    /// Overwrites one element of a variable in place
    ///
    /// This mutates the buffer behind an existing SSA identity; downstream
    /// users that reached this variable through value numbering will observe
    /// the new contents.
    pub fn var_write(&mut self, index: u32, offset: usize, src: &[u8]) -> Result<()> {
        if self.var(index)?.dirty {
            self.eval()?;
        }
        if !self.var(index)?.is_materialized() {
            if self.var(index)?.cmd.is_some() {
                self.var_eval(index)?;
            } else {
                let ty = self.var(index)?.ty;
                return Err(Error::TypeMismatch(format!(
                    "r{} ({:?}) has neither data nor a statement",
                    index, ty
                )));
            }
        }
        let v = self.var(index)?;
        let esize = v.ty.size();
        if offset >= v.size as usize || src.len() != esize {
            return Err(Error::SizeMismatch(offset as u32, v.size));
        }
        if v.ref_count_int > 0 || v.ref_count_ext > 1 {
            log::warn!(
                "var_write(r{}): variable is shared; value numbering no \
                 longer reflects its contents",
                index
            );
        }
        let dst = unsafe { v.data.add(offset * esize) };
        let backend = v.backend;
        unsafe {
            self.backend_driver(backend)
                .copy_to_device(dst, src.as_ptr(), esize);
        }

        // Pending expressions keyed on this variable would silently alias
        // the rewritten buffer; evict them so future traces re-issue.
        self.variable_from_key.retain(|k, _| !k.mentions(index));
        Ok(())
    }

    /// Marks a statement as a scatter-like operation
    ///
    /// The statement bypasses value numbering, enters the live set
    /// unconditionally (the graph itself keeps it alive until flushed), and
    /// marks `target` dirty.
    pub fn var_mark_scatter(&mut self, index: u32, target: u32) -> Result<()> {
        self.var(index)?;
        {
            let v = self.var_mut(index)?;
            v.side_effect = true;
        }
        self.inc_ref_ext(index);
        self.live.insert(index);
        self.se_counter += 1;
        let counter = self.se_counter;
        self.se_trace.push((counter, index));
        if target != 0 {
            self.var_mut(target)?.dirty = true;
            self.dirty.push(target);
            self.scatter_by_target.entry(target).or_default().push(index);
        }
        Ok(())
    }

    /// Migrates the storage of a materialized variable
    pub fn var_migrate(&mut self, index: u32, ty: crate::AllocType) -> Result<()> {
        if !self.var(index)?.is_materialized() {
            self.var_eval(index)?;
        }
        let old = self.var(index)?.data;
        let new = self.malloc_migrate(old, ty)?;
        if new != old {
            self.variable_from_ptr.remove(&(old as usize));
            self.variable_from_ptr.insert(new as usize, index);
            self.var_mut(index)?.data = new;
        }
        Ok(())
    }

    /// Returns a human-readable summary of all registered variables
    pub fn var_whos(&self) -> String {
        let mut out = String::new();
        writeln!(out, "\n  ID       Type   Size       Refs      Status    Label").unwrap();
        writeln!(out, "  =====================================================").unwrap();
        let mut indices: Vec<_> = self.variables.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            let v = &self.variables[&index];
            writeln!(
                out,
                "  {:<8} {:<6} {:<10} {:>4}/{:<4} {:<9} {}",
                index,
                v.ty.ptx_name(),
                v.size,
                v.ref_count_ext,
                v.ref_count_int,
                if v.is_materialized() { "device" } else { "trace" },
                v.label.as_deref().unwrap_or("")
            )
            .unwrap();
        }
        writeln!(out, "  =====================================================").unwrap();
        for (i, usage) in self.alloc_usage.iter().enumerate() {
            if *usage > 0 || self.alloc_watermark[i] > 0 {
                writeln!(
                    out,
                    "  memory[{}]: {} bytes used ({} peak)",
                    i, usage, self.alloc_watermark[i]
                )
                .unwrap();
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_literal_templates() {
        assert_eq!(
            literal_cmd(Backend::Cuda, VarType::Float32, false).unwrap(),
            "mov.$t1 $r1, 0f00000000"
        );
        assert_eq!(
            literal_cmd(Backend::Cuda, VarType::UInt32, true).unwrap(),
            "mov.$t1 $r1, 0x00000001"
        );
        assert!(literal_cmd(Backend::Llvm, VarType::Float32, false).is_none());
    }

    #[test]
    fn test_key_eligibility() {
        let mut v = Variable {
            cmd: Some("add.$t1 $r1, $r2, $r3".into()),
            ty: VarType::Float32,
            size: 4,
            ..Default::default()
        };
        assert!(VariableKey::new(&v).is_some());
        v.side_effect = true;
        assert!(VariableKey::new(&v).is_none());
        v.side_effect = false;
        v.dirty = true;
        assert!(VariableKey::new(&v).is_none());
    }
}
