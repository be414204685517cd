//! Evaluation scheduler
//!
//! Turns the set of live variables into kernels: snapshot the roots,
//! collect every unmaterialized ancestor, partition by backend and size,
//! topologically order each partition, generate and compile code (with both
//! in-memory and on-disk caching), launch, and finally rewrite the evaluated
//! nodes from expression form into materialized form.
//!
//! Scatter flushing is ordered at partition granularity: a partition that
//! reads a dirty buffer runs after every partition containing scatters that
//! target it.

use crate::cache;
use crate::codegen::{self, kernel_name, rename_kernel};
use crate::error::{fatal, Error, Result};
use crate::state::{KernelEntry, State};
use crate::types::{Backend, VarKind, VarType};
use crate::variable::VariableKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

struct Group {
    backend: Backend,
    size: u32,
    nodes: Vec<u32>,
}

/// Checks whether a variable carries work for the scheduler
///
/// Plain `Nop` carriers (loop bookkeeping holders) have neither statements
/// nor dependencies and are skipped entirely.
fn evaluable(v: &crate::variable::Variable) -> bool {
    if v.is_materialized() {
        return false;
    }
    match v.kind {
        VarKind::Expression => v.cmd.is_some(),
        VarKind::Nop => v.dep[0] != 0,
        _ => true,
    }
}

impl State {
    /// Marks a variable for evaluation during the next `eval` call
    pub fn var_schedule(&mut self, index: u32) -> Result<()> {
        let v = self.var(index)?;
        if !v.is_materialized() && v.cmd.is_some() && !v.symbolic {
            self.scheduled.push(index);
        }
        Ok(())
    }

    /// Evaluates everything in the live set
    pub fn eval(&mut self) -> Result<()> {
        let mut roots: Vec<u32> = self
            .live
            .iter()
            .copied()
            .filter(|&i| {
                self.variables
                    .get(&i)
                    .map(|v| evaluable(v) && !v.symbolic)
                    .unwrap_or(false)
            })
            .collect();
        roots.extend(std::mem::take(&mut self.scheduled));
        self.run(roots)?;

        // Everything with pending scatters was flushed above
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.retain(|&t| self.variables.get(&t).map(|v| v.dirty).unwrap_or(false));
        self.dirty = dirty;
        let mut trace = std::mem::take(&mut self.se_trace);
        trace.retain(|&(_, i)| {
            self.variables
                .get(&i)
                .map(|v| v.cmd.is_some())
                .unwrap_or(false)
        });
        self.se_trace = trace;
        self.release_pending();
        Ok(())
    }

    /// Evaluates the sub-graph rooted at the given variable
    pub fn var_eval(&mut self, index: u32) -> Result<()> {
        let v = self.var(index)?;
        if v.symbolic {
            return Err(Error::DirtyRead(index));
        }
        let mut roots = vec![];
        if !v.is_materialized() {
            roots.push(index);
        }
        if v.dirty {
            if let Some(scatters) = self.scatter_by_target.get(&index) {
                roots.extend(scatters.iter().copied());
            }
        }
        if roots.is_empty() {
            return Ok(());
        }
        self.run(roots)?;
        self.release_pending();
        Ok(())
    }

    fn run(&mut self, roots: Vec<u32>) -> Result<()> {
        let collected = self.collect(roots)?;
        if collected.is_empty() {
            return Ok(());
        }
        let groups = self.partition(&collected)?;
        for group in groups {
            self.run_group(group)?;
        }
        Ok(())
    }

    /// Reverse reachability: all unmaterialized ancestors of the roots
    ///
    /// Encountering a dirty materialized buffer pulls the scatters targeting
    /// it into the set, so that reads always observe flushed data.
    fn collect(&self, roots: Vec<u32>) -> Result<Vec<u32>> {
        let mut set = HashSet::new();
        let mut stack = roots;
        while let Some(i) = stack.pop() {
            let v = match self.variables.get(&i) {
                Some(v) => v,
                None => continue,
            };
            if v.is_materialized() {
                if v.dirty {
                    if let Some(scatters) = self.scatter_by_target.get(&i) {
                        stack.extend(scatters.iter().copied());
                    }
                }
                continue;
            }
            if !evaluable(v) {
                continue;
            }
            if !set.insert(i) {
                continue;
            }
            stack.extend(v.iter_deps());
            if v.kind == VarKind::LoopEnd {
                if let Some(ld) = self.loops.get(&i) {
                    stack.extend(ld.inner_in.iter().copied());
                    stack.extend(ld.inner_out.iter().copied());
                }
            }
        }
        let mut out: Vec<u32> = set.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Splits the collected set into kernels keyed by (backend, size)
    ///
    /// Nodes recorded inside a symbolic loop join the loop's partition
    /// regardless of their own size.
    fn partition(&self, collected: &[u32]) -> Result<Vec<Group>> {
        // Index ranges covered by completed loops in the set
        let mut ranges: Vec<(u32, u32, u32)> = Vec::new(); // (lo, hi, size)
        for &i in collected {
            let v = self.var(i)?;
            if v.kind == VarKind::LoopEnd {
                if let Some(ld) = self.loops.get(&i) {
                    ranges.push((ld.start, ld.range_hi, v.size));
                }
            }
        }

        let mut keys: HashMap<(Backend, u32), usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for &i in collected {
            let v = self.var(i)?;
            let size = ranges
                .iter()
                .find(|&&(lo, hi, _)| i >= lo && i <= hi)
                .map(|&(_, _, s)| s)
                .unwrap_or(v.size);
            let key = (v.backend, size);
            let slot = *keys.entry(key).or_insert_with(|| {
                groups.push(Group {
                    backend: v.backend,
                    size: key.1,
                    nodes: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].nodes.push(i);
        }

        // Order partitions so that producers run before consumers and
        // scatters flush before their target is read
        let mut group_of: HashMap<u32, usize> = HashMap::new();
        for (gi, g) in groups.iter().enumerate() {
            for &n in &g.nodes {
                group_of.insert(n, gi);
            }
        }
        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        for (gi, g) in groups.iter().enumerate() {
            for &n in &g.nodes {
                for d in self.var(n)?.iter_deps() {
                    if let Some(&gd) = group_of.get(&d) {
                        if gd != gi {
                            edges.insert((gd, gi));
                        }
                    } else if let Ok(dv) = self.var(d) {
                        if dv.is_materialized() && dv.dirty {
                            if let Some(scatters) = self.scatter_by_target.get(&d)
                            {
                                for &s in scatters {
                                    if let Some(&gs) = group_of.get(&s) {
                                        if gs != gi {
                                            edges.insert((gs, gi));
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        let mut indeg = vec![0usize; groups.len()];
        for &(_, to) in &edges {
            indeg[to] += 1;
        }
        let mut ready: Vec<usize> =
            (0..groups.len()).filter(|&i| indeg[i] == 0).collect();
        let mut order = Vec::new();
        while let Some(gi) = ready.pop() {
            order.push(gi);
            for &(from, to) in &edges {
                if from == gi {
                    indeg[to] -= 1;
                    if indeg[to] == 0 {
                        ready.push(to);
                    }
                }
            }
        }
        if order.len() != groups.len() {
            fatal!("partition(): cyclic dependency between kernels");
        }

        let mut slots: Vec<Option<Group>> = groups.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .map(|gi| slots[gi].take().unwrap())
            .collect())
    }

    /// Topological order within one partition
    ///
    /// Dependencies come first; ties go to larger subtrees (better register
    /// pressure), then to creation order (FIFO among independent scatters).
    /// Explicit ordering edges keep loop bodies between the loop condition
    /// and the loop end, and phi initializers ahead of the loop start.
    fn order_group(&self, g: &Group) -> Result<Vec<u32>> {
        let members: HashSet<u32> = g.nodes.iter().copied().collect();
        let mut edges: HashSet<(u32, u32)> = HashSet::new();
        for &n in &g.nodes {
            for d in self.var(n)?.iter_deps() {
                if members.contains(&d) {
                    edges.insert((d, n));
                }
            }
        }
        for &n in &g.nodes {
            let v = self.var(n)?;
            if v.kind != VarKind::LoopEnd {
                continue;
            }
            let ld = match self.loops.get(&n) {
                Some(ld) => ld,
                None => continue,
            };
            let cond = v.dep[1];
            let start = ld.start;
            for &m in &g.nodes {
                let mv = self.var(m)?;
                if mv.scope == ld.body_scope
                    && mv.kind == VarKind::Expression
                    && m != cond
                {
                    edges.insert((cond, m));
                    edges.insert((m, n));
                }
            }
            for i in 0..ld.inner_in.len() {
                let outer = ld.outer_in[i];
                if members.contains(&outer) {
                    edges.insert((outer, start));
                }
            }
        }

        let mut indeg: HashMap<u32, usize> =
            g.nodes.iter().map(|&n| (n, 0)).collect();
        let mut succ: HashMap<u32, Vec<u32>> = HashMap::new();
        for &(from, to) in &edges {
            *indeg.get_mut(&to).unwrap() += 1;
            succ.entry(from).or_default().push(to);
        }
        let mut heap: BinaryHeap<(u32, Reverse<u32>)> = g
            .nodes
            .iter()
            .filter(|&&n| indeg[&n] == 0)
            .map(|&n| (self.var(n).map(|v| v.tsize).unwrap_or(0), Reverse(n)))
            .collect();
        let mut order = Vec::with_capacity(g.nodes.len());
        while let Some((_, Reverse(n))) = heap.pop() {
            order.push(n);
            if let Some(next) = succ.get(&n) {
                for &m in next {
                    let e = indeg.get_mut(&m).unwrap();
                    *e -= 1;
                    if *e == 0 {
                        heap.push((self.var(m)?.tsize, Reverse(m)));
                    }
                }
            }
        }
        if order.len() != g.nodes.len() {
            fatal!("order_group(): cyclic dependency within a kernel");
        }
        Ok(order)
    }

    /// Compiles and launches one partition, then materializes its nodes
    fn run_group(&mut self, mut group: Group) -> Result<()> {
        // Earlier partitions may already have materialized shared scalars
        group.nodes.retain(|&n| {
            self.variables
                .get(&n)
                .map(|v| !v.is_materialized())
                .unwrap_or(false)
        });
        if group.nodes.is_empty() {
            return Ok(());
        }
        let order = self.order_group(&group)?;

        // Values that outlive the kernel: external references, or internal
        // references from outside this partition
        let members: HashSet<u32> = order.iter().copied().collect();
        let mut in_refs: HashMap<u32, u32> = HashMap::new();
        for &n in &order {
            for d in self.var(n)?.iter_deps() {
                if members.contains(&d) {
                    *in_refs.entry(d).or_default() += 1;
                }
            }
        }
        let mut outputs = Vec::new();
        for &n in &order {
            let v = self.var(n)?;
            if v.ty == VarType::Void
                || v.side_effect
                || !matches!(v.kind, VarKind::Expression | VarKind::LoopResult)
            {
                continue;
            }
            let inside = in_refs.get(&n).copied().unwrap_or(0);
            let loop_refs = self.loop_ref_count(n);
            if v.ref_count_ext > loop_refs
                || v.ref_count_int > inside
            {
                outputs.push(n);
            }
        }

        let source =
            codegen::assemble(self, group.backend, group.size, &order, &outputs)?;
        let kernel = self.kernel_for(group.backend, &source.ir)?;

        // Parameter block: lane count, then one pointer per parameter
        let mut buffers: HashMap<u32, *mut u8> = HashMap::new();
        let mut params: Vec<u64> = Vec::with_capacity(source.params.len() + 1);
        params.push(u64::from(group.size));
        for p in &source.params {
            if p.output {
                let v = self.var(p.index)?;
                let bytes = v.ty.size() * v.size as usize;
                let ty = crate::AllocType::Device;
                let ptr = match self.malloc(ty, bytes) {
                    Ok(ptr) => ptr,
                    Err(e) => {
                        for (_, b) in buffers.drain() {
                            let _ = self.free(b);
                        }
                        return Err(e);
                    }
                };
                buffers.insert(p.index, ptr);
                params.push(ptr as u64);
            } else {
                params.push(self.var(p.index)?.data as u64);
            }
        }

        log::debug!(
            "eval(): launching kernel over {} lanes ({} statements, {} outputs)",
            group.size,
            order.len(),
            outputs.len()
        );
        let parallel = self.parallel_dispatch;
        {
            let driver = self.backend_driver(group.backend);
            unsafe { driver.launch(kernel.as_ref(), group.size, &params, parallel)? };
        }
        self.kernel_stats.launches += 1;

        // Rewrite evaluated nodes: expression -> materialized
        for &n in &order {
            if !self.variables.contains_key(&n) {
                continue;
            }
            let (was_side_effect, deps): (bool, Vec<u32>) = {
                let v = &self.variables[&n];
                (v.side_effect, v.iter_deps().collect())
            };
            if let Some(key) = VariableKey::new(&self.variables[&n]) {
                if self.variable_from_key.get(&key) == Some(&n) {
                    self.variable_from_key.remove(&key);
                }
            }
            {
                let v = self.variables.get_mut(&n).unwrap();
                v.cmd = None;
                v.dep = [0; 3];
                v.extra_dep = 0;
                v.dirty = false;
                if let Some(&ptr) = buffers.get(&n) {
                    v.data = ptr;
                    v.free_variable = true;
                }
            }
            if let Some(&ptr) = buffers.get(&n) {
                self.variable_from_ptr.insert(ptr as usize, n);
            }
            for d in deps {
                self.dec_ref_int(d);
            }
            if was_side_effect {
                self.retire_scatter(n);
            }
        }
        Ok(())
    }

    /// External references held by loop bookkeeping rather than the caller
    fn loop_ref_count(&self, index: u32) -> u32 {
        let mut count = 0;
        for ld in self.loops.values() {
            count += ld
                .inner_in
                .iter()
                .chain(ld.inner_out.iter())
                .chain(ld.outer_in.iter())
                .filter(|&&i| i == index)
                .count() as u32;
        }
        count
    }

    /// Drops the bookkeeping of an executed scatter statement
    fn retire_scatter(&mut self, index: u32) {
        let mut flushed = Vec::new();
        for (&target, scatters) in self.scatter_by_target.iter_mut() {
            scatters.retain(|&s| s != index);
            if scatters.is_empty() {
                flushed.push(target);
            }
        }
        for target in flushed {
            self.scatter_by_target.remove(&target);
            if let Some(v) = self.variables.get_mut(&target) {
                v.dirty = false;
            }
        }
        self.live.remove(&index);
        self.dec_ref_ext(index);
    }

    /// Resolves IR text to an executable kernel
    ///
    /// Lookup order: in-memory table, on-disk cache, compiler.  The hash is
    /// computed over the canonical kernel name; a unique name is substituted
    /// only for the compiler's benefit.
    fn kernel_for(
        &mut self,
        backend: Backend,
        ir: &str,
    ) -> Result<std::sync::Arc<dyn crate::driver::Kernel>> {
        let hash = cache::fnv1a32(ir.as_bytes());
        if let Some(entry) = self.kernels.get_mut(&(backend, hash)) {
            entry.hits += 1;
            self.kernel_stats.memory_hits += 1;
            return Ok(entry.kernel.clone());
        }

        if let Some(dir) = self.cache_dir.clone() {
            if let Some(payload) = cache::load(&dir, hash, ir.as_bytes()) {
                let driver = self.backend_driver(backend);
                if let Some(kernel) = driver.load(payload) {
                    self.kernel_stats.disk_hits += 1;
                    self.kernels.insert(
                        (backend, hash),
                        KernelEntry {
                            kernel: kernel.clone(),
                            hits: 0,
                        },
                    );
                    return Ok(kernel);
                }
            }
        }

        let name = kernel_name(self.kernel_id);
        self.kernel_id = self.kernel_id.wrapping_add(1);
        let unique_ir = rename_kernel(ir, &name);
        let compiled = {
            let driver = self.backend_driver(backend);
            driver.compile(&unique_ir, &name)?
        };
        self.kernel_stats.compiled += 1;
        log::debug!("eval(): compiled kernel {:08x} as {}", hash, name);
        if let (Some(dir), Some((payload, func_offset))) =
            (self.cache_dir.clone(), compiled.payload.as_ref())
        {
            cache::store(&dir, hash, ir.as_bytes(), payload, *func_offset);
        }
        self.kernels.insert(
            (backend, hash),
            KernelEntry {
                kernel: compiled.kernel.clone(),
                hits: 0,
            },
        );
        Ok(compiled.kernel)
    }
}
