//! Two-phase recording of symbolic loops
//!
//! A symbolic loop is traced rather than executed: the caller declares its
//! state variables, receives phi nodes in their place, records the condition
//! and body as ordinary statements, and closes the loop.  Closing may
//! request one bounded re-recording (returning `false`) after eliminating
//! state slots that turned out to be loop-invariant, dirty, or constant.
//!
//! The graph cycles are confined to this module: `LoopPhi` and `LoopResult`
//! reach their `LoopEnd` only through the [`LoopData`] side-structure, which
//! is owned by the `LoopEnd` node once recording completes and releases its
//! references (start last) when that node dies.

use crate::error::{Error, Result};
use crate::state::State;
use crate::types::{VarKind, VarType};
use crate::variable::Variable;

/// Side-structure carrying the state of one recorded loop
pub struct LoopData {
    /// Loop name (diagnostics only)
    pub name: String,
    /// The `LoopStart` node; one external reference is held here
    pub start: u32,
    /// State variables outside the loop (externally referenced here)
    pub outer_in: Vec<u32>,
    /// Phi nodes handed to the caller (externally referenced here);
    /// eliminated slots alias the outer input instead
    pub inner_in: Vec<u32>,
    /// Per-slot values entering the back-edge (externally referenced here)
    pub inner_out: Vec<u32>,
    /// `(result index, slot)` pairs; weak, checked against the table
    pub results: Vec<(u32, usize)>,
    /// CSE scope of the loop body
    pub body_scope: u32,
    /// Largest variable index belonging to the loop's trace
    pub range_hi: u32,
    /// Was the surrounding trace itself symbolic?
    pub symbolic: bool,
    /// Has the bounded re-recording already happened?
    pub retry: bool,
}

impl LoopData {
    /// External references to release when the owning node is destroyed
    ///
    /// The start node comes last so that phis and results are torn down
    /// while the loop skeleton still exists.
    pub fn release_list(&self) -> Vec<u32> {
        self.inner_out
            .iter()
            .chain(self.inner_in.iter())
            .chain(self.outer_in.iter())
            .copied()
            .chain(std::iter::once(self.start))
            .collect()
    }
}

impl State {
    /// Opens a symbolic loop over the given state variables
    ///
    /// Consumes the caller's references on the state variables and replaces
    /// each index with a fresh phi node.  Returns a loop handle that must be
    /// passed to [`var_loop_cond`](State::var_loop_cond) and
    /// [`var_loop_end`](State::var_loop_end); the handle is an ordinary
    /// variable reference that the caller releases when done.
    pub fn var_loop_start(
        &mut self,
        name: Option<&str>,
        indices: &mut [u32],
    ) -> Result<u32> {
        if indices.is_empty() {
            return Err(Error::LoopStateInvalid(
                "attempted to record a loop without state variables".to_string(),
            ));
        }
        let mut backend = None;
        let mut symbolic = false;
        let mut dirty = false;
        for (i, &index) in indices.iter().enumerate() {
            if index == 0 {
                return Err(Error::LoopStateInvalid(format!(
                    "state variable {} is uninitialized",
                    i
                )));
            }
            let v = self.var(index)?;
            match backend {
                None => backend = Some(v.backend),
                Some(b) if b != v.backend => {
                    return Err(Error::LoopStateInvalid(
                        "state involves variables with different backends"
                            .to_string(),
                    ))
                }
                _ => (),
            }
            symbolic |= v.symbolic;
            dirty |= v.dirty;
        }
        let backend = backend.unwrap();

        // Side effects targeting the state must land before the loop
        if dirty {
            self.eval()?;
            for &index in indices.iter() {
                if self.var(index)?.dirty {
                    return Err(Error::LoopStateInvalid(
                        "inputs remain dirty after evaluation".to_string(),
                    ));
                }
            }
        }

        self.new_scope();
        let start = self.var_new(
            Variable {
                kind: VarKind::LoopStart,
                ty: VarType::Void,
                size: 1,
                backend,
                symbolic: true,
                ..Default::default()
            },
            false,
        );
        self.new_scope();

        let mut ld = LoopData {
            name: name.unwrap_or("unnamed").to_string(),
            start,
            outer_in: Vec::with_capacity(indices.len()),
            inner_in: Vec::with_capacity(indices.len()),
            inner_out: Vec::new(),
            results: Vec::new(),
            body_scope: 0,
            range_hi: 0,
            symbolic,
            retry: false,
        };

        for slot in indices.iter_mut() {
            let outer = *slot;
            let (ty, size) = {
                let v = self.var(outer)?;
                (v.ty, v.size)
            };
            // The caller's reference on the outer input moves into the loop
            ld.outer_in.push(outer);
            let phi = self.var_new(
                Variable {
                    kind: VarKind::LoopPhi,
                    ty,
                    size,
                    backend,
                    symbolic: true,
                    dep: [start, 0, 0],
                    extra_dep: outer,
                    ..Default::default()
                },
                false,
            );
            self.inc_ref_ext(phi);
            ld.inner_in.push(phi);
            *slot = phi;
        }
        self.new_scope();

        // A plain carrier keeps the loop bookkeeping alive while the body
        // is being traced
        let holder = self.var_new(
            Variable {
                kind: VarKind::Nop,
                ty: VarType::Void,
                size: 1,
                backend,
                ..Default::default()
            },
            false,
        );
        self.loops.insert(holder, ld);
        log::debug!(
            "var_loop_start(r{}): recording loop with {} state variables",
            start,
            indices.len()
        );
        Ok(holder)
    }

    /// Records the loop condition
    ///
    /// `active` must be a boolean that depends on at least one phi node.
    pub fn var_loop_cond(&mut self, loop_: u32, active: u32) -> Result<u32> {
        let (start, retry) = {
            let ld = self.loops.get(&loop_).ok_or_else(|| {
                Error::LoopStateInvalid("unknown loop handle".to_string())
            })?;
            (ld.start, ld.retry)
        };
        let (active_ty, active_symbolic, active_size, backend) = {
            let v = self.var(active)?;
            (v.ty, v.symbolic, v.size, v.backend)
        };
        if active_ty != VarType::Bool {
            return Err(Error::LoopStateInvalid(
                "loop condition must be a boolean variable".to_string(),
            ));
        }
        // On the bounded re-recording every state slot may have been
        // eliminated, leaving a condition over plain outer values
        if !active_symbolic && !retry {
            return Err(Error::LoopStateInvalid(
                "loop condition does not depend on any loop variable".to_string(),
            ));
        }
        let start_size = self.var(start)?.size;

        self.new_scope();
        let cond = self.var_new(
            Variable {
                kind: VarKind::LoopCond,
                ty: VarType::Void,
                size: start_size.max(active_size),
                backend,
                symbolic: true,
                dep: [start, active, 0],
                ..Default::default()
            },
            false,
        );
        let body_scope = self.new_scope();
        if let Some(ld) = self.loops.get_mut(&loop_) {
            ld.body_scope = body_scope;
        }
        Ok(cond)
    }

    /// Closes a symbolic loop
    ///
    /// On the first pass, state slots that are loop-invariant, dirty
    /// targets, or unchanged literal constants are eliminated and `false`
    /// is returned: the caller must replay the body once with the narrowed
    /// state.  The second pass emits the `LoopEnd` and one `LoopResult` per
    /// surviving slot, rewriting the caller's indices to the results.
    pub fn var_loop_end(
        &mut self,
        loop_: u32,
        cond: u32,
        indices: &mut [u32],
        checkpoint: u64,
    ) -> Result<bool> {
        let (start, retry, symbolic, outer_in, inner_in) = {
            let ld = self.loops.get(&loop_).ok_or_else(|| {
                Error::LoopStateInvalid("unknown loop handle".to_string())
            })?;
            (
                ld.start,
                ld.retry,
                ld.symbolic,
                ld.outer_in.clone(),
                ld.inner_in.clone(),
            )
        };
        if indices.len() != outer_in.len() {
            return Err(Error::LoopStateInvalid(
                "state variable count changed".to_string(),
            ));
        }
        let (cond_size, active, backend) = {
            let v = self.var(cond)?;
            if v.kind != VarKind::LoopCond {
                return Err(Error::LoopStateInvalid(
                    "handle is not a loop condition".to_string(),
                ));
            }
            (v.size, v.dep[1], v.backend)
        };

        // Loop shape: the maximum of the condition and the live state slots
        let mut size = cond_size;
        for i in 0..indices.len() {
            if indices[i] == inner_in[i] {
                continue;
            }
            let s1 = self.var(outer_in[i])?.size;
            let v2 = self.var(indices[i])?;
            if v2.dirty {
                continue;
            }
            size = size.max(s1).max(v2.size);
        }

        if !retry {
            let mut eliminated = 0usize;
            for i in 0..indices.len() {
                let v2_dirty = self.var(indices[i])?.dirty;
                let eliminate = if v2_dirty {
                    // Targets of side effects cannot travel through phis
                    true
                } else if indices[i] == inner_in[i] {
                    true
                } else {
                    let c1 = self.var(outer_in[i])?.cmd.clone();
                    let c2 = self.var(indices[i])?.cmd.clone();
                    match (c1, c2) {
                        (Some(a), Some(b)) => {
                            a == b && self.var_is_literal_like(outer_in[i])?
                        }
                        _ => false,
                    }
                };
                if eliminate {
                    self.inc_ref_ext(outer_in[i]);
                    self.dec_ref_ext(inner_in[i]);
                    if let Some(ld) = self.loops.get_mut(&loop_) {
                        ld.inner_in[i] = ld.outer_in[i];
                    }
                    eliminated += 1;
                }
            }
            if eliminated > 0 {
                let ld = self.loops.get_mut(&loop_).unwrap();
                ld.retry = true;
                for (slot, &inner) in indices.iter_mut().zip(ld.inner_in.iter()) {
                    *slot = inner;
                }
                log::debug!(
                    "var_loop_end(r{}): re-recording to eliminate {}/{} \
                     redundant state variables",
                    start,
                    eliminated,
                    indices.len()
                );
                return Ok(false);
            }
        }

        let inner_in = self.loops[&loop_].inner_in.clone();

        // Back-edge values; on the CPU path the value after the loop exits
        // must stay well defined, hence the select against the phi
        let mut inner_out = Vec::with_capacity(indices.len());
        for i in 0..indices.len() {
            let index = indices[i];
            if index == 0 {
                return Err(Error::LoopStateInvalid(format!(
                    "state variable {} has become uninitialized",
                    i
                )));
            }
            let new_index = if inner_in[i] != outer_in[i] {
                let v2_size = self.var(index)?.size;
                if v2_size != size && size != 1 && v2_size != 1 {
                    return Err(Error::LoopStateInvalid(format!(
                        "state variable {} has a final shape (size {}) \
                         incompatible with the loop (size {})",
                        i, v2_size, size
                    )));
                }
                size = size.max(v2_size);
                if backend == crate::Backend::Llvm {
                    self.var_select(active, index, inner_in[i])?
                } else {
                    self.inc_ref_ext(index);
                    index
                }
            } else if self.var(index)?.dirty {
                self.inc_ref_ext(index);
                index
            } else {
                if index != inner_in[i] {
                    let same_literal = {
                        let c1 = self.var(inner_in[i])?.cmd.clone();
                        let c2 = self.var(index)?.cmd.clone();
                        matches!((c1, c2), (Some(a), Some(b)) if a == b)
                    };
                    if !same_literal {
                        return Err(Error::LoopStateInconsistent(i));
                    }
                }
                self.inc_ref_ext(inner_in[i]);
                inner_in[i]
            };
            inner_out.push(new_index);
        }

        self.new_scope();
        let end = self.var_new(
            Variable {
                kind: VarKind::LoopEnd,
                ty: VarType::Void,
                size,
                backend,
                symbolic: true,
                dep: [start, cond, 0],
                ..Default::default()
            },
            false,
        );
        self.new_scope();

        let mut results = Vec::new();
        let mut live_slots = 0usize;
        for i in 0..indices.len() {
            if inner_in[i] != outer_in[i] {
                let ty = self.var(indices[i])?.ty;
                let result = self.var_new(
                    Variable {
                        kind: VarKind::LoopResult,
                        ty,
                        size,
                        backend,
                        symbolic,
                        dep: [start, end, 0],
                        ..Default::default()
                    },
                    false,
                );
                results.push((result, i));
                indices[i] = result;
                live_slots += 1;
            } else {
                let index = inner_out[i];
                self.inc_ref_ext(index);
                indices[i] = index;
            }
        }
        let range_hi = self.variable_index.wrapping_sub(1);

        // Side effects recorded inside the body are re-parented into a
        // chain rooted above the loop end, so scheduling keeps them inside
        // the loop
        let drained: Vec<u32> = {
            let mut out = Vec::new();
            self.se_trace.retain(|&(c, i)| {
                if c > checkpoint {
                    out.push(i);
                    false
                } else {
                    true
                }
            });
            out
        };
        if !drained.is_empty() {
            let mut prev = end;
            for &se in drained.iter().rev() {
                prev = self.nop_node(backend, size, se, prev, symbolic);
            }
            self.var_mark_scatter(prev, 0)?;
        }

        // The bookkeeping now belongs to the loop end and is released
        // together with it
        let mut ld = self.loops.remove(&loop_).unwrap();
        ld.inner_out = inner_out;
        ld.results = results;
        ld.range_hi = range_hi;
        self.loops.insert(end, ld);

        log::debug!(
            "var_loop_end(r{}): created loop (\"{}\") with {}/{} state \
             variables, {} side effects, array size {}",
            start,
            self.loops[&end].name,
            live_slots,
            indices.len(),
            drained.len(),
            size
        );

        // The end node lives through the results and the side-effect chain
        self.dec_ref_ext(end);
        Ok(true)
    }

    /// Checks whether a statement is a canonical literal constant (any
    /// value, not just zero/one): a broadcast `mov` without dependencies
    pub(crate) fn var_is_literal_like(&self, index: u32) -> Result<bool> {
        let v = self.var(index)?;
        Ok(v.kind == VarKind::Expression
            && v.dep == [0; 3]
            && v.extra_dep == 0
            && v.cmd.as_deref().map(|c| c.starts_with("mov.")).unwrap_or(false))
    }
}
