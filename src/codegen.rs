//! Kernel code generation
//!
//! Turns one scheduled partition (an ordered list of variables sharing a
//! backend and size) into IR text for the target dialect.  The statement
//! templates recorded at trace time are substituted lexically: `$r<k>`
//! becomes the register assigned to operand `k` (operand 1 is the result)
//! and `$t<k>` becomes the operand's type decoration in the target dialect.
//!
//! The PTX path assigns registers with a single linear scan over the
//! partition, recycling a register at the last use of its value.  The LLVM
//! path numbers virtual registers uniquely instead — the IR is in SSA form
//! and the backend compiler performs physical allocation anyway.
//!
//! Register namespaces: `%r`/`%f`/`%p`/`%rd` belong to the allocator,
//! `%a*`/`%ad*`/`%lane`/`%size`/`%done`/`%ptr*` to the kernel skeleton.
//! Templates needing scratch registers should draw them from `%t*`, which
//! the generator never touches.

use crate::error::{Error, Result};
use crate::state::State;
use crate::types::{Backend, VarKind, VarType};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

/// Length in bytes of every kernel name ("filament_" + 8 hex digits)
pub const KERNEL_NAME_LEN: usize = 17;

/// Kernel name embedded into freshly generated IR
///
/// The cache hash is computed over this canonical form; the name is
/// rewritten to a unique one just before handing the text to a compiler.
pub const KERNEL_NAME_CANON: &str = "filament_00000000";

/// Builds the unique kernel name for the given id
pub fn kernel_name(id: u32) -> String {
    format!("filament_{:08x}", id)
}

/// Rewrites the (fixed-length) kernel name inside generated IR
pub fn rename_kernel(ir: &str, name: &str) -> String {
    debug_assert_eq!(name.len(), KERNEL_NAME_LEN);
    ir.replace(KERNEL_NAME_CANON, name)
}

/// One kernel parameter, in launch order
#[derive(Copy, Clone, Debug)]
pub struct KernelParam {
    /// Variable bound to this parameter
    pub index: u32,
    /// Is the parameter written by the kernel?
    pub output: bool,
}

/// Result of assembling one partition
pub struct KernelSource {
    /// Generated IR text, carrying the canonical kernel name
    pub ir: String,
    /// Parameters in the order expected by the launch call
    pub params: Vec<KernelParam>,
}

/// Linear layout of a partition: parameter discovery and value liveness
struct Layout {
    inputs: Vec<u32>,
    pos: HashMap<u32, usize>,
    last_use: HashMap<u32, usize>,
}

impl Layout {
    fn new(state: &State, order: &[u32], outputs: &HashSet<u32>) -> Result<Self> {
        let group: HashSet<u32> = order.iter().copied().collect();
        let mut inputs = Vec::new();
        let mut seen = HashSet::new();
        for &n in order {
            for d in state.var(n)?.iter_deps() {
                if !group.contains(&d) && seen.insert(d) {
                    inputs.push(d);
                }
            }
        }

        let mut pos = HashMap::new();
        for (i, &n) in inputs.iter().chain(order.iter()).enumerate() {
            pos.insert(n, i);
        }

        let mut last_use: HashMap<u32, usize> = HashMap::new();
        for (&n, &p) in &pos {
            last_use.insert(n, p);
        }
        for &n in order {
            let p = pos[&n];
            for d in state.var(n)?.iter_deps() {
                let e = last_use.entry(d).or_insert(p);
                *e = (*e).max(p);
            }
        }
        for &n in outputs {
            last_use.insert(n, usize::MAX);
        }

        // Loop-implied uses: phis are written at the loop end and read by
        // the results; inner outputs are read at the loop end.
        let mut ranges = Vec::new();
        for &n in order {
            let v = state.var(n)?;
            if v.kind != VarKind::LoopEnd {
                continue;
            }
            let ld = match state.loops.get(&n) {
                Some(ld) => ld,
                None => continue,
            };
            let epos = pos[&n];
            if let Some(&spos) = pos.get(&ld.start) {
                ranges.push((spos, epos));
            }
            for i in 0..ld.inner_in.len() {
                if ld.inner_in[i] == ld.outer_in[i] {
                    continue;
                }
                for idx in [ld.inner_in[i], ld.inner_out[i]] {
                    if let Some(e) = last_use.get_mut(&idx) {
                        *e = (*e).max(epos);
                    }
                }
            }
            for &(res, slot) in &ld.results {
                if let (Some(&rpos), Some(e)) =
                    (pos.get(&res), last_use.get_mut(&ld.inner_in[slot]))
                {
                    *e = (*e).max(rpos);
                }
            }
        }

        // Values defined before a loop but used inside it stay live for the
        // whole loop: their registers are re-read on every iteration.
        for (n, lu) in last_use.iter_mut() {
            let p = pos[n];
            for &(spos, epos) in &ranges {
                if p < spos && *lu > spos && *lu < epos {
                    *lu = epos;
                }
            }
        }

        Ok(Self {
            inputs,
            pos,
            last_use,
        })
    }
}

/// Register name prefix per value type (PTX register classes)
fn ptx_prefix(ty: VarType) -> &'static str {
    match ty {
        VarType::Bool => "%p",
        VarType::Float16 | VarType::Float32 | VarType::Float64 => "%f",
        VarType::Int64 | VarType::UInt64 | VarType::Pointer => "%rd",
        _ => "%r",
    }
}

/// Type decoration for PTX loads/stores (predicates travel as bytes)
fn ptx_mem_ty(ty: VarType) -> &'static str {
    if ty == VarType::Bool {
        "u8"
    } else {
        ty.ptx_name()
    }
}

/// Substitutes `$r` / `$t` tokens of one statement
fn substitute(
    out: &mut String,
    cmd: &str,
    reg_of: &dyn Fn(u32) -> Result<String>,
    ty_of: &dyn Fn(u32) -> Result<String>,
) -> Result<()> {
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            let tag = bytes[i + 1];
            if tag == b'r' || tag == b't' {
                let mut j = i + 2;
                let mut n = 0u32;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    n = n * 10 + (bytes[j] - b'0') as u32;
                    j += 1;
                }
                if j > i + 2 {
                    let text = if tag == b'r' { reg_of(n)? } else { ty_of(n)? };
                    out.push_str(&text);
                    i = j;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    Ok(())
}

/// Assembles a partition into IR for the given backend
pub fn assemble(
    state: &State,
    backend: Backend,
    size: u32,
    order: &[u32],
    outputs: &[u32],
) -> Result<KernelSource> {
    let output_set: HashSet<u32> = outputs.iter().copied().collect();
    let layout = Layout::new(state, order, &output_set)?;

    let mut params = vec![];
    for &n in &layout.inputs {
        params.push(KernelParam {
            index: n,
            output: false,
        });
    }
    for &n in outputs {
        params.push(KernelParam {
            index: n,
            output: true,
        });
    }

    let _ = size;
    let ir = match backend {
        Backend::Cuda => {
            PtxAssembler::new(state, &layout, order, &params).run()?
        }
        Backend::Llvm => {
            LlvmAssembler::new(state, &layout, order, &params).run()?
        }
    };
    Ok(KernelSource { ir, params })
}

////////////////////////////////////////////////////////////////////////////////
// PTX
////////////////////////////////////////////////////////////////////////////////

struct PtxAssembler<'a> {
    state: &'a State,
    layout: &'a Layout,
    order: &'a [u32],
    params: &'a [KernelParam],
    out: String,
    reg: HashMap<u32, String>,
    slot_of: HashMap<u32, u32>,
    spare: Vec<u32>,
    next_slot: u32,
    releases: Vec<Vec<u32>>,
}

impl<'a> PtxAssembler<'a> {
    fn new(
        state: &'a State,
        layout: &'a Layout,
        order: &'a [u32],
        params: &'a [KernelParam],
    ) -> Self {
        let positions = layout.inputs.len() + order.len();
        let mut releases = vec![Vec::new(); positions];
        for (&n, &lu) in &layout.last_use {
            if lu < positions {
                releases[lu].push(n);
            }
        }
        Self {
            state,
            layout,
            order,
            params,
            out: String::new(),
            reg: HashMap::new(),
            slot_of: HashMap::new(),
            spare: Vec::new(),
            next_slot: 0,
            releases,
        }
    }

    fn acquire(&mut self, index: u32) -> Result<()> {
        let ty = self.state.var(index)?.ty;
        let slot = self.spare.pop().unwrap_or_else(|| {
            let s = self.next_slot;
            self.next_slot += 1;
            s
        });
        self.reg.insert(index, format!("{}{}", ptx_prefix(ty), slot));
        // Remember the slot inside the name-free map for release
        self.slot_of.insert(index, slot);
        Ok(())
    }

    fn release_at(&mut self, pos: usize) {
        let list = std::mem::take(&mut self.releases[pos]);
        for n in list {
            if let Some(slot) = self.slot_of.remove(&n) {
                self.spare.push(slot);
            }
        }
    }

    fn reg_of(&self, index: u32) -> Result<String> {
        self.reg
            .get(&index)
            .cloned()
            .ok_or(Error::UnknownIndex(index))
    }

    fn run(mut self) -> Result<String> {
        let nparams = self.params.len();
        writeln!(self.out, ".version 6.3").unwrap();
        writeln!(self.out, ".target sm_50").unwrap();
        writeln!(self.out, ".address_size 64\n").unwrap();
        writeln!(
            self.out,
            ".visible .entry {}(.param .align 8 .b8 params[{}]) {{",
            KERNEL_NAME_CANON,
            8 * (nparams + 1)
        )
        .unwrap();
        writeln!(self.out, "    mov.u32 %a0, %ntid.x;").unwrap();
        writeln!(self.out, "    mov.u32 %a1, %ctaid.x;").unwrap();
        writeln!(self.out, "    mov.u32 %a2, %tid.x;").unwrap();
        writeln!(self.out, "    mad.lo.u32 %lane, %a1, %a0, %a2;").unwrap();
        writeln!(self.out, "    ld.param.u32 %size, [params+0];").unwrap();
        writeln!(self.out, "    setp.ge.u32 %done, %lane, %size;").unwrap();
        writeln!(self.out, "    @%done bra EXIT;\n").unwrap();

        // Kernel parameters: one pointer per input/output
        for (k, p) in self.params.iter().enumerate() {
            writeln!(
                self.out,
                "    ld.param.u64 %ptr{}, [params+{}];",
                k,
                8 * (k + 1)
            )
            .unwrap();
        }
        writeln!(self.out).unwrap();

        // Input loads
        for (pos, &n) in self.layout.inputs.clone().iter().enumerate() {
            self.acquire(n)?;
            let v = self.state.var(n)?;
            let reg = self.reg_of(n)?;
            let k = pos; // inputs come first in the parameter block
            if v.direct_pointer {
                writeln!(self.out, "    mov.u64 {}, %ptr{};", reg, k).unwrap();
            } else if v.size == 1 {
                writeln!(
                    self.out,
                    "    ld.global.{} {}, [%ptr{}];",
                    ptx_mem_ty(v.ty),
                    reg,
                    k
                )
                .unwrap();
            } else {
                writeln!(
                    self.out,
                    "    mul.wide.u32 %ad0, %lane, {};",
                    v.ty.size()
                )
                .unwrap();
                writeln!(self.out, "    add.u64 %ad0, %ptr{}, %ad0;", k).unwrap();
                writeln!(
                    self.out,
                    "    ld.global.{} {}, [%ad0];",
                    ptx_mem_ty(v.ty),
                    reg
                )
                .unwrap();
            }
            self.release_at(pos);
        }
        writeln!(self.out).unwrap();

        // Statements
        for (i, &n) in self.order.iter().enumerate() {
            let pos = self.layout.inputs.len() + i;
            self.emit_node(n)?;
            self.release_at(pos);
        }

        // Stores for surviving values
        writeln!(self.out).unwrap();
        for (k, p) in self.params.iter().enumerate() {
            if !p.output {
                continue;
            }
            let v = self.state.var(p.index)?;
            let reg = self.reg_of(p.index)?;
            if v.size == 1 {
                writeln!(
                    self.out,
                    "    st.global.{} [%ptr{}], {};",
                    ptx_mem_ty(v.ty),
                    k,
                    reg
                )
                .unwrap();
            } else {
                writeln!(
                    self.out,
                    "    mul.wide.u32 %ad0, %lane, {};",
                    v.ty.size()
                )
                .unwrap();
                writeln!(self.out, "    add.u64 %ad0, %ptr{}, %ad0;", k).unwrap();
                writeln!(
                    self.out,
                    "    st.global.{} [%ad0], {};",
                    ptx_mem_ty(v.ty),
                    reg
                )
                .unwrap();
            }
        }

        writeln!(self.out, "\nEXIT:").unwrap();
        writeln!(self.out, "    ret;").unwrap();
        writeln!(self.out, "}}").unwrap();
        Ok(self.out)
    }

    fn emit_node(&mut self, n: u32) -> Result<()> {
        let v = self.state.var(n)?;
        match v.kind {
            VarKind::Expression => {
                if v.ty != VarType::Void {
                    self.acquire(n)?;
                }
                let deps = v.dep;
                let extra = v.extra_dep;
                let cmd = v.cmd.clone().ok_or(Error::UnknownIndex(n))?;
                let mut line = String::new();
                {
                    let operand = |k: u32| -> Result<u32> {
                        if k <= 1 {
                            Ok(n)
                        } else {
                            let i = (k - 2) as usize;
                            let d = if i < 3 { deps[i] } else { extra };
                            if d == 0 {
                                return Err(Error::TypeMismatch(format!(
                                    "template \"{}\" references missing operand {}",
                                    cmd, k
                                )));
                            }
                            Ok(d)
                        }
                    };
                    let reg_of = |k: u32| self.reg_of(operand(k)?);
                    let ty_of = |k: u32| {
                        Ok(self.state.var(operand(k)?)?.ty.ptx_name().to_string())
                    };
                    substitute(&mut line, &cmd, &reg_of, &ty_of)?;
                }
                for part in line.split('\n') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let term = if part.ends_with(';') { "" } else { ";" };
                    writeln!(self.out, "    {}{}", part, term).unwrap();
                }
            }
            VarKind::LoopStart => {
                // Initialize the phi registers, then open the loop
                let ld = self
                    .state
                    .loops
                    .values()
                    .find(|ld| ld.start == n)
                    .ok_or(Error::UnknownIndex(n))?;
                for i in 0..ld.inner_in.len() {
                    let phi = ld.inner_in[i];
                    if phi == ld.outer_in[i] {
                        continue;
                    }
                    self.acquire(phi)?;
                    let ty = self.state.var(phi)?.ty;
                    let dst = self.reg_of(phi)?;
                    let src = self.reg_of(ld.outer_in[i])?;
                    writeln!(
                        self.out,
                        "    mov.{} {}, {};",
                        ptx_mem_ty(ty),
                        dst,
                        src
                    )
                    .unwrap();
                }
                writeln!(self.out, "L{}:", n).unwrap();
            }
            VarKind::LoopPhi => {
                // Value lives in the register initialized at the loop start
            }
            VarKind::LoopCond => {
                let start = v.dep[0];
                let active = self.reg_of(v.dep[1])?;
                writeln!(self.out, "    @!{} bra DONE{};", active, start).unwrap();
            }
            VarKind::LoopEnd => {
                let ld = self
                    .state
                    .loops
                    .get(&n)
                    .ok_or(Error::UnknownIndex(n))?;
                for i in 0..ld.inner_in.len() {
                    let phi = ld.inner_in[i];
                    if phi == ld.outer_in[i] || ld.inner_out[i] == phi {
                        continue;
                    }
                    let ty = self.state.var(phi)?.ty;
                    let dst = self.reg_of(phi)?;
                    let src = self.reg_of(ld.inner_out[i])?;
                    writeln!(
                        self.out,
                        "    mov.{} {}, {};",
                        ptx_mem_ty(ty),
                        dst,
                        src
                    )
                    .unwrap();
                }
                writeln!(self.out, "    bra L{};", ld.start).unwrap();
                writeln!(self.out, "DONE{}:", ld.start).unwrap();
            }
            VarKind::LoopResult => {
                self.acquire(n)?;
                let end = v.dep[1];
                let ld = self
                    .state
                    .loops
                    .get(&end)
                    .ok_or(Error::UnknownIndex(end))?;
                let slot = ld
                    .results
                    .iter()
                    .find(|(res, _)| *res == n)
                    .map(|&(_, s)| s)
                    .ok_or(Error::UnknownIndex(n))?;
                let phi = ld.inner_in[slot];
                let ty = self.state.var(n)?.ty;
                let dst = self.reg_of(n)?;
                let src = self.reg_of(phi)?;
                writeln!(self.out, "    mov.{} {}, {};", ptx_mem_ty(ty), dst, src)
                    .unwrap();
            }
            VarKind::Nop => (),
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// LLVM IR
////////////////////////////////////////////////////////////////////////////////

struct LlvmAssembler<'a> {
    state: &'a State,
    layout: &'a Layout,
    order: &'a [u32],
    params: &'a [KernelParam],
    width: u32,
    out: String,
    reg: HashMap<u32, String>,
    tmp: u32,
    cur_block: String,
}

impl<'a> LlvmAssembler<'a> {
    fn new(
        state: &'a State,
        layout: &'a Layout,
        order: &'a [u32],
        params: &'a [KernelParam],
    ) -> Self {
        // Symbolic loops are emitted as scalar code; vector masks would
        // otherwise require a horizontal reduction per iteration
        let has_loop = order.iter().any(|&n| {
            state
                .var(n)
                .map(|v| v.kind != VarKind::Expression)
                .unwrap_or(false)
        });
        let width = if has_loop {
            1
        } else {
            state.llvm_target.vector_width.max(1)
        };
        Self {
            state,
            layout,
            order,
            params,
            width,
            out: String::new(),
            reg: HashMap::new(),
            tmp: 0,
            cur_block: "entry".to_string(),
        }
    }

    fn vty(&self, ty: VarType) -> String {
        if self.width > 1 {
            format!("<{} x {}>", self.width, ty.llvm_name())
        } else {
            ty.llvm_name().to_string()
        }
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.tmp += 1;
        format!("%{}{}", prefix, self.tmp)
    }

    fn reg_of(&self, index: u32) -> Result<String> {
        self.reg
            .get(&index)
            .cloned()
            .ok_or(Error::UnknownIndex(index))
    }

    fn run(mut self) -> Result<String> {
        let w = self.width as usize;
        writeln!(
            self.out,
            "define void @{}(i64* noalias %params, i64 %start, i64 %end) #0 {{",
            KERNEL_NAME_CANON
        )
        .unwrap();
        writeln!(self.out, "entry:").unwrap();

        // Parameter pointers
        for (k, p) in self.params.iter().enumerate() {
            let v = self.state.var(p.index)?;
            writeln!(
                self.out,
                "    %pa{k} = getelementptr inbounds i64, i64* %params, i64 {}",
                k + 1
            )
            .unwrap();
            writeln!(self.out, "    %pv{k} = load i64, i64* %pa{k}").unwrap();
            if !v.direct_pointer {
                writeln!(
                    self.out,
                    "    %in{k} = inttoptr i64 %pv{k} to {}*",
                    v.ty.llvm_name()
                )
                .unwrap();
            }
        }
        writeln!(self.out, "    br label %body\n").unwrap();
        writeln!(self.out, "body:").unwrap();
        writeln!(
            self.out,
            "    %lane = phi i64 [ %start, %entry ], [ %lane_next, %latch ]"
        )
        .unwrap();
        self.cur_block = "body".to_string();

        // Input loads
        for (k, &n) in self.layout.inputs.clone().iter().enumerate() {
            let v = self.state.var(n)?;
            if v.direct_pointer {
                self.reg.insert(n, format!("%pv{}", k));
                continue;
            }
            let name = format!("%v{}", n);
            let base = v.ty.llvm_name();
            if v.size == 1 {
                if w > 1 {
                    let vt = self.vty(v.ty);
                    let u = self.fresh("u");
                    writeln!(
                        self.out,
                        "    {} = load {}, {}* %in{}",
                        u, base, base, k
                    )
                    .unwrap();
                    let ins = self.fresh("u");
                    writeln!(
                        self.out,
                        "    {} = insertelement {} undef, {} {}, i32 0",
                        ins, vt, base, u
                    )
                    .unwrap();
                    writeln!(
                        self.out,
                        "    {} = shufflevector {} {}, {} undef, <{} x i32> zeroinitializer",
                        name, vt, ins, vt, w
                    )
                    .unwrap();
                } else {
                    writeln!(
                        self.out,
                        "    {} = load {}, {}* %in{}",
                        name, base, base, k
                    )
                    .unwrap();
                }
            } else {
                let a = self.fresh("a");
                writeln!(
                    self.out,
                    "    {} = getelementptr inbounds {}, {}* %in{}, i64 %lane",
                    a, base, base, k
                )
                .unwrap();
                if w > 1 {
                    let vt = self.vty(v.ty);
                    let c = self.fresh("c");
                    writeln!(
                        self.out,
                        "    {} = bitcast {}* {} to {}*",
                        c, base, a, vt
                    )
                    .unwrap();
                    writeln!(
                        self.out,
                        "    {} = load {}, {}* {}, align {}",
                        name,
                        vt,
                        vt,
                        c,
                        v.ty.size()
                    )
                    .unwrap();
                } else {
                    writeln!(
                        self.out,
                        "    {} = load {}, {}* {}",
                        name, base, base, a
                    )
                    .unwrap();
                }
            }
            self.reg.insert(n, name);
        }

        // Statements
        for &n in self.order {
            self.emit_node(n)?;
        }

        // Stores
        for (k, p) in self.params.iter().enumerate() {
            if !p.output {
                continue;
            }
            let v = self.state.var(p.index)?;
            let reg = self.reg_of(p.index)?;
            let base = v.ty.llvm_name();
            if v.size == 1 {
                writeln!(
                    self.out,
                    "    store {} {}, {}* %in{}",
                    base, reg, base, k
                )
                .unwrap();
            } else {
                let a = self.fresh("a");
                writeln!(
                    self.out,
                    "    {} = getelementptr inbounds {}, {}* %in{}, i64 %lane",
                    a, base, base, k
                )
                .unwrap();
                if w > 1 {
                    let vt = self.vty(v.ty);
                    let c = self.fresh("c");
                    writeln!(
                        self.out,
                        "    {} = bitcast {}* {} to {}*",
                        c, base, a, vt
                    )
                    .unwrap();
                    writeln!(
                        self.out,
                        "    store {} {}, {}* {}, align {}",
                        vt,
                        reg,
                        vt,
                        c,
                        v.ty.size()
                    )
                    .unwrap();
                } else {
                    writeln!(
                        self.out,
                        "    store {} {}, {}* {}",
                        base, reg, base, a
                    )
                    .unwrap();
                }
            }
        }

        writeln!(self.out, "    br label %latch\n").unwrap();
        writeln!(self.out, "latch:").unwrap();
        writeln!(self.out, "    %lane_next = add nuw nsw i64 %lane, {}", w).unwrap();
        writeln!(self.out, "    %again = icmp slt i64 %lane_next, %end").unwrap();
        writeln!(self.out, "    br i1 %again, label %body, label %done\n").unwrap();
        writeln!(self.out, "done:").unwrap();
        writeln!(self.out, "    ret void").unwrap();
        writeln!(self.out, "}}\n").unwrap();
        writeln!(
            self.out,
            "attributes #0 = {{ norecurse nounwind \"target-cpu\"=\"{}\" \
             \"target-features\"=\"{}\" }}",
            self.state.llvm_target.cpu, self.state.llvm_target.features
        )
        .unwrap();
        Ok(self.out)
    }

    fn emit_node(&mut self, n: u32) -> Result<()> {
        let v = self.state.var(n)?;
        match v.kind {
            VarKind::Expression => {
                let name = format!("%v{}", n);
                self.reg.insert(n, name);
                let deps = v.dep;
                let extra = v.extra_dep;
                let cmd = v.cmd.clone().ok_or(Error::UnknownIndex(n))?;
                let mut line = String::new();
                {
                    let operand = |k: u32| -> Result<u32> {
                        if k <= 1 {
                            Ok(n)
                        } else {
                            let i = (k - 2) as usize;
                            let d = if i < 3 { deps[i] } else { extra };
                            if d == 0 {
                                return Err(Error::TypeMismatch(format!(
                                    "template \"{}\" references missing operand {}",
                                    cmd, k
                                )));
                            }
                            Ok(d)
                        }
                    };
                    let reg_of = |k: u32| self.reg_of(operand(k)?);
                    let ty_of = |k: u32| {
                        let ty = self.state.var(operand(k)?)?.ty;
                        Ok(self.vty(ty))
                    };
                    substitute(&mut line, &cmd, &reg_of, &ty_of)?;
                }
                for part in line.split('\n') {
                    let part = part.trim();
                    if !part.is_empty() {
                        writeln!(self.out, "    {}", part).unwrap();
                    }
                }
            }
            VarKind::LoopStart => {
                let ld = self
                    .state
                    .loops
                    .values()
                    .find(|ld| ld.start == n)
                    .ok_or(Error::UnknownIndex(n))?;
                let pre = self.cur_block.clone();
                writeln!(self.out, "    br label %Ls{}\n", n).unwrap();
                writeln!(self.out, "Ls{}:", n).unwrap();
                self.cur_block = format!("Ls{}", n);
                for i in 0..ld.inner_in.len() {
                    let phi = ld.inner_in[i];
                    if phi == ld.outer_in[i] {
                        continue;
                    }
                    let ty = self.state.var(phi)?.ty;
                    let vt = self.vty(ty);
                    let name = format!("%v{}", phi);
                    let init = self.reg_of(ld.outer_in[i])?;
                    writeln!(
                        self.out,
                        "    {} = phi {} [ {}, %{} ], [ %v{}, %Lb{} ]",
                        name, vt, init, pre, ld.inner_out[i], n
                    )
                    .unwrap();
                    self.reg.insert(phi, name);
                }
            }
            VarKind::LoopPhi => (),
            VarKind::LoopCond => {
                let start = v.dep[0];
                let active = self.reg_of(v.dep[1])?;
                writeln!(
                    self.out,
                    "    br i1 {}, label %Lb{}, label %Ld{}\n",
                    active, start, start
                )
                .unwrap();
                writeln!(self.out, "Lb{}:", start).unwrap();
                self.cur_block = format!("Lb{}", start);
            }
            VarKind::LoopEnd => {
                let ld = self
                    .state
                    .loops
                    .get(&n)
                    .ok_or(Error::UnknownIndex(n))?;
                writeln!(self.out, "    br label %Ls{}\n", ld.start).unwrap();
                writeln!(self.out, "Ld{}:", ld.start).unwrap();
                self.cur_block = format!("Ld{}", ld.start);
            }
            VarKind::LoopResult => {
                // The phi value dominates the exit block; reuse it directly
                let end = v.dep[1];
                let ld = self
                    .state
                    .loops
                    .get(&end)
                    .ok_or(Error::UnknownIndex(end))?;
                let slot = ld
                    .results
                    .iter()
                    .find(|(res, _)| *res == n)
                    .map(|&(_, s)| s)
                    .ok_or(Error::UnknownIndex(n))?;
                let phi = self.reg_of(ld.inner_in[slot])?;
                self.reg.insert(n, phi);
            }
            VarKind::Nop => (),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kernel_name() {
        assert_eq!(kernel_name(0xdeadbeef), "filament_deadbeef");
        assert_eq!(kernel_name(0).len(), KERNEL_NAME_LEN);
        assert_eq!(KERNEL_NAME_CANON.len(), KERNEL_NAME_LEN);
    }

    #[test]
    fn test_rename() {
        let ir = format!(".entry {}()", KERNEL_NAME_CANON);
        let renamed = rename_kernel(&ir, &kernel_name(7));
        assert_eq!(renamed, ".entry filament_00000007()");
        assert_eq!(renamed.len(), ir.len());
    }

    #[test]
    fn test_substitute() {
        let reg = |k: u32| Ok(format!("%f{}", k));
        let ty = |_: u32| Ok("f32".to_string());
        let mut out = String::new();
        substitute(&mut out, "add.$t1 $r1, $r2, $r3", &reg, &ty).unwrap();
        assert_eq!(out, "add.f32 %f1, %f2, %f3");
    }
}
