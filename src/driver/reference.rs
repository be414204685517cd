//! Host-side reference device
//!
//! Implements the CUDA-like driver contract on ordinary host memory.  PTX
//! kernels produced by the code generator are compiled into fixed-size
//! instruction records and interpreted one lane at a time; with parallel
//! dispatch enabled, lanes are chunked across a rayon worker pool.
//!
//! The instruction records serialize verbatim (they are plain old data), so
//! compiled kernels participate in the on-disk cache exactly like machine
//! code: a cache hit deserializes the records and never touches the IR
//! parser.
//!
//! Only the mnemonic subset emitted by the code generator and the common
//! arithmetic templates is understood; an unknown mnemonic fails compilation.

use crate::cache::Payload;
use crate::driver::{Compiled, Driver, Kernel};
use crate::error::{Error, Result};
use crate::types::{AllocType, Backend, ReductionType, VarType};
use std::collections::HashMap;
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const OP_MOV: u16 = 0;
const OP_CVT: u16 = 1;
const OP_ADD: u16 = 2;
const OP_SUB: u16 = 3;
const OP_MUL: u16 = 4;
const OP_MULWIDE: u16 = 5;
const OP_MAD: u16 = 6;
const OP_FMA: u16 = 7;
const OP_DIV: u16 = 8;
const OP_MIN: u16 = 9;
const OP_MAX: u16 = 10;
const OP_NEG: u16 = 11;
const OP_ABS: u16 = 12;
const OP_SQRT: u16 = 13;
const OP_AND: u16 = 14;
const OP_OR: u16 = 15;
const OP_XOR: u16 = 16;
const OP_NOT: u16 = 17;
const OP_SHL: u16 = 18;
const OP_SHR: u16 = 19;
const OP_SETP: u16 = 20;
const OP_SELP: u16 = 21;
const OP_LDPARAM: u16 = 22;
const OP_LD: u16 = 23;
const OP_ST: u16 = 24;
const OP_BRA: u16 = 25;
const OP_RET: u16 = 26;

const CMP_EQ: u8 = 0;
const CMP_NE: u8 = 1;
const CMP_LT: u8 = 2;
const CMP_LE: u8 = 3;
const CMP_GT: u8 = 4;
const CMP_GE: u8 = 5;

// Branch predication (stored in `cmp` of OP_BRA)
const BRA_ALWAYS: u8 = 0;
const BRA_IF: u8 = 1;
const BRA_UNLESS: u8 = 2;

// Which operand the `imm` field replaces
const IMM_NONE: u8 = 0;
const IMM_A: u8 = 1;
const IMM_B: u8 = 2;
const IMM_C: u8 = 3;

/// One decoded instruction; plain old data so that compiled kernels can be
/// written to and recovered from the on-disk cache without re-parsing
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Instr {
    imm: u64,
    dst: u32,
    a: u32,
    b: u32,
    c: u32,
    op: u16,
    ty: u8,
    ty2: u8,
    mode: u8,
    cmp: u8,
    _pad: [u8; 2],
}

impl Default for Instr {
    fn default() -> Self {
        Self {
            imm: 0,
            dst: u32::MAX,
            a: u32::MAX,
            b: u32::MAX,
            c: u32::MAX,
            op: OP_RET,
            ty: 0,
            ty2: 0,
            mode: IMM_NONE,
            cmp: 0,
            _pad: [0; 2],
        }
    }
}

#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Header {
    reg_count: u32,
    instr_count: u32,
    tid: u32,
    ctaid: u32,
    ntid: u32,
    _pad: u32,
}

/// A compiled (decoded) kernel
pub struct Program {
    reg_count: u32,
    tid: u32,
    ctaid: u32,
    ntid: u32,
    instrs: Vec<Instr>,
}

impl Kernel for Program {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn encode_ty(ty: VarType) -> u8 {
    ty as u8
}

fn decode_ty(v: u8) -> VarType {
    match v {
        1 => VarType::Int8,
        2 => VarType::UInt8,
        3 => VarType::Int16,
        4 => VarType::UInt16,
        5 => VarType::Int32,
        6 => VarType::UInt32,
        7 => VarType::Int64,
        8 => VarType::UInt64,
        9 => VarType::Float16,
        10 => VarType::Float32,
        11 => VarType::Float64,
        12 => VarType::Bool,
        13 => VarType::Pointer,
        _ => VarType::Invalid,
    }
}

fn type_from_suffix(s: &str) -> Option<VarType> {
    Some(match s {
        "s8" => VarType::Int8,
        "u8" => VarType::UInt8,
        "s16" => VarType::Int16,
        "u16" => VarType::UInt16,
        "s32" => VarType::Int32,
        "u32" => VarType::UInt32,
        "s64" => VarType::Int64,
        "u64" => VarType::UInt64,
        "f16" => VarType::Float16,
        "f32" => VarType::Float32,
        "f64" => VarType::Float64,
        "pred" => VarType::Bool,
        _ => return None,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Parsing
////////////////////////////////////////////////////////////////////////////////

struct Parser {
    regs: HashMap<String, u32>,
    labels: HashMap<String, u32>,
    fixups: Vec<(usize, String)>,
    instrs: Vec<Instr>,
}

impl Parser {
    fn new() -> Self {
        Self {
            regs: HashMap::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            instrs: Vec::new(),
        }
    }

    fn reg(&mut self, name: &str) -> u32 {
        let next = self.regs.len() as u32;
        *self.regs.entry(name.to_string()).or_insert(next)
    }

    fn parse_imm(tok: &str, ty: VarType) -> Option<u64> {
        if let Some(hex) = tok.strip_prefix("0f") {
            return u32::from_str_radix(hex, 16).ok().map(u64::from);
        }
        if let Some(hex) = tok.strip_prefix("0d") {
            return u64::from_str_radix(hex, 16).ok();
        }
        if let Some(hex) = tok.strip_prefix("0x") {
            return u64::from_str_radix(hex, 16).ok();
        }
        if tok.starts_with('-') || tok.chars().next()?.is_ascii_digit() {
            return match ty {
                VarType::Float32 => {
                    tok.parse::<f32>().ok().map(|f| u64::from(f.to_bits()))
                }
                VarType::Float64 => tok.parse::<f64>().ok().map(f64::to_bits),
                _ => tok.parse::<i64>().ok().map(|v| v as u64),
            };
        }
        None
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim().trim_end_matches(';').trim();
        if line.is_empty()
            || line.starts_with('.')
            || line.starts_with("//")
            || line == "{"
            || line == "}"
        {
            return Ok(());
        }

        // Label definition
        if let Some(name) = line.strip_suffix(':') {
            if !name.contains(' ') {
                self.labels
                    .insert(name.to_string(), self.instrs.len() as u32);
                return Ok(());
            }
        }

        // Optional branch predication: `@%p bra L` / `@!%p bra L`
        let (pred, line) = if let Some(rest) = line.strip_prefix('@') {
            let negate = rest.starts_with('!');
            let rest = rest.strip_prefix('!').unwrap_or(rest);
            let (reg, tail) =
                rest.split_once(char::is_whitespace).ok_or_else(|| {
                    Error::CompilationFailure(format!("bad predicate: {}", line))
                })?;
            let id = self.reg(reg);
            (
                Some((id, if negate { BRA_UNLESS } else { BRA_IF })),
                tail.trim(),
            )
        } else {
            (None, line)
        };

        let (mnemonic, operands) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest),
            None => (line, ""),
        };
        let operands: Vec<&str> = if operands.is_empty() {
            vec![]
        } else {
            operands.split(',').map(str::trim).collect()
        };

        let parts: Vec<&str> = mnemonic.split('.').collect();
        let name = parts[0];
        let tys: Vec<VarType> = parts[1..]
            .iter()
            .filter_map(|p| type_from_suffix(p))
            .collect();
        let ty = tys.last().copied().unwrap_or(VarType::UInt32);

        let mut ins = Instr {
            ty: encode_ty(ty),
            op: u16::MAX,
            ..Default::default()
        };

        // Operand decoding shared by most instructions: registers or one
        // immediate (recorded in `imm` plus a mode tag)
        let decode = |this: &mut Self,
                          ins: &mut Instr,
                          slots: &[u8],
                          toks: &[&str]|
         -> Result<()> {
            for (slot, tok) in slots.iter().zip(toks.iter()) {
                if tok.starts_with('%') {
                    let id = this.reg(tok);
                    match *slot {
                        0 => ins.dst = id,
                        1 => ins.a = id,
                        2 => ins.b = id,
                        _ => ins.c = id,
                    }
                } else {
                    let imm =
                        Self::parse_imm(tok, decode_ty(ins.ty)).ok_or_else(|| {
                            Error::CompilationFailure(format!(
                                "bad operand \"{}\" in \"{}\"",
                                tok, line
                            ))
                        })?;
                    ins.imm = imm;
                    ins.mode = *slot;
                }
            }
            Ok(())
        };

        match name {
            "mov" => {
                ins.op = OP_MOV;
                decode(self, &mut ins, &[0, 1], &operands)?;
            }
            "cvt" => {
                ins.op = OP_CVT;
                if tys.len() >= 2 {
                    ins.ty = encode_ty(tys[tys.len() - 2]);
                    ins.ty2 = encode_ty(tys[tys.len() - 1]);
                } else {
                    ins.ty2 = ins.ty;
                }
                decode(self, &mut ins, &[0, 1], &operands)?;
            }
            "add" | "sub" | "div" | "min" | "max" | "and" | "or" | "xor"
            | "shl" | "shr" => {
                ins.op = match name {
                    "add" => OP_ADD,
                    "sub" => OP_SUB,
                    "div" => OP_DIV,
                    "min" => OP_MIN,
                    "max" => OP_MAX,
                    "and" => OP_AND,
                    "or" => OP_OR,
                    "xor" => OP_XOR,
                    "shl" => OP_SHL,
                    _ => OP_SHR,
                };
                decode(self, &mut ins, &[0, 1, 2], &operands)?;
            }
            "mul" => {
                ins.op = if parts.contains(&"wide") {
                    OP_MULWIDE
                } else {
                    OP_MUL
                };
                decode(self, &mut ins, &[0, 1, 2], &operands)?;
            }
            "mad" => {
                ins.op = OP_MAD;
                decode(self, &mut ins, &[0, 1, 2, 3], &operands)?;
            }
            "fma" => {
                ins.op = OP_FMA;
                decode(self, &mut ins, &[0, 1, 2, 3], &operands)?;
            }
            "neg" | "abs" | "sqrt" | "not" => {
                ins.op = match name {
                    "neg" => OP_NEG,
                    "abs" => OP_ABS,
                    "sqrt" => OP_SQRT,
                    _ => OP_NOT,
                };
                decode(self, &mut ins, &[0, 1], &operands)?;
            }
            "setp" => {
                ins.op = OP_SETP;
                ins.cmp = match parts.get(1).copied() {
                    Some("eq") => CMP_EQ,
                    Some("ne") => CMP_NE,
                    Some("lt") => CMP_LT,
                    Some("le") => CMP_LE,
                    Some("gt") => CMP_GT,
                    Some("ge") => CMP_GE,
                    other => {
                        return Err(Error::CompilationFailure(format!(
                            "unknown comparison \"{}\"",
                            other.unwrap_or("")
                        )))
                    }
                };
                decode(self, &mut ins, &[0, 1, 2], &operands)?;
            }
            "selp" => {
                ins.op = OP_SELP;
                decode(self, &mut ins, &[0, 1, 2, 3], &operands)?;
            }
            "ld" => {
                let mem = operands.get(1).copied().unwrap_or("");
                if parts.contains(&"param") {
                    ins.op = OP_LDPARAM;
                    let off = mem
                        .strip_prefix("[params+")
                        .and_then(|s| s.strip_suffix(']'))
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| {
                            Error::CompilationFailure(format!(
                                "bad parameter operand \"{}\"",
                                mem
                            ))
                        })?;
                    ins.imm = off / 8;
                } else {
                    ins.op = OP_LD;
                    let (reg, off) = Self::parse_mem(mem).ok_or_else(|| {
                        Error::CompilationFailure(format!(
                            "bad memory operand \"{}\"",
                            mem
                        ))
                    })?;
                    ins.a = self.reg(&reg);
                    ins.imm = off;
                }
                ins.dst = self.reg(operands.first().copied().unwrap_or(""));
            }
            "st" => {
                ins.op = OP_ST;
                let mem = operands.first().copied().unwrap_or("");
                let (reg, off) = Self::parse_mem(mem).ok_or_else(|| {
                    Error::CompilationFailure(format!(
                        "bad memory operand \"{}\"",
                        mem
                    ))
                })?;
                ins.a = self.reg(&reg);
                ins.imm = off;
                let val = operands.get(1).copied().unwrap_or("");
                if val.starts_with('%') {
                    ins.b = self.reg(val);
                } else {
                    return Err(Error::CompilationFailure(format!(
                        "st requires a register source: \"{}\"",
                        line
                    )));
                }
            }
            "bra" => {
                ins.op = OP_BRA;
                if let Some((reg, kind)) = pred {
                    ins.a = reg;
                    ins.cmp = kind;
                } else {
                    ins.cmp = BRA_ALWAYS;
                }
                let target = operands.first().copied().unwrap_or("");
                self.fixups.push((self.instrs.len(), target.to_string()));
            }
            "ret" => ins.op = OP_RET,
            other => {
                return Err(Error::CompilationFailure(format!(
                    "unknown mnemonic \"{}\"",
                    other
                )))
            }
        }

        if pred.is_some() && ins.op != OP_BRA {
            return Err(Error::CompilationFailure(
                "predication is only supported on branches".to_string(),
            ));
        }

        self.instrs.push(ins);
        Ok(())
    }

    fn parse_mem(tok: &str) -> Option<(String, u64)> {
        let inner = tok.strip_prefix('[')?.strip_suffix(']')?;
        match inner.split_once('+') {
            Some((reg, off)) => {
                Some((reg.trim().to_string(), off.trim().parse().ok()?))
            }
            None => Some((inner.trim().to_string(), 0)),
        }
    }

    fn finish(mut self) -> Result<Program> {
        for (at, label) in &self.fixups {
            let target = self.labels.get(label).ok_or_else(|| {
                Error::CompilationFailure(format!("unknown label \"{}\"", label))
            })?;
            self.instrs[*at].imm = u64::from(*target);
        }
        let special = |regs: &HashMap<String, u32>, name: &str| {
            regs.get(name).copied().unwrap_or(u32::MAX)
        };
        Ok(Program {
            reg_count: self.regs.len() as u32,
            tid: special(&self.regs, "%tid.x"),
            ctaid: special(&self.regs, "%ctaid.x"),
            ntid: special(&self.regs, "%ntid.x"),
            instrs: self.instrs,
        })
    }
}

impl Program {
    /// Parses one PTX-dialect kernel
    pub fn parse(ir: &str) -> Result<Self> {
        let mut parser = Parser::new();
        for line in ir.lines() {
            parser.parse_line(line)?;
        }
        parser.finish()
    }

    fn serialize(&self) -> Vec<u8> {
        let header = Header {
            reg_count: self.reg_count,
            instr_count: self.instrs.len() as u32,
            tid: self.tid,
            ctaid: self.ctaid,
            ntid: self.ntid,
            _pad: 0,
        };
        let mut out = Vec::with_capacity(
            std::mem::size_of::<Header>() + self.instrs.as_bytes().len(),
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(self.instrs.as_bytes());
        out
    }

    fn deserialize(bytes: &[u8]) -> Option<Self> {
        let hsize = std::mem::size_of::<Header>();
        if bytes.len() < hsize {
            return None;
        }
        let header = Header::read_from_bytes(&bytes[..hsize]).ok()?;
        let body = &bytes[hsize..];
        let step = std::mem::size_of::<Instr>();
        let want = header.instr_count as usize * step;
        if body.len() < want {
            return None;
        }
        // Per-record copies sidestep any alignment requirement on `bytes`
        let mut instrs = Vec::with_capacity(header.instr_count as usize);
        for chunk in body[..want].chunks_exact(step) {
            instrs.push(Instr::read_from_bytes(chunk).ok()?);
        }
        Some(Self {
            reg_count: header.reg_count,
            tid: header.tid,
            ctaid: header.ctaid,
            ntid: header.ntid,
            instrs,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Execution
////////////////////////////////////////////////////////////////////////////////

fn as_f64(ty: VarType, bits: u64) -> f64 {
    match ty {
        VarType::Float32 => f64::from(f32::from_bits(bits as u32)),
        VarType::Float64 => f64::from_bits(bits),
        _ => 0.0,
    }
}

fn from_f64(ty: VarType, v: f64) -> u64 {
    match ty {
        VarType::Float32 => u64::from((v as f32).to_bits()),
        VarType::Float64 => v.to_bits(),
        _ => 0,
    }
}

fn as_i64(ty: VarType, bits: u64) -> i64 {
    match ty {
        VarType::Int8 => bits as u8 as i8 as i64,
        VarType::Int16 => bits as u16 as i16 as i64,
        VarType::Int32 => bits as u32 as i32 as i64,
        _ => bits as i64,
    }
}

fn truncate(ty: VarType, bits: u64) -> u64 {
    match ty.size() {
        1 => bits & 0xff,
        2 => bits & 0xffff,
        4 => bits & 0xffff_ffff,
        _ => bits,
    }
}

fn arith(op: u16, ty: VarType, a: u64, b: u64) -> u64 {
    if ty.is_float() {
        let (x, y) = (as_f64(ty, a), as_f64(ty, b));
        let r = match op {
            OP_ADD => x + y,
            OP_SUB => x - y,
            OP_MUL => x * y,
            OP_DIV => x / y,
            OP_MIN => x.min(y),
            OP_MAX => x.max(y),
            _ => 0.0,
        };
        from_f64(ty, r)
    } else if ty.is_signed() {
        let (x, y) = (as_i64(ty, a), as_i64(ty, b));
        let r = match op {
            OP_ADD => x.wrapping_add(y),
            OP_SUB => x.wrapping_sub(y),
            OP_MUL => x.wrapping_mul(y),
            OP_DIV => {
                if y == 0 {
                    0
                } else {
                    x.wrapping_div(y)
                }
            }
            OP_MIN => x.min(y),
            OP_MAX => x.max(y),
            OP_AND => x & y,
            OP_OR => x | y,
            OP_XOR => x ^ y,
            OP_SHL => x.wrapping_shl(y as u32),
            OP_SHR => x.wrapping_shr(y as u32),
            _ => 0,
        };
        truncate(ty, r as u64)
    } else {
        let (x, y) = (truncate(ty, a), truncate(ty, b));
        let r = match op {
            OP_ADD => x.wrapping_add(y),
            OP_SUB => x.wrapping_sub(y),
            OP_MUL => x.wrapping_mul(y),
            OP_DIV => {
                if y == 0 {
                    0
                } else {
                    x / y
                }
            }
            OP_MIN => x.min(y),
            OP_MAX => x.max(y),
            OP_AND => x & y,
            OP_OR => x | y,
            OP_XOR => x ^ y,
            OP_SHL => x.wrapping_shl(y as u32),
            OP_SHR => x.wrapping_shr(y as u32),
            _ => 0,
        };
        truncate(ty, r)
    }
}

fn compare(cmp: u8, ty: VarType, a: u64, b: u64) -> bool {
    let ord = if ty.is_float() {
        as_f64(ty, a).partial_cmp(&as_f64(ty, b))
    } else if ty.is_signed() {
        Some(as_i64(ty, a).cmp(&as_i64(ty, b)))
    } else {
        Some(truncate(ty, a).cmp(&truncate(ty, b)))
    };
    match (cmp, ord) {
        (CMP_EQ, Some(o)) => o.is_eq(),
        (CMP_NE, Some(o)) => o.is_ne(),
        (CMP_LT, Some(o)) => o.is_lt(),
        (CMP_LE, Some(o)) => o.is_le(),
        (CMP_GT, Some(o)) => o.is_gt(),
        (CMP_GE, Some(o)) => o.is_ge(),
        _ => false,
    }
}

fn convert(dst: VarType, src: VarType, bits: u64) -> u64 {
    if dst.is_float() {
        let v = if src.is_float() {
            as_f64(src, bits)
        } else if src.is_signed() {
            as_i64(src, bits) as f64
        } else {
            truncate(src, bits) as f64
        };
        from_f64(dst, v)
    } else {
        let v: i64 = if src.is_float() {
            as_f64(src, bits) as i64
        } else if src.is_signed() {
            as_i64(src, bits)
        } else {
            truncate(src, bits) as i64
        };
        truncate(dst, v as u64)
    }
}

unsafe fn load_mem(ty: VarType, addr: u64) -> u64 {
    let p = addr as *const u8;
    match ty.size() {
        1 => u64::from(*p),
        2 => u64::from((p as *const u16).read_unaligned()),
        4 => u64::from((p as *const u32).read_unaligned()),
        _ => (p as *const u64).read_unaligned(),
    }
}

unsafe fn store_mem(ty: VarType, addr: u64, value: u64) {
    let p = addr as *mut u8;
    match ty.size() {
        1 => *p = value as u8,
        2 => (p as *mut u16).write_unaligned(value as u16),
        4 => (p as *mut u32).write_unaligned(value as u32),
        _ => (p as *mut u64).write_unaligned(value),
    }
}

unsafe fn exec(prog: &Program, params: &[u64], lane: u32) {
    let mut regs = vec![0u64; prog.reg_count as usize];
    // The lane index is reconstructed from the special registers:
    // one lane per block keeps the arithmetic trivial
    if prog.tid != u32::MAX {
        regs[prog.tid as usize] = 0;
    }
    if prog.ntid != u32::MAX {
        regs[prog.ntid as usize] = 1;
    }
    if prog.ctaid != u32::MAX {
        regs[prog.ctaid as usize] = u64::from(lane);
    }

    fn get(regs: &[u64], ins: &Instr, slot: u8, reg: u32) -> u64 {
        if ins.mode == slot {
            ins.imm
        } else {
            regs[reg as usize]
        }
    }

    let mut pc = 0usize;
    while pc < prog.instrs.len() {
        let ins = &prog.instrs[pc];
        pc += 1;
        let ty = decode_ty(ins.ty);
        match ins.op {
            OP_MOV => regs[ins.dst as usize] = get(&regs, ins, IMM_A, ins.a),
            OP_CVT => {
                let a = get(&regs, ins, IMM_A, ins.a);
                regs[ins.dst as usize] = convert(ty, decode_ty(ins.ty2), a)
            }
            OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MIN | OP_MAX | OP_AND
            | OP_OR | OP_XOR | OP_SHL | OP_SHR => {
                let a = get(&regs, ins, IMM_A, ins.a);
                let b = get(&regs, ins, IMM_B, ins.b);
                regs[ins.dst as usize] = arith(ins.op, ty, a, b);
            }
            OP_MULWIDE => {
                let a = get(&regs, ins, IMM_A, ins.a);
                let b = get(&regs, ins, IMM_B, ins.b);
                regs[ins.dst as usize] = if ty.is_signed() {
                    ((a as u32 as i32 as i64) * (b as u32 as i32 as i64)) as u64
                } else {
                    u64::from(a as u32) * u64::from(b as u32)
                };
            }
            OP_MAD => {
                let a = get(&regs, ins, IMM_A, ins.a);
                let b = get(&regs, ins, IMM_B, ins.b);
                let c = get(&regs, ins, IMM_C, ins.c);
                let r = arith(OP_MUL, ty, a, b);
                regs[ins.dst as usize] = arith(OP_ADD, ty, r, c);
            }
            OP_FMA => {
                let x = as_f64(ty, get(&regs, ins, IMM_A, ins.a));
                let y = as_f64(ty, get(&regs, ins, IMM_B, ins.b));
                let z = as_f64(ty, get(&regs, ins, IMM_C, ins.c));
                regs[ins.dst as usize] = from_f64(ty, x.mul_add(y, z));
            }
            OP_NEG => {
                let a = get(&regs, ins, IMM_A, ins.a);
                regs[ins.dst as usize] = if ty.is_float() {
                    from_f64(ty, -as_f64(ty, a))
                } else {
                    truncate(ty, (as_i64(ty, a).wrapping_neg()) as u64)
                };
            }
            OP_ABS => {
                let a = get(&regs, ins, IMM_A, ins.a);
                regs[ins.dst as usize] = if ty.is_float() {
                    from_f64(ty, as_f64(ty, a).abs())
                } else {
                    truncate(ty, as_i64(ty, a).wrapping_abs() as u64)
                };
            }
            OP_SQRT => {
                let a = get(&regs, ins, IMM_A, ins.a);
                regs[ins.dst as usize] = from_f64(ty, as_f64(ty, a).sqrt());
            }
            OP_NOT => {
                let a = get(&regs, ins, IMM_A, ins.a);
                regs[ins.dst as usize] = if ty == VarType::Bool {
                    u64::from(a == 0)
                } else {
                    truncate(ty, !a)
                };
            }
            OP_SETP => {
                let a = get(&regs, ins, IMM_A, ins.a);
                let b = get(&regs, ins, IMM_B, ins.b);
                regs[ins.dst as usize] = u64::from(compare(ins.cmp, ty, a, b));
            }
            OP_SELP => {
                let p = get(&regs, ins, IMM_C, ins.c);
                let a = get(&regs, ins, IMM_A, ins.a);
                let b = get(&regs, ins, IMM_B, ins.b);
                regs[ins.dst as usize] = if p != 0 { a } else { b };
            }
            OP_LDPARAM => {
                regs[ins.dst as usize] = params[ins.imm as usize];
            }
            OP_LD => {
                let addr = regs[ins.a as usize].wrapping_add(ins.imm);
                regs[ins.dst as usize] = load_mem(ty, addr);
            }
            OP_ST => {
                let addr = regs[ins.a as usize].wrapping_add(ins.imm);
                store_mem(ty, addr, regs[ins.b as usize]);
            }
            OP_BRA => {
                let take = match ins.cmp {
                    BRA_ALWAYS => true,
                    BRA_IF => regs[ins.a as usize] != 0,
                    _ => regs[ins.a as usize] == 0,
                };
                if take {
                    pc = ins.imm as usize;
                }
            }
            _ => return,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Driver
////////////////////////////////////////////////////////////////////////////////

/// The reference device
#[derive(Default)]
pub struct ReferenceDriver;

const ALLOC_ALIGN: usize = 64;

impl Driver for ReferenceDriver {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn name(&self) -> &'static str {
        "reference"
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
        debug_assert_eq!(src.len(), esize);
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
        let esize = ty.size();
        let mut acc: u64 = match rtype {
            ReductionType::Add | ReductionType::Or => 0,
            ReductionType::Mul | ReductionType::And => {
                if ty.is_float() {
                    from_f64(ty, 1.0)
                } else {
                    truncate(ty, u64::MAX)
                }
            }
            ReductionType::Min => {
                if ty.is_float() {
                    from_f64(ty, f64::INFINITY)
                } else if ty.is_signed() {
                    truncate(ty, i64::MAX as u64)
                } else {
                    truncate(ty, u64::MAX)
                }
            }
            ReductionType::Max => {
                if ty.is_float() {
                    from_f64(ty, f64::NEG_INFINITY)
                } else if ty.is_signed() {
                    truncate(ty, 1u64 << (esize * 8 - 1))
                } else {
                    0
                }
            }
        };
        // Multiplicative identity for integers is 1, not all-ones
        if rtype == ReductionType::Mul && !ty.is_float() {
            acc = 1;
        }
        let op = match rtype {
            ReductionType::Add | ReductionType::Or => {
                if rtype == ReductionType::Or {
                    OP_OR
                } else {
                    OP_ADD
                }
            }
            ReductionType::Mul => OP_MUL,
            ReductionType::Min => OP_MIN,
            ReductionType::Max => OP_MAX,
            ReductionType::And => OP_AND,
        };
        for i in 0..size as usize {
            let v = load_mem(ty, ptr.add(i * esize) as u64);
            acc = arith(op, ty, acc, v);
        }
        store_mem(ty, out as u64, acc);
    }

    unsafe fn scan(&mut self, input: *const u32, out: *mut u32, size: u32) {
        let mut acc = 0u32;
        for i in 0..size as usize {
            let v = *input.add(i);
            *out.add(i) = acc;
            acc = acc.wrapping_add(v);
        }
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
        let values = std::slice::from_raw_parts(values, size as usize);
        let mut counts = vec![0u32; bucket_count as usize];
        for &v in values {
            counts[v as usize] += 1;
        }
        let mut unique = 0;
        let mut acc = 0u32;
        for (b, &c) in counts.iter().enumerate() {
            *offsets.add(b) = acc;
            acc += c;
            if c > 0 {
                unique += 1;
            }
        }
        *offsets.add(bucket_count as usize) = acc;
        let mut cursor: Vec<u32> = (0..bucket_count as usize)
            .map(|b| *offsets.add(b))
            .collect();
        for (i, &v) in values.iter().enumerate() {
            let at = cursor[v as usize];
            *perm.add(at as usize) = i as u32;
            cursor[v as usize] += 1;
        }
        unique
    }

    fn compile(&mut self, ir: &str, _name: &str) -> Result<Compiled> {
        let prog = Program::parse(ir)?;
        let payload = prog.serialize();
        Ok(Compiled {
            kernel: Arc::new(prog),
            payload: Some((payload, 0)),
        })
    }

    fn load(&mut self, payload: Payload) -> Option<Arc<dyn Kernel>> {
        let prog = Program::deserialize(payload.code())?;
        Some(Arc::new(prog))
    }

    unsafe fn launch(
        &mut self,
        kernel: &dyn Kernel,
        size: u32,
        params: &[u64],
        parallel: bool,
    ) -> Result<()> {
        let prog = kernel
            .as_any()
            .downcast_ref::<Program>()
            .ok_or_else(|| {
                Error::CompilationFailure(
                    "kernel was not produced by the reference device".to_string(),
                )
            })?;
        if parallel && size > 1024 {
            use rayon::prelude::*;
            (0..size).into_par_iter().for_each(|lane| unsafe {
                exec(prog, params, lane);
            });
        } else {
            for lane in 0..size {
                exec(prog, params, lane);
            }
        }
        Ok(())
    }

    fn sync(&mut self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_run() {
        let ir = "\
.version 6.3
.visible .entry filament_00000000(.param .align 8 .b8 params[24]) {
    mov.u32 %a0, %ntid.x;
    mov.u32 %a1, %ctaid.x;
    mov.u32 %a2, %tid.x;
    mad.lo.u32 %lane, %a1, %a0, %a2;
    ld.param.u32 %size, [params+0];
    setp.ge.u32 %done, %lane, %size;
    @%done bra EXIT;
    ld.param.u64 %ptr0, [params+8];
    ld.param.u64 %ptr1, [params+16];
    mul.wide.u32 %ad0, %lane, 4;
    add.u64 %ad0, %ptr0, %ad0;
    ld.global.f32 %f0, [%ad0];
    add.f32 %f1, %f0, %f0;
    mul.wide.u32 %ad0, %lane, 4;
    add.u64 %ad0, %ptr1, %ad0;
    st.global.f32 [%ad0], %f1;
EXIT:
    ret;
}
";
        let prog = Program::parse(ir).unwrap();
        let input: Vec<f32> = vec![1.0, 2.0, 3.0];
        let mut output: Vec<f32> = vec![0.0; 3];
        let params = [
            3u64,
            input.as_ptr() as u64,
            output.as_mut_ptr() as u64,
        ];
        for lane in 0..3 {
            unsafe { exec(&prog, &params, lane) };
        }
        assert_eq!(output, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let ir = "\
    mov.f32 %f0, 0f3f800000;
    add.f32 %f1, %f0, %f0;
    ret;
";
        let prog = Program::parse(ir).unwrap();
        let bytes = prog.serialize();
        let back = Program::deserialize(&bytes).unwrap();
        assert_eq!(back.reg_count, prog.reg_count);
        assert_eq!(back.instrs.len(), prog.instrs.len());
    }

    #[test]
    fn test_loop_program() {
        // while (i < 10) i += 1
        let ir = "\
    mov.u32 %r0, 0x00000000;
L1:
    setp.lt.u32 %p0, %r0, 10;
    @!%p0 bra DONE1;
    add.u32 %r0, %r0, 1;
    bra L1;
DONE1:
    ld.param.u64 %ptr0, [params+8];
    st.global.u32 [%ptr0], %r0;
    ret;
";
        let prog = Program::parse(ir).unwrap();
        let mut out = 0u32;
        let params = [1u64, &mut out as *mut u32 as u64];
        unsafe { exec(&prog, &params, 0) };
        assert_eq!(out, 10);
    }

    #[test]
    fn test_unknown_mnemonic() {
        assert!(Program::parse("    frobnicate.f32 %f0, %f1;").is_err());
    }
}
