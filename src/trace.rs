//! Appending statements to the instruction trace
//!
//! The front-end describes each operation as a textual template with
//! `$r<k>` / `$t<k>` substitution tokens (`$r1` is the result, `$r2` and up
//! are the operands).  Appending performs size inference with scalar
//! broadcasting, backend and dirty propagation, algebraic simplification
//! against the canonical literal templates, and finally value numbering.

use crate::error::{Error, Result};
use crate::state::State;
use crate::types::{VarKind, VarType};
use crate::variable::{literal_cmd, Variable};

/// Returns the highest `$r<k>` token index appearing in a template
fn max_reg_token(cmd: &str) -> u32 {
    let mut max = 0;
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i] == b'$' && (bytes[i + 1] == b'r' || bytes[i + 1] == b't') {
            let mut j = i + 2;
            let mut value = 0u32;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                value = value * 10 + (bytes[j] - b'0') as u32;
                j += 1;
            }
            if j > i + 2 {
                max = max.max(value);
            }
            i = j;
        } else {
            i += 1;
        }
    }
    max
}

/// Mnemonic of a template: the first dot- or space-delimited word
fn mnemonic(cmd: &str) -> &str {
    cmd.split(|c| c == '.' || c == ' ').next().unwrap_or("")
}

impl State {
    /// Appends a statement with no operands and an explicit size
    pub fn trace_append_0(&mut self, ty: VarType, cmd: &str, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::SizeMismatch(0, 1));
        }
        self.trace_append(ty, cmd, &[], size)
    }

    /// Appends a statement with the given operands
    ///
    /// The result size is inferred as the maximum operand size; size-1
    /// operands broadcast.
    pub fn trace_append(
        &mut self,
        ty: VarType,
        cmd: &str,
        args: &[u32],
        size0: u32,
    ) -> Result<u32> {
        let tokens = max_reg_token(cmd);
        if tokens as usize > args.len() + 1 {
            return Err(Error::TypeMismatch(format!(
                "template \"{}\" references operand {}, but only {} were given",
                cmd,
                tokens,
                args.len()
            )));
        }

        let mut size = size0;
        let mut backend = None;
        let mut dirty = false;
        let mut symbolic = false;
        for &arg in args {
            let v = self.var(arg)?;
            if v.size == 0 || v.ty == VarType::Void {
                return Err(Error::SizeMismatch(v.size, size.max(1)));
            }
            match backend {
                None => backend = Some(v.backend),
                Some(b) if b != v.backend => {
                    return Err(Error::BackendMismatch(b, v.backend))
                }
                _ => (),
            }
            size = size.max(v.size);
            dirty |= v.dirty;
            symbolic |= v.symbolic;
        }
        for &arg in args {
            let v = self.var(arg)?;
            if v.size != size && v.size != 1 {
                return Err(Error::SizeMismatch(v.size, size));
            }
        }
        let backend = backend.unwrap_or_else(|| self.active_backend());

        if let Some(index) = self.simplify(ty, cmd, args, size, backend)? {
            return Ok(index);
        }

        let mut v = Variable {
            cmd: Some(cmd.into()),
            ty,
            size,
            backend,
            dirty,
            symbolic,
            ..Default::default()
        };
        for (i, &arg) in args.iter().enumerate() {
            if i < 3 {
                v.dep[i] = arg;
            } else {
                v.extra_dep = arg;
            }
        }
        Ok(self.var_new(v, true))
    }

    /// Algebraic simplification for the common identities
    ///
    /// Returns the surviving operand (with a refreshed reference) or a
    /// literal-zero absorbing element instead of building a new statement.
    fn simplify(
        &mut self,
        ty: VarType,
        cmd: &str,
        args: &[u32],
        size: u32,
        backend: crate::Backend,
    ) -> Result<Option<u32>> {
        if args.len() != 2 {
            return Ok(None);
        }
        let (a, b) = (args[0], args[1]);
        if self.var(a)?.ty != ty || self.var(b)?.ty != ty {
            return Ok(None);
        }
        if self.var(a)?.dirty || self.var(b)?.dirty {
            return Ok(None);
        }

        // Keep the operand only when its shape already matches the result
        let keep = |s: &mut Self, index: u32| -> Result<Option<u32>> {
            if s.var(index)?.size == size {
                s.inc_ref_ext(index);
                Ok(Some(index))
            } else {
                Ok(None)
            }
        };

        let out = match mnemonic(cmd) {
            "mul" => {
                if self.var_is_literal_zero(a)? || self.var_is_literal_zero(b)? {
                    let zero = if self.var_is_literal_zero(a)? { a } else { b };
                    if self.var(zero)?.size == size {
                        self.inc_ref_ext(zero);
                        Some(zero)
                    } else {
                        // Absorb into a broadcast zero of the result shape;
                        // value numbering reuses an existing one if present
                        let lit = literal_cmd(backend, ty, false);
                        match lit {
                            Some(lit) => {
                                Some(self.trace_append_0(ty, &lit, size)?)
                            }
                            None => None,
                        }
                    }
                } else if self.var_is_literal_one(a)? {
                    keep(self, b)?
                } else if self.var_is_literal_one(b)? {
                    keep(self, a)?
                } else {
                    None
                }
            }
            "add" => {
                if self.var_is_literal_zero(a)? {
                    keep(self, b)?
                } else if self.var_is_literal_zero(b)? {
                    keep(self, a)?
                } else {
                    None
                }
            }
            "sub" => {
                if self.var_is_literal_zero(b)? {
                    keep(self, a)?
                } else {
                    None
                }
            }
            "div" => {
                if self.var_is_literal_one(b)? {
                    keep(self, a)?
                } else {
                    None
                }
            }
            _ => None,
        };
        if out.is_some() {
            log::trace!("trace_append(): simplified \"{}\"", cmd);
        }
        Ok(out)
    }

    /// Internal select helper used by the loop recorder on the CPU path
    pub(crate) fn var_select(
        &mut self,
        mask: u32,
        t: u32,
        f: u32,
    ) -> Result<u32> {
        let backend = self.var(mask)?.backend;
        let cmd = match backend {
            crate::Backend::Cuda => "selp.$t1 $r1, $r3, $r4, $r2",
            crate::Backend::Llvm => {
                "$r1 = select i1 $r2, $t1 $r3, $t1 $r4"
            }
        };
        let ty = self.var(t)?.ty;
        self.trace_append(ty, cmd, &[mask, t, f], 1)
    }

    /// Marks the creation of a `Nop` chain node (loop side-effect anchor)
    pub(crate) fn nop_node(
        &mut self,
        backend: crate::Backend,
        size: u32,
        dep0: u32,
        dep1: u32,
        symbolic: bool,
    ) -> u32 {
        let v = Variable {
            kind: VarKind::Nop,
            ty: VarType::Void,
            backend,
            size,
            dep: [dep0, dep1, 0],
            symbolic,
            ..Default::default()
        };
        self.var_new(v, false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_token_scan() {
        assert_eq!(max_reg_token("add.$t1 $r1, $r2, $r3"), 3);
        assert_eq!(max_reg_token("mov.$t1 $r1, 0f00000000"), 1);
        assert_eq!(max_reg_token("fma.rn.$t1 $r1, $r2, $r3, $r4"), 4);
        assert_eq!(max_reg_token("no tokens at all"), 0);
    }

    #[test]
    fn test_mnemonic() {
        assert_eq!(mnemonic("add.$t1 $r1, $r2, $r3"), "add");
        assert_eq!(mnemonic("mul.lo.$t1 $r1, $r2, $r3"), "mul");
        assert_eq!(mnemonic("selp.$t1 $r1, $r3, $r4, $r2"), "selp");
    }
}
