//! Statement lowering
//!
//! Control flow uses fresh labels per construct. `break`/`continue` consult
//! the loop/switch stack; `continue` skips switch frames. `switch` compares
//! the pushed discriminant against each case value and branches through
//! per-case trampolines that restore `sp` before entering the body, so
//! fall-through never drifts the stack.

use super::state::LoopCtx;
use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, Stmt, VarDeclEntry};
use std::fmt::Write as _;

impl CodeGen {
    pub(super) fn gen_block(&mut self, stmts: &[Stmt], ret_label: &str) -> Result<(), CodeGenError> {
        for st in stmts {
            self.gen_stmt(st, ret_label)?;
        }
        Ok(())
    }

    pub(super) fn gen_stmt(&mut self, st: &Stmt, ret_label: &str) -> Result<(), CodeGenError> {
        match st {
            Stmt::Return(e) => {
                self.gen_value(e)?;
                writeln!(self.out, "\tb\t{}", ret_label)?;
                Ok(())
            }

            Stmt::Expr(e) => self.gen_value(e),

            Stmt::VarDecl(entries) => {
                for e in entries {
                    self.gen_decl_init(e)?;
                }
                Ok(())
            }

            Stmt::If {
                cond,
                then_blk,
                else_blk,
            } => {
                let else_l = self.new_label("else");
                let end_l = self.new_label("endif");
                self.gen_value(cond)?;
                writeln!(self.out, "\tcmp\tx0, #0")?;
                match else_blk {
                    None => {
                        writeln!(self.out, "\tb.eq\t{}", end_l)?;
                        self.gen_block(&then_blk.stmts, ret_label)?;
                        writeln!(self.out, "{}:", end_l)?;
                    }
                    Some(else_blk) => {
                        writeln!(self.out, "\tb.eq\t{}", else_l)?;
                        self.gen_block(&then_blk.stmts, ret_label)?;
                        writeln!(self.out, "\tb\t{}", end_l)?;
                        writeln!(self.out, "{}:", else_l)?;
                        self.gen_block(&else_blk.stmts, ret_label)?;
                        writeln!(self.out, "{}:", end_l)?;
                    }
                }
                Ok(())
            }

            Stmt::While { cond, body } => {
                let start_l = self.new_label("while_start");
                let end_l = self.new_label("while_end");
                self.loop_stack.push(LoopCtx::Loop {
                    brk: end_l.clone(),
                    cont: start_l.clone(),
                });
                writeln!(self.out, "{}:", start_l)?;
                self.gen_value(cond)?;
                writeln!(self.out, "\tcmp\tx0, #0")?;
                writeln!(self.out, "\tb.eq\t{}", end_l)?;
                self.gen_block(&body.stmts, ret_label)?;
                writeln!(self.out, "\tb\t{}", start_l)?;
                writeln!(self.out, "{}:", end_l)?;
                self.loop_stack.pop();
                Ok(())
            }

            Stmt::DoWhile { cond, body } => {
                let start_l = self.new_label("dowhile_start");
                let end_l = self.new_label("dowhile_end");
                let cont_l = self.new_label("dowhile_cont");
                self.loop_stack.push(LoopCtx::Loop {
                    brk: end_l.clone(),
                    cont: cont_l.clone(),
                });
                writeln!(self.out, "{}:", start_l)?;
                self.gen_block(&body.stmts, ret_label)?;
                writeln!(self.out, "{}:", cont_l)?;
                self.gen_value(cond)?;
                writeln!(self.out, "\tcmp\tx0, #0")?;
                writeln!(self.out, "\tb.ne\t{}", start_l)?;
                writeln!(self.out, "{}:", end_l)?;
                self.loop_stack.pop();
                Ok(())
            }

            Stmt::For {
                init,
                cond,
                post,
                body,
            } => {
                let start_l = self.new_label("for_start");
                let post_l = self.new_label("for_post");
                let end_l = self.new_label("for_end");
                if let Some(init) = init {
                    self.gen_stmt(init, ret_label)?;
                }
                self.loop_stack.push(LoopCtx::Loop {
                    brk: end_l.clone(),
                    cont: post_l.clone(),
                });
                writeln!(self.out, "{}:", start_l)?;
                if let Some(cond) = cond {
                    self.gen_value(cond)?;
                    writeln!(self.out, "\tcmp\tx0, #0")?;
                    writeln!(self.out, "\tb.eq\t{}", end_l)?;
                }
                self.gen_block(&body.stmts, ret_label)?;
                writeln!(self.out, "{}:", post_l)?;
                if let Some(post) = post {
                    self.gen_value(post)?;
                }
                writeln!(self.out, "\tb\t{}", start_l)?;
                writeln!(self.out, "{}:", end_l)?;
                self.loop_stack.pop();
                Ok(())
            }

            Stmt::Break => {
                let target = match self.loop_stack.last() {
                    Some(LoopCtx::Loop { brk, .. }) | Some(LoopCtx::Switch { brk }) => brk.clone(),
                    None => {
                        return Err(CodeGenError::Logic(
                            "codegen: break used outside of a loop or switch".to_string(),
                        ));
                    }
                };
                writeln!(self.out, "\tb\t{}", target)?;
                Ok(())
            }

            Stmt::Continue => {
                // continue targets the innermost loop, skipping switches
                let target = self
                    .loop_stack
                    .iter()
                    .rev()
                    .find_map(|c| match c {
                        LoopCtx::Loop { cont, .. } => Some(cont.clone()),
                        LoopCtx::Switch { .. } => None,
                    })
                    .ok_or_else(|| {
                        CodeGenError::Logic(
                            "codegen: continue used outside of a loop".to_string(),
                        )
                    })?;
                writeln!(self.out, "\tb\t{}", target)?;
                Ok(())
            }

            Stmt::Goto(label) => {
                let l = self.user_label(label);
                writeln!(self.out, "\tb\t{}", l)?;
                Ok(())
            }

            Stmt::Label { name, stmt } => {
                let l = self.user_label(name);
                writeln!(self.out, "{}:", l)?;
                self.gen_stmt(stmt, ret_label)
            }

            Stmt::Switch { cond, cases } => self.gen_switch(cond, cases, ret_label),
        }
    }

    fn gen_switch(
        &mut self,
        cond: &Expr,
        cases: &[crate::ast::SwitchCase],
        ret_label: &str,
    ) -> Result<(), CodeGenError> {
        let end_l = self.new_label("sw_end");
        self.loop_stack.push(LoopCtx::Switch { brk: end_l.clone() });

        // Discriminant stays pushed while the comparisons run
        self.gen_value(cond)?;
        self.push_x0()?;

        let mut tramp_labels = Vec::new();
        for case in cases {
            let value = match case.value {
                Some(v) => v,
                None => continue,
            };
            let tl = self.new_label("sw_tramp");
            writeln!(self.out, "\tldr\tx0, [sp]")?;
            writeln!(self.out, "\tmov\tx1, #{}", value)?;
            writeln!(self.out, "\tcmp\tx0, x1")?;
            writeln!(self.out, "\tb.eq\t{}", tl)?;
            tramp_labels.push(tl);
        }

        // No case matched: pop the discriminant, go to default or end
        let has_default = cases.iter().any(|c| c.value.is_none());
        let def_l = if has_default {
            Some(self.new_label("sw_def"))
        } else {
            None
        };
        writeln!(self.out, "\tadd\tsp, sp, #16")?;
        match &def_l {
            Some(l) => writeln!(self.out, "\tb\t{}", l)?,
            None => writeln!(self.out, "\tb\t{}", end_l)?,
        }

        // Trampolines: restore sp, then enter the body. Bodies fall through
        // in declaration order.
        let mut body_labels = Vec::new();
        for tl in &tramp_labels {
            let bl = self.new_label("sw_body");
            writeln!(self.out, "{}:", tl)?;
            writeln!(self.out, "\tadd\tsp, sp, #16")?;
            writeln!(self.out, "\tb\t{}", bl)?;
            body_labels.push(bl);
        }

        let mut bi = 0;
        for case in cases {
            match case.value {
                Some(_) => {
                    writeln!(self.out, "{}:", body_labels[bi])?;
                    bi += 1;
                }
                None => {
                    if let Some(ref l) = def_l {
                        writeln!(self.out, "{}:", l)?;
                    }
                }
            }
            self.gen_block(&case.stmts, ret_label)?;
        }

        writeln!(self.out, "{}:", end_l)?;
        self.loop_stack.pop();
        Ok(())
    }

    // ---- Declaration initializers ----

    fn gen_decl_init(&mut self, e: &VarDeclEntry) -> Result<(), CodeGenError> {
        let off = self.layout.find_slot(&e.name).ok_or_else(|| {
            CodeGenError::Logic(format!(
                "codegen: variable '{}' missing from frame layout",
                e.name
            ))
        })?;
        let is_struct = e.struct_type.is_some() && e.ptr_depth == 0;

        // Struct variables
        if is_struct && e.array_len < 0 {
            let tag = e.struct_type.clone().unwrap();
            let nslots = self.struct_nslots(&tag);
            match &e.init {
                None => Ok(()),
                Some(Expr::InitList {
                    elems,
                    desig_indices,
                }) => self.store_struct_init(off, &tag, elems, desig_indices.as_deref()),
                Some(Expr::CompoundLit { init, .. }) => match init.as_ref() {
                    Expr::InitList {
                        elems,
                        desig_indices,
                    } => self.store_struct_init(off, &tag, elems, desig_indices.as_deref()),
                    _ => Err(CodeGenError::Logic(
                        "codegen: malformed compound literal initializer".to_string(),
                    )),
                },
                Some(other) => self.gen_struct_copy(off, nslots, other),
            }
        } else if e.array_len >= 0 {
            // Arrays
            match &e.init {
                None => Ok(()),
                Some(Expr::StrLit(raw)) => self.gen_char_array_init(off, raw),
                Some(Expr::InitList {
                    elems,
                    desig_indices,
                }) => {
                    let stride = if is_struct {
                        self.struct_nslots(e.struct_type.as_ref().unwrap())
                    } else if e.inner_dim2 > 0 {
                        e.inner_dim2
                    } else {
                        1
                    };
                    self.store_array_init(off, elems, desig_indices.as_deref(), stride)
                }
                Some(_) => Err(CodeGenError::Logic(format!(
                    "codegen: unsupported array initializer for '{}'",
                    e.name
                ))),
            }
        } else {
            // Scalars zero-initialize when no initializer is given
            match &e.init {
                Some(Expr::InitList { elems, .. }) => {
                    match elems.first() {
                        Some(first) => self.gen_value(first)?,
                        None => writeln!(self.out, "\tmov\tx0, #0")?,
                    }
                    self.store_x0_to_frame(off)
                }
                Some(init) => {
                    self.gen_value(init)?;
                    self.store_x0_to_frame(off)
                }
                None => {
                    writeln!(self.out, "\tmov\tx0, #0")?;
                    self.store_x0_to_frame(off)
                }
            }
        }
    }

    /// Store a struct variable's brace list. Designators and positions are
    /// field indices, mapped to slot offsets the same way field reads are.
    /// A nested list fills an embedded struct field slot by slot.
    fn store_struct_init(
        &mut self,
        off: i64,
        tag: &str,
        elems: &[Expr],
        desig: Option<&[i64]>,
    ) -> Result<(), CodeGenError> {
        let sd = match self.find_struct(tag) {
            Some(sd) => sd.clone(),
            // Unknown tag: fall back to one-slot-per-element packing
            None => return self.store_array_init(off, elems, desig, 1),
        };
        let desig = desig.map(<[i64]>::to_vec);
        let mut next_field: i64 = 0;
        for (k, elem) in elems.iter().enumerate() {
            let fi = match desig.as_ref().and_then(|d| d.get(k)).copied() {
                Some(d) if d >= 0 => d,
                _ => next_field,
            };
            if fi as usize >= sd.fields.len() {
                return Err(CodeGenError::Logic(format!(
                    "codegen: too many initializers for struct '{}'",
                    tag
                )));
            }
            let slot = self.field_slot_offset_at(&sd, fi as usize);
            match elem {
                Expr::InitList {
                    elems: inner,
                    desig_indices,
                } => {
                    let idesig = desig_indices.clone();
                    let mut inext: i64 = 0;
                    for (j, ie) in inner.iter().enumerate() {
                        let tj = match idesig.as_ref().and_then(|d| d.get(j)).copied() {
                            Some(d) if d >= 0 => d,
                            _ => inext,
                        };
                        self.gen_value(ie)?;
                        self.store_x0_to_frame(off - (slot + tj) * 8)?;
                        inext = tj + 1;
                    }
                }
                e => {
                    self.gen_value(e)?;
                    self.store_x0_to_frame(off - slot * 8)?;
                }
            }
            next_field = fi + 1;
        }
        Ok(())
    }

    /// Store brace-list elements into an array's frame area starting at
    /// `off`. `stride` is the slot count per element for nested lists (the
    /// struct size for struct arrays, the inner dimension for 2-D arrays);
    /// scalar elements always pack one per slot, so a flat list fills the
    /// array row-major.
    fn store_array_init(
        &mut self,
        off: i64,
        elems: &[Expr],
        desig: Option<&[i64]>,
        stride: i64,
    ) -> Result<(), CodeGenError> {
        let desig = desig.map(<[i64]>::to_vec);
        let mut next: i64 = 0;
        let mut flat: i64 = 0;
        for (k, elem) in elems.iter().enumerate() {
            let ti = match desig.as_ref().and_then(|d| d.get(k)).copied() {
                Some(d) if d >= 0 => d,
                _ => next,
            };
            match elem {
                Expr::InitList {
                    elems: inner,
                    desig_indices,
                } => {
                    let base = ti * stride;
                    let idesig = desig_indices.clone();
                    let mut inext: i64 = 0;
                    for (j, ie) in inner.iter().enumerate() {
                        let tj = match idesig.as_ref().and_then(|d| d.get(j)).copied() {
                            Some(d) if d >= 0 => d,
                            _ => inext,
                        };
                        self.gen_value(ie)?;
                        self.store_x0_to_frame(off - (base + tj) * 8)?;
                        inext = tj + 1;
                    }
                    flat = base + inext;
                }
                e => {
                    self.gen_value(e)?;
                    // Scalars fill consecutive slots even in strided lists
                    let slot = if desig.is_some() { ti } else { flat };
                    self.store_x0_to_frame(off - slot * 8)?;
                    flat = slot + 1;
                }
            }
            next = ti + 1;
        }
        Ok(())
    }


    /// Copy-initialize a struct variable from another struct's address.
    fn gen_struct_copy(
        &mut self,
        off: i64,
        nslots: i64,
        src: &Expr,
    ) -> Result<(), CodeGenError> {
        // The source expression yields the source struct's address: a struct
        // variable decays to its address, *p yields the pointer value, and a
        // struct-typed field contributes its address
        match src {
            Expr::Unary { op: '*', rhs } => self.gen_value(rhs)?,
            Expr::Field { .. } | Expr::Arrow { .. } => self.gen_addr(src)?,
            other => self.gen_value(other)?,
        }
        writeln!(self.out, "\tmov\tx1, x0")?;
        self.frame_addr_to_x0(off)?;
        for k in 0..nslots {
            writeln!(self.out, "\tldr\tx9, [x1, #{}]", k * 8)?;
            writeln!(self.out, "\tstr\tx9, [x0, #{}]", k * 8)?;
        }
        Ok(())
    }

    /// Byte-pack a string initializer into a char array's frame area,
    /// including the NUL terminator.
    fn gen_char_array_init(&mut self, off: i64, raw: &str) -> Result<(), CodeGenError> {
        let mut bytes = super::state::decode_c_string(raw).map_err(CodeGenError::Logic)?;
        bytes.push(0);
        self.frame_addr_to_x0(off)?;
        for (i, b) in bytes.iter().enumerate() {
            writeln!(self.out, "\tmov\tx1, #{}", b)?;
            writeln!(self.out, "\tstrb\tw1, [x0, #{}]", i)?;
        }
        Ok(())
    }
}
