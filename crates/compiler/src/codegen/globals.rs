//! String pool and global data emission
//!
//! Interned strings go into `__TEXT,__cstring` with `l_.str_<n>` labels.
//! Initialized scalar globals land in `.data` as `.quad`s; string scalars
//! point at their pool label. Uninitialized scalars, arrays and structs use
//! `.comm` with 8-byte alignment. Extern declarations are never emitted.

use super::state::asm_escape_string;
use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, GlobalDecl, Program};
use std::fmt::Write as _;

/// A constant value occupying one emitted data slot.
enum DataSlot {
    Num(i64),
    Label(String),
}

impl CodeGen {
    pub(super) fn emit_string_pool(&mut self) -> Result<(), CodeGenError> {
        if self.string_pool.is_empty() {
            return Ok(());
        }
        writeln!(self.out)?;
        writeln!(self.out, "\t.section\t__TEXT,__cstring,cstring_literals")?;
        let pool = std::mem::take(&mut self.string_pool);
        for (content, label) in &pool {
            writeln!(self.out, "{}:", label)?;
            writeln!(self.out, "\t.asciz\t\"{}\"", asm_escape_string(content))?;
        }
        self.string_pool = pool;
        Ok(())
    }

    /// Intern every string literal appearing in a global initializer so the
    /// pool section is complete before it is printed.
    pub(super) fn pre_intern_global_strings(&mut self, prog: &Program) -> Result<(), CodeGenError> {
        for g in &prog.globals {
            if g.is_extern || g.is_func_decl {
                continue;
            }
            match &g.init {
                // Char arrays embed their bytes directly, no pool entry
                Some(Expr::StrLit(_)) if g.array_len >= 0 => {}
                Some(init) => self.intern_strings_in(init)?,
                None => {}
            }
        }
        Ok(())
    }

    fn intern_strings_in(&mut self, e: &Expr) -> Result<(), CodeGenError> {
        match e {
            Expr::StrLit(raw) => {
                let decoded = super::state::decode_c_string(raw).map_err(CodeGenError::Logic)?;
                self.intern_string(decoded);
                Ok(())
            }
            Expr::InitList { elems, .. } => {
                for elem in elems {
                    self.intern_strings_in(elem)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(super) fn emit_globals(&mut self, prog: &Program) -> Result<(), CodeGenError> {
        let mut has_data = false;
        for g in &prog.globals {
            if g.is_extern || g.is_func_decl {
                continue;
            }
            self.emit_global(g, &mut has_data)?;
        }
        Ok(())
    }

    fn emit_global(&mut self, g: &GlobalDecl, has_data: &mut bool) -> Result<(), CodeGenError> {
        let elem_slots = match (&g.struct_type, g.ptr_depth) {
            (Some(st), 0) => self.struct_nslots(st),
            _ => 1,
        };

        if g.array_len >= 0 {
            match &g.init {
                // Char arrays with a string initializer embed their bytes
                Some(Expr::StrLit(raw)) => {
                    let bytes =
                        super::state::decode_c_string(raw).map_err(CodeGenError::Logic)?;
                    self.start_data(has_data)?;
                    writeln!(self.out, "\t.globl\t_{}", g.name)?;
                    writeln!(self.out, "\t.p2align\t3")?;
                    writeln!(self.out, "_{}:", g.name)?;
                    writeln!(self.out, "\t.asciz\t\"{}\"", asm_escape_string(&bytes))?;
                    return Ok(());
                }
                Some(Expr::InitList {
                    elems,
                    desig_indices,
                }) => {
                    let total = (g.array_len * elem_slots).max(elems.len() as i64);
                    let slots =
                        self.fill_data_slots(total, elems, desig_indices.as_deref(), elem_slots)?;
                    self.start_data(has_data)?;
                    writeln!(self.out, "\t.globl\t_{}", g.name)?;
                    writeln!(self.out, "\t.p2align\t3")?;
                    writeln!(self.out, "_{}:", g.name)?;
                    for slot in slots {
                        match slot {
                            DataSlot::Num(v) => writeln!(self.out, "\t.quad\t{}", v)?,
                            DataSlot::Label(l) => writeln!(self.out, "\t.quad\t{}", l)?,
                        }
                    }
                    return Ok(());
                }
                // Uninitialized arrays reserve zeroed common storage
                _ => {
                    let size = g.array_len * elem_slots * 8;
                    writeln!(self.out, "\t.comm\t_{}, {}, 3", g.name, size.max(8))?;
                    return Ok(());
                }
            }
        }

        match &g.init {
            Some(Expr::InitList {
                elems,
                desig_indices,
            }) => {
                // Struct variable with a brace initializer: one .quad per
                // slot, designators mapped through the field layout
                let slots = self.fill_struct_data_slots(g, elems, desig_indices.as_deref())?;
                self.start_data(has_data)?;
                writeln!(self.out, "\t.globl\t_{}", g.name)?;
                writeln!(self.out, "\t.p2align\t3")?;
                writeln!(self.out, "_{}:", g.name)?;
                for slot in slots {
                    match slot {
                        DataSlot::Num(v) => writeln!(self.out, "\t.quad\t{}", v)?,
                        DataSlot::Label(l) => writeln!(self.out, "\t.quad\t{}", l)?,
                    }
                }
                Ok(())
            }
            Some(init) => {
                let slot = self.data_slot_value(init)?;
                self.start_data(has_data)?;
                writeln!(self.out, "\t.globl\t_{}", g.name)?;
                writeln!(self.out, "\t.p2align\t3")?;
                writeln!(self.out, "_{}:", g.name)?;
                match slot {
                    DataSlot::Num(v) => writeln!(self.out, "\t.quad\t{}", v)?,
                    DataSlot::Label(l) => writeln!(self.out, "\t.quad\t{}", l)?,
                }
                Ok(())
            }
            None => {
                // Uninitialized scalar or struct
                let size = if g.is_struct_var() { elem_slots * 8 } else { 8 };
                writeln!(self.out, "\t.comm\t_{}, {}, 3", g.name, size)?;
                Ok(())
            }
        }
    }

    fn start_data(&mut self, has_data: &mut bool) -> Result<(), CodeGenError> {
        if !*has_data {
            writeln!(self.out)?;
            writeln!(self.out, "\t.data")?;
            *has_data = true;
        }
        Ok(())
    }

    /// One constant initializer element as a data slot.
    fn data_slot_value(&mut self, e: &Expr) -> Result<DataSlot, CodeGenError> {
        match e {
            Expr::Num(v) => Ok(DataSlot::Num(*v)),
            Expr::Unary { op: '-', rhs } => match rhs.as_ref() {
                Expr::Num(v) => Ok(DataSlot::Num(-v)),
                _ => Err(CodeGenError::Logic(
                    "codegen: non-constant global initializer".to_string(),
                )),
            },
            Expr::StrLit(raw) => {
                let decoded = super::state::decode_c_string(raw).map_err(CodeGenError::Logic)?;
                Ok(DataSlot::Label(self.intern_string(decoded)))
            }
            _ => Err(CodeGenError::Logic(
                "codegen: non-constant global initializer".to_string(),
            )),
        }
    }

    /// Flatten an array brace list into `total` data slots, zero-padded.
    /// Nested lists start at their element's stride boundary.
    fn fill_data_slots(
        &mut self,
        total: i64,
        elems: &[Expr],
        desig: Option<&[i64]>,
        stride: i64,
    ) -> Result<Vec<DataSlot>, CodeGenError> {
        let mut slots: Vec<DataSlot> = Vec::new();
        for _ in 0..total.max(0) {
            slots.push(DataSlot::Num(0));
        }
        let mut next: i64 = 0;
        let mut flat: i64 = 0;
        for (k, elem) in elems.iter().enumerate() {
            let ti = match desig.and_then(|d| d.get(k)).copied() {
                Some(d) if d >= 0 => d,
                _ => next,
            };
            match elem {
                Expr::InitList {
                    elems: inner,
                    desig_indices,
                } => {
                    let base = ti * stride;
                    let mut inext: i64 = 0;
                    for (j, ie) in inner.iter().enumerate() {
                        let tj = match desig_indices.as_ref().and_then(|d| d.get(j)).copied() {
                            Some(d) if d >= 0 => d,
                            _ => inext,
                        };
                        let idx = (base + tj) as usize;
                        if idx < slots.len() {
                            slots[idx] = self.data_slot_value(ie)?;
                        }
                        inext = tj + 1;
                    }
                    flat = base + inext;
                }
                e => {
                    let slot = if desig.is_some() { ti } else { flat };
                    if (slot as usize) < slots.len() {
                        slots[slot as usize] = self.data_slot_value(e)?;
                    }
                    flat = slot + 1;
                }
            }
            next = ti + 1;
        }
        Ok(slots)
    }

    /// Struct-variable brace list: field indices map to slot offsets.
    fn fill_struct_data_slots(
        &mut self,
        g: &GlobalDecl,
        elems: &[Expr],
        desig: Option<&[i64]>,
    ) -> Result<Vec<DataSlot>, CodeGenError> {
        let sd = g
            .struct_type
            .as_ref()
            .and_then(|st| self.find_struct(st))
            .cloned();
        let sd = match sd {
            Some(sd) => sd,
            // Not a struct (or unknown tag): treat as a dense slot list
            None => return self.fill_data_slots(elems.len() as i64, elems, desig, 1),
        };
        let nslots = self.struct_nslots(&sd.name);
        let mut slots: Vec<DataSlot> = Vec::new();
        for _ in 0..nslots {
            slots.push(DataSlot::Num(0));
        }
        let mut next_field: i64 = 0;
        for (k, elem) in elems.iter().enumerate() {
            let fi = match desig.and_then(|d| d.get(k)).copied() {
                Some(d) if d >= 0 => d,
                _ => next_field,
            };
            if fi as usize >= sd.fields.len() {
                return Err(CodeGenError::Logic(format!(
                    "codegen: too many initializers for struct '{}'",
                    sd.name
                )));
            }
            let base = self.field_slot_offset_at(&sd, fi as usize);
            match elem {
                Expr::InitList { elems: inner, .. } => {
                    for (j, ie) in inner.iter().enumerate() {
                        let idx = (base + j as i64) as usize;
                        if idx < slots.len() {
                            slots[idx] = self.data_slot_value(ie)?;
                        }
                    }
                }
                e => {
                    let idx = base as usize;
                    if idx < slots.len() {
                        slots[idx] = self.data_slot_value(e)?;
                    }
                }
            }
            next_field = fi + 1;
        }
        Ok(slots)
    }
}
