//! Program walk and per-function emission
//!
//! Registers the program's structs, globals and functions into the CodeGen
//! state, then emits `.text` with one function at a time. Each function gets
//! the standard frame: fp/lr pushed, `x29` established, the frame extended by
//! the layout's (16-byte aligned) size, and parameters spilled into their
//! slots on entry.

use super::{CodeGen, CodeGenError};
use crate::ast::{FuncDef, Program};
use std::fmt::Write as _;
use tracing::debug;

impl CodeGen {
    /// Generate the complete assembly text for a program.
    /// Deterministic: the same AST produces identical bytes.
    pub fn generate(&mut self, prog: &Program) -> Result<String, CodeGenError> {
        self.register_program(prog);

        writeln!(self.out, "\t.text")?;
        for f in &prog.funcs {
            self.gen_func(f)?;
        }

        // String-initialized globals must land in the pool before the pool
        // section is printed
        self.pre_intern_global_strings(prog)?;
        self.emit_string_pool()?;
        self.emit_globals(prog)?;

        debug!(
            funcs = prog.funcs.len(),
            strings = self.string_pool.len(),
            bytes = self.out.len(),
            "assembly generation complete"
        );
        Ok(std::mem::take(&mut self.out))
    }

    fn register_program(&mut self, prog: &Program) {
        self.structs = prog.structs.clone();

        for p in &prog.protos {
            self.known_funcs.push(p.name.clone());
            if p.ret_is_ptr {
                self.ptr_ret_funcs.push(p.name.clone());
            }
            if p.is_variadic {
                self.variadic_funcs.push((p.name.clone(), p.nparams));
            }
        }
        for f in &prog.funcs {
            self.known_funcs.push(f.name.clone());
            if f.ret_is_ptr {
                self.ptr_ret_funcs.push(f.name.clone());
            }
            if f.is_variadic {
                self.variadic_funcs.push((f.name.clone(), f.params.len()));
            }
        }
        for g in &prog.globals {
            if g.is_func_decl {
                self.known_funcs.push(g.name.clone());
                if g.ptr_depth > 0 {
                    self.ptr_ret_funcs.push(g.name.clone());
                }
                continue;
            }
            self.globals.push(super::state::GlobalInfo {
                name: g.name.clone(),
                is_array: g.array_len >= 0,
                is_struct_var: g.is_struct_var(),
                struct_type: g.struct_type.clone(),
                ptr_depth: g.ptr_depth,
                is_char: g.is_char,
            });
        }
    }

    fn gen_func(&mut self, f: &FuncDef) -> Result<(), CodeGenError> {
        if f.params.len() > 8 {
            return Err(CodeGenError::Logic(format!(
                "codegen: function '{}' has too many parameters (limit 8)",
                f.name
            )));
        }
        self.layout = self.layout_func(f).map_err(CodeGenError::Logic)?;
        self.cur_func_name = f.name.clone();
        let ret_label = self.new_label("ret");

        writeln!(self.out)?;
        writeln!(self.out, "\t.p2align\t2")?;
        writeln!(self.out, "\t.globl\t_{}", f.name)?;
        writeln!(self.out, "_{}:", f.name)?;
        writeln!(self.out, "\tstp\tx29, x30, [sp, #-16]!")?;
        writeln!(self.out, "\tmov\tx29, sp")?;

        let frame = self.layout.stack_size;
        if frame > 0 {
            if frame <= 4095 {
                writeln!(self.out, "\tsub\tsp, sp, #{}", frame)?;
            } else {
                writeln!(self.out, "\tmov\tx9, #{}", frame)?;
                writeln!(self.out, "\tsub\tsp, sp, x9")?;
            }
        }

        // Parameters arrive in x0..x7 and are stored into their slots
        for (i, p) in f.params.iter().enumerate() {
            let off = self.layout.find_slot(&p.name).ok_or_else(|| {
                CodeGenError::Logic(format!(
                    "codegen: parameter '{}' missing from frame layout",
                    p.name
                ))
            })?;
            if off <= 255 {
                writeln!(self.out, "\tstr\tx{}, [x29, #-{}]", i, off)?;
            } else {
                writeln!(self.out, "\tmov\tx9, #{}", off)?;
                writeln!(self.out, "\tsub\tx9, x29, x9")?;
                writeln!(self.out, "\tstr\tx{}, [x9]", i)?;
            }
        }

        self.gen_block(&f.body.stmts, &ret_label)?;

        // Falling off the end returns 0
        writeln!(self.out, "\tmov\tw0, #0")?;
        writeln!(self.out, "{}:", ret_label)?;
        if frame > 0 {
            if frame <= 4095 {
                writeln!(self.out, "\tadd\tsp, sp, #{}", frame)?;
            } else {
                writeln!(self.out, "\tmov\tx9, #{}", frame)?;
                writeln!(self.out, "\tadd\tsp, sp, x9")?;
            }
        }
        writeln!(self.out, "\tldp\tx29, x30, [sp], #16")?;
        writeln!(self.out, "\tret")?;
        Ok(())
    }
}
