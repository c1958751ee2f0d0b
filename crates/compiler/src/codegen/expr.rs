//! Expression lowering
//!
//! Every expression leaves its value in `x0`; binary evaluation spills the
//! LHS to the stack with 16-byte pushes so `sp` stays aligned. Address
//! generation (`gen_addr`) and value generation (`gen_value`) mirror each
//! other: an lvalue's address is computed, then loaded or stored through.
//!
//! Loads and stores through `char` pointers and char arrays move single
//! bytes (`ldrb`/`strb`) and index with stride 1; everything else moves
//! whole 8-byte slots.

use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, INDIRECT_CALL};
use std::fmt::Write as _;

impl CodeGen {
    // ---- Small emission helpers ----

    pub(super) fn push_x0(&mut self) -> Result<(), CodeGenError> {
        writeln!(self.out, "\tstr\tx0, [sp, #-16]!")?;
        Ok(())
    }

    pub(super) fn pop_x1(&mut self) -> Result<(), CodeGenError> {
        writeln!(self.out, "\tldr\tx1, [sp], #16")?;
        Ok(())
    }

    /// x0 = x29 - off
    pub(super) fn frame_addr_to_x0(&mut self, off: i64) -> Result<(), CodeGenError> {
        if off <= 255 {
            writeln!(self.out, "\tsub\tx0, x29, #{}", off)?;
        } else {
            writeln!(self.out, "\tmov\tx0, #{}", off)?;
            writeln!(self.out, "\tsub\tx0, x29, x0")?;
        }
        Ok(())
    }

    /// [x29 - off] = x0
    pub(super) fn store_x0_to_frame(&mut self, off: i64) -> Result<(), CodeGenError> {
        if off <= 255 {
            writeln!(self.out, "\tstr\tx0, [x29, #-{}]", off)?;
        } else {
            writeln!(self.out, "\tmov\tx9, #{}", off)?;
            writeln!(self.out, "\tsub\tx9, x29, x9")?;
            writeln!(self.out, "\tstr\tx0, [x9]")?;
        }
        Ok(())
    }

    /// Load an immediate into x0 with mov, or a movz/movk chain at 16-bit
    /// strides for wide values.
    pub(super) fn load_imm_x0(&mut self, val: i64) -> Result<(), CodeGenError> {
        if (-65535..=65535).contains(&val) {
            writeln!(self.out, "\tmov\tx0, #{}", val)?;
            return Ok(());
        }
        let u = val as u64;
        writeln!(self.out, "\tmovz\tx0, #{}", u & 0xFFFF)?;
        for shift in [16u32, 32, 48] {
            let part = (u >> shift) & 0xFFFF;
            if part != 0 {
                writeln!(self.out, "\tmovk\tx0, #{}, lsl #{}", part, shift)?;
            }
        }
        Ok(())
    }

    fn page_addr_to_x0(&mut self, symbol: &str) -> Result<(), CodeGenError> {
        writeln!(self.out, "\tadrp\tx0, {}@PAGE", symbol)?;
        writeln!(self.out, "\tadd\tx0, x0, {}@PAGEOFF", symbol)?;
        Ok(())
    }

    /// Element stride in bytes when indexing through `base`.
    fn index_stride(&self, base: &Expr) -> i64 {
        if let Expr::Var(name) = base {
            let stype = self
                .struct_var_type_of(name)
                .or_else(|| self.ptr_struct_type_of(name));
            if let Some(st) = stype {
                return self.struct_nslots(&st) * 8;
            }
            if self.is_byte_var(name) {
                return 1;
            }
        }
        8
    }

    /// Whether loading/storing through this lvalue moves a single byte.
    fn lvalue_is_byte(&self, e: &Expr) -> bool {
        match e {
            Expr::Index { base, .. } => matches!(base.as_ref(), Expr::Var(n) if self.is_byte_var(n)),
            Expr::Unary { op: '*', rhs } => match rhs.as_ref() {
                Expr::Var(n) => self.is_byte_var(n),
                // *(p + i) through a char pointer
                Expr::Binary { lhs, .. } => {
                    matches!(lhs.as_ref(), Expr::Var(n) if self.is_byte_var(n))
                }
                _ => false,
            },
            _ => false,
        }
    }

    // ---- Address generation ----

    pub(super) fn gen_addr(&mut self, e: &Expr) -> Result<(), CodeGenError> {
        match e {
            Expr::Var(name) => {
                if let Some(off) = self.layout.find_slot(name) {
                    return self.frame_addr_to_x0(off);
                }
                if self.find_global(name).is_some() || self.is_known_func(name) {
                    return self.page_addr_to_x0(&format!("_{}", name));
                }
                Err(CodeGenError::Logic(format!(
                    "codegen: unknown variable '{}'",
                    name
                )))
            }
            Expr::Unary { op: '*', rhs } => self.gen_value(rhs),
            Expr::Index { base, index } => {
                let stride = self.index_stride(base);
                self.gen_value(base)?;
                self.push_x0()?;
                self.gen_value(index)?;
                match stride {
                    1 => {}
                    8 => writeln!(self.out, "\tlsl\tx0, x0, #3")?,
                    s => {
                        writeln!(self.out, "\tmov\tx1, #{}", s)?;
                        writeln!(self.out, "\tmul\tx0, x0, x1")?;
                    }
                }
                self.pop_x1()?;
                writeln!(self.out, "\tadd\tx0, x1, x0")?;
                Ok(())
            }
            Expr::Field {
                obj,
                field,
                struct_type,
            } => {
                self.gen_addr(obj)?;
                let fi = self.field_slot_offset(struct_type, field)?;
                self.add_field_offset(fi * 8)
            }
            Expr::Arrow {
                obj,
                field,
                struct_type,
            } => {
                self.gen_value(obj)?;
                let fi = self.field_slot_offset(struct_type, field)?;
                self.add_field_offset(fi * 8)
            }
            _ => Err(CodeGenError::Logic(
                "codegen: expression is not an lvalue".to_string(),
            )),
        }
    }

    fn add_field_offset(&mut self, bytes: i64) -> Result<(), CodeGenError> {
        if bytes == 0 {
            return Ok(());
        }
        if bytes <= 4095 {
            writeln!(self.out, "\tadd\tx0, x0, #{}", bytes)?;
        } else {
            writeln!(self.out, "\tmov\tx9, #{}", bytes)?;
            writeln!(self.out, "\tadd\tx0, x0, x9")?;
        }
        Ok(())
    }

    // ---- Value generation ----

    pub(super) fn gen_value(&mut self, e: &Expr) -> Result<(), CodeGenError> {
        match e {
            Expr::Num(val) => self.load_imm_x0(*val),

            Expr::Var(name) => {
                // A function name used as a value resolves to its address
                if self.layout.find_slot(name).is_none()
                    && self.find_global(name).is_none()
                    && self.is_known_func(name)
                {
                    return self.gen_addr(e);
                }
                self.gen_addr(e)?;
                // Arrays and struct variables decay to their address
                let mut skip_load =
                    self.layout.is_array(name) || self.layout.is_struct_var(name);
                if !skip_load {
                    if let Some(g) = self.find_global(name) {
                        skip_load = g.is_array || g.is_struct_var;
                    }
                }
                if !skip_load {
                    writeln!(self.out, "\tldr\tx0, [x0]")?;
                }
                Ok(())
            }

            Expr::Field { .. } | Expr::Arrow { .. } => {
                self.gen_addr(e)?;
                writeln!(self.out, "\tldr\tx0, [x0]")?;
                Ok(())
            }

            Expr::Index { .. } => {
                self.gen_addr(e)?;
                if self.lvalue_is_byte(e) {
                    writeln!(self.out, "\tldrb\tw0, [x0]")?;
                } else {
                    writeln!(self.out, "\tldr\tx0, [x0]")?;
                }
                Ok(())
            }

            Expr::Assign { target, rhs } => {
                self.gen_addr(target)?;
                self.push_x0()?;
                self.gen_value(rhs)?;
                self.pop_x1()?;
                if self.lvalue_is_byte(target) {
                    writeln!(self.out, "\tstrb\tw0, [x1]")?;
                } else {
                    writeln!(self.out, "\tstr\tx0, [x1]")?;
                }
                Ok(())
            }

            Expr::PostInc(operand) | Expr::PostDec(operand) => {
                // Pointer-to-struct steps by the struct size
                let mut inc: i64 = 1;
                if let Expr::Var(name) = operand.as_ref() {
                    if let Some(st) = self.ptr_struct_type_of(name) {
                        inc = self.struct_nslots(&st) * 8;
                    }
                }
                self.gen_addr(operand)?;
                self.push_x0()?;
                writeln!(self.out, "\tldr\tx0, [x0]")?;
                self.push_x0()?;
                if matches!(e, Expr::PostInc(_)) {
                    writeln!(self.out, "\tadd\tx0, x0, #{}", inc)?;
                } else {
                    writeln!(self.out, "\tsub\tx0, x0, #{}", inc)?;
                }
                writeln!(self.out, "\tldr\tx1, [sp, #16]")?;
                writeln!(self.out, "\tstr\tx0, [x1]")?;
                // The pre-increment value is the expression's result
                writeln!(self.out, "\tldr\tx0, [sp], #32")?;
                Ok(())
            }

            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let else_l = self.new_label("tern_else");
                let end_l = self.new_label("tern_end");
                self.gen_value(cond)?;
                writeln!(self.out, "\tcmp\tx0, #0")?;
                writeln!(self.out, "\tb.eq\t{}", else_l)?;
                self.gen_value(then_expr)?;
                writeln!(self.out, "\tb\t{}", end_l)?;
                writeln!(self.out, "{}:", else_l)?;
                self.gen_value(else_expr)?;
                writeln!(self.out, "{}:", end_l)?;
                Ok(())
            }

            Expr::StrLit(raw) => {
                let decoded = super::state::decode_c_string(raw).map_err(CodeGenError::Logic)?;
                let label = self.intern_string(decoded);
                self.page_addr_to_x0(&label)
            }

            Expr::Unary { op, rhs } => match op {
                '&' => self.gen_addr(rhs),
                '*' => {
                    self.gen_value(rhs)?;
                    if self.lvalue_is_byte(e) {
                        writeln!(self.out, "\tldrb\tw0, [x0]")?;
                    } else {
                        writeln!(self.out, "\tldr\tx0, [x0]")?;
                    }
                    Ok(())
                }
                '-' => {
                    self.gen_value(rhs)?;
                    writeln!(self.out, "\tneg\tx0, x0")?;
                    Ok(())
                }
                '!' => {
                    self.gen_value(rhs)?;
                    writeln!(self.out, "\tcmp\tx0, #0")?;
                    writeln!(self.out, "\tcset\tx0, eq")?;
                    Ok(())
                }
                '~' => {
                    self.gen_value(rhs)?;
                    writeln!(self.out, "\tmvn\tx0, x0")?;
                    Ok(())
                }
                other => Err(CodeGenError::Logic(format!(
                    "codegen: unsupported unary operator '{}'",
                    *other
                ))),
            },

            Expr::Binary { op, lhs, rhs } => self.gen_binary(op, lhs, rhs),

            Expr::Call { name, args } => self.gen_call(name, args),

            Expr::InitList { .. } | Expr::CompoundLit { .. } => Err(CodeGenError::Logic(
                "codegen: initializer list used outside a declaration".to_string(),
            )),
        }
    }

    fn gen_binary(&mut self, op: &str, lhs: &Expr, rhs: &Expr) -> Result<(), CodeGenError> {
        // Comma evaluates and discards the LHS
        if op == "," {
            self.gen_value(lhs)?;
            return self.gen_value(rhs);
        }

        // Short-circuit forms branch around the RHS
        if op == "&&" || op == "||" {
            let end_l = self.new_label("sc_end");
            let rhs_l = self.new_label("sc_rhs");
            self.gen_value(lhs)?;
            writeln!(self.out, "\tcmp\tx0, #0")?;
            if op == "&&" {
                writeln!(self.out, "\tb.ne\t{}", rhs_l)?;
                writeln!(self.out, "\tmov\tx0, #0")?;
                writeln!(self.out, "\tb\t{}", end_l)?;
            } else {
                writeln!(self.out, "\tb.eq\t{}", rhs_l)?;
                writeln!(self.out, "\tmov\tx0, #1")?;
                writeln!(self.out, "\tb\t{}", end_l)?;
            }
            writeln!(self.out, "{}:", rhs_l)?;
            self.gen_value(rhs)?;
            writeln!(self.out, "\tcmp\tx0, #0")?;
            writeln!(self.out, "\tcset\tx0, ne")?;
            writeln!(self.out, "{}:", end_l)?;
            return Ok(());
        }

        self.gen_value(lhs)?;
        self.push_x0()?;
        self.gen_value(rhs)?;
        self.pop_x1()?;

        // Pointer-to-struct arithmetic scales the integer side by the
        // struct size before the add/sub
        if op == "+" || op == "-" {
            let mut scale: Option<(i64, bool)> = None;
            if let Expr::Var(name) = lhs {
                if let Some(st) = self.ptr_struct_type_of(name) {
                    scale = Some((self.struct_nslots(&st) * 8, true));
                }
            }
            if scale.is_none() {
                if let Expr::Var(name) = rhs {
                    if let Some(st) = self.ptr_struct_type_of(name) {
                        scale = Some((self.struct_nslots(&st) * 8, false));
                    }
                }
            }
            if let Some((bytes, scale_rhs)) = scale {
                writeln!(self.out, "\tmov\tx9, #{}", bytes)?;
                if scale_rhs {
                    writeln!(self.out, "\tmul\tx0, x0, x9")?;
                } else {
                    writeln!(self.out, "\tmul\tx1, x1, x9")?;
                }
            }
        }

        match op {
            "+" => writeln!(self.out, "\tadd\tx0, x1, x0")?,
            "-" => writeln!(self.out, "\tsub\tx0, x1, x0")?,
            "*" => writeln!(self.out, "\tmul\tx0, x1, x0")?,
            "/" => writeln!(self.out, "\tsdiv\tx0, x1, x0")?,
            "%" => {
                writeln!(self.out, "\tsdiv\tx9, x1, x0")?;
                writeln!(self.out, "\tmsub\tx0, x9, x0, x1")?;
            }
            "&" => writeln!(self.out, "\tand\tx0, x1, x0")?,
            "|" => writeln!(self.out, "\torr\tx0, x1, x0")?,
            "^" => writeln!(self.out, "\teor\tx0, x1, x0")?,
            "<<" => writeln!(self.out, "\tlsl\tx0, x1, x0")?,
            ">>" => writeln!(self.out, "\tasr\tx0, x1, x0")?,
            "==" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, eq")?;
            }
            "!=" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, ne")?;
            }
            "<" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, lt")?;
            }
            "<=" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, le")?;
            }
            ">" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, gt")?;
            }
            ">=" => {
                writeln!(self.out, "\tcmp\tx1, x0")?;
                writeln!(self.out, "\tcset\tx0, ge")?;
            }
            other => {
                return Err(CodeGenError::Logic(format!(
                    "codegen: unsupported binary operator '{}'",
                    other
                )));
            }
        }
        Ok(())
    }

    // ---- Calls ----

    fn gen_call(&mut self, name: &str, args: &[Expr]) -> Result<(), CodeGenError> {
        // Byte access intrinsics, the escape hatch for byte-granular work
        if name == "__read_byte" {
            if args.len() != 2 {
                return Err(CodeGenError::Logic(
                    "codegen: __read_byte takes 2 arguments".to_string(),
                ));
            }
            self.gen_value(&args[0])?;
            self.push_x0()?;
            self.gen_value(&args[1])?;
            self.pop_x1()?;
            writeln!(self.out, "\tldrb\tw0, [x1, x0]")?;
            return Ok(());
        }
        if name == "__write_byte" {
            if args.len() != 3 {
                return Err(CodeGenError::Logic(
                    "codegen: __write_byte takes 3 arguments".to_string(),
                ));
            }
            self.gen_value(&args[0])?;
            self.push_x0()?;
            self.gen_value(&args[1])?;
            self.push_x0()?;
            self.gen_value(&args[2])?;
            writeln!(self.out, "\tldr\tx1, [sp], #16")?;
            writeln!(self.out, "\tldr\tx2, [sp], #16")?;
            writeln!(self.out, "\tstrb\tw0, [x2, x1]")?;
            return Ok(());
        }

        // __builtin_va_start(&ap): ap = x29 + 16, the first caller-stacked
        // variadic slot
        if name == "__builtin_va_start" {
            if args.len() != 1 {
                return Err(CodeGenError::Logic(
                    "codegen: __builtin_va_start takes 1 argument".to_string(),
                ));
            }
            self.gen_value(&args[0])?;
            writeln!(self.out, "\tadd\tx1, x29, #16")?;
            writeln!(self.out, "\tstr\tx1, [x0]")?;
            return Ok(());
        }

        // Indirect call through a non-identifier expression: the function
        // expression was prepended to the argument list by the parser
        if name == INDIRECT_CALL {
            if args.is_empty() {
                return Err(CodeGenError::Logic(
                    "codegen: indirect call with no function expression".to_string(),
                ));
            }
            return self.gen_indirect_call(&args[0], &args[1..]);
        }

        // Call through a function-pointer variable
        if !self.is_known_func(name)
            && (self.layout.find_slot(name).is_some() || self.find_global(name).is_some())
        {
            let fn_expr = Expr::Var(name.to_string());
            return self.gen_indirect_call(&fn_expr, args);
        }

        // Variadic callee with extra arguments: named args in registers,
        // the variadic tail stacked on 8-byte slots at [sp, #0]
        if let Some(nfixed) = self.variadic_fixed_count(name) {
            if args.len() > nfixed {
                return self.gen_variadic_call(name, args, nfixed);
            }
        }

        // Plain direct call
        if args.len() > 8 {
            return Err(CodeGenError::Logic(format!(
                "codegen: too many call arguments for '{}' (limit 8)",
                name
            )));
        }
        for a in args {
            self.gen_value(a)?;
            self.push_x0()?;
        }
        for i in 0..args.len() {
            let disp = (args.len() - 1 - i) * 16;
            writeln!(self.out, "\tldr\tx{}, [sp, #{}]", i, disp)?;
        }
        if !args.is_empty() {
            writeln!(self.out, "\tadd\tsp, sp, #{}", args.len() * 16)?;
        }
        writeln!(self.out, "\tbl\t_{}", name)?;
        if !self.func_returns_ptr(name) {
            writeln!(self.out, "\tsxtw\tx0, w0")?;
        }
        Ok(())
    }

    fn gen_variadic_call(
        &mut self,
        name: &str,
        args: &[Expr],
        nfixed: usize,
    ) -> Result<(), CodeGenError> {
        if nfixed > 8 {
            return Err(CodeGenError::Logic(format!(
                "codegen: too many fixed arguments for variadic '{}'",
                name
            )));
        }
        let n_var = args.len() - nfixed;
        let var_space = ((n_var as i64 * 8) + 15) / 16 * 16;

        for a in &args[..nfixed] {
            self.gen_value(a)?;
            self.push_x0()?;
        }
        if var_space > 0 {
            writeln!(self.out, "\tsub\tsp, sp, #{}", var_space)?;
        }
        for (i, a) in args[nfixed..].iter().enumerate() {
            self.gen_value(a)?;
            writeln!(self.out, "\tstr\tx0, [sp, #{}]", i * 8)?;
        }
        for i in 0..nfixed {
            let disp = var_space + ((nfixed - 1 - i) as i64) * 16;
            writeln!(self.out, "\tldr\tx{}, [sp, #{}]", i, disp)?;
        }
        writeln!(self.out, "\tbl\t_{}", name)?;
        writeln!(
            self.out,
            "\tadd\tsp, sp, #{}",
            var_space + (nfixed as i64) * 16
        )?;
        if !self.func_returns_ptr(name) {
            writeln!(self.out, "\tsxtw\tx0, w0")?;
        }
        Ok(())
    }

    fn gen_indirect_call(&mut self, fn_expr: &Expr, args: &[Expr]) -> Result<(), CodeGenError> {
        if args.len() > 8 {
            return Err(CodeGenError::Logic(
                "codegen: too many call arguments (limit 8)".to_string(),
            ));
        }
        self.gen_value(fn_expr)?;
        self.push_x0()?;
        for a in args {
            self.gen_value(a)?;
            self.push_x0()?;
        }
        writeln!(self.out, "\tldr\tx8, [sp, #{}]", args.len() * 16)?;
        for i in 0..args.len() {
            let disp = (args.len() - 1 - i) * 16;
            writeln!(self.out, "\tldr\tx{}, [sp, #{}]", i, disp)?;
        }
        writeln!(self.out, "\tadd\tsp, sp, #{}", (args.len() + 1) * 16)?;
        writeln!(self.out, "\tblr\tx8")?;
        Ok(())
    }
}
