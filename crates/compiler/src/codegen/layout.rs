//! Stack frame layout
//!
//! A pre-codegen walk over every statement in a function body, including
//! nested blocks, `for` initializers and switch cases, assigns each
//! parameter and local a unique frame offset. Structs consume their
//! recursive slot count, arrays `length * 8` bytes. The total is rounded up
//! to a multiple of 16 (AArch64 ABI).

use super::CodeGen;
use crate::ast::{FuncDef, Stmt, VarDeclEntry};

const MAX_SLOTS: usize = 256;
const MAX_ARRAYS: usize = 64;
const MAX_STRUCT_VARS: usize = 64;

/// Per-function frame layout. Offsets are positive distances below `x29`;
/// a variable's storage ends at `x29 - offset + size`.
#[derive(Debug, Clone, Default)]
pub(super) struct FuncLayout {
    slots: Vec<(String, i64)>,
    arrays: Vec<(String, i64)>,
    struct_vars: Vec<(String, String)>,
    ptr_struct_vars: Vec<(String, String)>,
    char_ptrs: Vec<String>,
    char_arrays: Vec<String>,
    pub stack_size: i64,
}

impl FuncLayout {
    pub fn find_slot(&self, name: &str) -> Option<i64> {
        self.slots
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, off)| *off)
    }

    pub fn is_array(&self, name: &str) -> bool {
        self.arrays.iter().any(|(n, _)| n == name)
    }

    pub fn is_struct_var(&self, name: &str) -> bool {
        self.struct_vars.iter().any(|(n, _)| n == name)
    }

    pub fn struct_var_type(&self, name: &str) -> Option<String> {
        self.struct_vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    pub fn ptr_struct_type(&self, name: &str) -> Option<String> {
        self.ptr_struct_vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    pub fn is_char_ptr(&self, name: &str) -> bool {
        self.char_ptrs.iter().any(|n| n == name)
    }

    pub fn is_char_array(&self, name: &str) -> bool {
        self.char_arrays.iter().any(|n| n == name)
    }

    fn add_slot(&mut self, name: &str, offset: i64) -> Result<(), String> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(format!(
                "codegen: too many locals (limit {}) in function frame",
                MAX_SLOTS
            ));
        }
        self.slots.push((name.to_string(), offset));
        Ok(())
    }
}

impl CodeGen {
    /// Compute the frame layout for one function.
    pub(super) fn layout_func(&self, f: &FuncDef) -> Result<FuncLayout, String> {
        let mut layout = FuncLayout::default();
        let mut offset: i64 = 0;

        for p in &f.params {
            offset += 8;
            layout.add_slot(&p.name, offset)?;
            // Pointer-to-struct parameters participate in stride scaling;
            // a struct "by value" is just one slot here
            if let Some(ref st) = p.struct_type {
                if p.ptr_depth == 1 {
                    layout.ptr_struct_vars.push((p.name.clone(), st.clone()));
                }
            }
            if p.is_char && p.ptr_depth == 1 {
                layout.char_ptrs.push(p.name.clone());
            }
        }

        self.walk_stmts(&f.body.stmts, &mut layout, &mut offset)?;

        layout.stack_size = (offset + 15) / 16 * 16;
        Ok(layout)
    }

    fn layout_decl(
        &self,
        e: &VarDeclEntry,
        layout: &mut FuncLayout,
        offset: &mut i64,
    ) -> Result<(), String> {
        if layout.find_slot(&e.name).is_some() {
            return Err(format!("codegen: duplicate variable '{}'", e.name));
        }
        let is_struct = e.struct_type.is_some() && e.ptr_depth == 0;
        if is_struct && e.array_len >= 0 {
            let st = e.struct_type.as_ref().unwrap();
            let nslots = self.struct_nslots(st);
            *offset += e.array_len * nslots * 8;
            if layout.struct_vars.len() >= MAX_STRUCT_VARS {
                return Err(format!(
                    "codegen: too many struct variables (limit {})",
                    MAX_STRUCT_VARS
                ));
            }
            layout.struct_vars.push((e.name.clone(), st.clone()));
            if layout.arrays.len() >= MAX_ARRAYS {
                return Err(format!("codegen: too many arrays (limit {})", MAX_ARRAYS));
            }
            layout.arrays.push((e.name.clone(), e.array_len));
        } else if is_struct {
            let st = e.struct_type.as_ref().unwrap();
            *offset += self.struct_nslots(st) * 8;
            if layout.struct_vars.len() >= MAX_STRUCT_VARS {
                return Err(format!(
                    "codegen: too many struct variables (limit {})",
                    MAX_STRUCT_VARS
                ));
            }
            layout.struct_vars.push((e.name.clone(), st.clone()));
        } else if e.array_len >= 0 {
            *offset += e.array_len * 8;
            if layout.arrays.len() >= MAX_ARRAYS {
                return Err(format!("codegen: too many arrays (limit {})", MAX_ARRAYS));
            }
            layout.arrays.push((e.name.clone(), e.array_len));
            if e.is_char {
                layout.char_arrays.push(e.name.clone());
            }
        } else {
            *offset += 8;
            if let Some(ref st) = e.struct_type {
                if e.ptr_depth == 1 {
                    layout.ptr_struct_vars.push((e.name.clone(), st.clone()));
                }
            }
            if e.is_char && e.ptr_depth == 1 {
                layout.char_ptrs.push(e.name.clone());
            }
        }
        layout.add_slot(&e.name, *offset)
    }

    fn walk_stmts(
        &self,
        stmts: &[Stmt],
        layout: &mut FuncLayout,
        offset: &mut i64,
    ) -> Result<(), String> {
        for st in stmts {
            match st {
                Stmt::VarDecl(entries) => {
                    for e in entries {
                        self.layout_decl(e, layout, offset)?;
                    }
                }
                Stmt::If {
                    then_blk, else_blk, ..
                } => {
                    self.walk_stmts(&then_blk.stmts, layout, offset)?;
                    if let Some(b) = else_blk {
                        self.walk_stmts(&b.stmts, layout, offset)?;
                    }
                }
                Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => {
                    self.walk_stmts(&body.stmts, layout, offset)?;
                }
                Stmt::For { init, body, .. } => {
                    if let Some(init) = init {
                        if matches!(init.as_ref(), Stmt::VarDecl(_)) {
                            self.walk_stmts(std::slice::from_ref(init), layout, offset)?;
                        }
                    }
                    self.walk_stmts(&body.stmts, layout, offset)?;
                }
                Stmt::Label { stmt, .. } => {
                    self.walk_stmts(std::slice::from_ref(stmt), layout, offset)?;
                }
                Stmt::Switch { cases, .. } => {
                    for c in cases {
                        self.walk_stmts(&c.stmts, layout, offset)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn layout_of(src: &str) -> FuncLayout {
        let prog = Parser::new(tokenize(src).unwrap()).parse().unwrap();
        let mut cg = CodeGen::new();
        cg.structs = prog.structs.clone();
        cg.layout_func(prog.find_func("main").unwrap()).unwrap()
    }

    #[test]
    fn test_params_then_locals() {
        let l = layout_of("int main(int a, int b) { int c; return 0; }");
        assert_eq!(l.find_slot("a"), Some(8));
        assert_eq!(l.find_slot("b"), Some(16));
        assert_eq!(l.find_slot("c"), Some(24));
        assert_eq!(l.stack_size, 32);
    }

    #[test]
    fn test_frame_rounded_to_sixteen() {
        let l = layout_of("int main() { int a; return 0; }");
        assert_eq!(l.stack_size % 16, 0);
        assert_eq!(l.stack_size, 16);
    }

    #[test]
    fn test_struct_consumes_slots() {
        let l = layout_of(
            "struct P { int x; int y; }; int main() { struct P p; int after; return 0; }",
        );
        assert_eq!(l.find_slot("p"), Some(16));
        assert_eq!(l.find_slot("after"), Some(24));
        assert!(l.is_struct_var("p"));
    }

    #[test]
    fn test_array_consumes_len_slots() {
        let l = layout_of("int main() { int arr[4]; int after; return 0; }");
        assert_eq!(l.find_slot("arr"), Some(32));
        assert_eq!(l.find_slot("after"), Some(40));
        assert!(l.is_array("arr"));
    }

    #[test]
    fn test_nested_blocks_share_frame() {
        let l = layout_of("int main(int c) { if (c) { int x; } else { int y; } while (c) { int z; } return 0; }");
        assert!(l.find_slot("x").is_some());
        assert!(l.find_slot("y").is_some());
        assert!(l.find_slot("z").is_some());
    }

    #[test]
    fn test_for_init_and_switch_cases_walked() {
        let l = layout_of(
            "int main(int c) { for (int i = 0; i < c; i++) { int w; } \
             switch (c) { case 1: { int s; } } return 0; }",
        );
        assert!(l.find_slot("i").is_some());
        assert!(l.find_slot("w").is_some());
        assert!(l.find_slot("s").is_some());
    }

    #[test]
    fn test_duplicate_is_error() {
        let prog = Parser::new(tokenize("int main() { int a; int a; return 0; }").unwrap())
            .parse()
            .unwrap();
        let cg = CodeGen::new();
        assert!(cg.layout_func(prog.find_func("main").unwrap()).is_err());
    }

    #[test]
    fn test_char_tracking() {
        let l = layout_of("int main(char *p) { char buf[8]; char *q; return 0; }");
        assert!(l.is_char_ptr("p"));
        assert!(l.is_char_ptr("q"));
        assert!(l.is_char_array("buf"));
    }

    #[test]
    fn test_union_collapses() {
        let l = layout_of(
            "union U { int a; int b; int c; }; int main() { union U u; int after; return 0; }",
        );
        assert_eq!(l.find_slot("u"), Some(8));
        assert_eq!(l.find_slot("after"), Some(16));
    }
}
