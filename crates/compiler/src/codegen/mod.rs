//! Apple AArch64 assembly generation
//!
//! This module generates Apple-flavored ARM64 assembly text (`.s` files)
//! from a parsed `Program`. Generation is deterministic: the same AST
//! produces identical bytes.
//!
//! # Key Concepts
//!
//! ## Machine model
//!
//! Every scalar, pointer and struct field occupies one 8-byte slot; only
//! `char` data is byte-granular (`ldrb`/`strb`, stride 1). `x29` is the
//! frame pointer, `sp` stays 16-byte aligned, and `x0` is the accumulator
//! carrying every expression's value. Binary expressions spill the LHS to
//! the stack with 16-byte pushes.
//!
//! ## Frames
//!
//! A pre-codegen layout pass walks every declaration in the function
//! (nested blocks, `for` initializers, switch cases; all locals share one
//! frame) and assigns offsets below `x29`. Frame sizes round up to 16.
//!
//! ## Sections
//!
//! Code goes to `.text` with underscore-prefixed globals. Interned strings
//! go to `__TEXT,__cstring` under `l_.str_<n>` labels, at most one per
//! distinct decoded content. Initialized globals use `.data`/`.quad`;
//! uninitialized data uses `.comm` with 2^3 alignment. Relocations use
//! `@PAGE`/`@PAGEOFF`.
//!
//! ## Calls
//!
//! The first 8 arguments travel in `x0`..`x7`. Variadic callees instead
//! receive their variadic tail on caller-stacked 8-byte slots at `[sp, #0]`
//! (the Apple AArch64 convention); `__builtin_va_start` exposes them at
//! `x29 + 16`. Indirect calls load the target into `x8` and use `blr`.
//!
//! # Module Structure
//!
//! - `state.rs`: CodeGen struct, labels, string pool, registries
//! - `layout.rs`: stack frame layout pass
//! - `expr.rs`: expression lowering (`gen_addr`/`gen_value`)
//! - `statements.rs`: statement lowering, switch trampolines
//! - `program.rs`: program walk, prologue/epilogue
//! - `globals.rs`: string pool and data section emission
//! - `error.rs`: error types

mod error;
mod expr;
mod globals;
mod layout;
mod program;
mod state;
mod statements;

pub use error::CodeGenError;
pub use state::CodeGen;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;
    use crate::preprocessor::Preprocessor;

    fn gen(src: &str) -> String {
        let cleaned = Preprocessor::new().preprocess(src, None).unwrap();
        let toks = tokenize(&cleaned).unwrap();
        let prog = Parser::new(toks).parse().unwrap();
        CodeGen::new().generate(&prog).unwrap()
    }

    #[test]
    fn test_return_arithmetic() {
        let asm = gen("int main() { return 3 + 4 * 2; }");
        assert!(asm.contains("\t.globl\t_main"));
        assert!(asm.contains("_main:"));
        assert!(asm.contains("\tmov\tx0, #3"));
        assert!(asm.contains("\tmul\tx0, x1, x0"));
        assert!(asm.contains("\tadd\tx0, x1, x0"));
        assert!(asm.contains("\tret"));
    }

    #[test]
    fn test_generation_deterministic() {
        let src = "struct P { int x; int y; }; int g = 3; \
                   int main() { struct P p; p.x = g; return p.x; }";
        assert_eq!(gen(src), gen(src));
    }

    #[test]
    fn test_prologue_epilogue_shape() {
        let asm = gen("int main() { int a; a = 1; return a; }");
        assert!(asm.contains("\tstp\tx29, x30, [sp, #-16]!"));
        assert!(asm.contains("\tmov\tx29, sp"));
        assert!(asm.contains("\tsub\tsp, sp, #16"));
        assert!(asm.contains("\tmov\tw0, #0"));
        assert!(asm.contains("\tldp\tx29, x30, [sp], #16"));
    }

    // Every emitted frame adjustment is a multiple of 16
    #[test]
    fn test_stack_alignment() {
        let asm = gen(
            "int f(int a, int b, int c) { int d; int e; return a + b + c; } \
             int main() { int arr[3]; struct Q { int m; } q; return f(1, 2, 3); }",
        );
        for line in asm.lines() {
            if let Some(rest) = line.strip_prefix("\tsub\tsp, sp, #") {
                let n: i64 = rest.parse().unwrap();
                assert_eq!(n % 16, 0, "unaligned frame adjustment: {}", line);
            }
        }
    }

    #[test]
    fn test_global_scalar_in_data() {
        let asm = gen("int a = 5; int main() { return a; }");
        assert!(asm.contains("\t.data"));
        assert!(asm.contains("_a:"));
        assert!(asm.contains("\t.quad\t5"));
        assert!(asm.contains("\tadrp\tx0, _a@PAGE"));
        assert!(asm.contains("\tadd\tx0, x0, _a@PAGEOFF"));
    }

    #[test]
    fn test_uninitialized_global_comm() {
        let asm = gen("int g; int arr[4]; int main() { return 0; }");
        assert!(asm.contains("\t.comm\t_g, 8, 3"));
        assert!(asm.contains("\t.comm\t_arr, 32, 3"));
    }

    #[test]
    fn test_initialized_global_array() {
        let asm = gen("int t[3] = {7, 8, 9}; int main() { return t[1]; }");
        assert!(asm.contains("_t:"));
        assert!(asm.contains("\t.quad\t7"));
        assert!(asm.contains("\t.quad\t8"));
        assert!(asm.contains("\t.quad\t9"));
        assert!(!asm.contains("\t.comm\t_t"));
    }

    #[test]
    fn test_struct_field_access_offset() {
        let src = "struct P { int x; int y; }; \
                   int main() { struct P p; p.x = 7; p.y = 11; return p.x * p.y; }";
        let asm = gen(src);
        // p.y sits one slot above p.x
        assert!(asm.contains("\tadd\tx0, x0, #8"));
        assert!(asm.contains("\tmul\tx0, x1, x0"));
    }

    #[test]
    fn test_short_circuit_or_guards_call() {
        let asm = gen("int f() { return 99; } int main() { return 1 || f(); }");
        let call_sites = asm.matches("\tbl\t_f").count();
        assert_eq!(call_sites, 1);
        // The call is behind a conditional branch taken only when the LHS
        // is false
        let idx_branch = asm.find("\tb.eq\tL_sc_rhs").unwrap();
        let idx_call = asm.find("\tbl\t_f").unwrap();
        assert!(idx_branch < idx_call);
    }

    #[test]
    fn test_short_circuit_and() {
        let asm = gen("int main(int a, int b) { return a && b; }");
        assert!(asm.contains("\tb.ne\tL_sc_rhs"));
        assert!(asm.contains("\tcset\tx0, ne"));
    }

    #[test]
    fn test_preprocessor_conditional_pipeline() {
        let src = "#define N 2\n#if N==2\nint main(){return 42;}\n#else\nint main(){return 0;}\n#endif\n";
        let asm = gen(src);
        assert!(asm.contains("\tmov\tx0, #42"));
        assert!(!asm.contains("\tmov\tx0, #0\n\tb\tL_ret"));
    }

    #[test]
    fn test_string_interning() {
        let src = "int puts(char *s); int main() { puts(\"hi\"); puts(\"hi\"); puts(\"other\"); return 0; }";
        let asm = gen(src);
        assert_eq!(asm.matches(".asciz").count(), 2);
        assert!(asm.contains("l_.str_1:"));
        assert!(asm.contains("l_.str_2:"));
        assert!(!asm.contains("l_.str_3:"));
        assert!(asm.contains("\t.section\t__TEXT,__cstring,cstring_literals"));
    }

    #[test]
    fn test_string_escape_decoding() {
        let asm = gen("int puts(char *s); int main() { puts(\"a\\nb\"); return 0; }");
        assert!(asm.contains("\t.asciz\t\"a\\nb\""));
    }

    #[test]
    fn test_pointer_to_struct_arithmetic_scales() {
        let src = "struct P { int x; int y; } a[2]; \
                   int main() { struct P *p; p = &a[0]; p = p + 1; p->x = 9; return a[1].x; }";
        let asm = gen(src);
        // p + 1 multiplies by sizeof(struct P) = 16
        assert!(asm.contains("\tmov\tx9, #16"));
        assert!(asm.contains("\tmul\tx0, x0, x9"));
    }

    #[test]
    fn test_pointer_postinc_uses_struct_stride() {
        let src = "struct P { int x; int y; } a[2]; \
                   int main() { struct P *p; p = &a[0]; p++; return 0; }";
        let asm = gen(src);
        assert!(asm.contains("\tadd\tx0, x0, #16"));
    }

    #[test]
    fn test_struct_array_index_stride() {
        let src = "struct P { int x; int y; }; \
                   int main() { struct P a[2]; a[1].x = 5; return a[1].x; }";
        let asm = gen(src);
        assert!(asm.contains("\tmov\tx1, #16"));
        assert!(asm.contains("\tmul\tx0, x0, x1"));
    }

    #[test]
    fn test_plain_array_index_scales_by_eight() {
        let asm = gen("int main() { int a[4]; a[2] = 9; return a[2]; }");
        assert!(asm.contains("\tlsl\tx0, x0, #3"));
    }

    #[test]
    fn test_switch_trampolines_restore_sp() {
        let src = "int main(int x) { switch (x) { case 1: return 10; case 2: return 20; default: return 0; } }";
        let asm = gen(src);
        assert!(asm.contains("L_sw_tramp"));
        assert!(asm.contains("L_sw_def"));
        // Each trampoline pops the discriminant before entering the body
        let tramp_count = asm.matches("L_sw_tramp").count();
        assert!(tramp_count >= 4); // two targets + two label definitions
        assert!(asm.matches("\tadd\tsp, sp, #16").count() >= 3);
    }

    #[test]
    fn test_goto_labels_are_function_scoped() {
        let asm = gen("int main() { goto done; done: return 1; }");
        assert!(asm.contains("\tb\tL_usr_main_done"));
        assert!(asm.contains("L_usr_main_done:"));
    }

    #[test]
    fn test_break_continue_targets() {
        let src = "int main() { int i; for (i = 0; i < 10; i++) { if (i == 2) continue; if (i == 5) break; } return i; }";
        let asm = gen(src);
        assert!(asm.contains("\tb\tL_for_post"));
        assert!(asm.contains("\tb\tL_for_end"));
    }

    #[test]
    fn test_continue_inside_switch_targets_loop() {
        let src = "int main() { int i; int n; n = 0; \
                   for (i = 0; i < 4; i++) { switch (i) { case 1: continue; default: n++; } } return n; }";
        let asm = gen(src);
        // continue branches to the for post label, not a switch label
        let cont_branch = asm
            .lines()
            .filter(|l| l.starts_with("\tb\tL_for_post"))
            .count();
        assert!(cont_branch >= 1);
    }

    #[test]
    fn test_variadic_call_stacks_tail() {
        let src = "int printf(char *fmt, ...); int main() { printf(\"%d %d\", 3, 4); return 0; }";
        let asm = gen(src);
        assert!(asm.contains("\tstr\tx0, [sp, #0]"));
        assert!(asm.contains("\tstr\tx0, [sp, #8]"));
        assert!(asm.contains("\tbl\t_printf"));
        assert!(asm.contains("\tsxtw\tx0, w0"));
    }

    #[test]
    fn test_va_start_points_above_frame() {
        let src = "typedef char *va_list; void __builtin_va_start(va_list *ap); \
                   int first(int n, ...) { va_list ap; __builtin_va_start(&ap); return 0; }\
                   int main() { return first(1, 2); }";
        let asm = gen(src);
        assert!(asm.contains("\tadd\tx1, x29, #16"));
    }

    #[test]
    fn test_byte_intrinsics() {
        let src = "int main(char *buf) { __write_byte(buf, 0, 65); return __read_byte(buf, 0); }";
        let asm = gen(src);
        assert!(asm.contains("\tstrb\tw0, [x2, x1]"));
        assert!(asm.contains("\tldrb\tw0, [x1, x0]"));
    }

    #[test]
    fn test_char_pointer_loads_bytes() {
        let asm = gen("int main(char *p) { return p[1]; }");
        assert!(asm.contains("\tldrb\tw0, [x0]"));
        // Char indexing uses stride 1: no shift before the add
        assert!(!asm.contains("\tlsl\tx0, x0, #3"));
    }

    #[test]
    fn test_char_pointer_stores_bytes() {
        let asm = gen("int main(char *p) { p[0] = 65; return 0; }");
        assert!(asm.contains("\tstrb\tw0, [x1]"));
    }

    #[test]
    fn test_char_array_string_init() {
        let asm = gen("int main() { char s[] = \"ab\"; return s[0]; }");
        assert!(asm.contains("\tmov\tx1, #97"));
        assert!(asm.contains("\tstrb\tw1, [x0, #0]"));
        assert!(asm.contains("\tstrb\tw1, [x0, #2]")); // the NUL
    }

    #[test]
    fn test_union_global_size_is_max_member() {
        let src = "struct Big { int a; int b; int c; }; \
                   union U { struct Big big; int small; } u; \
                   int main() { return u.small; }";
        let asm = gen(src);
        assert!(asm.contains("\t.comm\t_u, 24, 3"));
    }

    #[test]
    fn test_bitfield_struct_size_and_offsets() {
        let src = "struct B { int a:3; int b:5; int c; } x; \
                   int main() { return x.c; }";
        let asm = gen(src);
        // Two packed words: bitfields share word 0, c flushes to word 1
        assert!(asm.contains("\t.comm\t_x, 16, 3"));
        assert!(asm.contains("\tadd\tx0, x0, #8"));
    }

    #[test]
    fn test_string_pointer_global() {
        let asm = gen("char *msg = \"hi\"; int main() { return 0; }");
        assert!(asm.contains("_msg:"));
        assert!(asm.contains("\t.quad\tl_.str_1"));
        assert!(asm.contains("\t.asciz\t\"hi\""));
    }

    #[test]
    fn test_wide_literal_movz_movk() {
        let asm = gen("int main() { return 100000; }");
        assert!(asm.contains("\tmovz\tx0, #34464"));
        assert!(asm.contains("\tmovk\tx0, #1, lsl #16"));
    }

    #[test]
    fn test_indirect_call_through_pointer_var() {
        let src = "int add1(int x) { return x + 1; } \
                   int main() { int (*fp)(int); fp = add1; return fp(4); }";
        let asm = gen(src);
        assert!(asm.contains("\tblr\tx8"));
        // Taking add1's address uses page relocation
        assert!(asm.contains("\tadrp\tx0, _add1@PAGE"));
    }

    #[test]
    fn test_ternary_branches() {
        let asm = gen("int main(int x) { return x ? 7 : 9; }");
        assert!(asm.contains("L_tern_else"));
        assert!(asm.contains("L_tern_end"));
    }

    #[test]
    fn test_call_sign_extends_int_returns() {
        let src = "void *malloc(long size); int getval(); \
                   int main() { void *p; p = malloc(8); return getval(); }";
        let asm = gen(src);
        // malloc returns a pointer: no sxtw right after its call
        let after_malloc = &asm[asm.find("\tbl\t_malloc").unwrap()..];
        assert!(!after_malloc.lines().nth(1).unwrap().contains("sxtw"));
        let after_getval = &asm[asm.find("\tbl\t_getval").unwrap()..];
        assert!(after_getval.lines().nth(1).unwrap().contains("sxtw"));
    }

    #[test]
    fn test_extern_not_emitted() {
        let asm = gen("extern int errno; int main() { return 0; }");
        assert!(!asm.contains("_errno:"));
        assert!(!asm.contains(".comm\t_errno"));
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let cleaned = Preprocessor::new()
            .preprocess("int main() { return nope; }", None)
            .unwrap();
        let prog = Parser::new(tokenize(&cleaned).unwrap()).parse().unwrap();
        let err = CodeGen::new().generate(&prog).unwrap_err();
        assert!(err.to_string().contains("unknown variable"));
    }

    #[test]
    fn test_struct_copy_init() {
        let src = "struct P { int x; int y; }; \
                   int main() { struct P a; a.x = 1; a.y = 2; struct P b = a; return b.y; }";
        let asm = gen(src);
        // Slot-by-slot copy through x9
        assert!(asm.contains("\tldr\tx9, [x1, #0]"));
        assert!(asm.contains("\tldr\tx9, [x1, #8]"));
    }

    #[test]
    fn test_designated_struct_init() {
        let src = "struct P { int x; int y; }; \
                   int main() { struct P p = { .y = 11, .x = 7 }; return p.y; }";
        let asm = gen(src);
        assert!(asm.contains("\tmov\tx0, #11"));
        assert!(asm.contains("\tmov\tx0, #7"));
    }

    #[test]
    fn test_do_while_shape() {
        let asm = gen("int main() { int i; i = 0; do { i++; } while (i < 3); return i; }");
        assert!(asm.contains("L_dowhile_start"));
        assert!(asm.contains("L_dowhile_cont"));
        assert!(asm.contains("\tb.ne\tL_dowhile_start"));
    }

    #[test]
    fn test_large_frame_via_scratch_register() {
        let asm = gen("int main() { int big[600]; return 0; }");
        assert!(asm.contains("\tmov\tx9, #4800"));
        assert!(asm.contains("\tsub\tsp, sp, x9"));
    }

    #[test]
    fn test_layout_overflow_errors() {
        // 70 arrays exceed the 64-array cap
        let mut body = String::new();
        for i in 0..70 {
            body.push_str(&format!("int arr{}[2]; ", i));
        }
        let src = format!("int main() {{ {} return 0; }}", body);
        let cleaned = Preprocessor::new().preprocess(&src, None).unwrap();
        let prog = Parser::new(tokenize(&cleaned).unwrap()).parse().unwrap();
        let err = CodeGen::new().generate(&prog).unwrap_err();
        assert!(err.to_string().contains("too many arrays"));
    }

    #[test]
    fn test_comma_discards_lhs() {
        let asm = gen("int main() { int x; x = (1, 2); return x; }");
        assert!(asm.contains("\tmov\tx0, #1"));
        assert!(asm.contains("\tmov\tx0, #2"));
    }
}
