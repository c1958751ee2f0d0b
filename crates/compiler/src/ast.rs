//! Abstract syntax tree for the compiled C subset
//!
//! The parser builds a `Program` from the token stream; the code generator
//! consumes it. Recursive struct types are expressed with the tag stored as a
//! name string and resolved by registry lookup, never with node pointers.

/// Sentinel struct tag stored when field-access resolution fails.
/// Codegen treats it with lenient defaults instead of aborting.
pub const UNKNOWN_STRUCT: &str = "__unknown_struct";

/// Sentinel call name for indirect calls through a non-identifier expression.
/// The function expression is prepended to the argument list.
pub const INDIRECT_CALL: &str = "__indirect_call";

// ============================================================================
//                               TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Char,
    Short,
    Int,
    Long,
    LLong,
    Float,
    Double,
    Ptr,
    Array,
    Struct,
    Union,
    Enum,
    Func,
}

/// Structural type description built during parsing.
///
/// Codegen largely ignores widths and treats every slot as 8 bytes; the type
/// is kept for field-offset resolution and the const evaluator's width table.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub kind: TypeKind,
    /// Pointed-to type (Ptr/Array) or return type (Func)
    pub base: Option<Box<Type>>,
    /// Tag name for Struct/Union
    pub struct_name: Option<String>,
    /// Element count for Array (-1 if unspecified)
    pub array_len: i64,
    pub is_unsigned: bool,
}

impl Type {
    fn scalar(kind: TypeKind) -> Type {
        Type {
            kind,
            base: None,
            struct_name: None,
            array_len: -1,
            is_unsigned: false,
        }
    }

    pub fn void() -> Type {
        Type::scalar(TypeKind::Void)
    }
    pub fn char_() -> Type {
        Type::scalar(TypeKind::Char)
    }
    pub fn short() -> Type {
        Type::scalar(TypeKind::Short)
    }
    pub fn int() -> Type {
        Type::scalar(TypeKind::Int)
    }
    pub fn long() -> Type {
        Type::scalar(TypeKind::Long)
    }
    pub fn llong() -> Type {
        Type::scalar(TypeKind::LLong)
    }
    pub fn float() -> Type {
        Type::scalar(TypeKind::Float)
    }
    pub fn double() -> Type {
        Type::scalar(TypeKind::Double)
    }
    pub fn enum_() -> Type {
        Type::scalar(TypeKind::Enum)
    }

    pub fn ptr(base: Type) -> Type {
        Type {
            kind: TypeKind::Ptr,
            base: Some(Box::new(base)),
            struct_name: None,
            array_len: -1,
            is_unsigned: false,
        }
    }

    pub fn struct_(name: &str) -> Type {
        Type {
            kind: TypeKind::Struct,
            base: None,
            struct_name: Some(name.to_string()),
            array_len: -1,
            is_unsigned: false,
        }
    }

    pub fn union_(name: &str) -> Type {
        Type {
            kind: TypeKind::Union,
            base: None,
            struct_name: Some(name.to_string()),
            array_len: -1,
            is_unsigned: false,
        }
    }

    pub fn unsigned(mut self) -> Type {
        self.is_unsigned = true;
        self
    }

    /// Natural width in bytes, used by the const-expression evaluator.
    /// Struct/union widths need the registry and are resolved by the parser.
    pub fn size(&self) -> i64 {
        match self.kind {
            TypeKind::Char => 1,
            TypeKind::Short => 2,
            TypeKind::Int | TypeKind::Float | TypeKind::Enum => 4,
            _ => 8,
        }
    }
}

// ============================================================================
//                             EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(i64),
    Var(String),
    /// Raw lexeme with escape sequences still intact; decoding happens in
    /// codegen when the literal is interned.
    StrLit(String),
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Unary {
        op: char,
        rhs: Box<Expr>,
    },
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        obj: Box<Expr>,
        field: String,
        /// Resolved struct tag; `UNKNOWN_STRUCT` when resolution failed
        struct_type: String,
    },
    Arrow {
        obj: Box<Expr>,
        field: String,
        struct_type: String,
    },
    Assign {
        target: Box<Expr>,
        rhs: Box<Expr>,
    },
    PostInc(Box<Expr>),
    PostDec(Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    InitList {
        elems: Vec<Expr>,
        /// Per-element designator index (-1 = positional); None when the list
        /// had no designators at all
        desig_indices: Option<Vec<i64>>,
    },
    CompoundLit {
        struct_type: String,
        init: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: &str, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op: op.to_string(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn assign(target: Expr, rhs: Expr) -> Expr {
        Expr::Assign {
            target: Box::new(target),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: char, rhs: Expr) -> Expr {
        Expr::Unary {
            op,
            rhs: Box::new(rhs),
        }
    }
}

// ============================================================================
//                              STATEMENTS
// ============================================================================

/// Ordered statement sequence. Carries no scope semantics of its own: all
/// locals in a function share one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn single(stmt: Stmt) -> Block {
        Block { stmts: vec![stmt] }
    }
}

/// A single declarator within a declaration statement.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclEntry {
    pub name: String,
    /// Struct/union tag when the base type is a struct (also set for
    /// pointer-to-struct; combine with `ptr_depth`)
    pub struct_type: Option<String>,
    /// -1 = scalar, >= 0 = array element count (0 = infer/flexible)
    pub array_len: i64,
    /// Inner dimension for 2-D arrays, -1 if one-dimensional
    pub inner_dim2: i64,
    pub ptr_depth: u32,
    pub init: Option<Expr>,
    pub is_static: bool,
    pub is_unsigned: bool,
    pub is_char: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// Evaluated case value; None for `default:`
    pub value: Option<i64>,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Return(Expr),
    If {
        cond: Expr,
        then_blk: Block,
        else_blk: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    DoWhile {
        cond: Expr,
        body: Block,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Expr>,
        body: Block,
    },
    Switch {
        cond: Expr,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Goto(String),
    Label {
        name: String,
        stmt: Box<Stmt>,
    },
    Expr(Expr),
    VarDecl(Vec<VarDeclEntry>),
}

// ============================================================================
//                              TOP LEVEL
// ============================================================================

/// A struct or union definition with per-field layout metadata.
///
/// For a bitfield-free struct `nwords == 0` and each field occupies one
/// 8-byte slot (or `field_array_lens[i]` slots, or the recursive slot count
/// of an embedded struct). When bitfields are present, `nwords` is the packed
/// word count and `word_indices` maps each field to its containing word.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<String>,
    /// Embedded struct tag per field (None for non-struct fields)
    pub field_types: Vec<Option<String>>,
    /// Pointed-to struct tag per field (None unless pointer-to-struct)
    pub field_ptr_types: Vec<Option<String>>,
    /// -1 = scalar field, >= 0 = array element count
    pub field_array_lens: Vec<i64>,
    /// 0 = regular field, > 0 = bitfield width
    pub bit_widths: Vec<u32>,
    /// Bit offset within the containing word (bitfields only)
    pub bit_offsets: Vec<u32>,
    /// Containing 8-byte word index per field (bitfield structs only)
    pub word_indices: Vec<usize>,
    /// Packed word count; 0 when the struct has no bitfields
    pub nwords: usize,
    pub is_union: bool,
}

impl StructDef {
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    pub fn has_bitfields(&self) -> bool {
        self.nwords > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub struct_type: Option<String>,
    pub ptr_depth: u32,
    pub is_char: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Block,
    pub is_static: bool,
    pub ret_is_ptr: bool,
    pub is_variadic: bool,
    /// Struct tag when the return type is pointer-to-struct
    pub ret_struct_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncProto {
    pub name: String,
    pub ret_is_ptr: bool,
    pub is_variadic: bool,
    pub nparams: usize,
    pub ret_struct_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDecl {
    pub name: String,
    pub struct_type: Option<String>,
    pub ptr_depth: u32,
    /// -1 if not an array
    pub array_len: i64,
    pub init: Option<Expr>,
    pub is_extern: bool,
    pub is_static: bool,
    /// extern declaration that turned out to be a function prototype
    pub is_func_decl: bool,
    pub is_char: bool,
}

impl GlobalDecl {
    /// A non-pointer, non-array struct variable
    pub fn is_struct_var(&self) -> bool {
        self.struct_type.is_some() && self.ptr_depth == 0 && self.array_len < 0
    }
}

/// The complete translation unit. Mutable while parsing, frozen before
/// code generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub structs: Vec<StructDef>,
    pub funcs: Vec<FuncDef>,
    pub globals: Vec<GlobalDecl>,
    pub protos: Vec<FuncProto>,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn find_func(&self, name: &str) -> Option<&FuncDef> {
        self.funcs.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_widths() {
        assert_eq!(Type::char_().size(), 1);
        assert_eq!(Type::short().size(), 2);
        assert_eq!(Type::int().size(), 4);
        assert_eq!(Type::long().size(), 8);
        assert_eq!(Type::ptr(Type::char_()).size(), 8);
        assert_eq!(Type::int().unsigned().size(), 4);
    }

    #[test]
    fn test_struct_field_index() {
        let sd = StructDef {
            name: "P".to_string(),
            fields: vec!["x".to_string(), "y".to_string()],
            field_types: vec![None, None],
            field_ptr_types: vec![None, None],
            field_array_lens: vec![-1, -1],
            bit_widths: vec![0, 0],
            bit_offsets: vec![0, 0],
            word_indices: vec![0, 0],
            nwords: 0,
            is_union: false,
        };
        assert_eq!(sd.field_index("y"), Some(1));
        assert_eq!(sd.field_index("z"), None);
        assert!(!sd.has_bitfields());
    }
}
