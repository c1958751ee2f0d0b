//! Single-pass parser for the C subset
//!
//! Builds a typed `Program` from the token stream while maintaining the
//! struct, typedef, enum and global registries the back-end needs. Lookahead
//! is bounded; backtracking happens only at the documented ambiguities
//! (cast vs parenthesized expression, function vs global variable).
//!
//! Every `.`/`->` postfix is resolved to a struct tag at parse time using, in
//! order: the local table, the global table, the previous field's struct
//! type, the previous call's return struct type, and the most recent cast.
//! When all of those fail the `__unknown_struct` sentinel is stored and the
//! code generator falls back to lenient defaults.

use crate::ast::{
    Block, Expr, FuncDef, FuncProto, GlobalDecl, Param, Program, Stmt, StructDef, SwitchCase, Type,
    VarDeclEntry, INDIRECT_CALL, UNKNOWN_STRUCT,
};
use crate::lexer::{tokkind_str, TokKind, Token};
use tracing::debug;

#[derive(Debug, Clone)]
struct TypedefEntry {
    name: String,
    /// Resolved struct tag, None for int-like aliases
    struct_type: Option<String>,
    is_char: bool,
}

#[derive(Debug, Clone)]
struct LocalVar {
    name: String,
    struct_type: Option<String>,
    ptr_depth: u32,
    array_len: i64,
}

#[derive(Debug, Clone)]
struct GlobalVarInfo {
    name: String,
    struct_type: Option<String>,
    ptr_depth: u32,
    array_len: i64,
}

/// One declarator inside a struct/union body.
#[derive(Debug, Clone)]
struct FieldRec {
    name: String,
    struct_type: Option<String>,
    ptr_depth: u32,
    bit_width: u32,
    array_len: i64,
}

enum TopDecl {
    Func(FuncDef),
    Proto(FuncProto),
}

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
    /// Unified struct/union registry; becomes `Program::structs`
    structs: Vec<StructDef>,
    typedefs: Vec<TypedefEntry>,
    enum_consts: Vec<(String, i64)>,
    global_vars: Vec<GlobalVarInfo>,
    /// name -> return struct tag for pointer-to-struct returning functions
    func_ret_infos: Vec<(String, Option<String>)>,
    /// Per-function scratch table, cleared at each function
    local_vars: Vec<LocalVar>,
    /// Struct type of the most recent pointer cast, for `((T*)0)->f`
    last_cast_struct_type: Option<String>,
    /// Flags set by the most recent parse_base_type call
    last_type_unsigned: bool,
    last_type_is_char: bool,
    last_type: Type,
    anon_counter: usize,
    /// Tracks unclosed `{` from Duff's-device patterns inside switch
    in_switch_depth: usize,
}

impl Parser {
    pub fn new(toks: Vec<Token>) -> Parser {
        Parser {
            toks,
            pos: 0,
            structs: Vec::new(),
            typedefs: Vec::new(),
            enum_consts: Vec::new(),
            global_vars: Vec::new(),
            func_ret_infos: Vec::new(),
            local_vars: Vec::new(),
            last_cast_struct_type: None,
            last_type_unsigned: false,
            last_type_is_char: false,
            last_type: Type::int(),
            anon_counter: 0,
            in_switch_depth: 0,
        }
    }

    // ---- Token helpers ----

    fn cur(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn peek(&self, n: usize) -> Option<&Token> {
        self.toks.get(self.pos + n)
    }

    fn at_end(&self) -> bool {
        self.cur().kind == TokKind::Eof
    }

    fn check(&self, kind: TokKind, value: &str) -> bool {
        let t = self.cur();
        t.kind == kind && t.text == value
    }

    fn check_kind(&self, kind: TokKind) -> bool {
        self.cur().kind == kind
    }

    fn check_op(&self, value: &str) -> bool {
        self.check(TokKind::Op, value)
    }

    fn check_kw(&self, value: &str) -> bool {
        self.check(TokKind::Keyword, value)
    }

    /// Advance unconditionally, returning the consumed token.
    fn advance(&mut self) -> Token {
        let t = self.cur().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn context_dump(&self) -> String {
        let lo = self.pos.saturating_sub(5);
        let hi = (self.pos + 5).min(self.toks.len());
        let mut out = String::from("context:");
        for d in lo..hi {
            let t = &self.toks[d];
            out.push_str(&format!(
                " {}{}:'{}'",
                if d == self.pos { ">>>" } else { "" },
                tokkind_str(t.kind),
                t.text
            ));
        }
        out
    }

    fn eat(&mut self, kind: TokKind, value: Option<&str>) -> Result<Token, String> {
        let t = self.cur().clone();
        if t.kind != kind {
            return Err(format!(
                "parser: expected {}, got {} '{}' at byte {} ({})",
                tokkind_str(kind),
                tokkind_str(t.kind),
                t.text,
                t.pos,
                self.context_dump()
            ));
        }
        if let Some(v) = value {
            if t.text != v {
                return Err(format!(
                    "parser: expected '{}', got '{}' at byte {} ({})",
                    v,
                    t.text,
                    t.pos,
                    self.context_dump()
                ));
            }
        }
        self.advance();
        Ok(t)
    }

    fn eat_op(&mut self, value: &str) -> Result<(), String> {
        self.eat(TokKind::Op, Some(value)).map(|_| ())
    }

    fn eat_kw(&mut self, value: &str) -> Result<(), String> {
        self.eat(TokKind::Keyword, Some(value)).map(|_| ())
    }

    // ---- Registry helpers ----

    fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    fn find_local(&self, name: &str) -> Option<&LocalVar> {
        self.local_vars.iter().find(|l| l.name == name)
    }

    fn find_typedef(&self, name: &str) -> Option<&TypedefEntry> {
        self.typedefs.iter().find(|t| t.name == name)
    }

    fn find_enum_const(&self, name: &str) -> Option<i64> {
        self.enum_consts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    fn find_global_var(&self, name: &str) -> Option<&GlobalVarInfo> {
        self.global_vars.iter().find(|g| g.name == name)
    }

    fn find_func_ret_struct(&self, name: &str) -> Option<String> {
        self.func_ret_infos
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, s)| s.clone())
    }

    fn add_func_ret_info(&mut self, name: &str, ret_struct_type: Option<&str>) {
        for (n, s) in self.func_ret_infos.iter_mut() {
            if n == name {
                if s.is_none() {
                    *s = ret_struct_type.map(|t| t.to_string());
                }
                return;
            }
        }
        self.func_ret_infos
            .push((name.to_string(), ret_struct_type.map(|t| t.to_string())));
    }

    fn add_local(&mut self, name: &str, struct_type: Option<&str>, ptr_depth: u32, array_len: i64) {
        self.local_vars.push(LocalVar {
            name: name.to_string(),
            struct_type: struct_type.map(|s| s.to_string()),
            ptr_depth,
            array_len,
        });
    }

    fn add_typedef(&mut self, name: &str, struct_type: Option<&str>, is_char: bool) {
        self.typedefs.push(TypedefEntry {
            name: name.to_string(),
            struct_type: struct_type.map(|s| s.to_string()),
            is_char,
        });
    }

    fn add_global_var_info(&mut self, name: &str, struct_type: &str, ptr_depth: u32, array_len: i64) {
        self.global_vars.push(GlobalVarInfo {
            name: name.to_string(),
            struct_type: Some(struct_type.to_string()),
            ptr_depth,
            array_len,
        });
    }

    /// Declared type facts for `sizeof(expr)` resolution: struct tag,
    /// pointer depth and array length, from the local then global tables.
    fn sizeof_var_info(&self, name: &str) -> Option<(Option<String>, u32, i64)> {
        if let Some(l) = self.find_local(name) {
            return Some((l.struct_type.clone(), l.ptr_depth, l.array_len));
        }
        self.find_global_var(name)
            .map(|g| (g.struct_type.clone(), g.ptr_depth, g.array_len))
    }

    /// Recursive 8-byte slot count for a struct type. Unknown structs count
    /// as one slot; unions collapse to their widest member.
    pub(crate) fn struct_nslots(&self, name: &str) -> i64 {
        let sd = match self.find_struct(name) {
            Some(sd) => sd,
            None => return 1,
        };
        if sd.nwords > 0 {
            return sd.nwords as i64;
        }
        let mut total: i64 = 0;
        let mut max_field: i64 = 0;
        for i in 0..sd.fields.len() {
            let field_slots = match (&sd.field_types[i], sd.field_array_lens[i]) {
                (Some(sub), len) if len > 0 => self.struct_nslots(sub) * len,
                (Some(sub), _) => self.struct_nslots(sub),
                (None, len) if len > 0 => len,
                _ => 1,
            };
            if sd.is_union {
                max_field = max_field.max(field_slots);
            } else {
                total += field_slots;
            }
        }
        if sd.is_union {
            max_field.max(1)
        } else {
            total.max(1)
        }
    }

    /// Struct type of a field, for resolving chained member access.
    /// Lenient: unknown struct or field yields None.
    fn field_struct_type(&self, struct_name: &str, field_name: &str) -> Option<String> {
        let sd = self.find_struct(struct_name)?;
        let idx = sd.field_index(field_name)?;
        sd.field_types[idx]
            .clone()
            .or_else(|| sd.field_ptr_types[idx].clone())
    }

    // ---- Number conversion ----

    fn number_value(text: &str) -> i64 {
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).unwrap_or(0) as i64
        } else {
            text.parse::<u64>().unwrap_or(0) as i64
        }
    }

    // ---- Type parsing ----

    fn skip_qualifiers(&mut self) {
        while self.check_kw("const") || self.check_kw("volatile") || self.check_kw("register") {
            self.advance();
        }
    }

    fn is_type_start(&self) -> bool {
        const TYPE_KWS: &[&str] = &[
            "int", "char", "void", "unsigned", "signed", "long", "short", "struct", "union",
            "enum", "const", "volatile", "register", "static", "extern", "typedef", "_Bool",
            "bool", "inline", "float", "double",
        ];
        if self.cur().kind == TokKind::Keyword && TYPE_KWS.contains(&self.cur().text.as_str()) {
            return true;
        }
        self.cur().kind == TokKind::Ident && self.find_typedef(&self.cur().text).is_some()
    }

    /// Whether the current token can begin a declaration statement.
    fn starts_type(&self) -> bool {
        const TYPE_KWS: &[&str] = &[
            "int", "char", "void", "unsigned", "signed", "long", "short", "struct", "union",
            "const", "volatile", "register", "static", "enum", "_Bool", "bool", "float", "double",
        ];
        if self.cur().kind == TokKind::Keyword && TYPE_KWS.contains(&self.cur().text.as_str()) {
            return true;
        }
        self.cur().kind == TokKind::Ident && self.find_typedef(&self.cur().text).is_some()
    }

    /// Is the cursor at a function-pointer declarator `(*name)(...)`?
    fn is_funcptr_decl(&self) -> bool {
        self.check_op("(")
            && self
                .peek(1)
                .map(|t| t.kind == TokKind::Op && t.text == "*")
                .unwrap_or(false)
    }

    fn skip_param_list(&mut self) -> Result<(), String> {
        self.eat_op("(")?;
        let mut depth = 1;
        while depth > 0 {
            if self.at_end() {
                return Err(format!(
                    "parser: unexpected end of input in parameter list ({})",
                    self.context_dump()
                ));
            }
            if self.check_op("(") {
                depth += 1;
            } else if self.check_op(")") {
                depth -= 1;
            }
            if depth > 0 {
                self.advance();
            }
        }
        self.eat_op(")")
    }

    fn synth_anon_name(&mut self) -> String {
        let name = format!("__anon_{}", self.anon_counter);
        self.anon_counter += 1;
        name
    }

    /// Parse the base type at the cursor. Returns the struct/union tag name,
    /// or None for int-like types. Sets `last_type`, `last_type_unsigned` and
    /// `last_type_is_char` as side effects.
    fn parse_base_type(&mut self) -> Result<Option<String>, String> {
        self.skip_qualifiers();

        if self.check_kw("struct") || self.check_kw("union") {
            let is_union = self.check_kw("union");
            self.advance();

            if self.check_op("{") {
                // Anonymous inline struct used directly as a type
                let synth = self.synth_anon_name();
                self.eat_op("{")?;
                let fields = self.parse_field_list()?;
                self.eat_op("}")?;
                self.register_struct(&synth, fields, is_union);
                self.last_type = if is_union {
                    Type::union_(&synth)
                } else {
                    Type::struct_(&synth)
                };
                return Ok(Some(synth));
            }

            let name = self.eat(TokKind::Ident, None)?.text;
            // Named inline definition used as a field or variable type
            if self.check_op("{") {
                self.eat_op("{")?;
                let fields = self.parse_field_list()?;
                self.eat_op("}")?;
                self.register_struct(&name, fields, is_union);
            }
            self.last_type = if is_union {
                Type::union_(&name)
            } else {
                Type::struct_(&name)
            };
            return Ok(Some(name));
        }

        if self.check_kw("enum") {
            self.eat_kw("enum")?;
            if self.check_kind(TokKind::Ident) {
                self.advance();
            }
            self.last_type = Type::enum_();
            return Ok(None);
        }

        // Multi-keyword integer combinations: unsigned long long int, etc.
        self.last_type_unsigned = false;
        self.last_type_is_char = false;
        let mut got_type = false;
        let mut has_char = false;
        let mut has_short = false;
        let mut has_void = false;
        let mut has_float = false;
        let mut has_double = false;
        let mut has_signed = false;
        let mut long_count = 0;
        loop {
            let kw = if self.cur().kind == TokKind::Keyword {
                self.cur().text.clone()
            } else {
                String::new()
            };
            match kw.as_str() {
                "unsigned" => self.last_type_unsigned = true,
                "signed" => has_signed = true,
                "char" => {
                    has_char = true;
                    self.last_type_is_char = true;
                }
                "short" => has_short = true,
                "long" => long_count += 1,
                "void" => has_void = true,
                "float" => has_float = true,
                "double" => has_double = true,
                "int" | "_Bool" | "bool" => {}
                _ => break,
            }
            self.advance();
            got_type = true;
        }
        if got_type {
            self.skip_qualifiers();
            // signed char keeps sign on load by staying int-sized
            if has_char && has_signed && !self.last_type_unsigned {
                self.last_type_is_char = false;
            }
            let base = if has_void {
                Type::void()
            } else if has_float {
                Type::float()
            } else if has_double {
                Type::double()
            } else if has_char {
                Type::char_()
            } else if has_short {
                Type::short()
            } else if long_count >= 2 {
                Type::llong()
            } else if long_count == 1 {
                Type::long()
            } else {
                Type::int()
            };
            self.last_type = if self.last_type_unsigned {
                base.unsigned()
            } else {
                base
            };
            return Ok(None);
        }

        // Typedef name
        if self.cur().kind == TokKind::Ident {
            if let Some(td) = self.find_typedef(&self.cur().text).cloned() {
                self.advance();
                self.skip_qualifiers();
                if let Some(st) = td.struct_type {
                    self.last_type = Type::struct_(&st);
                    return Ok(Some(st));
                }
                if td.is_char {
                    self.last_type_is_char = true;
                }
                self.last_type = Type::int();
                return Ok(None);
            }
        }

        Err(format!(
            "parser: expected type, got '{}' at byte {} ({})",
            self.cur().text,
            self.cur().pos,
            self.context_dump()
        ))
    }

    // ---- Struct/union definitions ----

    /// Parse the field declarations between the braces of a struct/union
    /// body (cursor just past `{`, stops at `}`).
    fn parse_field_list(&mut self) -> Result<Vec<FieldRec>, String> {
        let mut fields = Vec::new();
        while !self.check_op("}") {
            if self.at_end() {
                return Err(format!(
                    "parser: unexpected end of input in struct body ({})",
                    self.context_dump()
                ));
            }
            self.parse_field_line(&mut fields)?;
        }
        Ok(fields)
    }

    fn parse_field_line(&mut self, fields: &mut Vec<FieldRec>) -> Result<(), String> {
        let ftype = self.parse_base_type()?;
        let mut is_funcptr = false;
        let mut base_ptr: u32 = 0;

        // Function pointer field: type (*name)(params)
        if self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            base_ptr = 1;
            is_funcptr = true;
        }
        while self.check_op("*") {
            self.advance();
            self.skip_qualifiers();
            base_ptr += 1;
        }
        // type *(*name)(params)
        if !is_funcptr && self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            base_ptr += 1;
            is_funcptr = true;
        }

        // Nested funcptr like void (*(*f)(a,b))(void): recorded opaquely
        if is_funcptr && self.is_funcptr_decl() {
            while !self.check_op(";") && !self.at_end() {
                self.advance();
            }
            self.eat_op(";")?;
            fields.push(FieldRec {
                name: "__nested_fptr".to_string(),
                struct_type: ftype,
                ptr_depth: 1,
                bit_width: 0,
                array_len: -1,
            });
            return Ok(());
        }
        // Other complex declarators starting with '(' but not '(*'
        if !is_funcptr && self.check_op("(") {
            while !self.check_op(";") && !self.at_end() {
                self.advance();
            }
            self.eat_op(";")?;
            fields.push(FieldRec {
                name: "__complex_fptr".to_string(),
                struct_type: ftype,
                ptr_depth: 1,
                bit_width: 0,
                array_len: -1,
            });
            return Ok(());
        }

        // Multiple declarators: int *a, b, c;
        loop {
            let mut decl_ptr = base_ptr;
            if !is_funcptr {
                while self.check_op("*") {
                    self.advance();
                    self.skip_qualifiers();
                    decl_ptr += 1;
                }
            }
            self.skip_qualifiers();
            let fname = self.eat(TokKind::Ident, None)?.text;
            if is_funcptr {
                self.eat_op(")")?;
                self.skip_param_list()?;
            }

            let mut array_len: i64 = -1;
            if self.check_op("[") {
                self.eat_op("[")?;
                if self.check_op("]") {
                    array_len = 0; // flexible array member
                    self.eat_op("]")?;
                } else {
                    array_len = self.parse_const_expr()?;
                    self.eat_op("]")?;
                }
                // Further dimensions flatten into one length
                while self.check_op("[") {
                    self.eat_op("[")?;
                    let dim2 = self.parse_const_expr()?;
                    self.eat_op("]")?;
                    if array_len > 0 && dim2 > 0 {
                        array_len *= dim2;
                    }
                }
            }

            let mut bit_width: u32 = 0;
            if self.check_op(":") {
                self.eat_op(":")?;
                bit_width = self.parse_const_expr()? as u32;
            }

            fields.push(FieldRec {
                name: fname,
                struct_type: ftype.clone(),
                ptr_depth: decl_ptr,
                bit_width,
                array_len,
            });

            if self.check_op(",") {
                self.eat_op(",")?;
                is_funcptr = false;
                continue;
            }
            break;
        }
        self.eat_op(";")
    }

    /// Build a `StructDef` from parsed fields, computing bitfield packing,
    /// and register it. A tag seen again (a rewound re-parse of the same
    /// definition) replaces the earlier entry.
    fn register_struct(&mut self, name: &str, fields: Vec<FieldRec>, is_union: bool) {
        let n = fields.len();
        let mut sd = StructDef {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.name.clone()).collect(),
            field_types: fields
                .iter()
                .map(|f| {
                    if f.ptr_depth == 0 {
                        f.struct_type.clone()
                    } else {
                        None
                    }
                })
                .collect(),
            field_ptr_types: fields
                .iter()
                .map(|f| {
                    if f.ptr_depth == 1 {
                        f.struct_type.clone()
                    } else {
                        None
                    }
                })
                .collect(),
            field_array_lens: fields.iter().map(|f| f.array_len).collect(),
            bit_widths: fields.iter().map(|f| f.bit_width).collect(),
            bit_offsets: vec![0; n],
            word_indices: vec![0; n],
            nwords: 0,
            is_union,
        };

        if fields.iter().any(|f| f.bit_width > 0) {
            // Bitfield packing: consecutive bitfields share a word until it
            // would overflow; a regular field flushes the partial word.
            let mut cur_word = 0usize;
            let mut cur_bit = 0u32;
            for (i, f) in fields.iter().enumerate() {
                if f.bit_width > 0 {
                    if cur_bit + f.bit_width > 64 {
                        cur_word += 1;
                        cur_bit = 0;
                    }
                    sd.bit_offsets[i] = cur_bit;
                    sd.word_indices[i] = cur_word;
                    cur_bit += f.bit_width;
                } else {
                    if cur_bit > 0 {
                        cur_word += 1;
                        cur_bit = 0;
                    }
                    sd.word_indices[i] = cur_word;
                    cur_word += 1;
                }
            }
            if cur_bit > 0 {
                cur_word += 1;
            }
            sd.nwords = cur_word;
        }

        if let Some(existing) = self.structs.iter_mut().find(|s| s.name == name) {
            *existing = sd;
        } else {
            self.structs.push(sd);
        }
    }

    // ---- Constant expressions ----

    pub(crate) fn parse_const_expr(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_xor()?;
        while self.check_op("|") {
            self.advance();
            val |= self.parse_const_xor()?;
        }
        Ok(val)
    }

    fn parse_const_xor(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_and()?;
        while self.check_op("^") {
            self.advance();
            val ^= self.parse_const_and()?;
        }
        Ok(val)
    }

    fn parse_const_and(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_shift()?;
        while self.check_op("&") {
            self.advance();
            val &= self.parse_const_shift()?;
        }
        Ok(val)
    }

    fn parse_const_shift(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_add()?;
        loop {
            if self.check_op("<<") {
                self.advance();
                val = val.wrapping_shl(self.parse_const_add()? as u32);
            } else if self.check_op(">>") {
                self.advance();
                val = val.wrapping_shr(self.parse_const_add()? as u32);
            } else {
                return Ok(val);
            }
        }
    }

    fn parse_const_add(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_mul()?;
        loop {
            if self.check_op("+") {
                self.advance();
                val = val.wrapping_add(self.parse_const_mul()?);
            } else if self.check_op("-") {
                self.advance();
                val = val.wrapping_sub(self.parse_const_mul()?);
            } else {
                return Ok(val);
            }
        }
    }

    fn parse_const_mul(&mut self) -> Result<i64, String> {
        let mut val = self.parse_const_unary()?;
        loop {
            if self.check_op("*") {
                self.advance();
                val = val.wrapping_mul(self.parse_const_unary()?);
            } else if self.check_op("/") {
                self.advance();
                let rhs = self.parse_const_unary()?;
                if rhs == 0 {
                    return Err("parser: division by zero in constant expression".to_string());
                }
                val /= rhs;
            } else if self.check_op("%") {
                self.advance();
                let rhs = self.parse_const_unary()?;
                if rhs == 0 {
                    return Err("parser: division by zero in constant expression".to_string());
                }
                val %= rhs;
            } else {
                return Ok(val);
            }
        }
    }

    fn parse_const_unary(&mut self) -> Result<i64, String> {
        if self.check_op("-") {
            self.advance();
            return Ok(-self.parse_const_unary()?);
        }
        if self.check_op("~") {
            self.advance();
            return Ok(!self.parse_const_unary()?);
        }
        if self.check_op("!") {
            self.advance();
            return Ok((self.parse_const_unary()? == 0) as i64);
        }
        // &((T*)0)->member: the offsetof pattern evaluates to 0.
        // The field offset is deliberately not computed.
        if self.check_op("&") {
            self.advance();
            if self.check_op("(") {
                self.eat_op("(")?;
                let mut depth = 1;
                while depth > 0 {
                    if self.at_end() {
                        return Err(
                            "parser: unexpected end of input in constant expression".to_string()
                        );
                    }
                    if self.check_op("(") {
                        depth += 1;
                    } else if self.check_op(")") {
                        depth -= 1;
                    }
                    if depth > 0 {
                        self.advance();
                    }
                }
                self.eat_op(")")?;
            } else {
                self.advance();
            }
            while self.check_op("->") || self.check_op(".") {
                self.advance();
                if self.check_kind(TokKind::Ident) {
                    self.advance();
                }
            }
            return Ok(0);
        }
        self.parse_const_primary()
    }

    fn parse_const_primary(&mut self) -> Result<i64, String> {
        if self.check_op("(") {
            // A cast in a constant expression is skipped
            let saved = self.pos;
            self.eat_op("(")?;
            self.skip_qualifiers();
            if self.is_type_start() {
                self.parse_base_type()?;
                while self.check_op("*") {
                    self.advance();
                    self.skip_qualifiers();
                }
                if self.check_op(")") {
                    self.eat_op(")")?;
                    return self.parse_const_unary();
                }
            }
            self.pos = saved;
            self.eat_op("(")?;
            let val = self.parse_const_expr()?;
            self.eat_op(")")?;
            return Ok(val);
        }
        if self.check_kind(TokKind::Number) {
            let t = self.advance();
            return Ok(Self::number_value(&t.text));
        }
        if self.check_kw("sizeof") {
            return self.parse_const_sizeof();
        }
        if self.check_kind(TokKind::Ident) {
            let name = self.advance().text;
            if let Some(v) = self.find_enum_const(&name) {
                return Ok(v);
            }
            return Err(format!("parser: unknown enum constant '{}'", name));
        }
        Err(format!(
            "parser: expected constant expression at byte {} ({})",
            self.cur().pos,
            self.context_dump()
        ))
    }

    fn parse_const_sizeof(&mut self) -> Result<i64, String> {
        self.eat_kw("sizeof")?;
        self.eat_op("(")?;
        self.skip_qualifiers();
        let sz;
        if self.is_type_start() {
            let stype = self.parse_base_type()?;
            let mut nstars = 0;
            while self.check_op("*") {
                self.advance();
                nstars += 1;
            }
            if nstars > 0 {
                sz = 8;
            } else if let Some(st) = stype {
                sz = if self.find_struct(&st).is_some() {
                    self.struct_nslots(&st) * 8
                } else {
                    8
                };
            } else {
                // The const evaluator knows real scalar widths
                sz = self.last_type.size();
            }
        } else {
            // sizeof(expr): skip the expression, assume 8
            let mut depth = 1;
            while depth > 0 {
                if self.at_end() {
                    return Err("parser: unexpected end of input in sizeof".to_string());
                }
                if self.check_op("(") {
                    depth += 1;
                } else if self.check_op(")") {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                self.advance();
            }
            self.eat_op(")")?;
            return Ok(8);
        }
        self.eat_op(")")?;
        Ok(sz)
    }

    // ---- Enum definitions ----

    fn parse_enum_def(&mut self) -> Result<(), String> {
        self.eat_kw("enum")?;
        if self.check_kind(TokKind::Ident) {
            self.advance();
        }
        self.eat_op("{")?;
        let mut value: i64 = 0;
        while !self.check_op("}") {
            if self.at_end() {
                return Err("parser: unexpected end of input in enum".to_string());
            }
            let name = self.eat(TokKind::Ident, None)?.text;
            if self.check_op("=") {
                self.eat_op("=")?;
                value = self.parse_const_expr()?;
            }
            self.enum_consts.push((name, value));
            value += 1;
            if self.check_op(",") {
                self.eat_op(",")?;
            }
        }
        self.eat_op("}")?;
        self.eat_op(";")
    }

    // ---- Initializers ----

    /// Brace initializer list, positional and/or designated.
    fn parse_init_list(&mut self, struct_type: Option<&str>) -> Result<Expr, String> {
        self.eat_op("{")?;
        let mut elems = Vec::new();
        let mut desig = Vec::new();
        let mut has_desig = false;

        while !self.check_op("}") {
            if self.at_end() {
                return Err("parser: unexpected end of input in initializer".to_string());
            }
            let mut di: i64 = -1;
            if self.check_op(".") {
                self.eat_op(".")?;
                let fname = self.eat(TokKind::Ident, None)?.text;
                self.eat_op("=")?;
                has_desig = true;
                if let Some(st) = struct_type {
                    if let Some(sd) = self.find_struct(st) {
                        if let Some(idx) = sd.field_index(&fname) {
                            di = idx as i64;
                        }
                    }
                }
                if di < 0 {
                    return Err(format!(
                        "parser: unknown field '{}' in designated initializer",
                        fname
                    ));
                }
            } else if self.check_op("[") {
                self.eat_op("[")?;
                let t = self.eat(TokKind::Number, None)?.text;
                di = Self::number_value(&t);
                self.eat_op("]")?;
                self.eat_op("=")?;
                has_desig = true;
            }

            if self.check_op("{") {
                elems.push(self.parse_init_list(None)?);
            } else {
                elems.push(self.parse_expr(0)?);
            }
            desig.push(di);

            if self.check_op(",") {
                self.eat_op(",")?;
                continue;
            }
            break;
        }
        self.eat_op("}")?;

        Ok(Expr::InitList {
            elems,
            desig_indices: if has_desig { Some(desig) } else { None },
        })
    }

    // ---- Variable declarations ----

    fn parse_vardecl_stmt(&mut self, is_static: bool) -> Result<Stmt, String> {
        let stype = self.parse_base_type()?;
        let base_unsigned = self.last_type_unsigned;
        let base_is_char = self.last_type_is_char;
        let mut entries = Vec::new();

        loop {
            let mut ptr_depth: u32 = 0;
            let mut is_funcptr = false;
            if self.is_funcptr_decl() {
                self.eat_op("(")?;
                self.eat_op("*")?;
                ptr_depth = 1;
                is_funcptr = true;
            }
            while self.check_op("*") {
                self.advance();
                ptr_depth += 1;
                self.skip_qualifiers();
            }
            if !is_funcptr && self.is_funcptr_decl() {
                self.eat_op("(")?;
                self.eat_op("*")?;
                ptr_depth += 1;
                is_funcptr = true;
            }
            self.skip_qualifiers();
            let name = self.eat(TokKind::Ident, None)?.text;
            if is_funcptr {
                self.eat_op(")")?;
                self.skip_param_list()?;
            }

            let mut array_len: i64 = -1;
            let mut inner_dim2: i64 = -1;
            if self.check_op("[") {
                self.eat_op("[")?;
                if self.check_op("]") {
                    array_len = 0; // inferred from the initializer
                } else {
                    array_len = self.parse_const_expr()?;
                }
                self.eat_op("]")?;
                if self.check_op("[") {
                    self.eat_op("[")?;
                    inner_dim2 = self.parse_const_expr()?;
                    self.eat_op("]")?;
                }
            }

            let mut init = None;
            if array_len >= 0 && self.check_op("=") {
                self.eat_op("=")?;
                if self.check_kind(TokKind::String) {
                    // char s[] = "text": length is strlen + NUL
                    let tok = self.advance();
                    let decoded_len = decoded_string_len(&tok.text);
                    if array_len == 0 {
                        array_len = decoded_len;
                    }
                    init = Some(Expr::StrLit(tok.text));
                } else {
                    let list = self.parse_init_list(stype.as_deref())?;
                    if array_len == 0 {
                        if let Expr::InitList { ref elems, .. } = list {
                            array_len = elems.len() as i64;
                        }
                    }
                    init = Some(list);
                }
            } else if stype.is_some() && ptr_depth == 0 && array_len < 0 && self.check_op("=") {
                // Struct variable: brace init or copy from another value
                self.eat_op("=")?;
                if self.check_op("{") {
                    init = Some(self.parse_init_list(stype.as_deref())?);
                } else {
                    init = Some(self.parse_expr(0)?);
                }
            } else if (stype.is_none() || ptr_depth > 0) && array_len < 0 && self.check_op("=") {
                self.eat_op("=")?;
                init = Some(self.parse_expr(0)?);
            }

            self.add_local(&name, stype.as_deref(), ptr_depth, array_len);

            let total_len = if array_len > 0 && inner_dim2 > 0 {
                array_len * inner_dim2
            } else {
                array_len
            };
            entries.push(VarDeclEntry {
                name,
                struct_type: stype.clone(),
                array_len: total_len,
                inner_dim2,
                ptr_depth,
                init,
                is_static,
                is_unsigned: base_unsigned,
                is_char: base_is_char,
            });

            if self.check_op(",") {
                self.eat_op(",")?;
                continue;
            }
            break;
        }
        self.eat_op(";")?;
        Ok(Stmt::VarDecl(entries))
    }

    // ---- Expressions ----

    fn get_prec(op: &str) -> i32 {
        match op {
            "||" => 1,
            "&&" => 2,
            "|" => 3,
            "^" => 4,
            "&" => 5,
            "==" | "!=" => 6,
            "<" | "<=" | ">" | ">=" => 7,
            "<<" | ">>" => 8,
            "+" | "-" => 9,
            "*" | "/" | "%" => 10,
            _ => -1,
        }
    }

    fn is_compound_assign(op: &str) -> bool {
        matches!(
            op,
            "+=" | "-=" | "*=" | "/=" | "%=" | "&=" | "|=" | "^=" | "<<=" | ">>="
        )
    }

    /// Precedence-climbing expression parser. `min_prec` of -1 permits the
    /// comma operator (statement context).
    fn parse_expr(&mut self, min_prec: i32) -> Result<Expr, String> {
        let mut e = self.parse_unary()?;

        loop {
            let t = self.cur();
            if t.kind != TokKind::Op {
                break;
            }
            let op = t.text.clone();

            if op == "," && min_prec < 0 {
                self.advance();
                let rhs = self.parse_expr(0)?;
                e = Expr::binary(",", e, rhs);
                continue;
            }

            if op == "?" && min_prec <= 0 {
                self.advance();
                let then_e = self.parse_expr(-1)?;
                self.eat_op(":")?;
                let else_e = self.parse_expr(0)?;
                e = Expr::Ternary {
                    cond: Box::new(e),
                    then_expr: Box::new(then_e),
                    else_expr: Box::new(else_e),
                };
                continue;
            }

            if op == "=" && min_prec <= 0 {
                self.advance();
                let rhs = self.parse_expr(0)?;
                e = Expr::assign(e, rhs);
                continue;
            }

            // x op= e desugars to x = x op e at parse time
            if Self::is_compound_assign(&op) && min_prec <= 0 {
                self.advance();
                let base_op = &op[..op.len() - 1];
                let rhs = self.parse_expr(0)?;
                let combined = Expr::binary(base_op, e.clone(), rhs);
                e = Expr::assign(e, combined);
                continue;
            }

            let prec = Self::get_prec(&op);
            if prec < 0 || prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(prec + 1)?;
            e = Expr::binary(&op, e, rhs);
        }

        Ok(e)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        // Prefix ++/-- desugar to assignments
        if self.check_op("++") {
            self.advance();
            let rhs = self.parse_unary()?;
            return Ok(Expr::assign(
                rhs.clone(),
                Expr::binary("+", rhs, Expr::Num(1)),
            ));
        }
        if self.check_op("--") {
            self.advance();
            let rhs = self.parse_unary()?;
            return Ok(Expr::assign(
                rhs.clone(),
                Expr::binary("-", rhs, Expr::Num(1)),
            ));
        }
        // Unary + is a no-op
        if self.check_op("+") {
            self.advance();
            return self.parse_unary();
        }
        if self.check_op("-")
            || self.check_op("!")
            || self.check_op("*")
            || self.check_op("&")
            || self.check_op("~")
        {
            let op = self.advance().text.chars().next().unwrap();
            let rhs = self.parse_unary()?;
            return Ok(Expr::unary(op, rhs));
        }

        // Cast vs parenthesized expression: a leading '(' followed by a type
        // specifier is a cast; rewind on misdetection.
        if self.check_op("(") {
            let saved = self.pos;
            self.eat_op("(")?;
            self.skip_qualifiers();
            if self.is_type_start() {
                let cast_stype = self.parse_base_type()?;
                if self.is_funcptr_decl() {
                    // (type (*)(params)) or (type (*name)(params))
                    self.eat_op("(")?;
                    while self.check_op("*") {
                        self.advance();
                        self.skip_qualifiers();
                    }
                    if self.check_kind(TokKind::Ident) {
                        self.advance();
                    }
                    self.eat_op(")")?;
                    self.skip_param_list()?;
                } else {
                    while self.check_op("*") {
                        self.advance();
                        self.skip_qualifiers();
                    }
                    if self.is_funcptr_decl() {
                        self.eat_op("(")?;
                        while self.check_op("*") {
                            self.advance();
                            self.skip_qualifiers();
                        }
                        if self.check_kind(TokKind::Ident) {
                            self.advance();
                        }
                        self.eat_op(")")?;
                        self.skip_param_list()?;
                    }
                }
                self.eat_op(")")?;
                // Compound literal: (struct Tag){ ... }
                if let Some(ref st) = cast_stype {
                    if self.check_op("{") {
                        let init = self.parse_init_list(Some(st))?;
                        return Ok(Expr::CompoundLit {
                            struct_type: st.clone(),
                            init: Box::new(init),
                        });
                    }
                }
                // Remember struct casts for ((T*)0)->field resolution
                if let Some(st) = cast_stype {
                    self.last_cast_struct_type = Some(st);
                }
                // The cast itself generates no code
                return self.parse_unary();
            }
            self.pos = saved;
        }

        self.parse_primary()
    }

    /// Resolve the struct tag for a `.`/`->` access on `e`.
    fn resolve_member_struct(&mut self, e: &Expr) -> String {
        let direct = match e {
            Expr::Var(name) => self
                .find_local(name)
                .and_then(|l| l.struct_type.clone())
                .or_else(|| {
                    self.find_global_var(name)
                        .and_then(|g| g.struct_type.clone())
                }),
            Expr::Field {
                struct_type, field, ..
            }
            | Expr::Arrow {
                struct_type, field, ..
            } => self.field_struct_type(struct_type, field),
            Expr::Index { base, .. } => match base.as_ref() {
                Expr::Var(name) => self
                    .find_local(name)
                    .and_then(|l| l.struct_type.clone())
                    .or_else(|| {
                        self.find_global_var(name)
                            .and_then(|g| g.struct_type.clone())
                    }),
                Expr::Field {
                    struct_type, field, ..
                }
                | Expr::Arrow {
                    struct_type, field, ..
                } => self.field_struct_type(struct_type, field),
                _ => None,
            },
            Expr::Call { name, .. } => self.find_func_ret_struct(name),
            _ => None,
        };
        if let Some(st) = direct {
            return st;
        }
        if let Some(st) = self.last_cast_struct_type.take() {
            return st;
        }
        UNKNOWN_STRUCT.to_string()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let t = self.cur().clone();
        let mut e;

        if t.kind == TokKind::Number {
            self.advance();
            e = Expr::Num(Self::number_value(&t.text));
        } else if t.kind == TokKind::String {
            self.advance();
            e = Expr::StrLit(t.text);
        } else if t.kind == TokKind::Ident {
            let name = self.advance().text;
            if !self.check_op("(") && self.find_enum_const(&name).is_some() {
                e = Expr::Num(self.find_enum_const(&name).unwrap());
            } else if self.check_op("(") {
                self.eat_op("(")?;
                let mut args = Vec::new();
                if !self.check_op(")") {
                    loop {
                        args.push(self.parse_expr(0)?);
                        if self.check_op(",") {
                            self.eat_op(",")?;
                            continue;
                        }
                        break;
                    }
                }
                self.eat_op(")")?;
                e = Expr::Call { name, args };
            } else {
                e = Expr::Var(name);
            }
        } else if self.check_op("(") {
            self.eat_op("(")?;
            e = self.parse_expr(-1)?;
            self.eat_op(")")?;
        } else if self.check_kw("sizeof") {
            e = Expr::Num(self.parse_sizeof_value()?);
        } else {
            return Err(format!(
                "parser: unexpected token {}:'{}' at byte {} ({})",
                tokkind_str(t.kind),
                t.text,
                t.pos,
                self.context_dump()
            ));
        }

        // Postfix: [] . -> ++ -- ()
        loop {
            if self.check_op("(") {
                // Call through a postfix expression. A plain variable becomes
                // a regular call; anything else goes through the indirect
                // call convention with the function expression prepended.
                self.eat_op("(")?;
                let mut args = Vec::new();
                if !self.check_op(")") {
                    loop {
                        args.push(self.parse_expr(0)?);
                        if self.check_op(",") {
                            self.eat_op(",")?;
                            continue;
                        }
                        break;
                    }
                }
                self.eat_op(")")?;
                e = match e {
                    Expr::Var(name) => Expr::Call { name, args },
                    other => {
                        let mut new_args = vec![other];
                        new_args.extend(args);
                        Expr::Call {
                            name: INDIRECT_CALL.to_string(),
                            args: new_args,
                        }
                    }
                };
                continue;
            }
            if self.check_op("[") {
                self.eat_op("[")?;
                let idx = self.parse_expr(0)?;
                self.eat_op("]")?;
                e = Expr::Index {
                    base: Box::new(e),
                    index: Box::new(idx),
                };
                continue;
            }
            if self.check_op("++") {
                self.advance();
                e = Expr::PostInc(Box::new(e));
                continue;
            }
            if self.check_op("--") {
                self.advance();
                e = Expr::PostDec(Box::new(e));
                continue;
            }
            if self.check_op(".") {
                self.eat_op(".")?;
                let field = self.eat(TokKind::Ident, None)?.text;
                let st = self.resolve_member_struct(&e);
                e = Expr::Field {
                    obj: Box::new(e),
                    field,
                    struct_type: st,
                };
                continue;
            }
            if self.check_op("->") {
                self.eat_op("->")?;
                let field = self.eat(TokKind::Ident, None)?.text;
                let st = self.resolve_member_struct(&e);
                e = Expr::Arrow {
                    obj: Box::new(e),
                    field,
                    struct_type: st,
                };
                continue;
            }
            break;
        }

        Ok(e)
    }

    /// Expression-context `sizeof`. Most scalars report 8 so the uniform
    /// 8-byte slot model downstream holds; `sizeof(char)` is 1 and structs
    /// report their recursive slot size.
    fn parse_sizeof_value(&mut self) -> Result<i64, String> {
        self.eat_kw("sizeof")?;
        if !self.check_op("(") {
            self.parse_unary()?;
            return Ok(8);
        }
        self.eat_op("(")?;
        let mut sz: i64 = 8;
        if self.is_type_start() {
            let stype = self.parse_base_type()?;
            let is_char = self.last_type_is_char;
            let mut is_ptr = false;
            while self.check_op("*") {
                self.advance();
                is_ptr = true;
            }
            if is_ptr {
                sz = 8;
            } else if is_char && stype.is_none() {
                sz = 1;
            } else if let Some(ref st) = stype {
                sz = if self.find_struct(st).is_some() {
                    self.struct_nslots(st) * 8
                } else {
                    8
                };
            }
            if self.check_op("[") {
                self.eat_op("[")?;
                let n = self.parse_const_expr()?;
                self.eat_op("]")?;
                sz *= n;
            }
        } else {
            sz = self.parse_sizeof_of_expr()?;
        }
        self.eat_op(")")?;
        Ok(sz)
    }

    /// sizeof(expr): resolve struct variables, struct pointers and fields to
    /// their slot sizes; everything else is 8.
    fn parse_sizeof_of_expr(&mut self) -> Result<i64, String> {
        // sizeof(*p) where p is a pointer to struct
        if self.check_op("*") {
            if let Some(next) = self.peek(1) {
                if next.kind == TokKind::Ident {
                    let vname = next.text.clone();
                    let after_is_close = self
                        .peek(2)
                        .map(|t| t.kind == TokKind::Op && t.text == ")")
                        .unwrap_or(false);
                    if after_is_close {
                        if let Some((Some(st), ptr, _)) = self.sizeof_var_info(&vname) {
                            if ptr > 0 {
                                self.advance(); // *
                                self.advance(); // ident
                                return Ok(self.struct_nslots(&st) * 8);
                            }
                        }
                    }
                }
            }
        }

        if self.check_kind(TokKind::Ident) {
            let vname = self.cur().text.clone();
            let next = self.peek(1).cloned();
            let next_is = |s: &str| {
                next.as_ref()
                    .map(|t| t.kind == TokKind::Op && t.text == s)
                    .unwrap_or(false)
            };

            if next_is(")") || next_is("[") {
                if let Some((stype, ptr_depth, array_len)) = self.sizeof_var_info(&vname) {
                    if let Some(ref st) = stype {
                        let nslots = self.struct_nslots(st);
                        self.advance();
                        if next_is("[") {
                            self.eat_op("[")?;
                            self.parse_expr(0)?;
                            self.eat_op("]")?;
                            return Ok(nslots * 8);
                        }
                        if array_len > 0 {
                            return Ok(array_len * nslots * 8);
                        }
                        if ptr_depth == 0 {
                            return Ok(nslots * 8);
                        }
                        return Ok(8);
                    }
                    if array_len > 0 && next_is(")") {
                        self.advance();
                        return Ok(array_len * 8);
                    }
                }
            }

            // sizeof(v.f) / sizeof(v->f)
            if next_is("->") || next_is(".") {
                let stype = self.sizeof_var_info(&vname).and_then(|(st, _, _)| st);
                if let Some(st) = stype {
                    let fname = self.peek(2).map(|t| t.text.clone());
                    let closes = self
                        .peek(3)
                        .map(|t| t.kind == TokKind::Op && t.text == ")")
                        .unwrap_or(false);
                    if let (Some(fname), true) = (fname, closes) {
                        if let Some(sd) = self.find_struct(&st).cloned() {
                            if let Some(fi) = sd.field_index(&fname) {
                                let sz = if sd.field_array_lens[fi] > 0 {
                                    let elem = match &sd.field_types[fi] {
                                        Some(sub) => self.struct_nslots(sub) * 8,
                                        None => 8,
                                    };
                                    sd.field_array_lens[fi] * elem
                                } else if sd.field_types[fi].is_some() {
                                    self.struct_nslots(sd.field_types[fi].as_ref().unwrap()) * 8
                                } else {
                                    8
                                };
                                self.advance(); // var
                                self.advance(); // -> or .
                                self.advance(); // field
                                return Ok(sz);
                            }
                        }
                    }
                }
            }
        }

        self.parse_expr(0)?;
        Ok(8)
    }

    // ---- Statements ----

    fn parse_block(&mut self) -> Result<Block, String> {
        self.eat_op("{")?;
        if self.in_switch_depth > 0 {
            self.in_switch_depth += 1;
        }
        let mut b = Block::default();
        while !self.check_op("}")
            && !(self.in_switch_depth > 0 && (self.check_kw("case") || self.check_kw("default")))
        {
            if self.at_end() {
                return Err("parser: unexpected end of input in block".to_string());
            }
            b.stmts.push(self.parse_stmt()?);
        }
        if self.check_op("}") {
            self.eat_op("}")?;
            if self.in_switch_depth > 0 {
                self.in_switch_depth -= 1;
            }
        }
        // Otherwise a case/default label inside this block (Duff's device);
        // the enclosing switch handler picks it up.
        Ok(b)
    }

    fn parse_stmt_as_block(&mut self) -> Result<Block, String> {
        if self.check_op("{") {
            self.parse_block()
        } else {
            Ok(Block::single(self.parse_stmt()?))
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, String> {
        if self.check_kw("return") {
            self.eat_kw("return")?;
            if self.check_op(";") {
                self.eat_op(";")?;
                return Ok(Stmt::Return(Expr::Num(0)));
            }
            let e = self.parse_expr(0)?;
            self.eat_op(";")?;
            return Ok(Stmt::Return(e));
        }

        if self.check_kw("if") {
            self.eat_kw("if")?;
            self.eat_op("(")?;
            let cond = self.parse_expr(0)?;
            self.eat_op(")")?;
            let then_blk = self.parse_stmt_as_block()?;
            let mut else_blk = None;
            if self.check_kw("else") {
                self.eat_kw("else")?;
                // Dangling else binds to the nearest if
                else_blk = Some(self.parse_stmt_as_block()?);
            }
            return Ok(Stmt::If {
                cond,
                then_blk,
                else_blk,
            });
        }

        if self.check_kw("while") {
            self.eat_kw("while")?;
            self.eat_op("(")?;
            let cond = self.parse_expr(0)?;
            self.eat_op(")")?;
            let body = self.parse_stmt_as_block()?;
            return Ok(Stmt::While { cond, body });
        }

        if self.check_kw("do") {
            self.eat_kw("do")?;
            let body = self.parse_stmt_as_block()?;
            self.eat_kw("while")?;
            self.eat_op("(")?;
            let cond = self.parse_expr(0)?;
            self.eat_op(")")?;
            self.eat_op(";")?;
            return Ok(Stmt::DoWhile { cond, body });
        }

        if self.check_kw("for") {
            self.eat_kw("for")?;
            self.eat_op("(")?;
            let init = if self.starts_type() {
                Some(Box::new(self.parse_vardecl_stmt(false)?))
            } else if self.check_op(";") {
                self.eat_op(";")?;
                None
            } else {
                let e = self.parse_expr(-1)?;
                self.eat_op(";")?;
                Some(Box::new(Stmt::Expr(e)))
            };
            let cond = if !self.check_op(";") {
                Some(self.parse_expr(0)?)
            } else {
                None
            };
            self.eat_op(";")?;
            let post = if !self.check_op(")") {
                Some(self.parse_expr(-1)?)
            } else {
                None
            };
            self.eat_op(")")?;
            let body = self.parse_stmt_as_block()?;
            return Ok(Stmt::For {
                init,
                cond,
                post,
                body,
            });
        }

        if self.check_kw("switch") {
            return self.parse_switch();
        }

        if self.check_kw("break") {
            self.eat_kw("break")?;
            self.eat_op(";")?;
            return Ok(Stmt::Break);
        }

        if self.check_kw("continue") {
            self.eat_kw("continue")?;
            self.eat_op(";")?;
            return Ok(Stmt::Continue);
        }

        if self.check_kw("goto") {
            self.eat_kw("goto")?;
            let label = self.eat(TokKind::Ident, None)?.text;
            self.eat_op(";")?;
            return Ok(Stmt::Goto(label));
        }

        // Label: identifier followed by ':'
        if self.cur().kind == TokKind::Ident
            && self
                .peek(1)
                .map(|t| t.kind == TokKind::Op && t.text == ":")
                .unwrap_or(false)
        {
            let label = self.advance().text;
            self.eat_op(":")?;
            let stmt = if self.check_op("}") {
                // Label at end of block carries a synthetic no-op
                Stmt::Expr(Expr::Num(0))
            } else {
                self.parse_stmt()?
            };
            return Ok(Stmt::Label {
                name: label,
                stmt: Box::new(stmt),
            });
        }

        // Local typedef: skipped, but the alias is registered
        if self.check_kw("typedef") {
            self.eat_kw("typedef")?;
            let mut depth = 0;
            let mut last_id: Option<String> = None;
            let mut has_char = false;
            let mut has_ptr = false;
            while !(depth == 0 && self.check_op(";")) {
                if self.at_end() {
                    return Err("parser: unexpected end of input in typedef".to_string());
                }
                if self.check_op("(") {
                    depth += 1;
                } else if self.check_op(")") {
                    depth -= 1;
                }
                if self.check_kw("char") {
                    has_char = true;
                }
                if self.check_op("*") {
                    has_ptr = true;
                }
                if self.cur().kind == TokKind::Ident && depth <= 1 {
                    last_id = Some(self.cur().text.clone());
                }
                self.advance();
            }
            self.eat_op(";")?;
            if let Some(alias) = last_id {
                self.add_typedef(&alias, None, has_char && !has_ptr);
            }
            return Ok(Stmt::Expr(Expr::Num(0)));
        }

        if self.starts_type() {
            let mut local_static = false;
            if self.check_kw("static") {
                self.eat_kw("static")?;
                local_static = true;
            }
            // Standalone struct definition in a function body
            if self.check_kw("struct") || self.check_kw("union") {
                let saved = self.pos;
                self.parse_base_type()?;
                if self.check_op(";") {
                    self.eat_op(";")?;
                    return Ok(Stmt::Expr(Expr::Num(0)));
                }
                self.pos = saved;
            }
            return self.parse_vardecl_stmt(local_static);
        }

        // Bare block: all locals share one frame, so an if(1) wrapper is
        // semantically equivalent
        if self.check_op("{") {
            let blk = self.parse_block()?;
            return Ok(Stmt::If {
                cond: Expr::Num(1),
                then_blk: blk,
                else_blk: None,
            });
        }

        if self.check_op(";") {
            self.eat_op(";")?;
            return Ok(Stmt::Expr(Expr::Num(0)));
        }

        let e = self.parse_expr(-1)?;
        self.eat_op(";")?;
        Ok(Stmt::Expr(e))
    }

    fn parse_switch(&mut self) -> Result<Stmt, String> {
        self.eat_kw("switch")?;
        self.eat_op("(")?;
        let cond = self.parse_expr(0)?;
        self.eat_op(")")?;
        self.eat_op("{")?;

        let saved_depth = self.in_switch_depth;
        self.in_switch_depth = 1;
        let mut cases: Vec<SwitchCase> = Vec::new();

        // Declarations before the first case prepend to the first case body
        let mut pre_stmts = Vec::new();
        while !self.check_kw("case") && !self.check_kw("default") && !self.check_op("}") {
            if self.at_end() {
                return Err("parser: unexpected end of input in switch".to_string());
            }
            pre_stmts.push(self.parse_stmt()?);
        }

        'outer: while self.in_switch_depth > 0 {
            // Stray } from Duff's-device blocks
            while self.check_op("}") {
                self.eat_op("}")?;
                self.in_switch_depth -= 1;
                if self.in_switch_depth == 0 {
                    break 'outer;
                }
            }

            let value = if self.check_kw("case") {
                self.eat_kw("case")?;
                let v = self.parse_const_expr()?;
                self.eat_op(":")?;
                Some(v)
            } else if self.check_kw("default") {
                self.eat_kw("default")?;
                self.eat_op(":")?;
                None
            } else {
                return Err(format!(
                    "parser: expected 'case' or 'default' in switch at byte {} ({})",
                    self.cur().pos,
                    self.context_dump()
                ));
            };

            let mut stmts = Vec::new();
            if cases.is_empty() && !pre_stmts.is_empty() {
                stmts.append(&mut pre_stmts);
            }
            while !self.check_kw("case") && !self.check_kw("default") && !self.check_op("}") {
                if self.at_end() {
                    return Err("parser: unexpected end of input in switch".to_string());
                }
                stmts.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { value, stmts });
        }

        self.in_switch_depth = saved_depth;
        Ok(Stmt::Switch { cond, cases })
    }

    // ---- Functions, prototypes, globals ----

    fn parse_func_or_proto(&mut self, is_static: bool) -> Result<TopDecl, String> {
        self.local_vars.clear();
        let ret_stype = self.parse_base_type()?;
        let mut ret_is_ptr = false;
        while self.check_op("*") {
            self.advance();
            self.skip_qualifiers();
            ret_is_ptr = true;
        }
        let name = self.eat(TokKind::Ident, None)?.text;
        self.eat_op("(")?;

        let mut params: Vec<Param> = Vec::new();
        let mut is_variadic = false;

        if !self.check_op(")") {
            let void_only = self.check_kw("void")
                && self
                    .peek(1)
                    .map(|t| t.kind == TokKind::Op && t.text == ")")
                    .unwrap_or(false);
            if void_only {
                self.eat_kw("void")?;
            } else {
                loop {
                    // Variadic marker: three consecutive '.' tokens
                    if self.check_op(".") {
                        self.eat_op(".")?;
                        self.eat_op(".")?;
                        self.eat_op(".")?;
                        is_variadic = true;
                        break;
                    }
                    let stype = self.parse_base_type()?;
                    let mut p_is_char = self.last_type_is_char;
                    let mut ptr_depth: u32 = 0;
                    let mut is_funcptr = false;
                    if self.is_funcptr_decl() {
                        self.eat_op("(")?;
                        self.eat_op("*")?;
                        ptr_depth = 1;
                        is_funcptr = true;
                    }
                    let mut star_count = 0;
                    while self.check_op("*") {
                        self.advance();
                        ptr_depth += 1;
                        star_count += 1;
                        self.skip_qualifiers();
                    }
                    // char** and deeper is not a char pointer
                    if star_count > 1 {
                        p_is_char = false;
                    }
                    if !is_funcptr && self.is_funcptr_decl() {
                        self.eat_op("(")?;
                        self.eat_op("*")?;
                        is_funcptr = true;
                    }
                    self.skip_qualifiers();

                    // Unnamed funcptr param: type (*)(params)
                    if is_funcptr && self.check_op(")") {
                        self.eat_op(")")?;
                        self.skip_param_list()?;
                        params.push(Param {
                            name: "__unnamed".to_string(),
                            struct_type: stype.clone(),
                            ptr_depth,
                            is_char: p_is_char,
                        });
                        if self.check_op(",") {
                            self.eat_op(",")?;
                            continue;
                        }
                        break;
                    }

                    if self.check_kind(TokKind::Ident) {
                        let pname = self.advance().text;
                        if is_funcptr {
                            self.eat_op(")")?;
                            self.skip_param_list()?;
                        }
                        // Array params decay to pointers
                        if self.check_op("[") {
                            self.eat_op("[")?;
                            if !self.check_op("]") {
                                self.eat(TokKind::Number, None)?;
                            }
                            self.eat_op("]")?;
                        }
                        self.add_local(&pname, stype.as_deref(), ptr_depth, -1);
                        params.push(Param {
                            name: pname,
                            struct_type: stype.clone(),
                            ptr_depth,
                            is_char: p_is_char,
                        });
                    } else {
                        // Unnamed parameter in a prototype
                        params.push(Param {
                            name: "__unnamed".to_string(),
                            struct_type: stype.clone(),
                            ptr_depth,
                            is_char: p_is_char,
                        });
                    }
                    if self.check_op(",") {
                        self.eat_op(",")?;
                        continue;
                    }
                    break;
                }
            }
        }
        self.eat_op(")")?;

        let ret_struct_type = match (&ret_stype, ret_is_ptr) {
            (Some(st), true) => Some(st.clone()),
            _ => None,
        };
        if ret_struct_type.is_some() {
            self.add_func_ret_info(&name, ret_stype.as_deref());
        }

        if self.check_op(";") {
            self.eat_op(";")?;
            return Ok(TopDecl::Proto(FuncProto {
                name,
                ret_is_ptr,
                is_variadic,
                nparams: params.len(),
                ret_struct_type,
            }));
        }

        let body = self.parse_block()?;
        Ok(TopDecl::Func(FuncDef {
            name,
            params,
            body,
            is_static,
            ret_is_ptr,
            is_variadic,
            ret_struct_type,
        }))
    }

    fn parse_extern_decl(&mut self) -> Result<GlobalDecl, String> {
        self.eat_kw("extern")?;
        let stype = self.parse_base_type()?;
        let base_is_char = self.last_type_is_char;
        let mut ptr_depth: u32 = 0;
        let mut is_funcptr = false;
        if self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            ptr_depth = 1;
            is_funcptr = true;
        }
        while self.check_op("*") {
            self.advance();
            self.skip_qualifiers();
            ptr_depth += 1;
        }
        let name = self.eat(TokKind::Ident, None)?.text;
        if is_funcptr {
            self.eat_op(")")?;
            self.skip_param_list()?;
        }
        let mut array_len: i64 = -1;
        if self.check_op("[") {
            self.eat_op("[")?;
            if !self.check_op("]") {
                array_len = self.parse_const_expr()?;
            }
            self.eat_op("]")?;
        }
        // extern int foo(...) is a function declaration
        let mut is_func = false;
        if self.check_op("(") {
            is_func = true;
            self.skip_param_list()?;
        }
        self.eat_op(";")?;

        if is_func && stype.is_some() && ptr_depth > 0 {
            let st = stype.clone();
            self.add_func_ret_info(&name, st.as_deref());
        }
        Ok(GlobalDecl {
            name,
            struct_type: stype,
            ptr_depth,
            array_len,
            init: None,
            is_extern: true,
            is_static: false,
            is_func_decl: is_func,
            is_char: base_is_char,
        })
    }

    /// After the base type: `[*]* name (` means function, else global.
    fn is_func_lookahead(&mut self) -> bool {
        let saved = self.pos;
        while self.check_op("*") {
            self.advance();
        }
        self.skip_qualifiers();
        if !self.check_kind(TokKind::Ident) {
            self.pos = saved;
            return false;
        }
        self.advance();
        let result = self.check_op("(");
        self.pos = saved;
        result
    }

    /// `type (* name (` signals a function returning a function pointer.
    fn is_funcptr_return(&self) -> bool {
        if !self.check_op("(") {
            return false;
        }
        let star = self
            .peek(1)
            .map(|t| t.kind == TokKind::Op && t.text == "*")
            .unwrap_or(false);
        let ident = self
            .peek(2)
            .map(|t| t.kind == TokKind::Ident)
            .unwrap_or(false);
        let call = self
            .peek(3)
            .map(|t| t.kind == TokKind::Op && t.text == "(")
            .unwrap_or(false);
        star && ident && call
    }

    /// Function-returning-function-pointer declarations are recorded as
    /// opaque prototypes; definition bodies are skipped.
    fn skip_funcptr_return_decl(
        &mut self,
        is_static: bool,
        prog: &mut Program,
    ) -> Result<(), String> {
        self.eat_op("(")?;
        self.eat_op("*")?;
        let name = self.eat(TokKind::Ident, None)?.text;
        self.skip_param_list()?;
        self.eat_op(")")?;
        if self.check_op("(") {
            self.skip_param_list()?;
        }
        if self.check_op(";") {
            self.eat_op(";")?;
            prog.protos.push(FuncProto {
                name,
                ret_is_ptr: true,
                is_variadic: false,
                nparams: 0,
                ret_struct_type: None,
            });
            return Ok(());
        }
        if self.check_op("{") {
            self.eat_op("{")?;
            let mut depth = 1;
            while depth > 0 {
                if self.at_end() {
                    return Err("parser: unexpected end of input in function body".to_string());
                }
                if self.check_op("{") {
                    depth += 1;
                } else if self.check_op("}") {
                    depth -= 1;
                }
                if depth > 0 {
                    self.advance();
                }
            }
            self.eat_op("}")?;
            prog.funcs.push(FuncDef {
                name,
                params: Vec::new(),
                body: Block::default(),
                is_static,
                ret_is_ptr: true,
                is_variadic: false,
                ret_struct_type: None,
            });
        }
        Ok(())
    }

    fn parse_global_decl(&mut self, is_static: bool) -> Result<GlobalDecl, String> {
        let stype = self.parse_base_type()?;
        let base_is_char = self.last_type_is_char;
        let mut ptr_depth: u32 = 0;
        let mut is_funcptr = false;
        if self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            ptr_depth = 1;
            is_funcptr = true;
        }
        while self.check_op("*") {
            self.advance();
            self.skip_qualifiers();
            ptr_depth += 1;
        }
        if !is_funcptr && self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            is_funcptr = true;
        }
        self.skip_qualifiers();
        let name = self.eat(TokKind::Ident, None)?.text;
        let mut array_len: i64 = -1;
        if is_funcptr {
            // Array of function pointers: type (*name[])(params)
            if self.check_op("[") {
                self.eat_op("[")?;
                if self.check_op("]") {
                    array_len = 0;
                } else {
                    array_len = self.parse_const_expr()?;
                }
                self.eat_op("]")?;
            }
            self.eat_op(")")?;
            self.skip_param_list()?;
        }
        if array_len < 0 && self.check_op("[") {
            self.eat_op("[")?;
            if self.check_op("]") {
                array_len = 0;
            } else {
                array_len = self.parse_const_expr()?;
            }
            self.eat_op("]")?;
        }

        let mut init = None;
        if array_len >= 0 && self.check_op("=") {
            self.eat_op("=")?;
            if self.check_kind(TokKind::String) {
                let tok = self.advance();
                let decoded_len = decoded_string_len(&tok.text);
                if array_len == 0 {
                    array_len = decoded_len;
                }
                init = Some(Expr::StrLit(tok.text));
            } else {
                let list = self.parse_init_list(stype.as_deref())?;
                if array_len == 0 {
                    if let Expr::InitList { ref elems, .. } = list {
                        array_len = elems.len() as i64;
                    }
                }
                init = Some(list);
            }
        } else if array_len < 0 && self.check_op("=") {
            self.eat_op("=")?;
            if self.check_op("{") {
                init = Some(self.parse_init_list(stype.as_deref())?);
            } else if self.check_op("-") {
                self.eat_op("-")?;
                let t = self.eat(TokKind::Number, None)?.text;
                init = Some(Expr::Num(-Self::number_value(&t)));
            } else {
                init = Some(self.parse_expr(0)?);
            }
        }
        self.eat_op(";")?;

        if let Some(ref st) = stype {
            self.add_global_var_info(&name, st, ptr_depth, array_len);
        }
        Ok(GlobalDecl {
            name,
            struct_type: stype,
            ptr_depth,
            array_len,
            init,
            is_extern: false,
            is_static,
            is_func_decl: false,
            is_char: base_is_char,
        })
    }

    fn parse_func_or_global(&mut self, is_static: bool, prog: &mut Program) -> Result<(), String> {
        let saved = self.pos;
        self.parse_base_type()?;
        if self.is_funcptr_return() {
            return self.skip_funcptr_return_decl(is_static, prog);
        }
        if self.is_func_lookahead() {
            self.pos = saved;
            match self.parse_func_or_proto(is_static)? {
                TopDecl::Func(fd) => prog.funcs.push(fd),
                TopDecl::Proto(p) => prog.protos.push(p),
            }
        } else {
            self.pos = saved;
            let gd = self.parse_global_decl(is_static)?;
            prog.globals.push(gd);
        }
        Ok(())
    }

    // ---- Top level ----

    pub fn parse(&mut self) -> Result<Program, String> {
        let mut prog = Program::new();

        while !self.at_end() {
            if self.check_kw("typedef") {
                self.parse_top_typedef()?;
                continue;
            }

            if self.check_kw("extern") {
                let gd = self.parse_extern_decl()?;
                prog.globals.push(gd);
                continue;
            }

            if self.check_kw("enum") {
                // enum { ... } is a definition; enum Name var is a usage
                let saved = self.pos;
                self.eat_kw("enum")?;
                if self.check_kind(TokKind::Ident) {
                    self.advance();
                }
                let is_def = self.check_op("{");
                self.pos = saved;
                if is_def {
                    self.parse_enum_def()?;
                } else {
                    self.parse_func_or_global(false, &mut prog)?;
                }
                continue;
            }

            if self.check_kw("static") {
                self.eat_kw("static")?;
                if self.check_kw("inline") {
                    self.eat_kw("inline")?;
                }
                self.parse_func_or_global(true, &mut prog)?;
                continue;
            }

            if self.check_kw("inline") {
                self.eat_kw("inline")?;
                if self.check_kw("static") {
                    self.eat_kw("static")?;
                }
                self.parse_func_or_global(true, &mut prog)?;
                continue;
            }

            if self.check_kw("struct") || self.check_kw("union") {
                // parse_base_type registers any inline definition; what
                // follows decides between a bare definition (or forward
                // declaration), a function, and a global variable.
                let saved = self.pos;
                self.parse_base_type()?;
                if self.check_op(";") {
                    self.eat_op(";")?;
                    continue;
                }
                if self.is_funcptr_return() {
                    self.skip_funcptr_return_decl(false, &mut prog)?;
                    continue;
                }
                if self.is_func_lookahead() {
                    self.pos = saved;
                    match self.parse_func_or_proto(false)? {
                        TopDecl::Func(fd) => prog.funcs.push(fd),
                        TopDecl::Proto(p) => prog.protos.push(p),
                    }
                } else {
                    self.pos = saved;
                    let gd = self.parse_global_decl(false)?;
                    prog.globals.push(gd);
                }
                continue;
            }

            self.parse_func_or_global(false, &mut prog)?;
        }

        prog.structs = self.structs.clone();
        debug!(
            structs = prog.structs.len(),
            funcs = prog.funcs.len(),
            globals = prog.globals.len(),
            protos = prog.protos.len(),
            "parse complete"
        );
        Ok(prog)
    }

    /// Top-level typedef: struct/union (with optional body), enum, or a
    /// plain alias (including function-pointer aliases).
    fn parse_top_typedef(&mut self) -> Result<(), String> {
        self.eat_kw("typedef")?;

        if self.check_kw("struct") || self.check_kw("union") {
            let is_union = self.check_kw("union");
            self.advance();

            let mut tag_name: Option<String> = None;
            if self.check_kind(TokKind::Ident) {
                tag_name = Some(self.advance().text);
            }

            if self.check_op("{") {
                self.eat_op("{")?;
                let fields = self.parse_field_list()?;
                self.eat_op("}")?;
                let tag = match tag_name.clone() {
                    Some(t) => t,
                    None => self.synth_anon_name(),
                };
                self.register_struct(&tag, fields, is_union);
                tag_name = Some(tag);
            }

            while self.check_op("*") {
                self.advance();
                self.skip_qualifiers();
            }
            if self.check_kind(TokKind::Ident) {
                let alias = self.advance().text;
                self.add_typedef(&alias, tag_name.as_deref(), false);
            }
            return self.eat_op(";");
        }

        if self.check_kw("enum") {
            self.eat_kw("enum")?;
            if self.check_kind(TokKind::Ident) {
                self.advance();
            }
            if self.check_op("{") {
                self.eat_op("{")?;
                let mut value: i64 = 0;
                while !self.check_op("}") {
                    if self.at_end() {
                        return Err("parser: unexpected end of input in enum".to_string());
                    }
                    let name = self.eat(TokKind::Ident, None)?.text;
                    if self.check_op("=") {
                        self.eat_op("=")?;
                        value = self.parse_const_expr()?;
                    }
                    self.enum_consts.push((name, value));
                    value += 1;
                    if self.check_op(",") {
                        self.eat_op(",")?;
                    }
                }
                self.eat_op("}")?;
            }
            if self.check_kind(TokKind::Ident) {
                let alias = self.advance().text;
                self.add_typedef(&alias, None, false);
            }
            return self.eat_op(";");
        }

        // typedef <base> [*]* Name; possibly a function-pointer alias
        let mut stype = self.parse_base_type()?;
        let mut td_is_char = self.last_type_is_char;

        if self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            let alias = self.eat(TokKind::Ident, None)?.text;
            self.eat_op(")")?;
            self.skip_param_list()?;
            self.eat_op(";")?;
            self.add_typedef(&alias, None, false);
            return Ok(());
        }

        while self.check_op("*") {
            self.advance();
            self.skip_qualifiers();
            // A pointer alias is just a pointer, not the pointee type
            stype = None;
            td_is_char = false;
        }
        if self.is_funcptr_decl() {
            self.eat_op("(")?;
            self.eat_op("*")?;
            let alias = self.eat(TokKind::Ident, None)?.text;
            self.eat_op(")")?;
            self.skip_param_list()?;
            self.eat_op(";")?;
            self.add_typedef(&alias, None, false);
            return Ok(());
        }

        let alias = self.eat(TokKind::Ident, None)?.text;
        if self.check_op("[") {
            self.eat_op("[")?;
            if !self.check_op("]") {
                self.parse_const_expr()?;
            }
            self.eat_op("]")?;
        }
        self.eat_op(";")?;
        self.add_typedef(&alias, stype.as_deref(), td_is_char);
        Ok(())
    }
}

/// Decoded byte length of a raw string lexeme plus the NUL terminator.
/// Used for inferring `char s[] = "..."` array lengths.
fn decoded_string_len(raw: &str) -> i64 {
    let bytes = raw.as_bytes();
    let mut n: i64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 1;
            // Hex and octal escapes count as one byte
            if bytes[i] == b'x' {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                n += 1;
                continue;
            }
            if bytes[i].is_ascii_digit() {
                let mut k = 0;
                while k < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    i += 1;
                    k += 1;
                }
                n += 1;
                continue;
            }
        }
        i += 1;
        n += 1;
    }
    n + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(src: &str) -> Program {
        let toks = tokenize(src).unwrap();
        Parser::new(toks).parse().unwrap()
    }

    fn parser_for(src: &str) -> Parser {
        Parser::new(tokenize(src).unwrap())
    }

    #[test]
    fn test_simple_function() {
        let prog = parse_src("int main() { return 3 + 4 * 2; }");
        assert_eq!(prog.funcs.len(), 1);
        let f = &prog.funcs[0];
        assert_eq!(f.name, "main");
        // Multiplication binds tighter than addition
        match &f.body.stmts[0] {
            Stmt::Return(Expr::Binary { op, rhs, .. }) => {
                assert_eq!(op, "+");
                assert!(matches!(rhs.as_ref(), Expr::Binary { op, .. } if op == "*"));
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_parser_determinism() {
        let src = "struct P { int x; int y; }; int main() { struct P p; p.x = 7; return p.x; }";
        assert_eq!(parse_src(src), parse_src(src));
    }

    #[test]
    fn test_compound_assign_desugars() {
        let prog = parse_src("int main() { int x; x += 3; return x; }");
        match &prog.funcs[0].body.stmts[1] {
            Stmt::Expr(Expr::Assign { rhs, .. }) => {
                assert!(matches!(rhs.as_ref(), Expr::Binary { op, .. } if op == "+"));
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_prefix_inc_desugars() {
        let prog = parse_src("int main() { int x; ++x; return x; }");
        assert!(matches!(
            &prog.funcs[0].body.stmts[1],
            Stmt::Expr(Expr::Assign { .. })
        ));
    }

    #[test]
    fn test_struct_registration() {
        let prog = parse_src("struct P { int x; int y; }; int main() { return 0; }");
        let sd = prog.find_struct("P").unwrap();
        assert_eq!(sd.fields, vec!["x", "y"]);
        assert!(!sd.is_union);
    }

    #[test]
    fn test_field_resolution_local() {
        let prog = parse_src("struct P { int x; }; int main() { struct P p; return p.x; }");
        match &prog.funcs[0].body.stmts[1] {
            Stmt::Return(Expr::Field { struct_type, .. }) => assert_eq!(struct_type, "P"),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_field_resolution_chained() {
        let src = "struct In { int v; }; struct Out { struct In in; }; \
                   int main() { struct Out o; return o.in.v; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[1] {
            Stmt::Return(Expr::Field {
                struct_type, obj, ..
            }) => {
                assert_eq!(struct_type, "In");
                assert!(
                    matches!(obj.as_ref(), Expr::Field { struct_type, .. } if struct_type == "Out")
                );
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_field_resolution_unknown_sentinel() {
        let prog = parse_src("int main(int argc, int *argv) { return argv->x; }");
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Return(Expr::Arrow { struct_type, .. }) => {
                assert_eq!(struct_type, UNKNOWN_STRUCT);
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_cast_struct_resolution() {
        let src = "struct S { int a; int b; }; int main(int *p) { return ((struct S*)p)->b; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Return(Expr::Arrow { struct_type, .. }) => assert_eq!(struct_type, "S"),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_bitfield_packing() {
        let src = "struct B { int a:3; int b:5; int c; };";
        let prog = parse_src(src);
        let sd = prog.find_struct("B").unwrap();
        assert!(sd.has_bitfields());
        // a and b share word 0; c flushes to its own word
        assert_eq!(sd.word_indices, vec![0, 0, 1]);
        assert_eq!(sd.bit_offsets[0], 0);
        assert_eq!(sd.bit_offsets[1], 3);
        assert_eq!(sd.nwords, 2);
    }

    #[test]
    fn test_bitfield_overflow_starts_new_word() {
        let src = "struct B { int a:60; int b:10; };";
        let prog = parse_src(src);
        let sd = prog.find_struct("B").unwrap();
        assert_eq!(sd.word_indices, vec![0, 1]);
        assert_eq!(sd.nwords, 2);
    }

    #[test]
    fn test_struct_nslots_recursive() {
        let src = "struct In { int a; int b; }; struct Out { struct In x; int y; };";
        let mut p = parser_for(src);
        p.parse().unwrap();
        assert_eq!(p.struct_nslots("In"), 2);
        assert_eq!(p.struct_nslots("Out"), 3);
        assert_eq!(p.struct_nslots("NoSuch"), 1);
    }

    #[test]
    fn test_union_nslots_is_max() {
        let src = "struct Big { int a; int b; int c; }; \
                   union U { struct Big big; int small; };";
        let mut p = parser_for(src);
        p.parse().unwrap();
        assert_eq!(p.struct_nslots("U"), 3);
    }

    #[test]
    fn test_enum_constants() {
        let src = "enum { A, B, C = 10, D }; int main() { return D; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Return(Expr::Num(11)) => {}
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_typedef_struct() {
        let src = "typedef struct Node { int v; } Node; int main() { Node n; n.v = 1; return n.v; }";
        let prog = parse_src(src);
        assert!(prog.find_struct("Node").is_some());
        match &prog.funcs[0].body.stmts[2] {
            Stmt::Return(Expr::Field { struct_type, .. }) => assert_eq!(struct_type, "Node"),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_designated_initializer() {
        let src = "struct P { int x; int y; }; int main() { struct P p = { .y = 2, .x = 1 }; return p.x; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::VarDecl(entries) => match &entries[0].init {
                Some(Expr::InitList { desig_indices, .. }) => {
                    assert_eq!(desig_indices.as_ref().unwrap(), &vec![1, 0]);
                }
                other => panic!("unexpected init {:?}", other),
            },
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_unknown_designator_is_error() {
        let src = "struct P { int x; }; int main() { struct P p = { .nope = 1 }; return 0; }";
        let toks = tokenize(src).unwrap();
        assert!(Parser::new(toks).parse().is_err());
    }

    #[test]
    fn test_char_array_string_init_length() {
        let src = "int main() { char s[] = \"ab\\n\"; return 0; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::VarDecl(entries) => assert_eq!(entries[0].array_len, 4),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_two_dim_array_flattens() {
        let prog = parse_src("int main() { int grid[3][4]; return 0; }");
        match &prog.funcs[0].body.stmts[0] {
            Stmt::VarDecl(entries) => {
                assert_eq!(entries[0].array_len, 12);
                assert_eq!(entries[0].inner_dim2, 4);
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_dangling_else_binds_inner() {
        let src = "int main(int a, int b) { if (a) if (b) return 1; else return 2; return 3; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::If {
                then_blk, else_blk, ..
            } => {
                assert!(else_blk.is_none());
                match &then_blk.stmts[0] {
                    Stmt::If { else_blk, .. } => assert!(else_blk.is_some()),
                    other => panic!("unexpected inner {:?}", other),
                }
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_switch_with_prelude() {
        let src = "int main(int x) { switch (x) { int tmp; case 1: tmp = 2; return tmp; default: return 0; } }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Switch { cases, .. } => {
                assert_eq!(cases.len(), 2);
                assert_eq!(cases[0].value, Some(1));
                // Prelude declaration lands at the head of the first case
                assert!(matches!(cases[0].stmts[0], Stmt::VarDecl(_)));
                assert_eq!(cases[1].value, None);
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_switch_case_const_expr() {
        let src = "enum { BASE = 4 }; int main(int x) { switch (x) { case BASE + 1: return 1; } return 0; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Switch { cases, .. } => assert_eq!(cases[0].value, Some(5)),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_goto_and_label() {
        let prog = parse_src("int main() { goto done; done: return 1; }");
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Goto(l) if l == "done"));
        assert!(matches!(&prog.funcs[0].body.stmts[1], Stmt::Label { name, .. } if name == "done"));
    }

    #[test]
    fn test_proto_vs_def_vs_global() {
        let src = "int helper(int a); int g = 5; int helper(int a) { return a; }";
        let prog = parse_src(src);
        assert_eq!(prog.protos.len(), 1);
        assert_eq!(prog.globals.len(), 1);
        assert_eq!(prog.funcs.len(), 1);
        assert_eq!(prog.globals[0].init, Some(Expr::Num(5)));
    }

    #[test]
    fn test_variadic_proto() {
        let prog = parse_src("int printf(char *fmt, ...); int main() { return 0; }");
        assert!(prog.protos[0].is_variadic);
        assert_eq!(prog.protos[0].nparams, 1);
    }

    #[test]
    fn test_extern_decl() {
        let prog = parse_src("extern int errno; int main() { return errno; }");
        assert!(prog.globals[0].is_extern);
    }

    #[test]
    fn test_offsetof_pattern_is_zero() {
        let src = "struct S { int a; int b; }; enum { OFF = &((struct S*)0)->b }; int main() { return OFF; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::Return(Expr::Num(0)) => {}
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_sizeof_char_is_one() {
        let prog = parse_src("int main() { return sizeof(char); }");
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(1))));
    }

    #[test]
    fn test_sizeof_int_is_eight_in_expr() {
        // Expression-context sizeof keeps the uniform slot story
        let prog = parse_src("int main() { return sizeof(int); }");
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(8))));
    }

    #[test]
    fn test_sizeof_struct() {
        let src = "struct P { int x; int y; }; int main() { return sizeof(struct P); }";
        let prog = parse_src(src);
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(16))));
    }

    #[test]
    fn test_sizeof_struct_var_and_deref() {
        let src = "struct P { int x; int y; }; \
                   int main() { struct P p; struct P *q; return sizeof(p) + sizeof(*q); }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[2] {
            Stmt::Return(Expr::Binary { lhs, rhs, .. }) => {
                assert_eq!(lhs.as_ref(), &Expr::Num(16));
                assert_eq!(rhs.as_ref(), &Expr::Num(16));
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_sizeof_plain_local_array() {
        let prog = parse_src("int main() { int arr[4]; return sizeof(arr); }");
        match &prog.funcs[0].body.stmts[1] {
            Stmt::Return(Expr::Num(32)) => {}
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_sizeof_global_bitfield_struct_var() {
        let src = "struct B { int a:3; int b:5; int c; } x; int main() { return sizeof(x); }";
        let prog = parse_src(src);
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(16))));
    }

    #[test]
    fn test_signed_char_is_int_sized() {
        let prog = parse_src("int main() { return sizeof(signed char); }");
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(8))));
    }

    #[test]
    fn test_indirect_call_sentinel() {
        let src = "struct Ops { int (*fn)(int); }; int main() { struct Ops o; return o.fn(3); }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[1] {
            Stmt::Return(Expr::Call { name, args }) => {
                assert_eq!(name, INDIRECT_CALL);
                assert_eq!(args.len(), 2);
                assert!(matches!(&args[0], Expr::Field { .. }));
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_compound_literal() {
        let src = "struct P { int x; int y; }; int main() { struct P p = (struct P){1, 2}; return p.x; }";
        let prog = parse_src(src);
        match &prog.funcs[0].body.stmts[0] {
            Stmt::VarDecl(entries) => {
                assert!(matches!(&entries[0].init, Some(Expr::CompoundLit { .. })));
            }
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_comma_only_in_statement_context() {
        let prog = parse_src("int f(int a, int b) { return a; } int main() { return f(1, 2); }");
        match &prog.funcs[1].body.stmts[0] {
            Stmt::Return(Expr::Call { args, .. }) => assert_eq!(args.len(), 2),
            other => panic!("unexpected stmt {:?}", other),
        }
    }

    #[test]
    fn test_ternary() {
        let prog = parse_src("int main(int x) { return x ? 1 : 2; }");
        assert!(matches!(
            &prog.funcs[0].body.stmts[0],
            Stmt::Return(Expr::Ternary { .. })
        ));
    }

    #[test]
    fn test_parse_error_has_context() {
        let toks = tokenize("int main() { return 1 }").unwrap();
        let err = Parser::new(toks).parse().unwrap_err();
        assert!(err.contains("context:"));
    }

    #[test]
    fn test_hex_numbers() {
        let prog = parse_src("int main() { return 0xFF; }");
        assert!(matches!(&prog.funcs[0].body.stmts[0], Stmt::Return(Expr::Num(255))));
    }

    #[test]
    fn test_funcptr_return_is_opaque_proto() {
        let src = "void (*getsig(int n))(int); int main() { return 0; }";
        let prog = parse_src(src);
        assert_eq!(prog.protos.len(), 1);
        assert_eq!(prog.protos[0].name, "getsig");
        assert!(prog.protos[0].ret_is_ptr);
    }

    #[test]
    fn test_anon_struct_synthesized() {
        let src = "struct Outer { struct { int a; } inner; };";
        let prog = parse_src(src);
        assert!(prog.structs.iter().any(|s| s.name.starts_with("__anon_")));
        let outer = prog.find_struct("Outer").unwrap();
        assert!(outer.field_types[0].as_ref().unwrap().starts_with("__anon_"));
    }

    #[test]
    fn test_multi_declarator_fields() {
        let src = "struct M { int *a, b; int c; };";
        let prog = parse_src(src);
        let sd = prog.find_struct("M").unwrap();
        assert_eq!(sd.fields, vec!["a", "b", "c"]);
    }
}
