//! Preprocessor: comments, directives, macro expansion
//!
//! Given source text, an include search path, and command-line macro
//! bindings, produces cleaned text containing no `#`-directives and no
//! comments, with object-like and function-like macros expanded in document
//! order. Conditional compilation (`#if`/`#ifdef`/`#elif`/`#else`/`#endif`)
//! is evaluated with a 32-bit signed constant-expression evaluator.
//!
//! Includes resolve against the including file's directory (quoted form),
//! the configured search paths, and finally the embedded stub headers, so a
//! bare `cc hello.c` works without installed support files.

use crate::headers;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Maximum `#include` nesting before we assume a cycle the header guards
/// failed to break.
const MAX_INCLUDE_DEPTH: usize = 64;

/// Maximum macro-expansion nesting.
const MAX_EXPANSION_DEPTH: usize = 200;

#[derive(Debug, Clone)]
struct MacroDef {
    /// None for object-like macros
    params: Option<Vec<String>>,
    is_variadic: bool,
    body: String,
}

/// One frame of the conditional-compilation stack.
#[derive(Debug, Clone, Copy)]
struct CondFrame {
    /// Whether the enclosing context was emitting text
    parent_active: bool,
    /// Whether any branch of this if-chain has been taken yet
    taken: bool,
    /// Whether the current branch is emitting text
    active: bool,
}

pub struct Preprocessor {
    macros: HashMap<String, MacroDef>,
    include_paths: Vec<PathBuf>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    pub fn new() -> Preprocessor {
        Preprocessor {
            macros: HashMap::new(),
            include_paths: Vec::new(),
        }
    }

    pub fn add_include_path(&mut self, path: PathBuf) {
        self.include_paths.push(path);
    }

    /// Register a `-D` style definition: `NAME` or `NAME=VALUE`.
    /// The value defaults to `1`.
    pub fn define_from_cli(&mut self, spec: &str) {
        let (name, value) = match spec.split_once('=') {
            Some((n, v)) => (n.to_string(), v.to_string()),
            None => (spec.to_string(), "1".to_string()),
        };
        self.macros.insert(
            name,
            MacroDef {
                params: None,
                is_variadic: false,
                body: value,
            },
        );
    }

    /// Preprocess a source file from disk.
    pub fn preprocess_file(&mut self, path: &Path) -> Result<String, String> {
        let src = fs::read_to_string(path)
            .map_err(|e| format!("preprocessor: cannot read {}: {}", path.display(), e))?;
        self.preprocess(&src, path.parent())
    }

    /// Preprocess source text. `current_dir` is the directory of the file the
    /// text came from, used to resolve quoted includes.
    pub fn preprocess(&mut self, src: &str, current_dir: Option<&Path>) -> Result<String, String> {
        let out = self.process(src, current_dir, 0)?;
        debug!(
            macros = self.macros.len(),
            bytes = out.len(),
            "preprocessing complete"
        );
        Ok(out)
    }

    fn process(
        &mut self,
        src: &str,
        current_dir: Option<&Path>,
        depth: usize,
    ) -> Result<String, String> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err("preprocessor: include depth exceeded (missing header guard?)".to_string());
        }

        let stripped = strip_comments(src)?;
        let spliced = splice_lines(&stripped);

        let mut out = String::with_capacity(spliced.len());
        let mut cond_stack: Vec<CondFrame> = Vec::new();

        for (lineno, line) in spliced.lines().enumerate() {
            let active = cond_stack.iter().all(|f| f.active);
            let trimmed = line.trim_start();

            if let Some(rest) = trimmed.strip_prefix('#') {
                let rest = rest.trim_start();
                let (name, args) = split_directive(rest);
                match name {
                    // Conditionals are scanned even inside skipped branches so
                    // nesting stays balanced.
                    "ifdef" | "ifndef" => {
                        let macro_name = args.trim();
                        let defined = self.macros.contains_key(macro_name);
                        let branch = if name == "ifdef" { defined } else { !defined };
                        cond_stack.push(CondFrame {
                            parent_active: active,
                            taken: active && branch,
                            active: active && branch,
                        });
                    }
                    "if" => {
                        let branch = if active {
                            self.eval_condition(args, lineno)? != 0
                        } else {
                            false
                        };
                        cond_stack.push(CondFrame {
                            parent_active: active,
                            taken: active && branch,
                            active: active && branch,
                        });
                    }
                    "elif" => {
                        let (parent_active, taken) = match cond_stack.last() {
                            Some(f) => (f.parent_active, f.taken),
                            None => {
                                return Err(format!(
                                    "preprocessor: #elif without #if at line {}",
                                    lineno + 1
                                ));
                            }
                        };
                        let branch = if parent_active && !taken {
                            self.eval_condition(args, lineno)? != 0
                        } else {
                            false
                        };
                        let frame = cond_stack.last_mut().unwrap();
                        frame.active = parent_active && !taken && branch;
                        frame.taken = taken || frame.active;
                    }
                    "else" => {
                        let frame = cond_stack.last_mut().ok_or_else(|| {
                            format!("preprocessor: #else without #if at line {}", lineno + 1)
                        })?;
                        frame.active = frame.parent_active && !frame.taken;
                        frame.taken = true;
                    }
                    "endif" => {
                        cond_stack.pop().ok_or_else(|| {
                            format!("preprocessor: #endif without #if at line {}", lineno + 1)
                        })?;
                    }
                    // Everything else is suppressed inside a skipped branch.
                    "define" if active => self.handle_define(args, lineno)?,
                    "undef" if active => {
                        self.macros.remove(args.trim());
                    }
                    "include" if active => {
                        let text = self.handle_include(args, current_dir, depth, lineno)?;
                        out.push_str(&text);
                        if !text.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    "error" if active => {
                        return Err(format!(
                            "preprocessor: #error at line {}: {}",
                            lineno + 1,
                            args.trim()
                        ));
                    }
                    // `#pragma` and unknown directives are dropped silently
                    _ => {}
                }
                // Keep the line structure stable for downstream offsets
                out.push('\n');
                continue;
            }

            if active {
                let mut hide = Vec::new();
                let expanded = self.expand_text(line, &mut hide, 0, lineno)?;
                out.push_str(&expanded);
            }
            out.push('\n');
        }

        if !cond_stack.is_empty() {
            return Err("preprocessor: unterminated conditional block".to_string());
        }
        Ok(out)
    }

    // ---- #define ----

    fn handle_define(&mut self, args: &str, lineno: usize) -> Result<(), String> {
        let args = args.trim_start();
        let name_end = args
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(args.len());
        if name_end == 0 {
            return Err(format!(
                "preprocessor: bad #define at line {}: '{}'",
                lineno + 1,
                args
            ));
        }
        let name = args[..name_end].to_string();
        let rest = &args[name_end..];

        // Function-like only when '(' immediately follows the name
        if let Some(after_paren) = rest.strip_prefix('(') {
            let close = after_paren.find(')').ok_or_else(|| {
                format!(
                    "preprocessor: unterminated macro parameter list at line {}",
                    lineno + 1
                )
            })?;
            let mut params = Vec::new();
            let mut is_variadic = false;
            let plist = &after_paren[..close];
            if !plist.trim().is_empty() {
                for p in plist.split(',') {
                    let p = p.trim();
                    if p == "..." {
                        is_variadic = true;
                    } else {
                        params.push(p.to_string());
                    }
                }
            }
            let body = after_paren[close + 1..].trim().to_string();
            self.macros.insert(
                name,
                MacroDef {
                    params: Some(params),
                    is_variadic,
                    body,
                },
            );
        } else {
            let body = rest.trim().to_string();
            self.macros.insert(
                name,
                MacroDef {
                    params: None,
                    is_variadic: false,
                    body,
                },
            );
        }
        Ok(())
    }

    // ---- #include ----

    fn handle_include(
        &mut self,
        args: &str,
        current_dir: Option<&Path>,
        depth: usize,
        lineno: usize,
    ) -> Result<String, String> {
        let args = args.trim();
        let (name, quoted) = if let Some(rest) = args.strip_prefix('"') {
            let end = rest.find('"').ok_or_else(|| {
                format!("preprocessor: bad #include at line {}: {}", lineno + 1, args)
            })?;
            (&rest[..end], true)
        } else if let Some(rest) = args.strip_prefix('<') {
            let end = rest.find('>').ok_or_else(|| {
                format!("preprocessor: bad #include at line {}: {}", lineno + 1, args)
            })?;
            (&rest[..end], false)
        } else {
            return Err(format!(
                "preprocessor: bad #include at line {}: {}",
                lineno + 1,
                args
            ));
        };

        // Quoted form also searches the including file's directory
        let mut candidates: Vec<PathBuf> = Vec::new();
        if quoted {
            if let Some(dir) = current_dir {
                candidates.push(dir.join(name));
            }
        }
        for p in &self.include_paths {
            candidates.push(p.join(name));
        }

        for cand in &candidates {
            if cand.is_file() {
                debug!(header = %cand.display(), "include resolved on disk");
                let src = fs::read_to_string(cand)
                    .map_err(|e| format!("preprocessor: cannot read {}: {}", cand.display(), e))?;
                return self.process(&src, cand.parent(), depth + 1);
            }
        }

        // Fall back to the embedded stub headers
        if let Some(src) = headers::embedded_header(name) {
            debug!(header = name, "include resolved to embedded stub");
            let owned = src.to_string();
            return self.process(&owned, None, depth + 1);
        }

        Err(format!(
            "preprocessor: include file not found at line {}: {}",
            lineno + 1,
            name
        ))
    }

    // ---- Macro expansion ----

    /// Expand all macros in one line of text. Identifier expansion skips the
    /// interior of string and character literals. A macro name that has
    /// already expanded on this path (`hide`) is left alone.
    fn expand_text(
        &self,
        text: &str,
        hide: &mut Vec<String>,
        depth: usize,
        lineno: usize,
    ) -> Result<String, String> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err(format!(
                "preprocessor: macro expansion depth exceeded at line {}",
                lineno + 1
            ));
        }

        let bytes = text.as_bytes();
        let len = bytes.len();
        let mut out = String::with_capacity(len);
        let mut i = 0;

        while i < len {
            let c = bytes[i];

            // String literal: copy verbatim
            if c == b'"' {
                let start = i;
                i += 1;
                while i < len && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i < len {
                    i += 1;
                }
                out.push_str(&text[start..i]);
                continue;
            }
            // Char literal: copy verbatim
            if c == b'\'' {
                let start = i;
                i += 1;
                while i < len && bytes[i] != b'\'' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i < len {
                    i += 1;
                }
                out.push_str(&text[start..i]);
                continue;
            }

            if c.is_ascii_alphabetic() || c == b'_' {
                let start = i;
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let ident = &text[start..i];

                if hide.iter().any(|h| h == ident) {
                    out.push_str(ident);
                    continue;
                }
                let def = match self.macros.get(ident) {
                    Some(d) => d.clone(),
                    None => {
                        out.push_str(ident);
                        continue;
                    }
                };

                match def.params {
                    None => {
                        hide.push(ident.to_string());
                        let expanded = self.expand_text(&def.body, hide, depth + 1, lineno)?;
                        hide.pop();
                        out.push_str(&expanded);
                    }
                    Some(ref params) => {
                        // Function-like: require '(' (else the name is left alone)
                        let mut j = i;
                        while j < len && (bytes[j] as char).is_whitespace() {
                            j += 1;
                        }
                        if j >= len || bytes[j] != b'(' {
                            out.push_str(ident);
                            continue;
                        }
                        let (args, after) = parse_macro_args(text, j, lineno)?;
                        i = after;

                        if !def.is_variadic && args.len() != params.len()
                            && !(params.is_empty() && args.len() == 1 && args[0].trim().is_empty())
                        {
                            return Err(format!(
                                "preprocessor: macro {} expects {} argument(s), got {} at line {}",
                                ident,
                                params.len(),
                                args.len(),
                                lineno + 1
                            ));
                        }

                        let substituted = substitute_params(&def, params, &args);
                        hide.push(ident.to_string());
                        let expanded = self.expand_text(&substituted, hide, depth + 1, lineno)?;
                        hide.pop();
                        out.push_str(&expanded);
                    }
                }
                continue;
            }

            // Skip numbers wholesale so 0x1F's 'F' is not treated as a macro
            if c.is_ascii_digit() {
                let start = i;
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                out.push_str(&text[start..i]);
                continue;
            }

            out.push(c as char);
            i += 1;
        }
        Ok(out)
    }

    // ---- #if evaluation ----

    fn eval_condition(&self, expr: &str, lineno: usize) -> Result<i32, String> {
        // `defined(X)` / `defined X` is resolved before macro expansion
        let resolved = self.resolve_defined(expr);
        let mut hide = Vec::new();
        let expanded = self.expand_text(&resolved, &mut hide, 0, lineno)?;
        let toks = CondLexer::lex(&expanded, lineno)?;
        let mut p = CondParser {
            toks: &toks,
            pos: 0,
            lineno,
        };
        let v = p.ternary()?;
        if p.pos != p.toks.len() {
            return Err(format!(
                "preprocessor: trailing tokens in #if expression at line {}",
                lineno + 1
            ));
        }
        Ok(v)
    }

    fn resolve_defined(&self, expr: &str) -> String {
        let bytes = expr.as_bytes();
        let len = bytes.len();
        let mut out = String::with_capacity(len);
        let mut i = 0;
        while i < len {
            let c = bytes[i];
            if c.is_ascii_alphabetic() || c == b'_' {
                let start = i;
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let ident = &expr[start..i];
                if ident == "defined" {
                    // defined(X) or defined X
                    let mut j = i;
                    while j < len && (bytes[j] as char).is_whitespace() {
                        j += 1;
                    }
                    let parens = j < len && bytes[j] == b'(';
                    if parens {
                        j += 1;
                        while j < len && (bytes[j] as char).is_whitespace() {
                            j += 1;
                        }
                    }
                    let name_start = j;
                    while j < len && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                        j += 1;
                    }
                    let name = &expr[name_start..j];
                    if parens {
                        while j < len && (bytes[j] as char).is_whitespace() {
                            j += 1;
                        }
                        if j < len && bytes[j] == b')' {
                            j += 1;
                        }
                    }
                    out.push_str(if self.macros.contains_key(name) {
                        "1"
                    } else {
                        "0"
                    });
                    i = j;
                } else {
                    out.push_str(ident);
                }
            } else {
                out.push(c as char);
                i += 1;
            }
        }
        out
    }
}

// ---- Text cleanup passes ----

/// Strip `//` and `/* */` comments, preserving newlines inside block comments
/// so line numbers stay meaningful. Skips string and character literals.
fn strip_comments(src: &str) -> Result<String, String> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        if c == b'"' || c == b'\'' {
            let quote = c;
            out.push(c as char);
            i += 1;
            while i < len && bytes[i] != quote {
                if bytes[i] == b'\\' && i + 1 < len {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                if bytes[i] == b'\n' {
                    break;
                }
                out.push(bytes[i] as char);
                i += 1;
            }
            if i < len && bytes[i] == quote {
                out.push(quote as char);
                i += 1;
            }
            continue;
        }
        if c == b'/' && i + 1 < len && bytes[i + 1] == b'/' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && i + 1 < len && bytes[i + 1] == b'*' {
            let start = i;
            i += 2;
            loop {
                if i + 1 >= len {
                    return Err(format!(
                        "preprocessor: unterminated comment starting at byte {}",
                        start
                    ));
                }
                if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    i += 2;
                    break;
                }
                if bytes[i] == b'\n' {
                    out.push('\n');
                }
                i += 1;
            }
            out.push(' ');
            continue;
        }
        out.push(c as char);
        i += 1;
    }
    Ok(out)
}

/// Remove backslash-newline pairs (line continuations).
fn splice_lines(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if chars.peek() == Some(&'\n') {
                chars.next();
                continue;
            }
            if chars.peek() == Some(&'\r') {
                chars.next();
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn split_directive(rest: &str) -> (&str, &str) {
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (&rest[..end], &rest[end..])
}

/// Parse a balanced, parenthesized macro argument list starting at the `(`.
/// Returns the raw argument texts and the index just past the `)`.
fn parse_macro_args(text: &str, open: usize, lineno: usize) -> Result<(Vec<String>, usize), String> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut depth = 1;
    let mut i = open + 1;
    while i < len {
        let c = bytes[i];
        if c == b'"' || c == b'\'' {
            let quote = c;
            cur.push(c as char);
            i += 1;
            while i < len && bytes[i] != quote {
                if bytes[i] == b'\\' && i + 1 < len {
                    cur.push(bytes[i] as char);
                    i += 1;
                }
                cur.push(bytes[i] as char);
                i += 1;
            }
            if i < len {
                cur.push(quote as char);
                i += 1;
            }
            continue;
        }
        match c {
            b'(' => {
                depth += 1;
                cur.push('(');
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    args.push(cur.trim().to_string());
                    return Ok((args, i + 1));
                }
                cur.push(')');
            }
            b',' if depth == 1 => {
                args.push(cur.trim().to_string());
                cur = String::new();
            }
            _ => cur.push(c as char),
        }
        i += 1;
    }
    Err(format!(
        "preprocessor: unterminated macro argument list at line {}",
        lineno + 1
    ))
}

/// Substitute parameters into a function-like macro body, handling
/// stringification (`#param`), token pasting (`##`) and `__VA_ARGS__`.
fn substitute_params(def: &MacroDef, params: &[String], args: &[String]) -> String {
    let arg_for = |name: &str| -> Option<String> {
        if name == "__VA_ARGS__" && def.is_variadic {
            let extra = if args.len() > params.len() {
                args[params.len()..].join(", ")
            } else {
                String::new()
            };
            return Some(extra);
        }
        params
            .iter()
            .position(|p| p == name)
            .map(|idx| args.get(idx).cloned().unwrap_or_default())
    };

    let body = &def.body;
    let bytes = body.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        // Stringify: #param (but not ##)
        if c == b'#' && i + 1 < len && bytes[i + 1] != b'#' && (i == 0 || bytes[i - 1] != b'#') {
            let mut j = i + 1;
            while j < len && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            let start = j;
            while j < len && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if start < j {
                if let Some(arg) = arg_for(&body[start..j]) {
                    out.push('"');
                    for ch in arg.chars() {
                        if ch == '"' || ch == '\\' {
                            out.push('\\');
                        }
                        out.push(ch);
                    }
                    out.push('"');
                    i = j;
                    continue;
                }
            }
            out.push('#');
            i += 1;
            continue;
        }
        if c == b'"' || c == b'\'' {
            let quote = c;
            out.push(c as char);
            i += 1;
            while i < len && bytes[i] != quote {
                if bytes[i] == b'\\' && i + 1 < len {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                out.push(bytes[i] as char);
                i += 1;
            }
            if i < len {
                out.push(quote as char);
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let ident = &body[start..i];
            match arg_for(ident) {
                Some(arg) => out.push_str(&arg),
                None => out.push_str(ident),
            }
            continue;
        }
        out.push(c as char);
        i += 1;
    }

    // Token pasting: remove `##` and the whitespace around it
    if out.contains("##") {
        let parts: Vec<&str> = out.split("##").collect();
        let mut pasted = String::with_capacity(out.len());
        for (idx, part) in parts.iter().enumerate() {
            if idx == 0 {
                pasted.push_str(part.trim_end());
            } else {
                pasted.push_str(part.trim_start());
            }
        }
        return pasted;
    }
    out
}

// ---- #if expression evaluator ----

#[derive(Debug, Clone, PartialEq)]
enum CondTok {
    Num(i32),
    Op(String),
}

struct CondLexer;

impl CondLexer {
    fn lex(expr: &str, lineno: usize) -> Result<Vec<CondTok>, String> {
        let bytes = expr.as_bytes();
        let len = bytes.len();
        let mut toks = Vec::new();
        let mut i = 0;
        while i < len {
            let c = bytes[i];
            if (c as char).is_whitespace() {
                i += 1;
                continue;
            }
            if c.is_ascii_digit() {
                let mut val: i64;
                if c == b'0' && i + 1 < len && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X') {
                    i += 2;
                    val = 0;
                    while i < len && bytes[i].is_ascii_hexdigit() {
                        val = val
                            .wrapping_mul(16)
                            .wrapping_add((bytes[i] as char).to_digit(16).unwrap() as i64);
                        i += 1;
                    }
                } else {
                    val = 0;
                    while i < len && bytes[i].is_ascii_digit() {
                        val = val.wrapping_mul(10).wrapping_add((bytes[i] - b'0') as i64);
                        i += 1;
                    }
                }
                // Integer suffixes are accepted and ignored
                while i < len && matches!(bytes[i], b'u' | b'U' | b'l' | b'L') {
                    i += 1;
                }
                toks.push(CondTok::Num(val as i32));
                continue;
            }
            if c.is_ascii_alphabetic() || c == b'_' {
                // Undefined identifiers evaluate to 0
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                toks.push(CondTok::Num(0));
                continue;
            }
            if !c.is_ascii() {
                return Err(format!(
                    "preprocessor: bad byte in #if expression at line {}",
                    lineno + 1
                ));
            }
            let two = if i + 1 < len && bytes[i + 1].is_ascii() {
                &expr[i..i + 2]
            } else {
                ""
            };
            if matches!(two, "&&" | "||" | "==" | "!=" | "<=" | ">=" | "<<" | ">>") {
                toks.push(CondTok::Op(two.to_string()));
                i += 2;
                continue;
            }
            if "+-*/%<>!~&|^()?:".contains(c as char) {
                toks.push(CondTok::Op((c as char).to_string()));
                i += 1;
                continue;
            }
            return Err(format!(
                "preprocessor: bad character '{}' in #if expression at line {}",
                c as char,
                lineno + 1
            ));
        }
        Ok(toks)
    }
}

struct CondParser<'a> {
    toks: &'a [CondTok],
    pos: usize,
    lineno: usize,
}

impl<'a> CondParser<'a> {
    fn peek_op(&self) -> Option<&str> {
        match self.toks.get(self.pos) {
            Some(CondTok::Op(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err(&self, what: &str) -> String {
        format!(
            "preprocessor: {} in #if expression at line {}",
            what,
            self.lineno + 1
        )
    }

    fn ternary(&mut self) -> Result<i32, String> {
        let cond = self.logical_or()?;
        if self.eat_op("?") {
            let then_v = self.ternary()?;
            if !self.eat_op(":") {
                return Err(self.err("missing ':'"));
            }
            let else_v = self.ternary()?;
            return Ok(if cond != 0 { then_v } else { else_v });
        }
        Ok(cond)
    }

    fn logical_or(&mut self) -> Result<i32, String> {
        let mut v = self.logical_and()?;
        while self.eat_op("||") {
            let rhs = self.logical_and()?;
            v = ((v != 0) || (rhs != 0)) as i32;
        }
        Ok(v)
    }

    fn logical_and(&mut self) -> Result<i32, String> {
        let mut v = self.bit_or()?;
        while self.eat_op("&&") {
            let rhs = self.bit_or()?;
            v = ((v != 0) && (rhs != 0)) as i32;
        }
        Ok(v)
    }

    fn bit_or(&mut self) -> Result<i32, String> {
        let mut v = self.bit_xor()?;
        while self.eat_op("|") {
            v |= self.bit_xor()?;
        }
        Ok(v)
    }

    fn bit_xor(&mut self) -> Result<i32, String> {
        let mut v = self.bit_and()?;
        while self.eat_op("^") {
            v ^= self.bit_and()?;
        }
        Ok(v)
    }

    fn bit_and(&mut self) -> Result<i32, String> {
        let mut v = self.equality()?;
        while self.peek_op() == Some("&") {
            self.pos += 1;
            v &= self.equality()?;
        }
        Ok(v)
    }

    fn equality(&mut self) -> Result<i32, String> {
        let mut v = self.relational()?;
        loop {
            if self.eat_op("==") {
                v = (v == self.relational()?) as i32;
            } else if self.eat_op("!=") {
                v = (v != self.relational()?) as i32;
            } else {
                return Ok(v);
            }
        }
    }

    fn relational(&mut self) -> Result<i32, String> {
        let mut v = self.shift()?;
        loop {
            if self.eat_op("<=") {
                v = (v <= self.shift()?) as i32;
            } else if self.eat_op(">=") {
                v = (v >= self.shift()?) as i32;
            } else if self.eat_op("<") {
                v = (v < self.shift()?) as i32;
            } else if self.eat_op(">") {
                v = (v > self.shift()?) as i32;
            } else {
                return Ok(v);
            }
        }
    }

    fn shift(&mut self) -> Result<i32, String> {
        let mut v = self.additive()?;
        loop {
            if self.eat_op("<<") {
                v = v.wrapping_shl(self.additive()? as u32);
            } else if self.eat_op(">>") {
                v = v.wrapping_shr(self.additive()? as u32);
            } else {
                return Ok(v);
            }
        }
    }

    fn additive(&mut self) -> Result<i32, String> {
        let mut v = self.multiplicative()?;
        loop {
            if self.eat_op("+") {
                v = v.wrapping_add(self.multiplicative()?);
            } else if self.eat_op("-") {
                v = v.wrapping_sub(self.multiplicative()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<i32, String> {
        let mut v = self.unary()?;
        loop {
            if self.eat_op("*") {
                v = v.wrapping_mul(self.unary()?);
            } else if self.eat_op("/") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(self.err("division by zero"));
                }
                v = v.wrapping_div(rhs);
            } else if self.eat_op("%") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(self.err("division by zero"));
                }
                v = v.wrapping_rem(rhs);
            } else {
                return Ok(v);
            }
        }
    }

    fn unary(&mut self) -> Result<i32, String> {
        if self.eat_op("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.eat_op("+") {
            return self.unary();
        }
        if self.eat_op("!") {
            return Ok((self.unary()? == 0) as i32);
        }
        if self.eat_op("~") {
            return Ok(!self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i32, String> {
        if self.eat_op("(") {
            let v = self.ternary()?;
            if !self.eat_op(")") {
                return Err(self.err("missing ')'"));
            }
            return Ok(v);
        }
        match self.toks.get(self.pos) {
            Some(CondTok::Num(n)) => {
                self.pos += 1;
                Ok(*n)
            }
            _ => Err(self.err("expected operand")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(src: &str) -> String {
        Preprocessor::new().preprocess(src, None).unwrap()
    }

    #[test]
    fn test_strip_comments() {
        let out = pp("int a; // trailing\nint /* mid */ b;\n");
        assert!(out.contains("int a;"));
        assert!(out.contains("int   b;"));
        assert!(!out.contains("trailing"));
        assert!(!out.contains("mid"));
    }

    #[test]
    fn test_comment_in_string_preserved() {
        let out = pp("char *s = \"no // comment /* here */\";\n");
        assert!(out.contains("no // comment /* here */"));
    }

    #[test]
    fn test_object_macro() {
        let out = pp("#define N 2\nint x = N;\n");
        assert!(out.contains("int x = 2;"));
    }

    #[test]
    fn test_macro_not_expanded_in_string() {
        let out = pp("#define N 2\nchar *s = \"N\"; int x = N;\n");
        assert!(out.contains("\"N\""));
        assert!(out.contains("x = 2"));
    }

    #[test]
    fn test_function_macro() {
        let out = pp("#define SQ(x) ((x) * (x))\nint y = SQ(3 + 1);\n");
        assert!(out.contains("((3 + 1) * (3 + 1))"));
    }

    #[test]
    fn test_stringify_and_paste() {
        let out = pp("#define STR(x) #x\n#define GLUE(a, b) a ## b\nSTR(hello) GLUE(foo, bar)\n");
        assert!(out.contains("\"hello\""));
        assert!(out.contains("foobar"));
    }

    #[test]
    fn test_va_args() {
        let out = pp("#define LOG(fmt, ...) printf(fmt, __VA_ARGS__)\nLOG(\"%d %d\", 1, 2);\n");
        assert!(out.contains("printf(\"%d %d\", 1, 2);"));
    }

    #[test]
    fn test_no_infinite_recursion() {
        let out = pp("#define FOO FOO\nint FOO;\n");
        assert!(out.contains("int FOO;"));
    }

    #[test]
    fn test_if_chain() {
        let src = "#define N 2\n#if N==2\nint a;\n#else\nint b;\n#endif\n";
        let out = pp(src);
        assert!(out.contains("int a;"));
        assert!(!out.contains("int b;"));
    }

    #[test]
    fn test_elif_and_defined() {
        let src = "#if defined(MISSING)\nint a;\n#elif defined MISSING2\nint b;\n#else\nint c;\n#endif\n";
        let out = pp(src);
        assert!(out.contains("int c;"));
        assert!(!out.contains("int a;"));
        assert!(!out.contains("int b;"));
    }

    #[test]
    fn test_nested_skipped_conditionals() {
        let src = "#ifdef MISSING\n#ifdef ALSO_MISSING\nint a;\n#endif\nint b;\n#endif\nint c;\n";
        let out = pp(src);
        assert!(!out.contains("int a;"));
        assert!(!out.contains("int b;"));
        assert!(out.contains("int c;"));
    }

    #[test]
    fn test_error_suppressed_in_skipped_branch() {
        let src = "#ifdef MISSING\n#error should not fire\n#endif\nint ok;\n";
        assert!(pp(src).contains("int ok;"));
    }

    #[test]
    fn test_error_fires_when_active() {
        let err = Preprocessor::new()
            .preprocess("#error boom\n", None)
            .unwrap_err();
        assert!(err.contains("boom"));
    }

    #[test]
    fn test_undef() {
        let out = pp("#define N 2\n#undef N\nint x = N;\n");
        assert!(out.contains("int x = N;"));
    }

    #[test]
    fn test_unterminated_conditional() {
        let err = Preprocessor::new()
            .preprocess("#ifdef X\nint a;\n", None)
            .unwrap_err();
        assert!(err.contains("unterminated conditional"));
    }

    #[test]
    fn test_line_continuation() {
        let out = pp("#define LONG 1 + \\\n 2\nint x = LONG;\n");
        assert!(out.contains("1 +  2"));
    }

    #[test]
    fn test_cli_defines() {
        let mut p = Preprocessor::new();
        p.define_from_cli("DEBUG");
        p.define_from_cli("LEVEL=3");
        let out = p
            .preprocess("#if DEBUG && LEVEL > 2\nint on;\n#endif\n", None)
            .unwrap();
        assert!(out.contains("int on;"));
    }

    #[test]
    fn test_embedded_include() {
        let out = pp("#include <stddef.h>\nint x;\n");
        assert!(out.contains("int x;"));
    }

    #[test]
    fn test_missing_include_is_error() {
        let err = Preprocessor::new()
            .preprocess("#include \"no_such_header.h\"\n", None)
            .unwrap_err();
        assert!(err.contains("no_such_header.h"));
    }

    #[test]
    fn test_unknown_directive_dropped() {
        let out = pp("#pragma once\n#frobnicate\nint x;\n");
        assert!(out.contains("int x;"));
        assert!(!out.contains("pragma"));
    }

    #[test]
    fn test_cond_evaluator_precedence() {
        let p = Preprocessor::new();
        assert_eq!(p.eval_condition("1 + 2 * 3", 0).unwrap(), 7);
        assert_eq!(p.eval_condition("(1 + 2) * 3", 0).unwrap(), 9);
        assert_eq!(p.eval_condition("1 << 4 | 1", 0).unwrap(), 17);
        assert_eq!(p.eval_condition("~0 == -1", 0).unwrap(), 1);
        assert_eq!(p.eval_condition("1 ? 10 : 20", 0).unwrap(), 10);
        assert_eq!(p.eval_condition("0 ? 10 : 20", 0).unwrap(), 20);
        assert_eq!(p.eval_condition("UNDEFINED_NAME + 1", 0).unwrap(), 1);
    }

    #[test]
    fn test_cond_division_by_zero() {
        let p = Preprocessor::new();
        assert!(p.eval_condition("1 / 0", 0).is_err());
    }
}
