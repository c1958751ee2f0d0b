//! Tokenizer for preprocessed C source
//!
//! Consumes cleaned text (no directives, no comments) and produces an indexed
//! token sequence terminated by an `Eof` token whose offset equals the input
//! length. Number lexemes are stored verbatim; value conversion is the
//! parser's job. Character literals are converted to their integer code point
//! and emitted as `Number` tokens. String lexemes keep their escape sequences
//! intact; decoding is the code generator's responsibility.

/// The fixed keyword set. Identifiers are compared against this list; a match
/// emits `Keyword`, anything else `Ident`.
const KEYWORDS: &[&str] = &[
    "int", "return", "if", "else", "while", "for", "break", "continue", "struct", "union", "enum",
    "do", "switch", "case", "default", "goto", "sizeof", "char", "void", "const", "volatile",
    "register", "static", "extern", "unsigned", "signed", "long", "short", "typedef", "inline",
    "_Bool", "bool", "float", "double",
];

/// Two-character operators, matched before single-character ones.
const TWO_CHAR_OPS: &[&str] = &[
    "->", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "<<", ">>", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=",
];

/// Three-character operators take priority over everything else.
const THREE_CHAR_OPS: &[&str] = &["<<=", ">>="];

const SINGLE_CHAR_OPS: &str = "+-*/%<>=!&|^~.;,(){}[]?:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokKind {
    Number,
    Ident,
    String,
    Keyword,
    Op,
    Eof,
}

/// A token with its source byte offset for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub text: String,
    pub pos: usize,
}

impl Token {
    fn new(kind: TokKind, text: String, pos: usize) -> Token {
        Token { kind, text, pos }
    }
}

pub fn tokkind_str(kind: TokKind) -> &'static str {
    match kind {
        TokKind::Number => "NUMBER",
        TokKind::Ident => "ID",
        TokKind::String => "STRING",
        TokKind::Keyword => "KW",
        TokKind::Op => "OP",
        TokKind::Eof => "EOF",
    }
}

fn is_keyword(s: &str) -> bool {
    KEYWORDS.contains(&s)
}

/// Decode one escape sequence starting after the backslash.
/// Returns the code point and the number of bytes consumed.
fn decode_escape(bytes: &[u8], i: usize) -> Result<(i64, usize), String> {
    let b = *bytes
        .get(i)
        .ok_or_else(|| format!("lexer: dangling escape at byte {}", i))?;
    match b {
        b'n' => Ok((10, 1)),
        b't' => Ok((9, 1)),
        b'r' => Ok((13, 1)),
        b'a' => Ok((7, 1)),
        b'b' => Ok((8, 1)),
        b'f' => Ok((12, 1)),
        b'v' => Ok((11, 1)),
        b'\\' => Ok((92, 1)),
        b'\'' => Ok((39, 1)),
        b'"' => Ok((34, 1)),
        b'x' => {
            let mut val: i64 = 0;
            let mut n = 0;
            while let Some(&h) = bytes.get(i + 1 + n) {
                let d = match h {
                    b'0'..=b'9' => (h - b'0') as i64,
                    b'a'..=b'f' => (h - b'a' + 10) as i64,
                    b'A'..=b'F' => (h - b'A' + 10) as i64,
                    _ => break,
                };
                val = val * 16 + d;
                n += 1;
            }
            if n == 0 {
                return Err(format!("lexer: \\x with no hex digits at byte {}", i));
            }
            Ok((val, 1 + n))
        }
        b'0'..=b'7' => {
            // Octal, one to three digits
            let mut val: i64 = 0;
            let mut n = 0;
            while n < 3 {
                match bytes.get(i + n) {
                    Some(&d @ b'0'..=b'7') => {
                        val = val * 8 + (d - b'0') as i64;
                        n += 1;
                    }
                    _ => break,
                }
            }
            Ok((val, n))
        }
        other => Err(format!(
            "lexer: unsupported escape '\\{}' at byte {}",
            other as char, i
        )),
    }
}

/// Tokenize cleaned source text.
pub fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Number: decimal, or 0x/0X hex. Stored verbatim.
        if c.is_ascii_digit() {
            let start = i;
            if c == b'0' && i + 1 < len && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X') {
                i += 2;
                while i < len && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
            } else {
                while i < len && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            toks.push(Token::new(
                TokKind::Number,
                src[start..i].to_string(),
                start,
            ));
            continue;
        }

        // Identifier or keyword
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let text = &src[start..i];
            let kind = if is_keyword(text) {
                TokKind::Keyword
            } else {
                TokKind::Ident
            };
            toks.push(Token::new(kind, text.to_string(), start));
            continue;
        }

        // Character literal: converted to its code point, emitted as Number
        if c == b'\'' {
            let start = i;
            i += 1;
            if i >= len {
                return Err(format!("lexer: unterminated char literal at byte {}", start));
            }
            let val = if bytes[i] == b'\\' {
                let (v, consumed) = decode_escape(bytes, i + 1)?;
                i += 1 + consumed;
                v
            } else {
                let v = bytes[i] as i64;
                i += 1;
                v
            };
            if i >= len || bytes[i] != b'\'' {
                return Err(format!("lexer: unterminated char literal at byte {}", start));
            }
            i += 1;
            toks.push(Token::new(TokKind::Number, val.to_string(), start));
            continue;
        }

        // String literal: stored without quotes, escapes kept verbatim.
        // Adjacent literals are not concatenated.
        if c == b'"' {
            let start = i;
            i += 1;
            while i < len && bytes[i] != b'"' {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            if i >= len {
                return Err(format!(
                    "lexer: unterminated string literal at byte {}",
                    start
                ));
            }
            let text = src[start + 1..i].to_string();
            i += 1;
            toks.push(Token::new(TokKind::String, text, start));
            continue;
        }

        // Operators, longest match first
        if i + 2 < len && THREE_CHAR_OPS.contains(&&src[i..i + 3]) {
            toks.push(Token::new(TokKind::Op, src[i..i + 3].to_string(), i));
            i += 3;
            continue;
        }
        if i + 1 < len && TWO_CHAR_OPS.contains(&&src[i..i + 2]) {
            toks.push(Token::new(TokKind::Op, src[i..i + 2].to_string(), i));
            i += 2;
            continue;
        }
        if SINGLE_CHAR_OPS.contains(c as char) {
            toks.push(Token::new(TokKind::Op, (c as char).to_string(), i));
            i += 1;
            continue;
        }

        return Err(format!(
            "lexer: unexpected character '{}' at byte {}",
            c as char, i
        ));
    }

    toks.push(Token::new(TokKind::Eof, String::new(), len));
    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        tokenize(src).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        let toks = tokenize("int main() { return 42; }").unwrap();
        assert_eq!(toks[0].kind, TokKind::Keyword);
        assert_eq!(toks[0].text, "int");
        assert_eq!(toks[1].kind, TokKind::Ident);
        assert_eq!(toks[1].text, "main");
        assert_eq!(toks.last().unwrap().kind, TokKind::Eof);
        assert_eq!(toks.last().unwrap().pos, 25);
    }

    #[test]
    fn test_hex_number_verbatim() {
        let toks = tokenize("0xFF 0X10 123").unwrap();
        assert_eq!(toks[0].text, "0xFF");
        assert_eq!(toks[1].text, "0X10");
        assert_eq!(toks[2].text, "123");
        assert!(toks[..3].iter().all(|t| t.kind == TokKind::Number));
    }

    #[test]
    fn test_char_literals_become_numbers() {
        let toks = tokenize("'a' '\\n' '\\0' '\\x41' '\\101'").unwrap();
        let vals: Vec<&str> = toks[..5].iter().map(|t| t.text.as_str()).collect();
        assert_eq!(vals, ["97", "10", "0", "65", "65"]);
        assert!(toks[..5].iter().all(|t| t.kind == TokKind::Number));
    }

    #[test]
    fn test_string_keeps_escapes() {
        let toks = tokenize(r#""hi\n\t""#).unwrap();
        assert_eq!(toks[0].kind, TokKind::String);
        assert_eq!(toks[0].text, "hi\\n\\t");
    }

    #[test]
    fn test_operator_priority() {
        let toks = tokenize("a <<= b >> c->d").unwrap();
        let ops: Vec<&str> = toks
            .iter()
            .filter(|t| t.kind == TokKind::Op)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, ["<<=", ">>", "->"]);
    }

    #[test]
    fn test_compound_assign_ops() {
        let toks = tokenize("x += 1; y %= 2; z ^= 3;").unwrap();
        let ops: Vec<&str> = toks
            .iter()
            .filter(|t| t.kind == TokKind::Op && t.text != ";")
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, ["+=", "%=", "^="]);
    }

    #[test]
    fn test_keywords_vs_idents() {
        assert_eq!(
            kinds("do dot switch switcher"),
            vec![
                TokKind::Keyword,
                TokKind::Ident,
                TokKind::Keyword,
                TokKind::Ident,
                TokKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(tokenize("\"abc").is_err());
        assert!(tokenize("'a").is_err());
    }

    #[test]
    fn test_unexpected_byte_is_error() {
        let err = tokenize("int @").unwrap_err();
        assert!(err.contains('@'));
    }

    // Lexer round-trip: joining lexemes with spaces re-lexes to the same
    // kinds and texts (string literals need their quotes restored).
    #[test]
    fn test_round_trip() {
        let src = "int main ( ) { return 3 + 4 * 2 ; }";
        let toks = tokenize(src).unwrap();
        let joined: Vec<String> = toks
            .iter()
            .filter(|t| t.kind != TokKind::Eof)
            .map(|t| match t.kind {
                TokKind::String => format!("\"{}\"", t.text),
                _ => t.text.clone(),
            })
            .collect();
        let relexed = tokenize(&joined.join(" ")).unwrap();
        let a: Vec<(TokKind, &str)> = toks.iter().map(|t| (t.kind, t.text.as_str())).collect();
        let b: Vec<(TokKind, &str)> = relexed.iter().map(|t| (t.kind, t.text.as_str())).collect();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()).take(a.len() - 1) {
            assert_eq!(x, y);
        }
    }
}
