//! slotcc compiler library
//!
//! A small, self-contained C compiler targeting Apple ARM64 (AArch64,
//! Mach-O) assembly. The pipeline is four stages, each consuming the
//! previous stage's output:
//!
//! preprocessor -> lexer -> parser -> code generator
//!
//! All compilation state lives in explicit per-compilation values, so the
//! compiler can be driven as a library:
//!
//! ```rust,ignore
//! use slotcc::{compile_to_asm, DriverConfig};
//!
//! let asm = compile_to_asm("int main() { return 42; }", &DriverConfig::new())?;
//! assert!(asm.contains("_main:"));
//! ```
//!
//! The driver functions at the bottom invoke the external `clang`
//! assembler/linker to turn the emitted `.s` text into objects and
//! executables.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod headers;
pub mod lexer;
pub mod parser;
pub mod preprocessor;

pub use ast::Program;
pub use codegen::{CodeGen, CodeGenError};
pub use config::DriverConfig;
pub use lexer::{tokenize, TokKind, Token};
pub use parser::Parser;
pub use preprocessor::Preprocessor;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

/// Cache for the assembler availability check; it runs once per process.
static ASSEMBLER_CHECKED: OnceLock<Result<(), String>> = OnceLock::new();

/// Check that the external assembler/linker is invocable.
fn check_assembler() -> Result<(), String> {
    ASSEMBLER_CHECKED
        .get_or_init(|| {
            let output = Command::new("clang")
                .arg("--version")
                .output()
                .map_err(|e| format!("failed to run clang: {}. Please install clang.", e))?;
            if !output.status.success() {
                return Err(format!(
                    "clang --version failed with exit code {:?}",
                    output.status.code()
                ));
            }
            Ok(())
        })
        .clone()
}

/// Build a preprocessor from the driver configuration: configured include
/// paths first, then the bundled header directory when one is found on disk.
/// (Embedded stub headers remain the fallback of last resort.)
fn build_preprocessor(config: &DriverConfig) -> Preprocessor {
    let mut pp = Preprocessor::new();
    for d in &config.defines {
        pp.define_from_cli(d);
    }
    for p in &config.include_paths {
        pp.add_include_path(p.clone());
    }
    if let Some(dir) = headers::find_include_dir() {
        pp.add_include_path(dir);
    }
    pp
}

/// Compile C source text to Apple ARM64 assembly text.
pub fn compile_to_asm(source: &str, config: &DriverConfig) -> Result<String, String> {
    compile_source(source, None, config)
}

fn compile_source(
    source: &str,
    source_dir: Option<&Path>,
    config: &DriverConfig,
) -> Result<String, String> {
    let mut pp = build_preprocessor(config);
    let cleaned = pp.preprocess(source, source_dir)?;
    let toks = lexer::tokenize(&cleaned)?;
    debug!(tokens = toks.len(), "lexing complete");
    let prog = Parser::new(toks).parse()?;
    let mut cg = CodeGen::new();
    cg.generate(&prog).map_err(|e| e.to_string())
}

/// Compile a `.c` file from disk to assembly text.
pub fn compile_c_file(path: &Path, config: &DriverConfig) -> Result<String, String> {
    let source =
        fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    debug!(input = %path.display(), bytes = source.len(), "compiling");
    compile_source(&source, path.parent(), config)
}

/// Compile a `.c` file to an object file via the external assembler.
/// The intermediate `.s` lands next to the input and is removed afterwards
/// unless the configuration keeps it.
pub fn compile_c_to_object(
    input: &Path,
    output: &Path,
    config: &DriverConfig,
) -> Result<(), String> {
    let asm = compile_c_file(input, config)?;
    let s_path = input.with_extension("s");
    fs::write(&s_path, &asm).map_err(|e| format!("cannot write {}: {}", s_path.display(), e))?;

    let result = assemble(&s_path, output);
    if !config.keep_asm {
        fs::remove_file(&s_path).ok();
    }
    result?;
    debug!(input = %input.display(), output = %output.display(), "assembled");
    Ok(())
}

/// Assemble a `.s` file into an object file.
pub fn assemble(s_path: &Path, o_path: &Path) -> Result<(), String> {
    check_assembler()?;
    let output = Command::new("clang")
        .arg("-c")
        .arg(s_path)
        .arg("-o")
        .arg(o_path)
        .output()
        .map_err(|e| format!("failed to run clang: {}", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "assembler failed for {}:\n{}",
            s_path.display(),
            stderr
        ));
    }
    Ok(())
}

/// Link object files into an executable.
pub fn link_objects(objects: &[PathBuf], output: &Path) -> Result<(), String> {
    check_assembler()?;
    let mut clang = Command::new("clang");
    for o in objects {
        clang.arg(o);
    }
    clang.arg("-o").arg(output);
    let out = clang
        .output()
        .map_err(|e| format!("failed to run clang: {}", e))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(format!("linking failed:\n{}", stderr));
    }
    debug!(output = %output.display(), objects = objects.len(), "linked");
    Ok(())
}

/// Default object path for an input: the input with a `.o` extension.
pub fn object_path_for(input: &Path) -> PathBuf {
    input.with_extension("o")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_to_asm_minimal() {
        let asm = compile_to_asm("int main() { return 0; }", &DriverConfig::new()).unwrap();
        assert!(asm.contains("\t.text"));
        assert!(asm.contains("_main:"));
        assert!(asm.contains("\tret"));
    }

    #[test]
    fn test_compile_with_defines() {
        let mut cfg = DriverConfig::new();
        cfg.defines.push("ANSWER=41".to_string());
        let asm = compile_to_asm("int main() { return ANSWER + 1; }", &cfg).unwrap();
        assert!(asm.contains("\tmov\tx0, #41"));
    }

    #[test]
    fn test_compile_with_embedded_header() {
        let src = "#include <stdio.h>\nint main() { printf(\"ok\\n\"); return 0; }";
        let asm = compile_to_asm(src, &DriverConfig::new()).unwrap();
        assert!(asm.contains("\tbl\t_printf"));
        assert!(asm.contains("\t.asciz\t\"ok\\n\""));
    }

    #[test]
    fn test_error_carries_stage_tag() {
        let err = compile_to_asm("#error nope\nint main(){return 0;}", &DriverConfig::new())
            .unwrap_err();
        assert!(err.starts_with("preprocessor:"));
        let err = compile_to_asm("int main() { return $; }", &DriverConfig::new()).unwrap_err();
        assert!(err.starts_with("lexer:"));
        let err = compile_to_asm("int main() { return 1 }", &DriverConfig::new()).unwrap_err();
        assert!(err.starts_with("parser:"));
        let err = compile_to_asm("int main() { return nope; }", &DriverConfig::new()).unwrap_err();
        assert!(err.starts_with("codegen:"));
    }

    #[test]
    fn test_compile_c_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let main_c = dir.path().join("main.c");
        let util_h = dir.path().join("util.h");
        std::fs::write(&util_h, "#define SEVEN 7\n").unwrap();
        std::fs::write(&main_c, "#include \"util.h\"\nint main() { return SEVEN; }\n").unwrap();
        let asm = compile_c_file(&main_c, &DriverConfig::new()).unwrap();
        assert!(asm.contains("\tmov\tx0, #7"));
    }

    #[test]
    fn test_object_path() {
        assert_eq!(object_path_for(Path::new("dir/foo.c")), Path::new("dir/foo.o"));
    }
}
