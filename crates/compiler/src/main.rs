//! cc driver
//!
//! Command-line front end: compiles `.c` inputs to objects through the
//! library pipeline and links with the external toolchain. Exit codes:
//! 0 success, 1 fatal diagnostic, 2 usage error.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{generate, Shell};
use slotcc::DriverConfig;
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "cc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Small C compiler targeting Apple ARM64", long_about = None)]
struct Cli {
    /// Compile only: emit one .o per input, no linking
    #[arg(short = 'c')]
    compile_only: bool,

    /// Output path (defaults to a.out when linking, <input>.o with -c)
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Predefine a macro: NAME or NAME=VALUE (value defaults to 1)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    defines: Vec<String>,

    /// Additional include search directories
    #[arg(short = 'I', value_name = "DIR")]
    include_dirs: Vec<PathBuf>,

    /// Keep the intermediate .s file next to each input
    #[arg(long)]
    keep_asm: bool,

    /// Load driver configuration from a TOML file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Generate shell completion scripts and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,

    /// Input files: .c sources and .o objects
    inputs: Vec<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "cc", &mut io::stdout());
        return;
    }

    let config = build_config(&cli);

    if cli.inputs.is_empty() {
        eprintln!("Usage: cc [-c] [-o <output>] [-D<name>[=<value>]]... <input>.c ...");
        process::exit(2);
    }

    let mut c_files = Vec::new();
    let mut o_files = Vec::new();
    for input in &cli.inputs {
        match input.extension().and_then(|e| e.to_str()) {
            Some("c") => c_files.push(input.clone()),
            Some("o") => o_files.push(input.clone()),
            _ => {
                eprintln!("cc: unrecognized input file: {}", input.display());
                process::exit(2);
            }
        }
    }

    if cli.compile_only {
        run_compile_only(&c_files, cli.output.as_deref(), &config);
    } else {
        run_link(&c_files, &o_files, cli.output.as_deref(), &config);
    }
}

fn build_config(cli: &Cli) -> DriverConfig {
    let mut config = match &cli.config {
        Some(path) => {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("cc: cannot read config {}: {}", path.display(), e);
                    process::exit(1);
                }
            };
            match DriverConfig::from_toml(&content) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("cc: {}", e);
                    process::exit(1);
                }
            }
        }
        None => DriverConfig::new(),
    };
    // Command-line settings go on top of the file
    config.merge(DriverConfig {
        include_paths: cli.include_dirs.clone(),
        defines: cli.defines.clone(),
        keep_asm: cli.keep_asm,
    });
    config
}

fn run_compile_only(c_files: &[PathBuf], output: Option<&std::path::Path>, config: &DriverConfig) {
    if c_files.is_empty() {
        eprintln!("cc: no source files to compile");
        process::exit(2);
    }
    if output.is_some() && c_files.len() > 1 {
        eprintln!("cc: -o is not permitted with -c and multiple inputs");
        process::exit(2);
    }
    for input in c_files {
        let obj = match output {
            Some(o) if c_files.len() == 1 => o.to_path_buf(),
            _ => slotcc::object_path_for(input),
        };
        if let Err(e) = slotcc::compile_c_to_object(input, &obj, config) {
            eprintln!("cc: {}", e);
            process::exit(1);
        }
        eprintln!("Compiled {} -> {}", input.display(), obj.display());
    }
}

fn run_link(
    c_files: &[PathBuf],
    o_files: &[PathBuf],
    output: Option<&std::path::Path>,
    config: &DriverConfig,
) {
    let out_path = output
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("a.out"));

    let mut objects = Vec::new();
    for input in c_files {
        let obj = slotcc::object_path_for(input);
        if let Err(e) = slotcc::compile_c_to_object(input, &obj, config) {
            eprintln!("cc: {}", e);
            process::exit(1);
        }
        eprintln!("Compiled {} -> {}", input.display(), obj.display());
        objects.push(obj);
    }
    objects.extend(o_files.iter().cloned());

    if objects.is_empty() {
        eprintln!("cc: nothing to link");
        process::exit(2);
    }
    if let Err(e) = slotcc::link_objects(&objects, &out_path) {
        eprintln!("cc: {}", e);
        process::exit(1);
    }
    eprintln!("Linked -> {}", out_path.display());
}
