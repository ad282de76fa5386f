//! Assembly to bytecode compiler CLI.
//!
//! Reads assembly source files and writes a program artifact.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [OPTIONS]
//! ```
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-r, --raw`: Write bare code words without the artifact header
//! - `-l, --listing`: Print a disassembly of the result
//!
//! # Examples
//! ```text
//! assembler program.asm
//! assembler program.asm -o output.bin -l
//! ```

use stackvm::virtual_machine::assembler::assemble_file;
use stackvm::virtual_machine::disasm::{VerifyOptions, listing, verify_program};
use stackvm::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut raw = false;
    let mut show_listing = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--raw" | "-r" => {
                raw = true;
                i += 1;
            }
            "--listing" | "-l" => {
                show_listing = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    if !Path::new(input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    // Diagnostics with source context are logged by the assembler itself.
    let program = match assemble_file(input_path) {
        Ok(p) => p,
        Err(_) => process::exit(1),
    };

    let report = verify_program(&program, &VerifyOptions::default());
    for issue in &report.issues {
        warn!("{}", issue);
    }

    let bytecode = if raw {
        program.code_bytes()
    } else {
        program.to_bytes()
    };

    if let Err(e) = fs::write(&output_path, &bytecode) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} words, {} bytes)",
        input_path,
        output_path,
        program.code.len(),
        bytecode.len()
    );

    if show_listing {
        println!("{}", listing(&program, None));
    }
}

const USAGE: &str = "\
Assembly Compiler

USAGE:
    {program} <input.asm> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>     Output file path (defaults to <input>.bin)
    -r, --raw               Write bare code words without the artifact header
    -l, --listing           Print a disassembly of the compiled program
    -h, --help              Print this help message

EXAMPLES:
    # Compile to default output name
    {program} program.asm

    # Compile with explicit output and show the listing
    {program} program.asm -o output.bin -l
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
