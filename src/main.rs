//! Command-line front end for the stack VM.
//!
//! # Usage
//! ```text
//! stackvm <command> <program> [OPTIONS]
//! ```
//!
//! `<program>` is either assembly source (`.asm`) or a compiled artifact.
//!
//! # Commands
//! - `run`: Execute the program and print the value left on the stack
//! - `disasm`: Print a disassembly listing
//! - `verify`: Check encoding, jump targets and constant references
//! - `dump`: Execute the program and print a core dump of the final state
//!
//! # Options
//! - `--trace`: Log every executed instruction
//! - `--debug`: Log calls, returns and lifecycle events
//! - `--stats`: Print execution statistics and the fault summary
//! - `--max-steps <n>`: Abort after `n` cycles
//! - `--no-gc`: Disable reference counting
//! - `--verbose`: Attach a core dump to unrecovered faults

use stackvm::utils::log::{self, Level};
use stackvm::virtual_machine::assembler::assemble_file;
use stackvm::virtual_machine::config::VMConfig;
use stackvm::virtual_machine::disasm::{VerifyOptions, listing, verify_program};
use stackvm::virtual_machine::errors::VMError;
use stackvm::virtual_machine::program::Program;
use stackvm::virtual_machine::vm::VM;
use stackvm::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 3 && !is_help(&args) { 1 } else { 0 });
    }

    let command = args[1].as_str();
    let input_path = &args[2];
    let mut config = VMConfig::default();
    let mut show_stats = false;
    let mut register_count: Option<u8> = None;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--trace" => {
                config.trace = true;
                log::set_level(Level::Debug);
                i += 1;
            }
            "--debug" => {
                config.debug = true;
                log::set_level(Level::Debug);
                i += 1;
            }
            "--stats" => {
                show_stats = true;
                i += 1;
            }
            "--no-gc" => {
                config.gc_enabled = false;
                i += 1;
            }
            "--verbose" => {
                config.verbose_errors = true;
                i += 1;
            }
            "--max-steps" => {
                i += 1;
                if i >= args.len() {
                    error!("--max-steps requires an argument");
                    process::exit(1);
                }
                let steps = args[i].parse::<u64>().unwrap_or_else(|_| {
                    error!("Invalid step limit: '{}' is not a valid number", args[i]);
                    process::exit(1);
                });
                config.max_steps = Some(steps);
                i += 1;
            }
            "--registers" => {
                i += 1;
                if i >= args.len() {
                    error!("--registers requires an argument");
                    process::exit(1);
                }
                register_count = Some(args[i].parse::<u8>().unwrap_or_else(|_| {
                    error!("Invalid register count: '{}'", args[i]);
                    process::exit(1);
                }));
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let program = load_program(input_path).unwrap_or_else(|e| {
        error!("Failed to load {}: {}", input_path, e);
        process::exit(1);
    });

    match command {
        "run" => run(program, config, show_stats, false),
        "dump" => run(program, config, show_stats, true),
        "disasm" => println!("{}", listing(&program, None)),
        "verify" => {
            let mut options = VerifyOptions::default();
            if let Some(count) = register_count {
                options.register_count = count;
            }
            let report = verify_program(&program, &options);
            if report.is_ok() {
                info!("{}: {} instructions, no issues", input_path, report.instructions);
            } else {
                println!("{report}");
                process::exit(1);
            }
        }
        other => {
            error!("Unknown command: {}\n", other);
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

fn is_help(args: &[String]) -> bool {
    args.get(1).is_some_and(|a| a == "--help" || a == "-h")
}

/// Assembles `.asm` sources; anything else is read as an artifact or raw code.
fn load_program(path: &str) -> Result<Program, VMError> {
    if Path::new(path).extension().is_some_and(|ext| ext == "asm") {
        assemble_file(path)
    } else {
        Program::load(&fs::read(path)?)
    }
}

fn run(program: Program, config: VMConfig, show_stats: bool, dump: bool) {
    let mut vm = VM::new(config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let result = vm.execute(program);

    if dump {
        println!("{}", vm.core_dump());
    }
    if show_stats {
        println!("{}", vm.stats().report());
        println!("{}", vm.monitor().summary());
        let gc = vm.gc_stats();
        println!(
            "gc: allocated {} collected {} live {}",
            gc.allocated, gc.collected, gc.live
        );
    }

    match result {
        Ok(value) => {
            if vm.monitor().handled() > 0 {
                warn!("{} faults recovered during the run", vm.monitor().handled());
            }
            info!("Program halted after {} steps with {}", vm.steps(), value);
        }
        Err(e) => {
            error!("Execution failed: {}", e);
            process::exit(2);
        }
    }
}

const USAGE: &str = "\
Stack VM

USAGE:
    {program} <command> <program> [OPTIONS]

COMMANDS:
    run       Execute the program
    disasm    Print a disassembly listing
    verify    Check the program for encoding and reference errors
    dump      Execute the program and print a core dump

OPTIONS:
    --trace             Log every executed instruction
    --debug             Log calls, returns and lifecycle events
    --stats             Print execution statistics
    --max-steps <n>     Abort after n cycles
    --no-gc             Disable reference counting
    --verbose           Attach a core dump to unrecovered faults
    --registers <n>     Register file size checked by verify
    -h, --help          Print this help message
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
