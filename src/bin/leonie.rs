// File: src/bin/leonie.rs
//
// Command-line embedder for the Leonie execution core. This is not a
// language front end: it assembles a small line-oriented textual format
// directly into `Instruction`s and runs them through a `Dispatcher`. A real
// host (a HyperCard-style authoring environment) would compile its own
// script language down to the same instructions; this binary exists so the
// core can be exercised and scripted from a shell.

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use leonie::context::Context;
use leonie::dispatcher::Dispatcher;
use leonie::instruction::{Instruction, Opcode, BACK_OF_STACK};
use leonie::script::{script_create, HandlerRef, ScriptBuilder};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "leonie",
    about = "Assembles and runs Leonie bytecode handlers",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Assemble and run a handler
    Run {
        /// Path to the .leo assembly file
        file: PathBuf,
    },

    /// Assemble a handler and report instruction counts without running it
    Check {
        /// Path to the .leo assembly file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => match assemble_file(&file) {
            Ok((script, handler)) => {
                let mut ctx = Context::with_defaults();
                ctx.prepare(script, handler);
                let dispatcher = Dispatcher::new();
                dispatcher.run(&mut ctx);
                match ctx.error() {
                    Some(err) => {
                        eprintln!("{}", err);
                        ExitCode::FAILURE
                    }
                    None => ExitCode::SUCCESS,
                }
            }
            Err(msg) => {
                eprintln!("{} {}", "assembly error:".red().bold(), msg);
                ExitCode::FAILURE
            }
        },
        Commands::Check { file } => match assemble_file(&file) {
            Ok((script, handler)) => {
                println!("{} instructions, {} literal strings", script.handler(handler).instructions().len(), script.literal_strings.len());
                ExitCode::SUCCESS
            }
            Err(msg) => {
                eprintln!("{} {}", "assembly error:".red().bold(), msg);
                ExitCode::FAILURE
            }
        },
    }
}

fn assemble_file(path: &PathBuf) -> Result<(std::sync::Arc<leonie::script::Script>, HandlerRef), String> {
    let text = fs::read_to_string(path).map_err(|e| format!("can't read {}: {}", path.display(), e))?;
    assemble(&text)
}

/// The assembly format: a `.strings` section of double-quoted literals, one
/// per line, followed by a `.handler <name>` section of one instruction per
/// line as `OPCODE_NAME param1 param2`. `param1` is either `back` or a
/// decimal slot index; `param2` is a plain integer for most opcodes, a
/// trailing `f` float literal for `push_number` (bit-encoded to its 32-bit
/// payload), and a signed integer for the jump family.
fn assemble(text: &str) -> Result<(std::sync::Arc<leonie::script::Script>, HandlerRef), String> {
    let mut builder: ScriptBuilder = script_create(0, 0);
    let mut handler: Option<HandlerRef> = None;
    let mut section = Section::None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == ".strings" {
            section = Section::Strings;
            continue;
        }
        if let Some(name) = line.strip_prefix(".handler ") {
            let h = builder.add_command_handler_named(name.trim());
            handler = Some(h);
            section = Section::Instructions;
            continue;
        }

        match section {
            Section::Strings => {
                let literal = parse_quoted(line).ok_or_else(|| format!("line {}: expected a quoted string", lineno + 1))?;
                builder.add_literal_string(literal);
            }
            Section::Instructions => {
                let h = handler.ok_or_else(|| format!("line {}: instruction before any .handler", lineno + 1))?;
                let instr = parse_instruction(line).map_err(|e| format!("line {}: {}", lineno + 1, e))?;
                builder.append_instruction(h, instr);
            }
            Section::None => {
                return Err(format!("line {}: expected .strings or .handler before any content", lineno + 1));
            }
        }
    }

    let handler = handler.ok_or_else(|| "no .handler section found".to_string())?;
    Ok((builder.build(), handler))
}

enum Section {
    None,
    Strings,
    Instructions,
}

fn parse_quoted(line: &str) -> Option<String> {
    let inner = line.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.to_string())
}

fn parse_instruction(line: &str) -> Result<Instruction, String> {
    let mut parts = line.split_whitespace();
    let name = parts.next().ok_or("empty instruction line")?;
    let opcode = opcode_from_name(name).ok_or_else(|| format!("unknown opcode '{}'", name))?;
    let param1_tok = parts.next().unwrap_or("0");
    let param2_tok = parts.next().unwrap_or("0");

    let param1 = if param1_tok.eq_ignore_ascii_case("back") {
        BACK_OF_STACK
    } else {
        param1_tok.parse::<u16>().map_err(|_| format!("bad param1 '{}'", param1_tok))?
    };

    let param2 = match opcode {
        Opcode::PushNumber => {
            let f: f32 = param2_tok.parse().map_err(|_| format!("bad float param2 '{}'", param2_tok))?;
            f.to_bits()
        }
        Opcode::JumpRelative
        | Opcode::JumpRelativeIfTrue
        | Opcode::JumpRelativeIfFalse
        | Opcode::JumpRelativeIfGreaterThanZero
        | Opcode::JumpRelativeIfLessThanZero
        | Opcode::JumpRelativeIfGreaterSameThanZero
        | Opcode::JumpRelativeIfLessSameThanZero => {
            let displacement: i32 = param2_tok.parse().map_err(|_| format!("bad jump displacement '{}'", param2_tok))?;
            displacement as u32
        }
        _ => param2_tok.parse::<u32>().map_err(|_| format!("bad param2 '{}'", param2_tok))?,
    };

    Ok(Instruction::new(opcode.id(), param1, param2))
}

fn opcode_from_name(name: &str) -> Option<Opcode> {
    use Opcode::*;
    Some(match name.to_ascii_lowercase().as_str() {
        "exit_to_top" => ExitToTop,
        "no_op" => NoOp,
        "push_string_from_table" => PushStringFromTable,
        "print" => Print,
        "pop" => Pop,
        "push_boolean" => PushBoolean,
        "assign_string_from_table" => AssignStringFromTable,
        "jump_relative" => JumpRelative,
        "jump_relative_if_true" => JumpRelativeIfTrue,
        "jump_relative_if_false" => JumpRelativeIfFalse,
        "jump_relative_if_gt_zero" => JumpRelativeIfGreaterThanZero,
        "jump_relative_if_lt_zero" => JumpRelativeIfLessThanZero,
        "jump_relative_if_ge_zero" => JumpRelativeIfGreaterSameThanZero,
        "jump_relative_if_le_zero" => JumpRelativeIfLessSameThanZero,
        "push_number" => PushNumber,
        "add_number" => AddNumber,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_and_runs_hello_world() {
        let text = r#"
.strings
"hello world"
.handler mouseUp
push_string_from_table 0 0
print back 0
exit_to_top 0 0
"#;
        let (script, handler) = assemble(text).unwrap();
        let mut ctx = Context::with_defaults();
        ctx.prepare(script, handler);
        Dispatcher::new().run(&mut ctx);
        assert!(ctx.error().is_none());
        assert_eq!(ctx.stack_depth(), 0);
    }

    #[test]
    fn rejects_unknown_opcode_name() {
        let text = ".handler go\nfrobnicate 0 0\n";
        assert!(assemble(text).is_err());
    }
}
