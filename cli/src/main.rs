//! Command-line driver: parse a program, pick a backend, run it, and route
//! the TAC dump.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result, WrapErr};
use tapevm_core::{Backend, Interp, TacBackend, Vm, parse_source};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// Execute the program directly.
    Interp,
    /// Lower the program to three-address code and dump it as Horn clauses.
    Tac,
}

/// tapevm - a small retargetable tape-machine toolchain
#[derive(Parser, Debug)]
#[command(name = "tapevm")]
#[command(about = "Run tape-machine assembly or lower it to TAC", long_about = None)]
struct Args {
    /// Backend to drive the program through
    #[arg(long, value_enum, default_value = "interp")]
    backend: BackendKind,

    /// Where to write the TAC dump: a path, "-" for stdout, or "auto" for
    /// the conventional opt/tmp/raw/<stem>.pl location
    #[arg(long, default_value = "-")]
    emit: String,

    /// Program file ("-" reads from stdin)
    input: PathBuf,
}

fn read_source(input: &Path) -> Result<String> {
    if input.as_os_str() == "-" {
        let mut src = String::new();
        io::stdin()
            .read_to_string(&mut src)
            .into_diagnostic()
            .wrap_err("reading stdin")?;
        Ok(src)
    } else {
        fs::read_to_string(input)
            .into_diagnostic()
            .wrap_err_with(|| format!("reading {}", input.display()))
    }
}

/// The conventional dump location: basename without extension, `.pl`
/// suffix, under opt/tmp/raw.
fn conventional_dump_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s != "-")
        .unwrap_or_else(|| "parsed".to_string());
    PathBuf::from("opt/tmp/raw").join(format!("{stem}.pl"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let src = read_source(&args.input)?;
    let program = parse_source(&src).into_diagnostic()?;
    tracing::debug!(words = program.len(), "parsed program");

    let mut vm = Vm::new(program.words());
    match args.backend {
        BackendKind::Interp => {
            let mut interp = Interp::stdout();
            vm.run(&mut interp);
            interp.finalize(&mut vm, 0);
        }
        BackendKind::Tac => {
            let mut backend = TacBackend::new();
            vm.run(&mut backend);
            let dump = backend.program().to_string();
            match args.emit.as_str() {
                "-" => {
                    io::stdout()
                        .write_all(dump.as_bytes())
                        .into_diagnostic()?;
                }
                emit => {
                    let path = if emit == "auto" {
                        conventional_dump_path(&args.input)
                    } else {
                        PathBuf::from(emit)
                    };
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() {
                            fs::create_dir_all(parent)
                                .into_diagnostic()
                                .wrap_err_with(|| format!("creating {}", parent.display()))?;
                        }
                    }
                    fs::write(&path, dump)
                        .into_diagnostic()
                        .wrap_err_with(|| format!("writing {}", path.display()))?;
                    tracing::info!(path = %path.display(), "wrote TAC dump");
                }
            }
            backend.finalize(&mut vm, 0);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_path_uses_the_input_stem() {
        assert_eq!(
            conventional_dump_path(Path::new("demos/loop.rr")),
            PathBuf::from("opt/tmp/raw/loop.pl")
        );
        assert_eq!(
            conventional_dump_path(Path::new("-")),
            PathBuf::from("opt/tmp/raw/parsed.pl")
        );
    }
}
