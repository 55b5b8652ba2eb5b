pub mod schedule;
pub mod show;

use std::path::Path;
use std::process;

use serde::{Deserialize, Serialize};
use tilesched::ir::samples;
use tilesched::{KernelConstraints, Trace};

/// On-disk kernel: a traced kernel plus the constraints its frontend
/// attached.
#[derive(Serialize, Deserialize)]
pub struct KernelFile {
    pub trace: Trace,
    #[serde(default)]
    pub constraints: KernelConstraints,
}

/// A kernel ready to schedule, with the text diagnostics point into.
pub struct LoadedKernel {
    pub kernel: KernelFile,
    pub filename: String,
    pub source: String,
}

/// Load a kernel from a JSON file or by built-in name. Exactly one of the
/// two must be given.
pub fn load_kernel(input: Option<&Path>, builtin: Option<&str>) -> LoadedKernel {
    match (input, builtin) {
        (Some(path), None) => {
            let source = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("error: cannot read '{}': {}", path.display(), e);
                    process::exit(1);
                }
            };
            let kernel: KernelFile = match serde_json::from_str(&source) {
                Ok(k) => k,
                Err(e) => {
                    eprintln!("error: invalid kernel file '{}': {}", path.display(), e);
                    process::exit(1);
                }
            };
            LoadedKernel {
                kernel,
                filename: path.display().to_string(),
                source,
            }
        }
        (None, Some(name)) => {
            let Some((trace, constraints)) = samples::builtin(name) else {
                eprintln!(
                    "error: unknown built-in kernel '{}' (available: {})",
                    name,
                    samples::BUILTINS.join(", ")
                );
                process::exit(1);
            };
            let kernel = KernelFile { trace, constraints };
            let source = serde_json::to_string_pretty(&kernel).unwrap_or_default();
            LoadedKernel {
                kernel,
                filename: format!("<builtin:{}>", name),
                source,
            }
        }
        _ => {
            eprintln!("error: give either an input file or --builtin NAME");
            process::exit(1);
        }
    }
}

/// Write a kernel back to JSON.
pub fn write_kernel(path: &Path, kernel: &KernelFile) {
    let json = match serde_json::to_string_pretty(kernel) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("error: cannot serialize kernel: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        eprintln!("error: cannot write '{}': {}", path.display(), e);
        process::exit(1);
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default: warnings only).
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "tilesched=debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
