//! Analyze a minidump and save what was extracted in a container file.
//!
//! ```text
//! cargo run --example analyze -- user.dmp
//! cargo run --example analyze -- user.dmp -o user.dmpa -f --modules --memory
//! ```
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dump_analyze::{Analyzer, AnalyzerConfig, Dump};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Extension of the container written next to the dump by default.
const CONTAINER_EXTENSION: &str = "dmpa";

#[derive(Parser, Debug)]
#[command(name = "analyze", version, about = "Extract modules, threads and memory regions out of a minidump")]
struct Cli {
    /// Path of the minidump.
    path: PathBuf,

    /// Where to write the container (default: PATH with a .dmpa extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Overwrite the output if it already exists.
    #[arg(short, long)]
    force: bool,

    /// Smallest window mapped when reading the dump.
    #[arg(long, default_value_t = AnalyzerConfig::default().min_window)]
    min_window: usize,

    /// List the loaded modules.
    #[arg(long)]
    modules: bool,

    /// List the memory map.
    #[arg(long)]
    memory: bool,

    /// List the threads.
    #[arg(long)]
    threads: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn show_modules(dump: &Dump) {
    println!("Loaded modules:");
    for module in dump.modules() {
        println!(
            "{:016x}-{:016x} {:>16} {}",
            module.base,
            module.end_addr(),
            module.version.to_string(),
            module.name
        );
    }
}

fn show_memory(dump: &Dump) {
    println!("Memory map:");
    for region in dump.memory_regions() {
        print!(
            "{:016x} {:016x} {:016x} {:11} {:11} {:22}",
            region.range().start,
            region.range().end,
            region.size,
            region.type_.to_string(),
            region.state.to_string(),
            region.protect.to_string()
        );

        // Do we have a module that exists at this address?
        if let Some(module) = dump.find_module(region.base) {
            print!(" [{}]", module.file_name());
        }

        println!();
    }
}

fn show_threads(dump: &Dump) {
    println!("Threads:");
    for thread in dump.threads() {
        println!(
            "TID {:6}, TEB {:016x}, suspend {}, priority {}/{} {}",
            thread.id,
            thread.teb,
            thread.suspend_count,
            thread.priority_class,
            thread.priority,
            thread.name
        );
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.path.with_extension(CONTAINER_EXTENSION));
    if output.exists() && !cli.force {
        bail!("{} already exists, use -f to overwrite it", output.display());
    }

    let config = AnalyzerConfig {
        min_window: cli.min_window,
        ..AnalyzerConfig::default()
    };
    let dump = Analyzer::with_config(config)
        .analyze(&cli.path)
        .with_context(|| format!("failed to analyze {}", cli.path.display()))?;

    info!(
        path = %dump.path().display(),
        timestamp = %dump.timestamp(),
        flags = ?dump.dump_type(),
        architecture = %dump.architecture(),
        modules = dump.modules().len(),
        threads = dump.threads().len(),
        memory_regions = dump.memory_regions().len(),
        "analyzed dump"
    );

    if cli.modules {
        show_modules(&dump);
    }

    if cli.memory {
        show_memory(&dump);
    }

    if cli.threads {
        show_threads(&dump);
    }

    dump.save(&output)
        .with_context(|| format!("failed to save {}", output.display()))?;
    info!(output = %output.display(), "saved container");

    Ok(())
}
