//! Development tasks for obexd
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "obexd development tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the engine benchmarks
    Bench,

    /// Run one fuzz target (requires cargo-fuzz and a nightly toolchain)
    Fuzz {
        /// Target name, e.g. fuzz_session_trace
        #[arg(default_value = "fuzz_session_trace")]
        target: String,

        /// Stop after this many seconds
        #[arg(long, default_value_t = 60)]
        seconds: u32,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "-p", "obex-core"])?;
        }
        Commands::Fuzz { target, seconds } => {
            let limit = format!("-max_total_time={seconds}");
            let status = Command::new("cargo")
                .current_dir(Path::new(env!("CARGO_MANIFEST_DIR")).join("../fuzz"))
                .args(["+nightly", "fuzz", "run", &target, "--", &limit])
                .status()?;
            if !status.success() {
                anyhow::bail!("fuzz target {target} failed");
            }
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
