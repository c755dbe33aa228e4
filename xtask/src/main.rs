use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run every test in the workspace
    Test,
    /// Run the CLI demo against the simulated sensor
    Demo {
        /// Frames to print
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Demo { frames } => {
            println!("Running demo...");
            let frames = frames.to_string();
            cargo(
                &["run", "-p", "tofctl", "--", "demo", "--frames", &frames],
                "Demo",
            )?;
        }
    }

    Ok(())
}
