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
    /// Build the project
    Build,
    /// Run the workspace tests
    Test,
    /// Run clippy with warnings denied
    Lint,
    /// Run the CLI, forwarding any extra arguments
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(step: &str, args: &[&str]) -> Result<()> {
    println!("{}...", step);
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", step);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo("Building project", &["build", "--workspace"])?,
        Commands::Test => cargo("Running tests", &["test", "--workspace"])?,
        Commands::Lint => cargo(
            "Running clippy",
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        )?,
        Commands::Run { args } => {
            let mut full = vec!["run", "-p", "sdfu-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo("Running CLI", &full)?;
        }
    }

    Ok(())
}
