use anyhow::Result;
use clap::{Parser, Subcommand};
use hidbridge_core::BridgeConfig;
use std::path::PathBuf;
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
    /// Run the CLI, forwarding any extra arguments
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Write a config file with every default spelled out
    Config {
        #[arg(default_value = "hidbridge.toml")]
        path: PathBuf,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut command = vec!["run", "-p", "hidbridge-cli", "--"];
            command.extend(args.iter().map(String::as_str));
            cargo(&command, "Run")?;
        }
        Commands::Config { path } => {
            let config = BridgeConfig {
                poll_interval_ms: Some(BridgeConfig::default().poll_interval().as_millis() as u64),
                ..Default::default()
            };
            config.save_to_file(path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
