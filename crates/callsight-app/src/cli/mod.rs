use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "callsight",
    version,
    author,
    about = "Sales-call analysis and reconciliation service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            verbose: 0,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the callsight HTTP server.
    Serve(ServeArgs),
    /// Run one reconciliation pass over the call feed and exit.
    Preprocess(PreprocessArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct PreprocessArgs {
    /// Print stored report keys after the pass.
    #[arg(long)]
    pub list: bool,
}
