mod cli;

use clap::Parser;

use cli::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();
    match args.command {
        Commands::Run(run_args) => {
            let success = cli::run(run_args)?;
            if !success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
