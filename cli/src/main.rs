mod arg_parser;
mod commands;

use arg_parser::{ArgParser, SubCommand};
use gridlib::GridConfig;

use clap::Parser;
use std::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    let args = ArgParser::parse();

    // logs go to stderr so stdout stays machine readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => GridConfig::from_file(path)?,
        None => GridConfig::default(),
    };

    match args.sub_command {
        SubCommand::Run {
            timeout,
            tag,
            publish,
            argv,
        } => commands::run(&config, argv, timeout, tag, publish).await?,
        SubCommand::Dispatch { publish, workers } => {
            commands::dispatch(&config, publish, workers).await?
        }
        SubCommand::Stream { name, jobs, follow } => {
            commands::stream(&config, name, jobs, follow).await?
        }
        SubCommand::Tail { endpoint } => commands::tail(&config, endpoint).await?,
        SubCommand::Watch { endpoint } => commands::watch(&config, endpoint).await?,
    }

    Ok(())
}
