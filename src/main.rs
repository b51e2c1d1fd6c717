use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info};

use pgstage::cli::Cli;
use pgstage::postgres::PgConnector;
use pgstage::{commands, config, logging};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file before clap reads them
    let dotenv = config::load_env();

    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("pgstage: cannot initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }
    if let Some(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    let config = cli.to_config();
    let connector = PgConnector::new(config.postgres.clone());
    let now = chrono::Local::now().naive_local();
    let key = cli.restore_key();

    info!("Running {:?} for database {}", cli.action, config.postgres.database);
    match commands::run(cli.action, key.as_deref(), &config, &connector, now).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
