use clap::Parser;
use prefork::cli::Cli;
use prefork::{launcher, logging, server, LauncherConfig};
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = LauncherConfig::load(cli.config.as_deref());
    let config = match loaded.and_then(|loaded| cli.apply(loaded)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(2);
        }
    };

    let log_file = config.log_file.as_deref();
    if let Err(err) = logging::init_logger(config.log_level.as_deref(), log_file) {
        eprintln!("Failed to initialize logging: {:#}", err);
        return ExitCode::from(2);
    }

    match launcher::run(cli.role(), &config, server::demo_app()) {
        Ok(report) if report.succeeded() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            error!("{} error: {}", err.category().display_name(), err);
            ExitCode::from(err.exit_code())
        }
    }
}
