use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bordergraph::{Pipeline, PipelineConfig, PipelineError};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("could not install interrupt handler: {}", e);
    }

    info!("bordergraph {} for {}", env!("CARGO_PKG_VERSION"), config.country);
    match Pipeline::new(config).with_interrupt(interrupt).run() {
        Ok(summary) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Err(PipelineError::Interrupted) => {
            warn!("Interrupted by user, partial outputs were not written");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
