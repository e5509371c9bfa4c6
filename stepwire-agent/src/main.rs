use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use dotenv::dotenv;
use stepwire_agent::script::{load_script, replay};
use stepwire_agent::{Config, HttpTransport, LogTransport, Reporter, Transport};

fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: stepwire <script.jsonl>");
        return ExitCode::from(2);
    };

    let config = Config::from_env();
    let transport: Arc<dyn Transport> = match config.endpoint.as_deref() {
        Some(endpoint) => match HttpTransport::new(endpoint) {
            Ok(transport) => {
                log::info!("Sending records to {}", endpoint);
                Arc::new(transport)
            }
            Err(e) => {
                log::error!("Failed to build HTTP client: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            log::info!("STEPWIRE_ENDPOINT not set, logging records instead");
            Arc::new(LogTransport::new())
        }
    };

    let reporter = match Reporter::new(config.delivery, transport) {
        Ok(reporter) => reporter,
        Err(e) => {
            log::error!("Failed to start delivery: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let events = match load_script(&path) {
        Ok(events) => events,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = replay(&reporter, events);
    reporter.delivery().shutdown();
    match result {
        Ok(summary) => {
            for verdict in &summary.runs {
                println!("{}\t{}", verdict.run_id, verdict.status);
            }
            log::info!(
                "Replayed {} event(s) across {} run(s)",
                summary.events_applied,
                summary.runs.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            ExitCode::FAILURE
        }
    }
}
