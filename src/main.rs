use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use faasload::config::RunConfig;
use faasload::driver::invoker::{FunctionInvoker, GrpcInvoker, HttpInvoker};
use faasload::orchestrator::{self, RunSummary};
use faasload::trace::loader;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faasload=info".into()),
        )
        .init();

    let cfg = RunConfig::parse();
    match run(cfg).await {
        Ok(summary) if summary.overloaded => {
            warn!("Run finished under cluster overload");
            ExitCode::from(1)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cfg: RunConfig) -> faasload::error::Result<RunSummary> {
    info!("Starting faasload v{}", env!("CARGO_PKG_VERSION"));

    cfg.validate()?;
    let trace = loader::load(&cfg)?;

    let invoker: Arc<dyn FunctionInvoker> = if cfg.http_invoker {
        Arc::new(HttpInvoker::new())
    } else {
        Arc::new(GrpcInvoker::new())
    };

    // One shared cancellation signal for every task of the run.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling run");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator::run(cfg, trace, invoker, shutdown_rx).await
}
