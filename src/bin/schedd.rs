use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use faasload::sched::server::PlannerService;

/// Elastic replica planner: serves streaming scheduling rounds for the
/// workload driver.
#[derive(Debug, Parser)]
#[command(name = "schedd", about = "Elastic replica planner")]
struct SchedConfig {
    /// gRPC bind address.
    #[arg(long, default_value = "0.0.0.0:50051")]
    listen_addr: SocketAddr,

    /// Cluster GPU total; bounds the permitted allocation sizes.
    #[arg(long, default_value_t = 40)]
    total_gpu: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schedd=info,faasload=info".into()),
        )
        .init();

    let cfg = SchedConfig::parse();
    info!(
        listen_addr = %cfg.listen_addr,
        total_gpu = cfg.total_gpu,
        "Starting replica planner"
    );

    tonic::transport::Server::builder()
        .add_service(PlannerService::new(cfg.total_gpu).into_server())
        .serve(cfg.listen_addr)
        .await?;
    Ok(())
}
