use clap::Parser;
use tracing::info;

use beam_app::GpmdArgs;
use beam_gpmd::GpmdServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GpmdArgs::parse();
    let _log_guard = beam_app::init_logging(args.log_dir.as_deref())?;
    let config = args.resolve();

    let server = GpmdServer::bind(&config.gpmd).await?;
    server.serve()?;
    info!("GPMD serving on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down GPMD");
    server.stop();
    server.stopped().await;
    Ok(())
}
