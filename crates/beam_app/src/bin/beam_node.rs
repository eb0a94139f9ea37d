use bytes::Bytes;
use clap::Parser;
use tracing::info;

use beam_agent::{Agent, Flow};
use beam_app::NodeArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();
    let _log_guard = beam_app::init_logging(args.log_dir.as_deref())?;
    let config = args.resolve()?;

    let agent = Agent::new(&args.node, config.agent)?;
    let port = agent.start().await?;
    agent.register().await?;
    info!("{} up on port {port}", agent.node_name());

    for peer in &args.join {
        agent.join(peer).await;
    }
    if let Some(seed) = args.join.first() {
        agent.query_all_node(seed).await;
    }

    let process = agent.new_process()?;
    let routine = process.id();
    let node = agent.node_name().to_string();
    let echo = process.run(move |msg: Bytes| {
        let node = node.clone();
        async move {
            info!("{node} routine {routine} got {:?}", String::from_utf8_lossy(&msg));
            anyhow::Ok(Flow::Continue)
        }
    });
    println!("{} echo routine id: {routine}", agent.node_name());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down {}", agent.node_name());
    agent.stop().await;
    agent.stopped().await;
    echo.abort();
    Ok(())
}
