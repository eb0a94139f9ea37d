//! Command-line bootstrap shared by the `gpmd` and `beam-node` binaries.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use beam_core::config::BeamConfig;
use beam_core::logging;

/// Run a GPMD name registry.
#[derive(Debug, Parser)]
#[command(name = "gpmd", version)]
pub struct GpmdArgs {
    /// Interface to bind.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write daily-rotated logs to this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl GpmdArgs {
    /// The file configuration with command-line overrides applied.
    pub fn resolve(&self) -> BeamConfig {
        let mut config = load_config(self.config.as_deref());
        if let Some(host) = &self.host {
            config.gpmd.host = host.clone();
        }
        if let Some(port) = self.port {
            config.gpmd.port = port;
        }
        config
    }
}

/// Run one beam node.
#[derive(Debug, Parser)]
#[command(name = "beam-node", version)]
pub struct NodeArgs {
    /// This node, as `name@host`.
    pub node: String,

    /// Local registry as `host:port`.
    #[arg(long)]
    pub gpmd: Option<String>,

    /// Peer to join, as `name@host`. Repeatable.
    #[arg(long = "join")]
    pub join: Vec<String>,

    /// JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write daily-rotated logs to this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl NodeArgs {
    pub fn resolve(&self) -> anyhow::Result<BeamConfig> {
        let mut config = load_config(self.config.as_deref());
        if let Some(gpmd) = &self.gpmd {
            let (host, port) = gpmd
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("--gpmd must be HOST:PORT, got {gpmd:?}"))?;
            config.agent.gpmd_host = host.to_string();
            config.agent.gpmd_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid GPMD port {port:?}: {e}"))?;
        }
        Ok(config)
    }
}

fn load_config(path: Option<&Path>) -> BeamConfig {
    path.map(BeamConfig::load_or_default).unwrap_or_default()
}

/// Console logging, plus a file layer when `log_dir` is set. Keep the
/// returned guard alive until exit.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    match log_dir {
        Some(dir) => Ok(Some(logging::init_logging_to_dir(dir, logging::DEFAULT_FILTER)?)),
        None => {
            logging::init_logging(logging::DEFAULT_FILTER)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpmd_args_override_defaults() {
        let args = GpmdArgs::try_parse_from(["gpmd", "--port", "3000"]).unwrap();
        let config = args.resolve();
        assert_eq!(config.gpmd.port, 3000);
        assert_eq!(config.gpmd.host, "0.0.0.0");
    }

    #[test]
    fn test_node_args_repeated_join() {
        let args = NodeArgs::try_parse_from([
            "beam-node",
            "alpha@127.0.0.1",
            "--join",
            "beta@10.0.0.2",
            "--join",
            "gamma@10.0.0.3",
            "--gpmd",
            "127.0.0.1:4000",
        ])
        .unwrap();
        assert_eq!(args.node, "alpha@127.0.0.1");
        assert_eq!(args.join, ["beta@10.0.0.2", "gamma@10.0.0.3"]);

        let config = args.resolve().unwrap();
        assert_eq!(config.agent.gpmd_host, "127.0.0.1");
        assert_eq!(config.agent.gpmd_port, 4000);
    }

    #[test]
    fn test_node_args_bad_gpmd() {
        let args = NodeArgs::try_parse_from(["beam-node", "a@h", "--gpmd", "nohost"]).unwrap();
        assert!(args.resolve().is_err());
    }

    #[test]
    fn test_node_requires_name() {
        assert!(NodeArgs::try_parse_from(["beam-node"]).is_err());
    }

    #[test]
    fn test_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beam.json");
        let mut file_config = BeamConfig::default();
        file_config.gpmd.port = 4242;
        file_config.save_to_file(&path).unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let args = GpmdArgs::try_parse_from(["gpmd", "--config", path_str.as_str()]).unwrap();
        assert_eq!(args.resolve().gpmd.port, 4242);
    }
}
