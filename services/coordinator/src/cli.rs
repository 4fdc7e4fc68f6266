//! Command line flags

use clap::Parser;
use std::path::PathBuf;

use rescuenet_core::CoordinatorConfig;

/// RescueNet swarm coordinator
#[derive(Debug, Parser)]
#[command(name = "rescuenet-coordinator", version, about)]
pub struct Args {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    pub listen: Option<String>,

    /// Claim expiry without refresh (ms)
    #[arg(long)]
    pub claim_grace_ms: Option<u64>,

    /// Heartbeat silence before a participant is stale (ms)
    #[arg(long)]
    pub participant_timeout_ms: Option<u64>,

    /// Expiry sweep period (ms)
    #[arg(long)]
    pub sweep_interval_ms: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print version information as JSON and exit
    #[arg(long)]
    pub version_json: bool,
}

impl Args {
    /// Load the config file, if any, then apply flag overrides.
    pub fn load_config(&self) -> rescuenet_core::Result<CoordinatorConfig> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::from_file(path)?,
            None => CoordinatorConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ms) = self.claim_grace_ms {
            config.claim_grace_ms = ms;
        }
        if let Some(ms) = self.participant_timeout_ms {
            config.participant_timeout_ms = ms;
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.sweep_interval_ms = ms;
        }
        if self.json_logs {
            config.json_logs = true;
        }
    }
}
