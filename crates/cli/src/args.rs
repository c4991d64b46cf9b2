use std::path::PathBuf;

use clap::Parser;
use engine::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "appd")]
#[command(about = "Application server with a bounded worker pool")]
#[command(version)]
pub struct Args {
    /// JSON config file (defaults to ./appd.json when present)
    #[arg(long, short, env = "APPD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, short)]
    pub bind: Option<String>,

    /// Number of workers
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Per-request deadline in milliseconds, 0 to disable
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// How long an interrupted worker gets before it is replaced
    #[arg(long)]
    pub reclaim_grace_ms: Option<u64>,

    /// Request header that identifies the client for blocking
    #[arg(long)]
    pub identity_header: Option<String>,

    /// Disable the response cache
    #[arg(long)]
    pub no_cache: bool,

    /// Pin workers to CPU cores
    #[arg(long)]
    pub pin_workers: bool,

    /// Seconds between heartbeat tasks, 0 to disable
    #[arg(long, default_value_t = 60)]
    pub heartbeat_secs: u64,
}

impl Args {
    /// Config file, then `APPD_*` environment, then flags.
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::load(self.config.as_deref());
        config.apply_env();
        self.apply_to(&mut config);
        config
    }

    pub fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.request_timeout_ms = timeout;
        }
        if let Some(grace) = self.reclaim_grace_ms {
            config.reclaim_grace_ms = grace;
        }
        if let Some(header) = &self.identity_header {
            config.identity_header = header.to_ascii_lowercase();
        }
        if self.no_cache {
            config.cache_enabled = false;
        }
        if self.pin_workers {
            config.pin_workers = true;
        }
    }
}
