use clap::Parser;

use fwdproxy_command::config::FileConfig;

/// A forward HTTP and HTTPS proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// address to listen on
    #[arg(short, long)]
    pub listen: Option<String>,

    /// port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// number of worker threads draining the completion queue
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// log level or directives, like `info` or `fwdproxy_lib::request=debug`
    #[arg(long)]
    pub log_level: Option<String>,

    /// stdout, stderr, file:///path, udp://host:port or tcp://host:port
    #[arg(long)]
    pub log_target: Option<String>,

    /// seconds between statistics lines, 0 disables them
    #[arg(long)]
    pub statistics_interval: Option<u64>,
}

impl Args {
    /// command line values win over the configuration file
    pub fn apply_to(&self, config: &mut FileConfig) {
        if let Some(listen) = &self.listen {
            config.listen_address = Some(listen.clone());
        }
        if let Some(port) = self.port {
            config.listen_port = Some(port);
        }
        if let Some(workers) = self.workers {
            config.worker_count = Some(workers);
        }
        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(target) = &self.log_target {
            config.log_target = Some(target.clone());
        }
        if let Some(interval) = self.statistics_interval {
            config.statistics_interval_seconds = Some(interval);
        }
    }
}
