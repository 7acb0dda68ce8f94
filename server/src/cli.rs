use crate::config::ServerConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "traffic-server")]
#[command(author, version, about = "Traffic accounting server for reporting agents", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, env = "TRAFFIC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override listen address
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Override the state file
    #[arg(long)]
    pub data_file: Option<String>,

    /// Override the billing UTC offset, e.g. +08:00
    #[arg(long)]
    pub billing_utc_offset: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log directory
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    pub write_config: Option<PathBuf>,
}

impl CliArgs {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(data_file) = &self.data_file {
            config.data_file = data_file.clone();
        }
        if let Some(offset) = &self.billing_utc_offset {
            config.billing_utc_offset = offset.clone();
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }
        if let Some(log_dir) = &self.log_dir {
            config.log_dir = Some(log_dir.clone());
        }
    }
}
