use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use smbsrv::{setup_tracing, AppResult, BasicOps, ServerConfig, SmbServer};
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: String,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let _tracing_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = ServerConfig::set_up_config(config_path)?;

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("smbsrv")
        .build()?;

    rt.block_on(async {
        let server = SmbServer::start(config, Arc::new(BasicOps::new())).await?;
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }
        info!("get shutdown signal");
        server.stop().await
    })
}
