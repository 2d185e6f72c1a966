use anyhow::Result;
use clap::Parser;
use pacer::config::Config;
use pacer::logging;
use pacer::pool::ConnectionPool;
use pacer::progress::ProgressReporter;
use pacer::stats::Stats;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pacer", version)]
#[command(about = "Heartbeat round-trip load driver", long_about = None)]
struct Cli {
    /// Destination address
    #[arg(short = 'a', long)]
    addr: Option<String>,

    /// Destination port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Number of connections
    #[arg(short = 't', long)]
    connections: Option<usize>,

    /// Requests per connection
    #[arg(short = 'c', long)]
    count: Option<u64>,

    /// Write span timings to this file
    #[arg(short = 'f', long)]
    profile: Option<PathBuf>,

    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(addr) = &self.addr {
            config.target.addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.target.port = port;
        }
        if let Some(connections) = self.connections {
            config.run.connections = connections;
        }
        if let Some(count) = self.count {
            config.run.requests_per_connection = count;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    logging::init(cli.profile.as_deref())?;
    config.validate()?;

    info!(
        "Driving {} connections x {} requests against {}:{}",
        config.run.connections,
        config.run.requests_per_connection,
        config.target.addr,
        config.target.port
    );

    let stats = Stats::shared();
    let pool = ConnectionPool::new(&config, stats.clone());
    let reporter = ProgressReporter::new(
        stats,
        config.run.expected_exchanges(),
        config.progress.refresh_interval(),
    );

    tokio::spawn(reporter.clone().run());
    pool.start().await;

    tokio::signal::ctrl_c().await?;
    reporter.finish();
    info!("Stopping with {} connections still open", pool.live_sessions());

    Ok(())
}
