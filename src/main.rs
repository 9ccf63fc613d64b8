use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use spoolrelay::{Gateway, RelayConfig, Resolution, Role};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "spoolrelay", version, about = "Store-and-forward HTTP relay over a bundle transport")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "SPOOLRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Node role, overriding the configuration file
    #[arg(long, global = true, value_enum, env = "SPOOLRELAY_ROLE")]
    role: Option<Role>,

    /// Spool directory shared with the transport agent
    #[arg(long, global = true, env = "SPOOLRELAY_SPOOL")]
    spool: Option<PathBuf>,

    /// Mirrored cache root (near node)
    #[arg(long, global = true, env = "SPOOLRELAY_CACHE")]
    cache: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node: listen for deliveries and process the spool
    Serve,

    /// Resolve a URL as the near-side gateway would
    Request {
        url: String,

        /// Print the resolution as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

impl Cli {
    fn load_config(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::load(self.config.as_deref())?;
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(spool) = &self.spool {
            config.spool_dir = spool.clone();
        }
        if let Some(cache) = &self.cache {
            config.cache_dir = Some(cache.clone());
        }
        Ok(config.finalize()?)
    }

    fn default_filter(&self) -> &'static str {
        if self.quiet {
            "spoolrelay=error"
        } else {
            match self.verbose {
                0 => "spoolrelay=info",
                1 => "spoolrelay=debug",
                _ => "spoolrelay=trace",
            }
        }
    }
}

#[derive(Serialize)]
struct RequestOutput<'a> {
    status: u16,
    #[serde(flatten)]
    resolution: &'a Resolution,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter())))
        .init();

    let config = cli.load_config().context("Invalid configuration")?;

    match cli.command {
        Command::Serve => {
            spoolrelay::node::run(config, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
            })
            .await
        }
        Command::Request { url, json } => {
            if config.role != Role::Near {
                tracing::warn!("resolving a request on a far node configuration");
            }
            let gateway = Gateway::from_config(&config);
            let resolution = gateway.resolve(&url).await?;
            print_resolution(&resolution, json)
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn print_resolution(resolution: &Resolution, json: bool) -> Result<()> {
    let status = resolution.status();
    if json {
        let output = RequestOutput { status, resolution };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match resolution {
        Resolution::Served { path } => println!("{status} {}", path.display()),
        Resolution::Accepted { token, descriptor } => {
            println!("{status} accepted token={token} descriptor={}", descriptor.display())
        }
        Resolution::Pending { token } => println!("{status} pending token={token}"),
    }
    Ok(())
}
