use {
    anyhow::Context,
    async_trait::async_trait,
    structopt::StructOpt,
    tokio::sync::broadcast,
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

use burrow::{
    cli::{self, Cli},
    config::{defaults, TunnelConfig},
    Tunnel, TunnelEvent,
};

#[async_trait]
trait Command {
    async fn run(self, config: TunnelConfig) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl Command for cli::Run {
    async fn run(self, config: TunnelConfig) -> Result<(), anyhow::Error> {
        let auto_reconnect = config.auto_reconnect;
        let refresh_interval = config.auto_reconnect_interval;

        let tunnel = Tunnel::new(config)?;
        let mut events = tunnel.subscribe();
        info!(id = %tunnel.id(), url = %tunnel.url(), "starting tunnel");
        info!(
            "pool refresh every {}",
            humantime::format_duration(refresh_interval)
        );

        if let Err(error) = tunnel.open(None).await {
            if !auto_reconnect {
                return Err(error).context("Failed to open the tunnel");
            }
            // A reconnection attempt is already scheduled; keep running.
            warn!(%error, "initial connection failed");
        }

        loop {
            tokio::select! {
                interrupt = tokio::signal::ctrl_c() => {
                    interrupt.context("Failed to listen for interrupt")?;
                    info!("shutting down");
                    tunnel.close().await;
                    break;
                }
                event = events.recv() => match event {
                    Ok(TunnelEvent::Open { connection }) => {
                        info!(connection, pool_size = tunnel.pool_size(), "tunnel connection open")
                    }
                    Ok(TunnelEvent::Connected { .. }) => {}
                    Ok(TunnelEvent::Disconnected { message }) => warn!("{}", message),
                    Ok(TunnelEvent::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Command for cli::Info {
    async fn run(self, config: TunnelConfig) -> Result<(), anyhow::Error> {
        let tunnel = Tunnel::new(config)?;
        let info = tunnel
            .query_proxy_info(Default::default())
            .await
            .context("Failed to query the tunnel status endpoint")?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        Ok(())
    }
}

#[async_trait]
impl Command for cli::Id {
    async fn run(self, config: TunnelConfig) -> Result<(), anyhow::Error> {
        let tunnel = Tunnel::new(config)?;
        println!("{}", tunnel.id());
        println!("{}", tunnel.url());
        if let Some(alias) = &self.alias {
            println!("{}", tunnel.alias_url(alias));
        }
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::from_args();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => defaults::config_path()?,
    };
    let config = TunnelConfig::load(&config_path)
        .await
        .with_context(|| format!("Could not load configuration from {:?}", config_path))?;

    match cli.command {
        cli::Command::Run(run) => run.run(config).await,
        cli::Command::Info(info) => info.run(config).await,
        cli::Command::Id(id) => id.run(config).await,
    }
}
