//! # Duet
//!
//! Console client for anonymous one-to-one calls. Connects to the
//! coordinating service, keeps the connection alive, and exposes the call
//! lifecycle as line commands (`help` lists them).
//!
//! `--demo` runs everything in-process: a scripted coordinator and a partner
//! that joins the queue on its own, talking over loopback UDP.

mod console;
mod demo;

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use duet_call::{CallClient, CallConfig, CallDeps, CaptureDevice, Str0mEngine};
use duet_common::Credentials;
use duet_common::config::{AppConfig, IdentityMode};
use duet_signaling::WsDialer;

#[derive(Debug, Parser)]
#[command(name = "duet", version, about = "Anonymous one-to-one calls")]
struct Cli {
    /// Coordinating service WebSocket URL (overrides signaling.url).
    #[arg(long, env = "DUET_URL")]
    url: Option<String>,

    /// How the device token is obtained (overrides identity.mode).
    #[arg(long, value_enum)]
    identity: Option<IdentityArg>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    /// Run against an in-process coordinator and partner.
    #[arg(long)]
    demo: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IdentityArg {
    Remote,
    Local,
}

impl From<IdentityArg> for IdentityMode {
    fn from(arg: IdentityArg) -> Self {
        match arg {
            IdentityArg::Remote => IdentityMode::Remote,
            IdentityArg::Local => IdentityMode::Local,
        }
    }
}

impl Cli {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(url) = &self.url {
            cfg.signaling.url = url.clone();
        }
        if let Some(mode) = self.identity {
            cfg.identity.mode = mode.into();
        }
        if self.demo {
            cfg.identity.mode = IdentityMode::Local;
            cfg.identity.token_path = None;
            cfg.media.bind_ip = "127.0.0.1".into();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = duet_common::config::init()?.clone();
    cli.apply(&mut config);

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "duet=debug".into());
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }

    tracing::info!("Starting Duet v{}", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(Str0mEngine::from_config(&config.media)?);
    let credentials = Credentials::from_config(&config.identity)?;
    let call_config = CallConfig::from(&config);

    let (client, partner) = if cli.demo {
        tracing::info!("Demo mode: in-process coordinator and partner");
        let demo = demo::Demo::start(call_config.clone(), engine.clone());
        let deps = CallDeps {
            dialer: Arc::new(demo.dialer),
            credentials,
            engine,
            media: Arc::new(CaptureDevice::new()),
        };
        (CallClient::start(call_config, deps), Some(demo.partner))
    } else {
        tracing::info!(url = %config.signaling.url, identity = ?config.identity.mode, "Connecting");
        let deps = CallDeps {
            dialer: Arc::new(
                WsDialer::new(config.signaling.url.clone())
                    .with_connect_timeout(config.signaling.connect_timeout()),
            ),
            credentials,
            engine,
            media: Arc::new(CaptureDevice::new()),
        };
        (CallClient::start(call_config, deps), None)
    };

    let outcome = console::run(client.handle()).await?;
    match outcome {
        console::Exit::Quit => client.shutdown().await,
        console::Exit::LoggedOut => client.join().await,
    }
    if let Some(partner) = partner {
        partner.shutdown().await;
    }

    tracing::info!("Bye");
    Ok(())
}
