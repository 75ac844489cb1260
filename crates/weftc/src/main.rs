#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weft_common::base58;
use weft_common::types::{BlockHeader, DeviceId};

use weftc::blocks::MemoryBlockStore;
use weftc::config::{load_config, Cli, ClientConfig, Commands};
use weftc::fetch::{run_fetch, FetchRequest};
use weftc::ports::{PortMode, PublishedPort};
use weftc::session::Session;
use weftc::trace::ClientTrace;

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn load_effective_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref relay) = cli.relay {
        config.relay = relay.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

/// Parses a `<source>:<port>[:<mode>]` publish spec.
fn parse_port_spec(spec: &str, allow: &HashSet<DeviceId>) -> anyhow::Result<PublishedPort> {
    let mut parts = spec.split(':');
    let source = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("bad port spec {spec:?}: missing source port"))?;
    let port = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("bad port spec {spec:?}: missing overlay port"))?;
    let mode = match parts.next() {
        Some(mode) => mode
            .parse::<PortMode>()
            .map_err(|e| anyhow::anyhow!("bad port spec {spec:?}: {e}"))?,
        None => PortMode::Public,
    };
    if parts.next().is_some() {
        anyhow::bail!("bad port spec {spec:?}: expected <source>:<port>[:<mode>]");
    }
    Ok(PublishedPort {
        port,
        source,
        mode,
        allowlist: allow.clone(),
    })
}

async fn run_publish(config: &ClientConfig, ports: &[String], allow: &[String]) -> anyhow::Result<()> {
    let mut allowlist = HashSet::new();
    for entry in allow {
        let device = base58::decode_device(entry)
            .map_err(|e| anyhow::anyhow!("invalid device id {entry:?}: {e}"))?;
        allowlist.insert(device);
    }
    let published: Vec<PublishedPort> = ports
        .iter()
        .map(|spec| parse_port_spec(spec, &allowlist))
        .collect::<anyhow::Result<_>>()?;

    let session = Session::connect(
        config.session_config()?,
        config.connector()?,
        Arc::new(MemoryBlockStore::new(BlockHeader {
            number: 0,
            hash: [0; 32],
            parent: [0; 32],
        })),
        ClientTrace::default(),
    )
    .await?;
    session.start();

    for port in published {
        session.publish(port);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = async {
            let mut state = session.state();
            let _ = state.wait_for(|s| *s == weftc::session::SessionState::Closed).await;
        } => {
            if let Some(reason) = session.goodbye_reason() {
                error!(%reason, "session terminated by node");
            } else {
                info!("session closed");
            }
        }
    }

    session.close().await;
    session.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Fetch {
            method,
            data,
            header,
            url,
            output,
            verbose,
        } => {
            let config = load_effective_config(&cli)?;
            let request = FetchRequest {
                method: method.clone(),
                data: data.clone(),
                headers: header.clone(),
                url: url.clone(),
                output: output.clone(),
                verbose: *verbose,
            };
            if let Err(e) = run_fetch(&config, request).await {
                eprintln!("fetch: {e}");
                std::process::exit(e.exit_code());
            }
        }

        Commands::Publish { ports, allow } => {
            let config = load_effective_config(&cli)?;
            run_publish(&config, ports, allow).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_with_defaults() {
        let port = parse_port_spec("8080:80", &HashSet::new()).unwrap();
        assert_eq!(port.source, 8080);
        assert_eq!(port.port, 80);
        assert_eq!(port.mode, PortMode::Public);
    }

    #[test]
    fn port_spec_with_mode() {
        let port = parse_port_spec("3000:80:protected", &HashSet::new()).unwrap();
        assert_eq!(port.mode, PortMode::Protected);
    }

    #[test]
    fn bad_port_specs_are_rejected() {
        assert!(parse_port_spec("8080", &HashSet::new()).is_err());
        assert!(parse_port_spec("x:80", &HashSet::new()).is_err());
        assert!(parse_port_spec("8080:80:open", &HashSet::new()).is_err());
        assert!(parse_port_spec("8080:80:public:extra", &HashSet::new()).is_err());
    }
}
