use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bootca::acme::engine::Engine;
use bootca::acme::routes::routes;
use bootca::ca::CertificateAuthority;
use bootca::config::Settings;
use clap::Parser;
use poem::Server;
use poem::listener::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bootca ACME server")]
struct Args {
    /// Path to server configuration file (default: bootca.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let settings = Settings::new(args.config)?;
    settings.validate()?;

    let ca_cert = tokio::fs::read_to_string(&settings.ca.cert)
        .await
        .with_context(|| format!("read CA certificate {}", settings.ca.cert.display()))?;
    let ca_key = tokio::fs::read_to_string(&settings.ca.key)
        .await
        .with_context(|| format!("read CA key {}", settings.ca.key.display()))?;
    let ca = CertificateAuthority::from_pem(&ca_cert, &ca_key)?;

    let engine = Arc::new(Engine::new(&settings, ca)?);
    let directory_url = format!("{}/directory", engine.urls().base());
    let app = routes(engine);

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!("Serving ACME directory at {directory_url}");
    info!("Listening on {listen_addr}");

    let mut server = tokio::spawn(Server::new(TcpListener::bind(listen_addr)).run(app));
    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Server failed: {err}"),
                Err(err) => error!("Server task failed: {err}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received");
        }
    }

    Ok(())
}
