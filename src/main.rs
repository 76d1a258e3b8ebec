use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use hyper::Method;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nanohttps::adapters::hyper_client::send;
use nanohttps::adapters::{load_roots, CredentialProvider, HyperTunnel, RustlsEngine, TcpTransport};
use nanohttps::config::{Config, Opts, Settings};
use nanohttps::domain::{ConnectService, ConnectionCache};

fn build_service(settings: &Settings) -> Result<ConnectService, Box<dyn Error>> {
    let mut transport = TcpTransport::new(settings.connector.connect_timeout);
    for (host, addr) in &settings.resolve {
        transport = transport.with_override(host, *addr);
    }

    let roots = load_roots(true, &settings.ca_files)?;
    let engine = RustlsEngine::new(roots).with_endpoint_identification(settings.endpoint_identification);
    let credentials = CredentialProvider::new(settings.auth_rules.clone())?;
    let cache = ConnectionCache::new(settings.keep_alive, settings.max_connections);

    Ok(ConnectService::new(
        Arc::new(transport),
        Arc::new(engine),
        Arc::new(HyperTunnel::new()),
        Arc::new(credentials),
        Arc::new(cache),
        settings.connector.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    let settings = Settings::new(&opts, Config::load(opts.config.as_deref())?)?;
    let service = build_service(&settings)?;

    for attempt in 1..=opts.count {
        let mut connector = service.connector();
        let conn = connector.connect(&opts.url, None).await?;

        let peer = connector
            .peer_principal()
            .map(|p| p.to_string())
            .unwrap_or_else(|e| e.to_string());
        info!(
            attempt,
            connection = %conn.id(),
            reused = conn.is_reused(),
            cipher = %connector.cipher_suite()?,
            peer = %peer,
            proxy = ?connector.proxy_host()?,
            "connected to {}",
            opts.url
        );

        let (response, conn) = send(conn, Method::GET, &opts.url, &service.config().user_agent).await?;
        info!(attempt, status = %response.status, bytes = response.body.len(), "response received");

        match conn {
            Some(conn) => {
                if !connector.release(conn).await {
                    warn!("connection pool full, connection closed");
                }
            }
            None => info!("server closed the connection"),
        }
    }

    service.shutdown().await?;
    Ok(())
}
