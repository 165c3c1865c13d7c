use anyhow::{Context, Result};
use clap::Parser;
use ldap_directory::server::connection_slots;
use ldap_directory::tls;
use ldap_directory::{run_metrics_server, Config, Directory, LdapServer, Metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ldap-directory")]
#[command(about = "In-memory LDAP v3 directory server with schema validation and LDIF seeding")]
struct Args {
    /// Configuration file path (built-in defaults when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Schema file to load on top of the standard schema (repeatable; replaces schema_files from config)
    #[arg(long = "schema", value_name = "FILE")]
    schema: Vec<String>,

    /// LDIF file to seed the directory with (repeatable; replaces ldif_files from config)
    #[arg(long = "ldif", value_name = "FILE")]
    ldif: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Configuration source: file {:?}", path);
                Config::from_file(path)?
            }
            None => {
                info!("No --config given, using built-in defaults");
                Config::default()
            }
        };
        if !self.schema.is_empty() {
            config.schema_files = self.schema.clone();
        }
        if !self.ldif.is_empty() {
            config.ldif_files = self.ldif.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ldap_directory={},info", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting LDAP directory");

    let config = args.load_config()?;
    info!("Configuration loaded:");
    info!("  Root DN: {}", config.root_dn);
    info!("  Plain listener: {}", config.plain_listen_addr());
    if let Some(addr) = config.tls_listen_addr() {
        info!("  LDAPS listener: {}", addr);
    }
    info!("  Schema files: {}", config.schema_files.len());
    info!("  LDIF files: {}", config.ldif_files.len());

    let tls_acceptor = match &config.tls {
        Some(tls_config) if config.listen_port_tls.is_some() => {
            let acceptor = tls::acceptor_from_config(tls_config)?;
            info!("TLS enabled for LDAPS listener");
            Some(acceptor)
        }
        _ => None,
    };

    let directory = Directory::load(config.clone()).await?;
    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let directory_for_http = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, directory_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let slots = connection_slots(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listeners = Vec::new();

    let plain = LdapServer::bind(
        &config.plain_listen_addr(),
        directory.clone(),
        Arc::clone(&metrics),
        None,
    )
    .await?
    .with_connection_slots(slots.clone());
    listeners.push(tokio::spawn(plain.run(shutdown_rx.clone())));

    if let (Some(addr), Some(acceptor)) = (config.tls_listen_addr(), tls_acceptor) {
        let ldaps = LdapServer::bind(&addr, directory.clone(), Arc::clone(&metrics), Some(acceptor))
            .await?
            .with_connection_slots(slots);
        listeners.push(tokio::spawn(ldaps.run(shutdown_rx)));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested, closing listeners");
    let _ = shutdown_tx.send(true);

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener error: {}", e),
            Err(e) => error!("Listener task failed: {}", e),
        }
    }

    directory.close().await;
    info!("LDAP directory stopped");
    Ok(())
}
