use mail_e2e_exporter::AppResources;
use mail_e2e_exporter::api::auth::ApiAuth;
use mail_e2e_exporter::api::start_webserver;
use mail_e2e_exporter::authority::ConfigAuthority;
use mail_e2e_exporter::config::FileConfigSource;
use mail_e2e_exporter::cycle::RouteCycleRunner;
use mail_e2e_exporter::metrics::MetricsSink;
use mail_e2e_exporter::receiver::ImapMailReceiver;
use mail_e2e_exporter::scheduler::Scheduler;
use mail_e2e_exporter::sender::SmtpMailSender;
use rustls::crypto;
use rustls::crypto::CryptoProvider;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "mail_e2e_exporter=info,hyper=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

fn config_path() -> String {
    env::args()
        .nth(1)
        .or_else(|| env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "config.yaml".to_string())
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    dotenvy::dotenv().ok();
    initialize_tracing();

    let ring_provider = crypto::ring::default_provider();
    CryptoProvider::install_default(ring_provider).expect("Failed to install crypto provider");

    let path = config_path();
    tracing::info!(path = %path, "loading configuration");
    let authority = Arc::new(ConfigAuthority::bootstrap(Box::new(FileConfigSource::new(
        &path,
    )))?);

    let snapshot = authority.current();
    let metrics = Arc::new(MetricsSink::new(
        &snapshot.settings.metrics_prefix,
        env!("CARGO_PKG_VERSION"),
    ));
    let listen: SocketAddr = format!(
        "{}:{}",
        snapshot.settings.listen_addr, snapshot.settings.listen_port
    )
    .parse()?;

    let runner = Arc::new(RouteCycleRunner::new(
        Arc::new(SmtpMailSender),
        Arc::new(ImapMailReceiver),
        Arc::clone(&metrics),
    ));
    let scheduler = Scheduler::new(Arc::clone(&authority), runner, Arc::clone(&metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    let resources = AppResources {
        authority,
        metrics,
        auth: Arc::new(ApiAuth::from_env()),
    };
    start_webserver(resources, listen, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    scheduler_handle.await?;
    tracing::info!("exporter stopped");
    Ok(())
}
