use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use webreplay::archive::{Archive, MemoryArchive};
use webreplay::cache_miss::{CacheMissLog, CacheMissObserver};
use webreplay::dispatch::ModeController;
use webreplay::dns::SystemResolver;
use webreplay::http_client::{Fetch, OriginFetcher};
use webreplay::inject::load_inject_script;
use webreplay::mitm::{CertificateAuthority, TlsInterceptor};
use webreplay::server::{self, ServerContext};
use webreplay::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(config.log_json);
    info!("Starting webreplay...");

    // Script resolution failure is fatal
    let inject_script = if config.inject_scripts.is_empty() {
        None
    } else {
        Some(load_inject_script(&config.inject_scripts).context("Failed to load inject scripts")?)
    };

    let archive = Arc::new(load_archive(&config.archive_path).await?);
    info!(
        path = %config.archive_path.display(),
        entries = archive.len().await,
        "Archive loaded"
    );

    let ca = CertificateAuthority::load_or_generate(&config.ca_cert_path, &config.ca_key_path, config.cert_cache_size)
        .context("Failed to initialise certificate authority")?;
    info!(cert = %config.ca_cert_path.display(), "Certificate authority ready");

    let resolver = Arc::new(SystemResolver::new(
        config.dns_cache_size,
        config.dns_cache_ttl_seconds,
        config.dns_resolver_timeout_seconds,
    ));
    let fetcher: Arc<dyn Fetch> = Arc::new(OriginFetcher::from_config(
        &config,
        resolver,
        Arc::clone(&archive) as Arc<dyn Archive>,
    ));

    let cache_miss_log = config.cache_miss_log_path.as_ref().map(|_| Arc::new(CacheMissLog::new()));
    let observer = cache_miss_log
        .as_ref()
        .map(|log| Arc::clone(log) as Arc<dyn CacheMissObserver>);

    let controller = Arc::new(ModeController::new(
        config.dispatch_options(inject_script),
        Arc::clone(&archive) as Arc<dyn Archive>,
        fetcher,
        observer,
    ));
    info!(record_mode = controller.is_record_mode(), "Dispatcher ready");

    let ctx = Arc::new(ServerContext::new(
        Arc::clone(&controller),
        Arc::new(TlsInterceptor::new(Arc::new(ca))),
        config.use_delays,
    ));

    let http_listener = TcpListener::bind(config.http_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr()))?;
    let https_listener = TcpListener::bind(config.https_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.https_addr()))?;

    // Set once anything may have been recorded
    let recorded = Arc::new(AtomicBool::new(config.record_mode));
    tokio::spawn(mode_toggle_handler(Arc::clone(&controller), Arc::clone(&recorded)));

    tokio::select! {
        result = server::run_http_listener(http_listener, Arc::clone(&ctx)) => {
            error!("HTTP listener stopped");
            result?;
        }
        result = server::run_https_listener(https_listener, Arc::clone(&ctx)) => {
            error!("HTTPS listener stopped");
            result?;
        }
        _ = shutdown_signal() => {
            info!("Shutting down server...");
        }
    }

    if recorded.load(Ordering::SeqCst) {
        archive
            .save(&config.archive_path)
            .await
            .with_context(|| format!("Failed to save archive to {}", config.archive_path.display()))?;
        info!(path = %config.archive_path.display(), entries = archive.len().await, "Archive saved");
    }

    if let (Some(log), Some(path)) = (&cache_miss_log, &config.cache_miss_log_path) {
        log.save_json(path)
            .await
            .with_context(|| format!("Failed to save cache-miss log to {}", path.display()))?;
        info!(
            path = %path.display(),
            requests = log.request_count(),
            misses = log.miss_count(),
            "Cache-miss log saved"
        );
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn load_archive(path: &Path) -> Result<MemoryArchive> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        MemoryArchive::load(path)
            .await
            .with_context(|| format!("Failed to load archive {}", path.display()))
    } else {
        warn!(path = %path.display(), "Archive not found, starting empty");
        Ok(MemoryArchive::new())
    }
}

/// SIGUSR1 flips between record and replay mode
async fn mode_toggle_handler(controller: Arc<ModeController>, recorded: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGUSR1 handler, mode toggling disabled");
                return;
            }
        };

        while sigusr1.recv().await.is_some() {
            if controller.is_record_mode() {
                controller.set_replay_mode();
                info!("SIGUSR1 received - switched to replay mode");
            } else {
                recorded.store(true, Ordering::SeqCst);
                controller.set_record_mode();
                info!("SIGUSR1 received - switched to record mode");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (controller, recorded);
        std::future::pending::<()>().await;
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }

    // Give in-flight responses a moment before state is persisted
    tokio::time::sleep(Duration::from_millis(100)).await;
}
