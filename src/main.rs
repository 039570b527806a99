use anyhow::{Context, Result};
use artifact_service::{
    AppState, HttpSettings,
    audit::AuditSink,
    config::{AppConfig, AuditSinkKind, StorageBackendKind},
    object_store::{FsObjectStore, ObjectStore, UrlSigner},
    routes,
    services::Reconciler,
    store::{MetadataStore, SqliteMetadataStore},
};
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        backend = ?cfg.storage_backend,
        staleness = ?cfg.core.staleness_threshold,
        interval = ?cfg.core.reconcile_interval,
        "starting artifact-service"
    );

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let sqlite = SqliteMetadataStore::connect(&cfg.database_url, 5, cfg.core.store_timeout)
        .await
        .with_context(|| format!("opening metadata store at {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    let metadata: Arc<dyn MetadataStore> = Arc::new(sqlite);

    // --- Object store ---
    let public_base = cfg
        .public_base_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", cfg.addr()));
    let mut fs_gateway = None;
    let objects: Arc<dyn ObjectStore> = match cfg.storage_backend {
        StorageBackendKind::Fs => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let signer = match &cfg.signing_key {
                Some(key) => UrlSigner::new(key.as_bytes()),
                None => {
                    tracing::warn!(
                        "no ARTIFACT_SERVICE_SIGNING_KEY set; presigned object URLs will not survive a restart"
                    );
                    UrlSigner::random()
                }
            };
            let store = FsObjectStore::new(&cfg.storage_dir, public_base, signer);
            fs_gateway = Some(store.clone());
            Arc::new(store)
        }
        StorageBackendKind::S3 => s3_backend(&cfg).await?,
    };

    // --- Audit sink ---
    let audit = match cfg.audit_sink {
        AuditSinkKind::Local => AuditSink::Local,
        AuditSinkKind::Remote => {
            let endpoint = cfg
                .audit_endpoint
                .clone()
                .context("remote audit sink requires an endpoint")?;
            AuditSink::remote(endpoint).context("building audit http client")?
        }
    };
    tracing::info!(sink = audit.name(), "audit sink initialised");

    // --- Background reconciler ---
    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(metadata.clone(), objects.clone(), cfg.core)
        .spawn(shutdown.child_token());

    // --- Build router ---
    let http = HttpSettings {
        public_base_url: cfg.public_base_url.clone(),
        trust_forwarded_for: cfg.trust_forwarded_for,
        storage_quota: cfg.storage_quota,
        max_upload_bytes: cfg.max_upload_bytes,
    };
    let mut state = AppState::new(metadata, objects, cfg.core, http, audit);
    if let Some(gateway) = fs_gateway {
        state = state.with_fs_gateway(gateway);
    }
    let app = routes::routes(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for shutdown signal: {}", err);
        }
        tracing::info!("shutdown requested");
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    reconciler.await.context("reconciler task panicked")?;
    Ok(())
}

#[cfg(feature = "s3")]
async fn s3_backend(cfg: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    let store = artifact_service::object_store::S3ObjectStore::connect(
        cfg.s3_bucket.clone(),
        cfg.s3_endpoint.clone(),
        cfg.s3_region.clone(),
    )
    .await;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "s3"))]
async fn s3_backend(_cfg: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    anyhow::bail!("the s3 storage backend requires building with `--features s3`")
}
