use crate::services::CoreConfig;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "ARTIFACT_SERVICE_";

/// Where artifact payloads are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendKind {
    /// Sharded local directory; presigned URLs are served by this process.
    Fs,
    /// S3-compatible bucket (requires the `s3` feature).
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuditSinkKind {
    Local,
    Remote,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_backend: StorageBackendKind,
    pub storage_dir: String,
    /// HMAC key for fs presigned URLs. `None` means a random per-process key.
    pub signing_key: Option<String>,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    /// Externally visible origin used in token and presigned URLs.
    pub public_base_url: Option<String>,
    pub core: CoreConfig,
    /// Capacity reported by the storage usage endpoint, in bytes.
    pub storage_quota: i64,
    pub max_upload_bytes: usize,
    pub audit_sink: AuditSinkKind,
    pub audit_endpoint: Option<String>,
    pub trust_forwarded_for: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Artifact storage service with token-gated access")]
pub struct Args {
    /// Host to bind to (overrides ARTIFACT_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ARTIFACT_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides ARTIFACT_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage backend (overrides ARTIFACT_SERVICE_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub storage_backend: Option<StorageBackendKind>,

    /// Directory where objects are stored (overrides ARTIFACT_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket for the s3 backend (overrides ARTIFACT_SERVICE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint, e.g. a Ceph RGW (overrides ARTIFACT_SERVICE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Externally visible base URL (overrides ARTIFACT_SERVICE_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// How long an upload may stay pending, e.g. `30m` (overrides ARTIFACT_SERVICE_STALENESS)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub staleness: Option<Duration>,

    /// Reconciliation period (overrides ARTIFACT_SERVICE_RECONCILE_INTERVAL)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub reconcile_interval: Option<Duration>,

    /// Lifetime of presigned URLs (overrides ARTIFACT_SERVICE_PRESIGN_EXPIRY)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub presign_expiry: Option<Duration>,

    /// Upper bound on each store call (overrides ARTIFACT_SERVICE_STORE_TIMEOUT)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub store_timeout: Option<Duration>,

    /// Reported storage capacity in bytes (overrides ARTIFACT_SERVICE_STORAGE_QUOTA)
    #[arg(long)]
    pub storage_quota: Option<i64>,

    /// Largest accepted multipart upload in bytes (overrides ARTIFACT_SERVICE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Audit sink (overrides ARTIFACT_SERVICE_AUDIT_SINK)
    #[arg(long, value_enum)]
    pub audit_sink: Option<AuditSinkKind>,

    /// Collector URL for the remote audit sink (overrides ARTIFACT_SERVICE_AUDIT_ENDPOINT)
    #[arg(long)]
    pub audit_endpoint: Option<String>,

    /// Take the client address from X-Forwarded-For
    #[arg(long)]
    pub trust_forwarded_for: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables visible through `lookup` over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvReader { lookup };
        let defaults = CoreConfig::default();

        let core = CoreConfig {
            staleness_threshold: args
                .staleness
                .or(env.duration("STALENESS")?)
                .unwrap_or(defaults.staleness_threshold),
            reconcile_interval: args
                .reconcile_interval
                .or(env.duration("RECONCILE_INTERVAL")?)
                .unwrap_or(defaults.reconcile_interval),
            presign_expiry: args
                .presign_expiry
                .or(env.duration("PRESIGN_EXPIRY")?)
                .unwrap_or(defaults.presign_expiry),
            store_timeout: args
                .store_timeout
                .or(env.duration("STORE_TIMEOUT")?)
                .unwrap_or(defaults.store_timeout),
        };

        let storage_backend = match args.storage_backend {
            Some(kind) => kind,
            None => env.value_enum("STORAGE_BACKEND")?.unwrap_or(StorageBackendKind::Fs),
        };
        let audit_sink = match args.audit_sink {
            Some(kind) => kind,
            None => env.value_enum("AUDIT_SINK")?.unwrap_or(AuditSinkKind::Local),
        };

        let cfg = Self {
            host: args
                .host
                .or(env.string("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => env.parsed("PORT")?.unwrap_or(8080),
            },
            database_url: args
                .database_url
                .or(env.string("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/artifacts.db".into()),
            storage_backend,
            storage_dir: args
                .storage_dir
                .or(env.string("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            signing_key: env.string("SIGNING_KEY"),
            s3_bucket: args
                .s3_bucket
                .or(env.string("S3_BUCKET"))
                .unwrap_or_else(|| "artifacts".into()),
            s3_endpoint: args.s3_endpoint.or(env.string("S3_ENDPOINT")),
            s3_region: env.string("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            public_base_url: args
                .public_base_url
                .or(env.string("PUBLIC_BASE_URL"))
                .map(|url| url.trim_end_matches('/').to_string()),
            core,
            storage_quota: match args.storage_quota {
                Some(quota) => quota,
                None => env.parsed("STORAGE_QUOTA")?.unwrap_or(10 * 1024 * 1024 * 1024),
            },
            max_upload_bytes: match args.max_upload_bytes {
                Some(max) => max,
                None => env.parsed("MAX_UPLOAD_BYTES")?.unwrap_or(1024 * 1024 * 1024),
            },
            audit_sink,
            audit_endpoint: args.audit_endpoint.or(env.string("AUDIT_ENDPOINT")),
            trust_forwarded_for: args.trust_forwarded_for
                || env.flag("TRUST_FORWARDED_FOR")?.unwrap_or(false),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.core.reconcile_interval.is_zero() {
            bail!("reconcile interval must be greater than zero");
        }
        if self.core.store_timeout.is_zero() {
            bail!("store timeout must be greater than zero");
        }
        if self.core.presign_expiry.is_zero() {
            bail!("presign expiry must be greater than zero");
        }
        if self.storage_quota < 0 {
            bail!("storage quota must not be negative");
        }
        if self.audit_sink == AuditSinkKind::Remote && self.audit_endpoint.is_none() {
            bail!("the remote audit sink needs ARTIFACT_SERVICE_AUDIT_ENDPOINT");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, suffix: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(suffix)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .with_context(|| format!("parsing {ENV_PREFIX}{suffix} value `{value}`"))
            })
            .transpose()
    }

    fn duration(&self, suffix: &str) -> Result<Option<Duration>> {
        self.string(suffix)
            .map(|value| {
                humantime::parse_duration(value.trim())
                    .with_context(|| format!("parsing {ENV_PREFIX}{suffix} value `{value}`"))
            })
            .transpose()
    }

    fn flag(&self, suffix: &str) -> Result<Option<bool>> {
        self.string(suffix)
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("parsing {ENV_PREFIX}{suffix} value `{value}`: expected a boolean"),
            })
            .transpose()
    }

    fn value_enum<T: ValueEnum>(&self, suffix: &str) -> Result<Option<T>> {
        self.string(suffix)
            .map(|value| {
                T::from_str(value.trim(), true).map_err(|err| {
                    anyhow::anyhow!("parsing {ENV_PREFIX}{suffix} value `{value}`: {err}")
                })
            })
            .transpose()
    }
}
