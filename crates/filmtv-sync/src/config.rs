use std::path::PathBuf;
use std::time::Duration;

use filmtv_adapters::{HUMO_DEFAULT_BASE_URL, TMDB_DEFAULT_BASE_URL};
use filmtv_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationConfig {
    pub api_key: String,
    pub base_url: String,
    pub country: String,
}

/// Pipeline settings, read once and handed to each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub current_db_url: String,
    pub catalog_db_url: String,
    pub history_db_url: String,
    pub guide_base_url: String,
    pub lookahead_days: u32,
    pub year_tolerance: u32,
    pub rules_path: PathBuf,
    pub catalog_titles_path: PathBuf,
    pub catalog_ratings_path: PathBuf,
    pub certification: Option<CertificationConfig>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(text(key, default));

        let certification = get("FILMTV_CERTIFICATION_API_KEY").map(|api_key| CertificationConfig {
            api_key,
            base_url: text("FILMTV_CERTIFICATION_BASE_URL", TMDB_DEFAULT_BASE_URL),
            country: text("FILMTV_CERTIFICATION_COUNTRY", "US"),
        });

        Ok(Self {
            current_db_url: text("FILMTV_CURRENT_DB_URL", "sqlite://data/filmtv.db"),
            catalog_db_url: text("FILMTV_CATALOG_DB_URL", "sqlite://data/catalog.db"),
            history_db_url: text("FILMTV_HISTORY_DB_URL", "sqlite://data/filmtv-history.db"),
            guide_base_url: text("FILMTV_GUIDE_BASE_URL", HUMO_DEFAULT_BASE_URL),
            lookahead_days: number(&get, "FILMTV_LOOKAHEAD_DAYS", 7)?,
            year_tolerance: number(&get, "FILMTV_YEAR_TOLERANCE", 2)?,
            rules_path: path("FILMTV_RULES_PATH", "rules/titles.yaml"),
            catalog_titles_path: path("FILMTV_CATALOG_TITLES_PATH", "data/title.basics.tsv.gz"),
            catalog_ratings_path: path("FILMTV_CATALOG_RATINGS_PATH", "data/title.ratings.tsv.gz"),
            certification,
            user_agent: text("FILMTV_USER_AGENT", "filmtv-bot/0.1"),
            http_timeout_secs: number(&get, "FILMTV_HTTP_TIMEOUT_SECS", 20)?,
            http_max_retries: number(&get, "FILMTV_HTTP_MAX_RETRIES", 3)?,
            archive_dir: get("FILMTV_ARCHIVE_DIR").map(PathBuf::from),
            reports_dir: path("FILMTV_REPORTS_DIR", "reports"),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}
