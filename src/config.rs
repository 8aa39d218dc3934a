use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetch::peeringdb::PEERINGDB_BASE;
use crate::fetch::ripestat::RIPESTAT_BASE;
use crate::rate_limiter::MIN_RATE;
use crate::shared::{is_country_code, PipelineError};
use crate::store::read_json;

pub const CONFIG_ENV: &str = "BORDERGRAPH_CONFIG";
const ENV_PREFIX: &str = "BORDERGRAPH_";

/// Settings for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Two-letter code of the country being mapped
    pub country: String,

    /// Human-readable country name for the run metadata
    pub country_name: Option<String>,

    /// Output directory; defaults to `<data dir>/bordergraph/<CC>`
    pub data_dir: Option<PathBuf>,

    /// License registry; defaults to `licenses.json` in the data directory
    pub license_file: Option<PathBuf>,

    /// Shared request rate for the routing and metadata services
    pub requests_per_second: f64,

    /// Request rate for the peering directory
    pub peering_requests_per_second: f64,

    /// Longest comma-joined prefix list per routing-state request
    pub route_batch_max_len: usize,

    pub route_concurrency: usize,
    pub overview_concurrency: usize,
    pub geo_concurrency: usize,
    pub widen_concurrency: usize,

    /// Add each network's announced prefixes to the allocation list before fetching
    pub widen_with_announced: bool,

    pub route_retries: u32,
    pub overview_retries: u32,
    pub geo_retries: u32,
    pub peering_retries: u32,

    /// First transport backoff in seconds; doubles per attempt
    pub retry_backoff_secs: f64,

    /// Wait in seconds after a rate-limited response without `Retry-After`
    pub rate_limit_fallback_secs: f64,

    pub top_international: usize,
    pub top_domestic: usize,

    /// Share of located space at home above which a network counts as home-based
    pub geo_home_threshold: f64,

    /// Upstream neighbors consulted per offshore network
    pub max_upstreams: usize,

    pub peering_enabled: bool,

    /// Skip the route fetch and re-analyze the existing raw store
    pub reprocess: bool,

    /// Collapse duplicate observations in the raw store after fetching
    pub dedup_raw_store: bool,

    pub ripestat_base: String,
    pub peeringdb_base: String,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            country: "BD".to_string(),
            country_name: None,
            data_dir: None,
            license_file: None,
            requests_per_second: 4.0,
            peering_requests_per_second: 1.0 / 3.0,
            route_batch_max_len: 1800,
            route_concurrency: 5,
            overview_concurrency: 20,
            geo_concurrency: 10,
            widen_concurrency: 10,
            widen_with_announced: false,
            route_retries: 3,
            overview_retries: 2,
            geo_retries: 2,
            peering_retries: 2,
            retry_backoff_secs: 2.0,
            rate_limit_fallback_secs: 60.0,
            top_international: 1000,
            top_domestic: 2000,
            geo_home_threshold: 0.8,
            max_upstreams: 3,
            peering_enabled: true,
            reprocess: false,
            dedup_raw_store: false,
            ripestat_base: RIPESTAT_BASE.to_string(),
            peeringdb_base: PEERINGDB_BASE.to_string(),
            user_agent: concat!("bordergraph/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Longest configurable retry wait.
pub const MAX_WAIT_SECS: f64 = 3600.0;

fn bounded_wait(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_WAIT_SECS)).unwrap_or(Duration::ZERO)
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, PipelineError> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{}{}: cannot parse {:?}", ENV_PREFIX, key, raw)))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, PipelineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(PipelineError::Config(format!(
            "{}{}: expected a boolean, got {:?}",
            ENV_PREFIX, key, raw
        ))),
    }
}

impl PipelineConfig {
    pub fn new(country: &str) -> Self {
        PipelineConfig {
            country: country.to_ascii_uppercase(),
            ..Default::default()
        }
    }

    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        read_json(path).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// File named by `BORDERGRAPH_CONFIG` (if any), then environment overrides.
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BORDERGRAPH_*` overrides. `lookup` receives the name without the prefix.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COUNTRY") {
            self.country = v.trim().to_ascii_uppercase();
        }
        if let Some(v) = lookup("COUNTRY_NAME") {
            self.country_name = Some(v);
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LICENSE_FILE") {
            self.license_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RPS") {
            self.requests_per_second = parse_env("RPS", &v)?;
        }
        if let Some(v) = lookup("ROUTE_CONCURRENCY") {
            self.route_concurrency = parse_env("ROUTE_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("TOP_INTERNATIONAL") {
            self.top_international = parse_env("TOP_INTERNATIONAL", &v)?;
        }
        if let Some(v) = lookup("TOP_DOMESTIC") {
            self.top_domestic = parse_env("TOP_DOMESTIC", &v)?;
        }
        if let Some(v) = lookup("WIDEN") {
            self.widen_with_announced = parse_flag("WIDEN", &v)?;
        }
        if let Some(v) = lookup("PEERINGDB") {
            self.peering_enabled = parse_flag("PEERINGDB", &v)?;
        }
        if let Some(v) = lookup("REPROCESS") {
            self.reprocess = parse_flag("REPROCESS", &v)?;
        }
        if let Some(v) = lookup("DEDUP") {
            self.dedup_raw_store = parse_flag("DEDUP", &v)?;
        }
        debug!(config = ?self,"configuration after environment overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !is_country_code(&self.country) {
            return Err(PipelineError::Config(format!(
                "{:?} is not a two-letter country code",
                self.country
            )));
        }
        let rates = [self.requests_per_second, self.peering_requests_per_second];
        if !rates.iter().all(|r| r.is_finite() && *r >= MIN_RATE) {
            return Err(PipelineError::Config(format!(
                "request rates must be finite and at least {}",
                MIN_RATE
            )));
        }
        let waits = [self.retry_backoff_secs, self.rate_limit_fallback_secs];
        if !waits.iter().all(|w| (0.0..=MAX_WAIT_SECS).contains(w)) {
            return Err(PipelineError::Config(format!(
                "retry waits must be between 0 and {} seconds",
                MAX_WAIT_SECS
            )));
        }
        if !(0.0..=1.0).contains(&self.geo_home_threshold) {
            return Err(PipelineError::Config(
                "geo_home_threshold must be between 0 and 1".to_string(),
            ));
        }
        if self.route_batch_max_len == 0 {
            return Err(PipelineError::Config("route_batch_max_len must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_license_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.license_file = Some(path.into());
        self
    }

    pub fn with_requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn with_peering_requests_per_second(mut self, rps: f64) -> Self {
        self.peering_requests_per_second = rps;
        self
    }

    pub fn with_retry_timing(mut self, backoff_secs: f64, rate_limit_fallback_secs: f64) -> Self {
        self.retry_backoff_secs = backoff_secs;
        self.rate_limit_fallback_secs = rate_limit_fallback_secs;
        self
    }

    pub fn with_top_k(mut self, international: usize, domestic: usize) -> Self {
        self.top_international = international;
        self.top_domestic = domestic;
        self
    }

    pub fn with_widening(mut self, enabled: bool) -> Self {
        self.widen_with_announced = enabled;
        self
    }

    pub fn with_peering(mut self, enabled: bool) -> Self {
        self.peering_enabled = enabled;
        self
    }

    pub fn with_reprocess(mut self, enabled: bool) -> Self {
        self.reprocess = enabled;
        self
    }

    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup_raw_store = enabled;
        self
    }

    pub fn country_name(&self) -> String {
        self.country_name.clone().unwrap_or_else(|| self.country.clone())
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("data"))
                .join("bordergraph")
                .join(&self.country),
        }
    }

    pub fn license_path(&self) -> PathBuf {
        self.license_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("licenses.json"))
    }

    pub fn raw_store_path(&self) -> PathBuf {
        self.data_dir().join("bgp_routes_raw.jsonl")
    }

    pub fn asn_table_path(&self) -> PathBuf {
        self.data_dir().join("asn_names.json")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir().join("viz_data.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir().join("metadata.json")
    }

    pub fn retry_backoff(&self) -> Duration {
        bounded_wait(self.retry_backoff_secs)
    }

    pub fn rate_limit_fallback(&self) -> Duration {
        bounded_wait(self.rate_limit_fallback_secs)
    }
}
