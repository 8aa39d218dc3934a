use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::as_graph::ASN;

/// Final role of a network in the border graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Outside,
    LicensedGateway,
    OffshoreEnterprise,
    OffshoreGateway,
    DetectedGateway,
    LocalCompany,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Outside,
        Role::LicensedGateway,
        Role::DetectedGateway,
        Role::OffshoreEnterprise,
        Role::OffshoreGateway,
        Role::LocalCompany,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Outside => "outside",
            Role::LicensedGateway => "licensed-gateway",
            Role::OffshoreEnterprise => "offshore-enterprise",
            Role::OffshoreGateway => "offshore-gateway",
            Role::DetectedGateway => "detected-gateway",
            Role::LocalCompany => "local-company",
        }
    }

    /// Offshore gateways sell transit to domestic networks from abroad.
    pub fn is_high_risk(&self) -> bool {
        matches!(self, Role::OffshoreGateway)
    }

    pub fn is_offshore(&self) -> bool {
        matches!(self, Role::OffshoreGateway | Role::OffshoreEnterprise)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeClass {
    International,
    Domestic,
}

impl fmt::Display for EdgeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeClass::International => "international",
            EdgeClass::Domestic => "domestic",
        };
        write!(f, "{}", s)
    }
}

/// How a failed request attempt should be treated by the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::Permanent => "PERMANENT",
        };
        write!(f, "{}", s)
    }
}

lazy_static::lazy_static! {
    /// Registry region codes that look like country codes but are not countries.
    pub static ref INVALID_REGIONS: HashSet<&'static str> =
        ["AP", "EU", "AS", "AF", "LA", "NA", "OC", "AN"].into_iter().collect();

    /// Countries of large transit and content networks whose holder strings carry no country.
    pub static ref WELL_KNOWN_COUNTRIES: HashMap<ASN, &'static str> = [
        (174, "US"), (6939, "US"), (6461, "US"), (3356, "US"), (1299, "SE"),
        (2914, "US"), (3257, "DE"), (3491, "US"), (5511, "FR"), (6762, "IT"),
        (9498, "IN"), (4637, "HK"), (2516, "JP"), (4826, "AU"), (7922, "US"),
        (20473, "US"), (13335, "US"), (16509, "US"), (15169, "US"), (8075, "US"),
        (32934, "US"), (36351, "US"), (46489, "US"), (397143, "US"),
    ]
    .into_iter()
    .collect();
}

/// Two ASCII letters that are not a regional registry code.
pub fn is_country_code(code: &str) -> bool {
    code.len() == 2
        && code.chars().all(|c| c.is_ascii_alphabetic())
        && !INVALID_REGIONS.contains(code.to_ascii_uppercase().as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("service reported status {0:?}")]
    ServiceStatus(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("interrupted")]
    Interrupted,
}

impl FetchError {
    /// Default classification shared by every service call site.
    pub fn classify(&self) -> ErrorClass {
        match self {
            FetchError::RateLimited { .. } => ErrorClass::RateLimited,
            FetchError::Transport(_) => ErrorClass::Transient,
            FetchError::Status(code) if *code >= 500 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io { path: path.display().to_string(), source }
    }

    pub fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        StoreError::Json { path: path.display().to_string(), source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not resolve country resources for {country}: {source}")]
    Setup {
        country: String,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run interrupted before completion")]
    Interrupted,
}
