use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::as_graph::{GeoLocation, ASN};
use crate::path_record::RawPathRecord;
use crate::rate_limiter::RateLimiter;
use crate::shared::FetchError;

use super::retry::{with_retry, RetryPolicy};
use super::waves::{chunk_prefixes, Progress, WaveSummary, Waves};
use super::{HttpRequest, Transport};

pub const RIPESTAT_BASE: &str = "https://stat.ripe.net/data";

const COUNTRY_TIMEOUT: Duration = Duration::from_secs(60);
const PREFIXES_TIMEOUT: Duration = Duration::from_secs(30);
const ROUTES_TIMEOUT: Duration = Duration::from_secs(120);
const OVERVIEW_TIMEOUT: Duration = Duration::from_secs(15);
const GEO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct CountryResourceData {
    #[serde(default)]
    resources: CountryResourceLists,
}

#[derive(Debug, Default, Deserialize)]
struct CountryResourceLists {
    #[serde(default)]
    asn: Vec<Value>,
    #[serde(default)]
    ipv4: Vec<String>,
    #[serde(default)]
    ipv6: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnnouncedPrefixesData {
    #[serde(default)]
    prefixes: Vec<AnnouncedPrefix>,
}

#[derive(Debug, Deserialize)]
struct AnnouncedPrefix {
    prefix: String,
}

#[derive(Debug, Default, Deserialize)]
struct BgpStateData {
    #[serde(default)]
    bgp_state: Vec<RawPathRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoData {
    #[serde(default)]
    located_resources: Vec<LocatedResource>,
}

#[derive(Debug, Deserialize)]
struct LocatedResource {
    #[serde(default)]
    locations: Vec<RawLocation>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    covered_percentage: f64,
    #[serde(default)]
    resources: Vec<String>,
}

/// Address space and network identifiers registered to one country.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountryResources {
    pub asns: HashSet<ASN>,
    pub prefixes: Vec<IpNetwork>,
}

/// Holder name and announcement state from the overview endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AsOverview {
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub announced: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteFetchSummary {
    pub batches: usize,
    pub failed_batches: usize,
    pub records: u64,
    pub interrupted: bool,
}

/// Parses an ASN given as a number, `"64500"` or `"AS64500"`.
pub fn parse_asn(value: &Value) -> Option<ASN> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| ASN::try_from(v).ok()),
        Value::String(s) => {
            let s = s.trim();
            let digits = s
                .strip_prefix("AS")
                .or_else(|| s.strip_prefix("as"))
                .unwrap_or(s);
            digits.parse::<ASN>().ok()
        }
        _ => None,
    }
}

/// Client for the routing-data, metadata and geolocation endpoints.
pub struct RipeStatClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    base_url: String,
    pub routes_policy: RetryPolicy,
    pub overview_policy: RetryPolicy,
    pub geo_policy: RetryPolicy,
}

impl RipeStatClient {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>) -> Self {
        RipeStatClient {
            transport,
            limiter,
            base_url: RIPESTAT_BASE.to_string(),
            routes_policy: RetryPolicy::new(3),
            overview_policy: RetryPolicy::new(2),
            geo_policy: RetryPolicy::new(2),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_routes_policy(mut self, policy: RetryPolicy) -> Self {
        self.routes_policy = policy;
        self
    }

    pub fn with_overview_policy(mut self, policy: RetryPolicy) -> Self {
        self.overview_policy = policy;
        self
    }

    pub fn with_geo_policy(mut self, policy: RetryPolicy) -> Self {
        self.geo_policy = policy;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn endpoint(&self, name: &str, timeout: Duration) -> HttpRequest {
        HttpRequest::new(format!("{}/{}/data.json", self.base_url, name), timeout)
    }

    fn call<T: DeserializeOwned + Default>(
        &self,
        request: &HttpRequest,
        policy: &RetryPolicy,
        label: &str,
    ) -> Result<T, FetchError> {
        with_retry(policy, &self.limiter, label, FetchError::classify, || {
            let envelope: Envelope<T> = self.transport.get(request)?.json()?;
            match envelope.status.as_deref() {
                None | Some("ok") => Ok(envelope.data.unwrap_or_default()),
                Some(other) => Err(FetchError::ServiceStatus(other.to_string())),
            }
        })
    }

    /// Resolves the country's registered ASNs and allocated prefixes.
    pub fn country_resources(&self, country: &str) -> Result<CountryResources, FetchError> {
        let request = self
            .endpoint("country-resource-list", COUNTRY_TIMEOUT)
            .param("resource", country.to_lowercase())
            .param("v4_format", "prefix");
        let data: CountryResourceData =
            self.call(&request, &self.overview_policy, "country-resources")?;

        let asns: HashSet<ASN> = data.resources.asn.iter().filter_map(parse_asn).collect();
        let mut prefixes = Vec::new();
        for raw in data.resources.ipv4.iter().chain(data.resources.ipv6.iter()) {
            match raw.trim().parse::<IpNetwork>() {
                Ok(net) => prefixes.push(net),
                Err(_) => debug!(prefix = %raw, "skipping unparsable allocation"),
            }
        }
        info!(
            "Found {} ASNs and {} prefixes for {}",
            asns.len(),
            prefixes.len(),
            country.to_uppercase()
        );
        Ok(CountryResources { asns, prefixes })
    }

    pub fn announced_prefixes(&self, asn: ASN) -> Result<Vec<IpNetwork>, FetchError> {
        let request = self
            .endpoint("announced-prefixes", PREFIXES_TIMEOUT)
            .param("resource", format!("AS{}", asn));
        let data: AnnouncedPrefixesData =
            self.call(&request, &self.overview_policy, &format!("AS{} prefixes", asn))?;
        Ok(data
            .prefixes
            .iter()
            .filter_map(|p| p.prefix.trim().parse::<IpNetwork>().ok())
            .collect())
    }

    /// Routing-table state for a comma-joined batch of prefixes.
    pub fn bgp_state(&self, batch: &[String], label: &str) -> Result<Vec<RawPathRecord>, FetchError> {
        let request = self
            .endpoint("bgp-state", ROUTES_TIMEOUT)
            .param("resource", batch.join(","));
        let data: BgpStateData = self.call(&request, &self.routes_policy, label)?;
        Ok(data.bgp_state)
    }

    pub fn as_overview(&self, asn: ASN) -> Result<AsOverview, FetchError> {
        let request = self
            .endpoint("as-overview", OVERVIEW_TIMEOUT)
            .param("resource", format!("AS{}", asn));
        self.call(&request, &self.overview_policy, &format!("AS{} overview", asn))
    }

    /// Located slices of the address space announced by `asn`, in service order.
    pub fn geolocation(&self, asn: ASN) -> Result<Vec<GeoLocation>, FetchError> {
        let request = self
            .endpoint("maxmind-geo-lite-announced-by-as", GEO_TIMEOUT)
            .param("resource", format!("AS{}", asn));
        let data: GeoData = self.call(&request, &self.geo_policy, &format!("AS{} geo", asn))?;
        Ok(data
            .located_resources
            .into_iter()
            .flat_map(|r| r.locations)
            .filter_map(|loc| {
                let country = loc.country.filter(|c| !c.is_empty())?;
                Some(GeoLocation {
                    country,
                    city: loc.city.unwrap_or_default(),
                    percentage: loc.covered_percentage,
                    prefixes: loc.resources,
                })
            })
            .collect())
    }

    /// Adds each network's announced prefixes to the allocation list. This picks up
    /// more-specific announcements that never show up in allocation records.
    pub fn widen_prefixes(
        &self,
        asns: &HashSet<ASN>,
        prefixes: Vec<IpNetwork>,
        waves: &Waves,
    ) -> Vec<IpNetwork> {
        let mut sorted: Vec<ASN> = asns.iter().copied().collect();
        sorted.sort_unstable();

        let progress = Progress::new("announced prefixes", sorted.len()).with_report_every(50);
        let outcome = waves.collect(sorted, &progress, |_, asn| self.announced_prefixes(asn));
        progress.finish();

        let mut seen: HashSet<IpNetwork> = prefixes.iter().copied().collect();
        let mut widened = prefixes;
        let before = widened.len();
        for announced in outcome.successes() {
            for net in announced {
                if seen.insert(net) {
                    widened.push(net);
                }
            }
        }
        info!(
            "Widened prefix set from {} to {} ({} lookups failed)",
            before,
            widened.len(),
            progress.failed()
        );
        widened
    }

    /// Fetches routing state for every prefix, batch by batch, in waves.
    ///
    /// `sink` receives each wave's records once the whole wave has settled. A
    /// failed batch contributes nothing.
    pub fn fetch_routes<E, S>(
        &self,
        prefixes: &[IpNetwork],
        max_batch_len: usize,
        waves: &Waves,
        mut sink: S,
    ) -> Result<RouteFetchSummary, E>
    where
        S: FnMut(Vec<RawPathRecord>) -> Result<(), E>,
    {
        let resources: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
        let batches = chunk_prefixes(&resources, max_batch_len);
        let total = batches.len();
        info!(
            "Fetching BGP routes in {} batches ({} parallel)",
            total, waves.size
        );

        let progress = Progress::new("route batches", total);
        let mut records = 0u64;
        let waves_summary: WaveSummary = waves.run(
            batches,
            &progress,
            |idx, batch| self.bgp_state(&batch, &format!("batch {}", idx + 1)),
            |wave| {
                let mut flat = Vec::new();
                for (_, batch_records) in wave {
                    flat.extend(batch_records);
                }
                records += flat.len() as u64;
                sink(flat)
            },
        )?;
        progress.finish();

        if waves_summary.failed > 0 {
            warn!("{} batches failed even after retries", waves_summary.failed);
        }
        Ok(RouteFetchSummary {
            batches: total,
            failed_batches: waves_summary.failed,
            records,
            interrupted: waves_summary.interrupted,
        })
    }
}
