use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde::Deserialize;
use tracing::debug;

use crate::as_graph::ASN;
use crate::rate_limiter::RateLimiter;
use crate::shared::FetchError;

use super::retry::{with_retry, RetryPolicy};
use super::{HttpRequest, Transport};

pub const PEERINGDB_BASE: &str = "https://www.peeringdb.com/api";

const PEERINGDB_TIMEOUT: Duration = Duration::from_secs(30);

/// ASNs per `asn__in` query.
const NET_BATCH: usize = 50;
const IX_BATCH: usize = 100;

/// A colocation facility a network is present in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Facility {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
}

/// A port on an internet exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExchangePort {
    pub ix_id: u32,
    #[serde(default)]
    pub name: String,
    /// Port speed in Mbit/s.
    #[serde(default)]
    pub speed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeeringNetwork {
    pub asn: ASN,
    #[serde(default, rename = "netfac_set")]
    pub facilities: Vec<Facility>,
    #[serde(default, rename = "netixlan_set")]
    pub exchanges: Vec<ExchangePort>,
}

#[derive(Debug, Deserialize)]
struct DataList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Exchange {
    id: u32,
    #[serde(default)]
    country: String,
}

/// Client for the peering directory. It runs on its own, much slower limiter.
pub struct PeeringDbClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    base_url: String,
    pub policy: RetryPolicy,
    exchange_cache: Mutex<LruCache<u32, String>>,
}

impl PeeringDbClient {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>) -> Self {
        PeeringDbClient {
            transport,
            limiter,
            base_url: PEERINGDB_BASE.to_string(),
            policy: RetryPolicy::new(2),
            exchange_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(4096).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn list<T: serde::de::DeserializeOwned>(
        &self,
        request: &HttpRequest,
        label: &str,
    ) -> Result<Vec<T>, FetchError> {
        with_retry(&self.policy, &self.limiter, label, FetchError::classify, || {
            let list: DataList<T> = self.transport.get(request)?.json()?;
            Ok(list.data)
        })
    }

    /// Facility and exchange membership for every listed network that has a record.
    pub fn networks(&self, asns: &[ASN]) -> Result<HashMap<ASN, PeeringNetwork>, FetchError> {
        let mut unique: Vec<ASN> = asns.iter().copied().collect::<HashSet<_>>().into_iter().collect();
        unique.sort_unstable();

        let mut found = HashMap::new();
        for chunk in unique.chunks(NET_BATCH) {
            let ids: Vec<String> = chunk.iter().map(|a| a.to_string()).collect();
            let request = HttpRequest::new(format!("{}/net", self.base_url), PEERINGDB_TIMEOUT)
                .param("asn__in", ids.join(","))
                .param("depth", "2");
            let networks: Vec<PeeringNetwork> =
                self.list(&request, &format!("peering net x{}", chunk.len()))?;
            debug!(requested = chunk.len(), returned = networks.len(), "peering networks");
            for net in networks {
                found.insert(net.asn, net);
            }
        }
        Ok(found)
    }

    /// Countries of the given exchanges. Resolved ids are remembered across calls.
    pub fn exchange_countries(&self, ids: &[u32]) -> Result<HashMap<u32, String>, FetchError> {
        let mut resolved = HashMap::new();
        let mut missing: Vec<u32> = Vec::new();
        {
            let mut cache = self.exchange_cache.lock().unwrap_or_else(|e| e.into_inner());
            for &id in ids.iter().collect::<HashSet<_>>() {
                match cache.get(&id) {
                    Some(country) => {
                        resolved.insert(id, country.clone());
                    }
                    None => missing.push(id),
                }
            }
        }
        missing.sort_unstable();

        for chunk in missing.chunks(IX_BATCH) {
            let ids: Vec<String> = chunk.iter().map(|i| i.to_string()).collect();
            let request = HttpRequest::new(format!("{}/ix", self.base_url), PEERINGDB_TIMEOUT)
                .param("id__in", ids.join(","));
            let exchanges: Vec<Exchange> =
                self.list(&request, &format!("peering ix x{}", chunk.len()))?;

            let mut cache = self.exchange_cache.lock().unwrap_or_else(|e| e.into_inner());
            for ix in exchanges {
                cache.put(ix.id, ix.country.clone());
                resolved.insert(ix.id, ix.country);
            }
        }
        Ok(resolved)
    }

    pub fn cached_exchanges(&self) -> usize {
        self.exchange_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
