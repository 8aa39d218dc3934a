use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::fetch::peeringdb::PeeringNetwork;

/// Facilities outweigh all but the fastest exchange ports.
pub const FACILITY_WEIGHT: u64 = 100;
const MAX_EXCHANGE_WEIGHT: u64 = 50;
const MAX_DETAILS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeeringSource {
    Peeringdb,
    PeeringdbUpstream,
    FallbackGeo,
}

impl PeeringSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeeringSource::Peeringdb => "peeringdb",
            PeeringSource::PeeringdbUpstream => "peeringdb-upstream",
            PeeringSource::FallbackGeo => "fallback-geo",
        }
    }
}

/// Country a network physically interconnects in, with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringLocation {
    pub country: String,
    pub details: Vec<String>,
    pub source: PeeringSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryScore {
    pub weight: u64,
    pub details: Vec<String>,
}

impl CountryScore {
    fn add(&mut self, weight: u64, name: &str) {
        self.weight += weight;
        if !name.is_empty() && !self.details.iter().any(|d| d == name) {
            self.details.push(name.to_string());
        }
    }
}

/// One point per Gbit/s of port speed, between 1 and 50.
pub fn exchange_weight(speed_mbps: u64) -> u64 {
    (speed_mbps / 1000).clamp(1, MAX_EXCHANGE_WEIGHT)
}

/// Weighted presence per country for one network. Exchanges whose country is
/// unknown are ignored.
pub fn score_network(
    net: &PeeringNetwork,
    exchange_countries: &HashMap<u32, String>,
) -> BTreeMap<String, CountryScore> {
    let mut scores: BTreeMap<String, CountryScore> = BTreeMap::new();
    for fac in net.facilities.iter().filter(|f| !f.country.is_empty()) {
        scores
            .entry(fac.country.to_ascii_uppercase())
            .or_default()
            .add(FACILITY_WEIGHT, &fac.name);
    }
    for port in &net.exchanges {
        let country = match exchange_countries.get(&port.ix_id) {
            Some(cc) if !cc.is_empty() => cc.to_ascii_uppercase(),
            _ => continue,
        };
        scores
            .entry(country)
            .or_default()
            .add(exchange_weight(port.speed), &port.name);
    }
    scores
}

fn capped(details: &[String]) -> Vec<String> {
    details.iter().take(MAX_DETAILS).cloned().collect()
}

/// Triangulates where an offshore network peers.
///
/// The network's own foreign presence wins; then a foreign country shared by at
/// least two upstreams; then the geolocation result. Home is never asserted.
pub fn locate(
    home: &str,
    target: Option<&PeeringNetwork>,
    upstreams: &[&PeeringNetwork],
    exchange_countries: &HashMap<u32, String>,
    geo_dominant: Option<&str>,
) -> Option<PeeringLocation> {
    if let Some(net) = target {
        let own = score_network(net, exchange_countries);
        // BTreeMap order makes ties fall to the alphabetically first country.
        let best = own
            .iter()
            .filter(|(cc, _)| cc.as_str() != home)
            .fold(None::<(&String, &CountryScore)>, |best, cur| match best {
                Some(b) if b.1.weight >= cur.1.weight => Some(b),
                _ => Some(cur),
            });
        if let Some((country, score)) = best {
            return Some(PeeringLocation {
                country: country.clone(),
                details: capped(&score.details),
                source: PeeringSource::Peeringdb,
            });
        }
    }

    let mut shared: BTreeMap<String, (usize, CountryScore)> = BTreeMap::new();
    for up in upstreams {
        for (country, score) in score_network(up, exchange_countries) {
            if country == home {
                continue;
            }
            let entry = shared.entry(country).or_default();
            entry.0 += 1;
            entry.1.weight += score.weight;
            for name in &score.details {
                entry.1.add(0, name);
            }
        }
    }
    let best = shared
        .iter()
        .filter(|(_, (count, _))| *count >= 2)
        .fold(None::<(&String, &(usize, CountryScore))>, |best, cur| match best {
            Some(b) if (b.1 .0, b.1 .1.weight) >= (cur.1 .0, cur.1 .1.weight) => Some(b),
            _ => Some(cur),
        });
    if let Some((country, (_, score))) = best {
        return Some(PeeringLocation {
            country: country.clone(),
            details: capped(&score.details),
            source: PeeringSource::PeeringdbUpstream,
        });
    }

    match geo_dominant {
        Some(cc) if !cc.is_empty() && cc != home => Some(PeeringLocation {
            country: cc.to_string(),
            details: Vec::new(),
            source: PeeringSource::FallbackGeo,
        }),
        _ => None,
    }
}
