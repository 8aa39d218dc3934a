use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::{analyze_stream, Analysis};
use crate::as_graph::{GraphStats, ASN};
use crate::classifier::{offshore_asns, GraphBuilder};
use crate::config::PipelineConfig;
use crate::enricher::{AsnTable, EnrichmentReport, MetadataEnricher};
use crate::fetch::ripestat::RouteFetchSummary;
use crate::fetch::{PeeringDbClient, ReqwestTransport, RetryPolicy, RipeStatClient, Transport, Waves};
use crate::license::LicenseRegistry;
use crate::rate_limiter::RateLimiter;
use crate::shared::{FetchError, PipelineError, StoreError};
use crate::store::{dedup_record_store, write_json_atomic, DedupReport, RecordStream, RecordWriter};

pub const SCHEMA_VERSION: u32 = 3;
pub const MODEL_NAME: &str = "license-aware";

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    country: &'a str,
    country_name: String,
    last_updated: String,
    schema_version: u32,
    model: &'static str,
    stats: &'a GraphStats,
    source: &'static str,
}

/// What a completed run did, for logging and the exit status.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub country: String,
    pub country_asns: usize,
    pub prefixes: usize,
    pub routes: Option<RouteFetchSummary>,
    pub dedup: Option<DedupReport>,
    pub valid_observations: u64,
    pub invalid_records: u64,
    pub duplicate_observations: u64,
    pub enrichment: EnrichmentReport,
    pub stats: GraphStats,
    pub rate_limited_waits: u64,
    pub outputs: Vec<PathBuf>,
}

impl RunSummary {
    /// Units that contributed nothing after exhausting their retries.
    pub fn failed_units(&self) -> usize {
        self.routes.map_or(0, |r| r.failed_batches) + self.enrichment.failures()
    }

    pub fn log(&self) {
        info!("Run complete for {}", self.country);
        info!(
            "Country resources: {} ASNs, {} prefixes",
            self.country_asns, self.prefixes
        );
        if let Some(routes) = &self.routes {
            info!(
                "Routes: {} records from {} batches ({} failed)",
                routes.records, routes.batches, routes.failed_batches
            );
        }
        info!(
            "Observations: {} valid, {} invalid, {} duplicate",
            self.valid_observations, self.invalid_records, self.duplicate_observations
        );
        info!(
            "Nodes: {} outside, {} licensed, {} detected, {} offshore gateway, {} offshore enterprise, {} local",
            self.stats.total_outside,
            self.stats.total_licensed_gateway,
            self.stats.total_detected_gateway,
            self.stats.total_offshore_gateway,
            self.stats.total_offshore_enterprise,
            self.stats.total_local_company
        );
        info!(
            "Failed units: {} (overview {}, geo {}, peering {}), rate limiter waits: {}",
            self.failed_units(),
            self.enrichment.overview_failures,
            self.enrichment.geo_failures,
            self.enrichment.peering_failures,
            self.rate_limited_waits
        );
        for path in &self.outputs {
            info!("Wrote {}", path.display());
        }
    }
}

/// Runs fetch, analysis, enrichment and classification in order.
pub struct Pipeline {
    config: PipelineConfig,
    transport: Option<Arc<dyn Transport>>,
    interrupt: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            transport: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn check_interrupt(&self) -> Result<(), PipelineError> {
        if self.interrupt.load(Ordering::SeqCst) {
            warn!("interrupt received, stopping before writing outputs");
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }

    fn policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries)
            .with_initial_backoff(self.config.retry_backoff())
            .with_rate_limit_fallback(self.config.rate_limit_fallback())
            .with_interrupt(Arc::clone(&self.interrupt))
    }

    fn waves(&self, size: usize) -> Waves {
        Waves::new(size).with_interrupt(Arc::clone(&self.interrupt))
    }

    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let cfg = &self.config;
        cfg.validate()?;
        let country = cfg.country.to_ascii_uppercase();
        let data_dir = cfg.data_dir();
        fs::create_dir_all(&data_dir).map_err(|e| StoreError::io(&data_dir, e))?;
        info!("Mapping {} into {}", country, data_dir.display());

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(t) => Arc::clone(t),
            None => Arc::new(ReqwestTransport::new(&cfg.user_agent).map_err(|source| {
                PipelineError::Setup {
                    country: country.clone(),
                    source,
                }
            })?),
        };
        let limiter = Arc::new(RateLimiter::new(cfg.requests_per_second));
        let ripestat = RipeStatClient::new(Arc::clone(&transport), Arc::clone(&limiter))
            .with_base_url(&cfg.ripestat_base)
            .with_routes_policy(self.policy(cfg.route_retries))
            .with_overview_policy(self.policy(cfg.overview_retries))
            .with_geo_policy(self.policy(cfg.geo_retries));

        let mut summary = RunSummary {
            country: country.clone(),
            ..Default::default()
        };

        let resources = match ripestat.country_resources(&country) {
            Ok(r) => r,
            Err(FetchError::Interrupted) => return Err(PipelineError::Interrupted),
            Err(source) => return Err(PipelineError::Setup { country, source }),
        };
        summary.country_asns = resources.asns.len();
        let country_set = resources.asns;

        let raw_path = cfg.raw_store_path();
        if cfg.reprocess {
            if !raw_path.exists() {
                return Err(PipelineError::Config(format!(
                    "nothing to reprocess: {} does not exist",
                    raw_path.display()
                )));
            }
            info!("Reprocessing existing store {}", raw_path.display());
            summary.prefixes = resources.prefixes.len();
        } else {
            let prefixes = if cfg.widen_with_announced {
                ripestat.widen_prefixes(&country_set, resources.prefixes, &self.waves(cfg.widen_concurrency))
            } else {
                resources.prefixes
            };
            summary.prefixes = prefixes.len();
            self.check_interrupt()?;

            let mut writer = RecordWriter::create(&raw_path)?;
            let routes = ripestat.fetch_routes(
                &prefixes,
                cfg.route_batch_max_len,
                &self.waves(cfg.route_concurrency),
                |records| writer.write_all(&records),
            )?;
            summary.routes = Some(routes);
            if routes.interrupted {
                return Err(PipelineError::Interrupted);
            }
            self.check_interrupt()?;
            writer.finish()?;

            if cfg.dedup_raw_store {
                let dedup_path = data_dir.join("bgp_routes_dedup.jsonl");
                let report = dedup_record_store(&raw_path, &dedup_path)?;
                fs::rename(&dedup_path, &raw_path).map_err(|e| StoreError::io(&raw_path, e))?;
                summary.dedup = Some(report);
            }
        }

        let stream = RecordStream::open(&raw_path)?;
        let analysis: Analysis = analyze_stream(&country_set, stream);
        summary.valid_observations = analysis.valid_observations;
        summary.invalid_records = analysis.invalid_records;
        summary.duplicate_observations = analysis.duplicates;
        self.check_interrupt()?;

        let licenses = LicenseRegistry::load(&cfg.license_path())?;
        let table_path = cfg.asn_table_path();
        let mut table = AsnTable::load(&table_path)?;

        let selection = GraphBuilder::new(&analysis, &table, &licenses, &country_set, &country)
            .with_top_k(cfg.top_international, cfg.top_domestic)
            .selection();
        let endpoints: Vec<ASN> = selection
            .edges()
            .flat_map(|e| [e.source, e.target])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let peeringdb = cfg.peering_enabled.then(|| {
            PeeringDbClient::new(
                Arc::clone(&transport),
                Arc::new(RateLimiter::new(cfg.peering_requests_per_second)),
            )
            .with_base_url(&cfg.peeringdb_base)
            .with_policy(self.policy(cfg.peering_retries))
        });
        let mut enricher = MetadataEnricher::new(&ripestat, &country_set, &country)
            .with_geo_threshold(cfg.geo_home_threshold)
            .with_overview_waves(self.waves(cfg.overview_concurrency))
            .with_geo_waves(self.waves(cfg.geo_concurrency))
            .with_max_upstreams(cfg.max_upstreams);
        if let Some(client) = &peeringdb {
            enricher = enricher.with_peeringdb(client);
        }

        let mut report = EnrichmentReport::default();
        enricher.resolve_countries(&mut table, &endpoints, &mut report);
        self.check_interrupt()?;

        let candidates = selection.geo_candidates(&country_set, &licenses);
        enricher.resolve_geolocation(&mut table, &candidates, &mut report);
        self.check_interrupt()?;

        let offshore = offshore_asns(&selection, &table, &licenses, &country_set, &country);
        enricher.resolve_peering(&mut table, &offshore, &analysis, &mut report);
        summary.enrichment = report;

        table.save(&table_path)?;
        summary.outputs.push(table_path);
        self.check_interrupt()?;

        let graph = GraphBuilder::new(&analysis, &table, &licenses, &country_set, &country)
            .with_top_k(cfg.top_international, cfg.top_domestic)
            .build();

        let graph_path = cfg.graph_path();
        write_json_atomic(&graph_path, &graph)?;
        summary.outputs.push(graph_path);

        let metadata = RunMetadata {
            country: &country,
            country_name: cfg.country_name(),
            last_updated: Utc::now().to_rfc3339(),
            schema_version: SCHEMA_VERSION,
            model: MODEL_NAME,
            stats: &graph.stats,
            source: "RIPEstat bgp-state, as-overview and GeoLite announcements; PeeringDB facilities",
        };
        let metadata_path = cfg.metadata_path();
        write_json_atomic(&metadata_path, &metadata)?;
        summary.outputs.push(metadata_path);

        summary.stats = graph.stats;
        summary.rate_limited_waits = limiter.wait_count();
        Ok(summary)
    }
}
