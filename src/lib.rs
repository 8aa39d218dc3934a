// Re-export all public modules
pub mod shared;
pub mod as_graph;
pub mod rate_limiter;
pub mod path_record;
pub mod store;
pub mod fetch;
pub mod analyzer;
pub mod enricher;
pub mod license;
pub mod classifier;
pub mod config;
pub mod pipeline;

// Re-export commonly used types at the crate root
pub use analyzer::{analyze_stream, Analysis, PathAnalyzer};
pub use as_graph::{ASGraph, Edge, GeoLocation, GraphStats, AS, ASN};
pub use classifier::{classify_gateway, EdgeSelection, GatewaySignals, GraphBuilder};
pub use config::PipelineConfig;
pub use enricher::{AsnInfo, AsnTable, EnrichmentReport, MetadataEnricher};
pub use license::LicenseRegistry;
pub use path_record::{PathRecord, RawPathRecord};
pub use pipeline::{Pipeline, RunSummary};
pub use rate_limiter::RateLimiter;
pub use shared::{EdgeClass, ErrorClass, FetchError, PipelineError, Role, StoreError};
