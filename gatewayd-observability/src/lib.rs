pub mod exporter;
pub mod exposition;
pub mod merger;
pub mod metrics;

pub use merger::MetricsMerger;
pub use metrics::MetricsCollector;
