//! Built-in plugins for the hook pipeline.

pub mod cache;
pub mod metrics;
pub mod rate_limit;

pub use cache::CachePlugin;
pub use metrics::MetricsPlugin;
pub use rate_limit::RateLimitPlugin;
