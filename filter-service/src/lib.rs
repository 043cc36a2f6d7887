pub mod config;
pub mod expression;
pub mod filters;
pub mod metrics_server;
pub mod observability;
pub mod opmodes;
pub mod pipeline;
pub mod settings_cache;
pub mod sinks;
pub mod sources;

pub use filters::{FilterChain, FilterContext, Filtered, SampleFilter};
pub use pipeline::{Envelope, Pipeline};
