use tracing_subscriber::{filter::Directive, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "filter_service=info";

/// `RUST_LOG` refines the default `filter_service=info` directive.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = DEFAULT_DIRECTIVE.parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr; stdout carries the filtered samples.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
