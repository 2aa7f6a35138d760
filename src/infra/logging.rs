use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,harvester=debug";

/// Install the global subscriber. Logs always go to stderr; stdout carries
/// reports and the worker protocol.
///
/// `HARVESTER_LOG` wins over `RUST_LOG`; `verbose` forces debug everywhere.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        std::env::var("HARVESTER_LOG")
            .ok()
            .and_then(|spec| EnvFilter::try_new(spec).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    };

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
}
