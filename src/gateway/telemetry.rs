use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Identity, Layered, SubscriberExt as _};
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::util::SubscriberInitExt as _;

/// `RUST_LOG` when set, `info` otherwise.
pub fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

/// Registry + `exporter` + formatted logs + [`env_filter`], installed process-wide.
pub(crate) fn install<L>(exporter: L, json_logs: bool) -> Result<(), Box<dyn std::error::Error>>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(exporter)
        .with(fmt_layer::<Layered<L, Registry>>(json_logs))
        .with(env_filter())
        .try_init()?;
    Ok(())
}

/// Installs the process-wide subscriber: filtered stderr logs, one JSON object per line when
/// `json_logs` is set.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    install(Identity::new(), json_logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_installs_once_per_process() {
        init_tracing(true).expect("first install");
        tracing::info!(component = "telemetry", "subscriber installed");
        assert!(init_tracing(false).is_err());
    }
}
