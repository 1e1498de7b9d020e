use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ripple_cache_hit_total",
            Unit::Count,
            "Total number of cache-aside reads served from the cache."
        );
        describe_counter!(
            "ripple_cache_miss_total",
            Unit::Count,
            "Total number of cache-aside reads that fell through to the store."
        );
        describe_counter!(
            "ripple_cache_degraded_total",
            Unit::Count,
            "Total number of cache operations that failed and were bypassed."
        );
        describe_counter!(
            "ripple_cache_invalidated_keys_total",
            Unit::Count,
            "Total number of cache keys removed by invalidation."
        );
        describe_counter!(
            "ripple_cache_evicted_total",
            Unit::Count,
            "Total number of in-process cache keys evicted at capacity."
        );
        describe_counter!(
            "ripple_events_published_total",
            Unit::Count,
            "Total number of domain events handed to the broker."
        );
        describe_counter!(
            "ripple_events_publish_failed_total",
            Unit::Count,
            "Total number of domain events that could not be published."
        );
        describe_counter!(
            "ripple_events_acked_total",
            Unit::Count,
            "Total number of deliveries acknowledged after a successful handler run."
        );
        describe_counter!(
            "ripple_events_poison_total",
            Unit::Count,
            "Total number of deliveries dropped because their body did not parse."
        );
        describe_counter!(
            "ripple_events_dead_lettered_total",
            Unit::Count,
            "Total number of deliveries recorded in the dead-letter log."
        );
        describe_gauge!(
            "ripple_subscriptions_active",
            Unit::Count,
            "Current number of running consumer loops."
        );
        describe_histogram!(
            "ripple_event_handle_ms",
            Unit::Milliseconds,
            "Handler latency per delivery in milliseconds."
        );
    });
}
