use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use ripple::application::posts::{CreatePostCommand, PostService};
use ripple::application::search::SearchIndexer;
use ripple::broker::{
    BrokerClient, Channel, DeadLetterLog, DeliveryPolicy, EventConsumer, EventPublisher,
    InMemoryBroker, RetryPolicy,
};
use ripple::cache::{CacheConfig, CacheLayer, InMemoryCache};
use ripple::infra::memory::InMemoryRepositories;
use ripple_events::{POST_CREATED, POST_EXCHANGE, PostCreated};

fn client(broker: &InMemoryBroker) -> Arc<BrokerClient> {
    Arc::new(BrokerClient::new(
        Arc::new(broker.clone()),
        POST_EXCHANGE,
        RetryPolicy {
            max_retries: 1,
            delay: Duration::ZERO,
        },
    ))
}

#[tokio::test]
async fn pipeline_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let broker = InMemoryBroker::new();
    let search_client = client(&broker);
    let consumer = EventConsumer::new(
        Arc::clone(&search_client),
        DeliveryPolicy {
            handler_timeout: Duration::from_secs(5),
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        },
        Arc::new(DeadLetterLog::default()),
    );
    let subscription = consumer
        .subscribe::<PostCreated, _>(
            POST_CREATED,
            Arc::new(SearchIndexer::new(
                Arc::new(InMemoryRepositories::new()),
                CacheLayer::new(Arc::new(InMemoryCache::new()), CacheConfig::default()),
            )),
        )
        .await
        .expect("subscribe");

    // Cache miss, fill, hit, and the invalidation that follows a write.
    let posts = PostService::new(
        Arc::new(InMemoryRepositories::new()),
        CacheLayer::new(Arc::new(InMemoryCache::new()), CacheConfig::default()),
        EventPublisher::new(client(&broker)),
    );
    posts.list_posts(None, None).await.expect("list");
    posts.list_posts(None, None).await.expect("list");
    posts
        .create_post(
            "alice",
            CreatePostCommand {
                content: "metrics everywhere".to_string(),
                media_ids: Vec::new(),
            },
        )
        .await
        .expect("create");

    // A body that cannot be decoded goes to the dead-letter log.
    let channel: Arc<dyn Channel> = search_client.channel().await.expect("channel");
    channel
        .publish(POST_EXCHANGE, POST_CREATED, b"not json".to_vec())
        .await
        .expect("publish");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.settled() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "events not settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    subscription.shutdown().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "ripple_cache_hit_total",
        "ripple_cache_miss_total",
        "ripple_cache_invalidated_keys_total",
        "ripple_events_published_total",
        "ripple_events_acked_total",
        "ripple_events_poison_total",
        "ripple_events_dead_lettered_total",
        "ripple_event_handle_ms",
        "ripple_subscriptions_active",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
