use std::{process, sync::Arc};

use axum::Router;
use ripple::{
    application::{
        error::AppError,
        media::{MediaCleanup, MediaUploadService, ObjectStore},
        posts::{PostCacheInvalidator, PostService},
        repos::{MediaRepo, PostsRepo, SearchRepo},
        search::{SearchIndexer, SearchService},
    },
    broker::{self, BrokerClient, DeadLetterLog, EventConsumer, EventPublisher, SubscriptionHandle},
    cache::{CacheConfig, CacheLayer, CacheStore, InMemoryCache, RedisCache},
    config::{self, Service},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HealthState, MediaState, PostsState, SearchState},
        memory::InMemoryRepositories,
        objects::LocalObjectStore,
        telemetry,
    },
};
use ripple_events::{POST_CREATED, POST_DELETED, PostCreated, PostDeleted};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const DEAD_LETTER_LOG_LIMIT: usize = 20;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, exit_code = error.exit_code(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, exit_code = error.exit_code(), "application error");
    });
}

/// Storage shared by the handlers and the HTTP surface of one process.
struct Stores {
    posts: Arc<dyn PostsRepo>,
    search: Arc<dyn SearchRepo>,
    media: Arc<dyn MediaRepo>,
    postgres: Option<Arc<PostgresRepositories>>,
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let service = cli_args
        .command
        .as_ref()
        .map(config::Command::service)
        .unwrap_or(Service::Posts);

    telemetry::init(&settings.logging)?;
    info!(service = service.as_str(), "Starting service");

    let cache = init_cache(&settings).await?;
    let stores = init_stores(&settings).await?;

    let client = Arc::new(BrokerClient::new(
        broker::connector_for(&settings.broker.url),
        settings.broker.exchange.clone(),
        settings.broker.retry_policy(),
    ));
    // Fatal when the retry budget runs out; nothing is listening yet.
    client.connect().await?;

    let consumer = EventConsumer::new(
        Arc::clone(&client),
        settings.broker.delivery_policy(),
        Arc::new(DeadLetterLog::default()),
    );

    let health = HealthState {
        service: service.as_str(),
        broker: Arc::clone(&client),
        db: stores.postgres.clone(),
    };

    let (mut subscriptions, router) = match service {
        Service::Posts => {
            let invalidator = Arc::new(PostCacheInvalidator::new(cache.clone()));
            let subscriptions = vec![
                consumer
                    .subscribe::<PostCreated, _>(POST_CREATED, Arc::clone(&invalidator))
                    .await?,
                consumer
                    .subscribe::<PostDeleted, _>(POST_DELETED, invalidator)
                    .await?,
            ];
            let posts = PostService::new(
                Arc::clone(&stores.posts),
                cache,
                EventPublisher::new(Arc::clone(&client)),
            );
            let router = http::build_posts_router(
                PostsState {
                    posts: Arc::new(posts),
                },
                health,
            );
            (subscriptions, router)
        }
        Service::Search => {
            let indexer = Arc::new(SearchIndexer::new(
                Arc::clone(&stores.search),
                cache.clone(),
            ));
            let subscriptions = vec![
                consumer
                    .subscribe::<PostCreated, _>(POST_CREATED, Arc::clone(&indexer))
                    .await?,
                consumer
                    .subscribe::<PostDeleted, _>(POST_DELETED, indexer)
                    .await?,
            ];
            let search = SearchService::new(Arc::clone(&stores.search), cache);
            let router = http::build_search_router(
                SearchState {
                    search: Arc::new(search),
                },
                health,
            );
            (subscriptions, router)
        }
        Service::Media => {
            let objects: Arc<dyn ObjectStore> = Arc::new(
                LocalObjectStore::new(settings.media.directory.clone())
                    .map_err(InfraError::from)?,
            );
            let cleanup = Arc::new(MediaCleanup::new(
                Arc::clone(&stores.media),
                Arc::clone(&objects),
            ));
            let subscriptions = vec![
                consumer
                    .subscribe::<PostDeleted, _>(POST_DELETED, cleanup)
                    .await?,
            ];
            let uploads = MediaUploadService::new(Arc::clone(&stores.media), objects);
            let router = http::build_media_router(
                MediaState {
                    uploads: Arc::new(uploads),
                    max_upload_bytes: settings.media.max_upload_bytes.get(),
                },
                health,
            );
            (subscriptions, router)
        }
    };

    let result = serve_http(&settings, router, &mut subscriptions).await;

    for subscription in subscriptions {
        subscription.shutdown().await;
    }
    if let Err(err) = client.close().await {
        warn!(error = %err, "Broker close failed");
    }
    log_dead_letters(&consumer);

    result
}

async fn init_cache(settings: &config::Settings) -> Result<CacheLayer, AppError> {
    let config = CacheConfig::from(&settings.cache);
    let store: Arc<dyn CacheStore> = match settings.cache.url.as_deref() {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            info!(
                max_entries = config.max_entries,
                "No cache url configured; using the in-process cache"
            );
            Arc::new(InMemoryCache::with_max_entries(config.max_entries_non_zero()))
        }
    };
    Ok(CacheLayer::new(store, config))
}

async fn init_stores(settings: &config::Settings) -> Result<Stores, AppError> {
    let Some(database_url) = settings.database.url.as_deref() else {
        info!("No database url configured; using in-process repositories");
        let repos = Arc::new(InMemoryRepositories::new());
        return Ok(Stores {
            posts: repos.clone(),
            search: repos.clone(),
            media: repos,
            postgres: None,
        });
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::migration(err.to_string()))?;

    let repos = Arc::new(PostgresRepositories::new(pool));
    Ok(Stores {
        posts: repos.clone(),
        search: repos.clone(),
        media: repos.clone(),
        postgres: Some(repos),
    })
}

/// Serve until a shutdown signal, a server failure, or the loss of any
/// subscription. Traffic is never served without the event subscriptions.
async fn serve_http(
    settings: &config::Settings,
    router: Router,
    subscriptions: &mut [SubscriptionHandle],
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "HTTP listener bound");

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let stop = Arc::clone(&stop);
        async move { stop.notified().await }
    });
    let mut server = tokio::spawn(async move { server.await });

    let joined = tokio::select! {
        joined = &mut server => joined,
        lost = broker::first_lost(subscriptions) => {
            error!(error = %lost, "Event subscription lost; stopping the service");
            stop.notify_one();
            if tokio::time::timeout(settings.server.graceful_shutdown, &mut server)
                .await
                .is_err()
            {
                server.abort();
            }
            return Err(lost.into());
        }
        () = shutdown_signal() => {
            info!("Shutdown requested");
            stop.notify_one();
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        timeout_secs = settings.server.graceful_shutdown.as_secs(),
                        "Graceful shutdown timed out; aborting open connections"
                    );
                    server.abort();
                    return Ok(());
                }
            }
        }
    };

    joined
        .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        // Without a signal handler the server runs until killed.
        std::future::pending::<()>().await;
    }
}

fn log_dead_letters(consumer: &EventConsumer) {
    let letters = consumer.dead_letters().snapshot();
    if letters.is_empty() {
        return;
    }
    warn!(count = letters.len(), "Dead-lettered events at shutdown");
    for letter in letters.iter().take(DEAD_LETTER_LOG_LIMIT) {
        warn!(
            queue = %letter.queue,
            routing_key = %letter.routing_key,
            reason = letter.reason.as_str(),
            error = %letter.error,
            "Dead letter"
        );
    }
}
