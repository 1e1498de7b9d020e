use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header::CONTENT_TYPE},
};
use ripple::application::media::{MediaCleanup, MediaUploadService};
use ripple::application::posts::PostService;
use ripple::application::repos::MediaRepo;
use ripple::application::search::{SearchIndexer, SearchService};
use ripple::broker::{
    BrokerClient, DeadLetterLog, DeliveryPolicy, EventConsumer, EventHandler, EventPublisher,
    InMemoryBroker, RetryPolicy,
};
use ripple::cache::{CacheConfig, CacheLayer, InMemoryCache};
use ripple::infra::http::{
    self, HealthState, MediaState, PostsState, SearchState, USER_ID_HEADER,
};
use ripple::infra::memory::InMemoryRepositories;
use ripple::infra::objects::LocalObjectStore;
use ripple_events::{POST_DELETED, PostCreated, PostDeleted};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "ripple-test-boundary";

fn broker_client() -> Arc<BrokerClient> {
    broker_client_on(&InMemoryBroker::new())
}

fn broker_client_on(broker: &InMemoryBroker) -> Arc<BrokerClient> {
    Arc::new(BrokerClient::new(
        Arc::new(broker.clone()),
        ripple_events::POST_EXCHANGE,
        RetryPolicy {
            max_retries: 1,
            delay: Duration::ZERO,
        },
    ))
}

fn health(service: &'static str, broker: Arc<BrokerClient>) -> HealthState {
    HealthState {
        service,
        broker,
        db: None,
    }
}

fn posts_app() -> Router {
    let client = broker_client();
    let cache = CacheLayer::new(Arc::new(InMemoryCache::new()), CacheConfig::default());
    let service = PostService::new(
        Arc::new(InMemoryRepositories::new()),
        cache,
        EventPublisher::new(Arc::clone(&client)),
    );
    http::build_posts_router(
        PostsState {
            posts: Arc::new(service),
        },
        health("posts", client),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user);
    }
    match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    }
}

fn media_app(
    repos: Arc<InMemoryRepositories>,
    objects: Arc<LocalObjectStore>,
    max_upload_bytes: usize,
) -> Router {
    http::build_media_router(
        MediaState {
            uploads: Arc::new(MediaUploadService::new(repos, objects)),
            max_upload_bytes,
        },
        health("media", broker_client()),
    )
}

fn multipart_body(field: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(user: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/media/upload")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user);
    }
    builder.body(Body::from(body)).expect("request should build")
}

#[tokio::test]
async fn requests_without_user_header_are_unauthorized() {
    let app = posts_app();
    let (status, body) = send(&app, request(Method::GET, "/api/posts", None, None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn post_lifecycle_over_http() {
    let app = posts_app();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/posts",
            Some("alice"),
            Some(json!({ "content": "hello over http" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    let id = body["post"]["id"].as_str().expect("post id").to_string();
    assert_eq!(body["post"]["userId"], json!("alice"));

    let (status, body) = send(
        &app,
        request(Method::GET, &format!("/api/posts/{id}"), Some("bob"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["post"]["content"], json!("hello over http"));

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/posts?page=1&limit=5", Some("bob"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalPosts"], json!(1));
    assert_eq!(body["currentPage"], json!(1));
    assert_eq!(body["totalPage"], json!(1));

    let (status, _) = send(
        &app,
        request(Method::DELETE, &format!("/api/posts/{id}"), Some("bob"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        request(Method::DELETE, &format!("/api/posts/{id}"), Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("Post deleted successfully"));

    let (status, body) = send(
        &app,
        request(Method::GET, &format!("/api/posts/{id}"), Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], json!("Post not found"));
}

#[tokio::test]
async fn invalid_input_is_a_bad_request() {
    let app = posts_app();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/posts",
            Some("alice"),
            Some(json!({ "content": "no" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/posts/not-a-uuid", Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_is_scoped_and_validated() {
    let repos = Arc::new(InMemoryRepositories::new());
    let cache = CacheLayer::new(Arc::new(InMemoryCache::new()), CacheConfig::default());
    let indexer = SearchIndexer::new(repos.clone(), cache.clone());
    for user in ["alice", "bob"] {
        EventHandler::<PostCreated>::handle(
            &indexer,
            &PostCreated {
                post_id: Uuid::new_v4(),
                user_id: user.to_string(),
                content: "tokio runtime notes".to_string(),
                created_at: OffsetDateTime::now_utc(),
            },
        )
        .await
        .expect("index");
    }

    let client = broker_client();
    let app = http::build_search_router(
        SearchState {
            search: Arc::new(SearchService::new(repos, cache)),
        },
        health("search", client),
    );

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/search/posts?query=tokio", Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["results"][0]["userId"], json!("alice"));

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/search/posts", Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn healthz_reports_broker_state_without_auth() {
    let client = broker_client();
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = Arc::new(LocalObjectStore::new(dir.path().to_path_buf()).expect("store"));
    let app = http::build_media_router(
        MediaState {
            uploads: Arc::new(MediaUploadService::new(
                Arc::new(InMemoryRepositories::new()),
                objects,
            )),
            max_upload_bytes: 1024,
        },
        health("media", Arc::clone(&client)),
    );

    let (status, body) = send(&app, request(Method::GET, "/healthz", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], json!("media"));
    assert_eq!(body["broker"], json!(false));

    client.connect().await.expect("connect");
    let (_, body) = send(&app, request(Method::GET, "/healthz", None, None)).await;
    assert_eq!(body["broker"], json!(true));
}

#[tokio::test]
async fn uploaded_media_is_removed_when_its_post_is_deleted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repos = Arc::new(InMemoryRepositories::new());
    let objects = Arc::new(LocalObjectStore::new(dir.path().to_path_buf()).expect("store"));
    let app = media_app(repos.clone(), objects.clone(), 1024 * 1024);

    let (status, body) = send(
        &app,
        upload_request(
            Some("alice"),
            multipart_body("file", "photo.png", "image/png", b"\x89PNG data"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    let media_id: Uuid = body["mediaId"]
        .as_str()
        .expect("media id")
        .parse()
        .expect("uuid");
    let record = repos
        .find_media(media_id)
        .await
        .expect("find")
        .expect("record stored");
    assert_eq!(body["url"], json!(record.url));
    assert_eq!(record.mime_type, "image/png");
    assert_eq!(record.original_name, "photo.png");
    let stored = dir.path().join(&record.public_id);
    assert_eq!(std::fs::read(&stored).expect("object written"), b"\x89PNG data");

    let broker = InMemoryBroker::new();
    let client = broker_client_on(&broker);
    let subscription = EventConsumer::new(
        Arc::clone(&client),
        DeliveryPolicy {
            handler_timeout: Duration::from_secs(5),
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        },
        Arc::new(DeadLetterLog::default()),
    )
    .subscribe::<PostDeleted, _>(
        POST_DELETED,
        Arc::new(MediaCleanup::new(repos.clone(), objects)),
    )
    .await
    .expect("subscribe");

    EventPublisher::new(broker_client_on(&broker))
        .publish(
            POST_DELETED,
            &PostDeleted {
                post_id: Uuid::new_v4(),
                user_id: "alice".to_string(),
                media_ids: vec![media_id],
            },
        )
        .await
        .expect("publish");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.acked() < 1 {
        assert!(tokio::time::Instant::now() < deadline, "cleanup not acknowledged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!stored.exists());
    assert!(repos.find_media(media_id).await.expect("find").is_none());

    subscription.shutdown().await;
}

#[tokio::test]
async fn upload_requires_user_and_a_file_field() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repos = Arc::new(InMemoryRepositories::new());
    let objects = Arc::new(LocalObjectStore::new(dir.path().to_path_buf()).expect("store"));
    let app = media_app(repos.clone(), objects, 1024 * 1024);

    let (status, _) = send(
        &app,
        upload_request(None, multipart_body("file", "a.png", "image/png", b"x")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        upload_request(
            Some("alice"),
            multipart_body("attachment", "a.png", "image/png", b"x"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], json!("No file uploaded"));
    assert_eq!(repos.media_count(), 0);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repos = Arc::new(InMemoryRepositories::new());
    let objects = Arc::new(LocalObjectStore::new(dir.path().to_path_buf()).expect("store"));
    let app = media_app(repos.clone(), objects, 64);

    let (status, body) = send(
        &app,
        upload_request(
            Some("alice"),
            multipart_body("file", "big.bin", "application/octet-stream", &[7u8; 4096]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], json!(false));
    assert_eq!(repos.media_count(), 0);
}

