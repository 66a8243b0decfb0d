//! End-to-end tests over real sockets: a worker stack on an ephemeral port
//! plus a minimal in-process Gateway stub that serves registration and
//! domain metadata on the same wire protocol.

use async_trait::async_trait;
use matrix_db::{EventLogStore, RecordStore, RuntimeLogStore};
use matrix_protocol::{
    AuthType, EntityEvent, Envelope, Event, EventResponse, EventType, ExecutorType, Header,
    PayloadType, RequestPacket, ResponsePacket, SecretAlgorithm, Worker, WorkerMode,
    WorkerServerConfig, HEADER_SIZE,
};
use matrix_worker::context::EventContext;
use matrix_worker::domain::DomainCache;
use matrix_worker::invoker::Invoker;
use matrix_worker::load::LoadProbe;
use matrix_worker::registry::{RegisteredWorker, WorkerRegistry};
use matrix_worker::server::IntranetServer;
use matrix_worker::shared_configure::SharedConfigureStore;
use matrix_worker::validator::CustomParserRegistry;
use matrix_worker::{
    ClientConfig, Dispatcher, Executor, IntranetClient, ServerMetrics, Surface,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const SECRET: &str = "integration-secret";

/// Worker stack bound to an ephemeral port, talking to a stubbed Gateway.
struct Harness {
    addr: String,
    client: Arc<IntranetClient>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<ServerMetrics>,
    domain: Arc<DomainCache>,
    gateway_hits: Arc<AtomicUsize>,
    _shutdown: watch::Sender<bool>,
}

fn envelope() -> Envelope {
    Envelope::new(SecretAlgorithm::Aes128, SECRET)
}

fn entity_events_json() -> Vec<u8> {
    let events = vec![
        EntityEvent {
            id: "ee-1".into(),
            code: "create".into(),
            executor_type: ExecutorType::Builtin,
            executor: "create".into(),
            timeout: 5,
            params: r#"[{"code":"name","required":true,"range":"length:1,64"}]"#.into(),
            auth_type: AuthType::None,
            ..Default::default()
        },
        EntityEvent {
            id: "ee-2".into(),
            code: "slow".into(),
            executor_type: ExecutorType::Custom,
            executor: "slow".into(),
            timeout: 1,
            auth_type: AuthType::None,
            ..Default::default()
        },
        EntityEvent {
            id: "ee-3".into(),
            code: "notify".into(),
            executor_type: ExecutorType::Task,
            executor: "notify".into(),
            timeout: 1,
            auth_type: AuthType::None,
            ..Default::default()
        },
    ];
    serde_json::to_vec(&events).unwrap()
}

/// Minimal Gateway stub speaking the binary protocol.
async fn spawn_gateway(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let envelope = envelope();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let envelope = envelope.clone();
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                loop {
                    let mut header_buf = [0u8; HEADER_SIZE];
                    if stream.read_exact(&mut header_buf).await.is_err() {
                        break;
                    }
                    let Ok(header) = Header::unpack(&header_buf) else {
                        break;
                    };
                    let mut body = vec![0u8; header.body_len as usize];
                    if stream.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let Ok(request) = RequestPacket::unpack(&body, header.compressed) else {
                        break;
                    };

                    let mut response = if request.payload_type == PayloadType::Ping {
                        ResponsePacket::pong()
                    } else {
                        let code: u16 = request.x_data.parse().unwrap_or(0);
                        let payload: Vec<u8> = match EventType::from_u16(code) {
                            Ok(EventType::WtgRegister) => b"ok".to_vec(),
                            Ok(EventType::WtgGetEntityEvents) => {
                                hits.fetch_add(1, Ordering::SeqCst);
                                entity_events_json()
                            }
                            Ok(EventType::WtgGetEntityAttrs) => {
                                hits.fetch_add(1, Ordering::SeqCst);
                                br#"[{"code":"name","fieldType":"string"}]"#.to_vec()
                            }
                            Ok(EventType::WtgGetConstants) => b"[]".to_vec(),
                            _ => b"[]".to_vec(),
                        };
                        ResponsePacket::new(200, PayloadType::Json, envelope.encrypt(&payload))
                    };
                    if stream.write_all(&response.pack(false)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

struct SlowExecutor;

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, _ctx: Arc<EventContext>) -> EventResponse {
        tokio::time::sleep(Duration::from_secs(10)).await;
        EventResponse::success()
    }
}

async fn boot() -> Harness {
    let gateway_hits = Arc::new(AtomicUsize::new(0));
    let gateway = spawn_gateway(Arc::clone(&gateway_hits)).await;

    let mut config = WorkerServerConfig {
        server_id: "srv-test".into(),
        intranet_secret: SECRET.into(),
        intranet_secret_algor: "AES-128".into(),
        gateway_intranet_endpoint: gateway.clone(),
        database_path: ":memory:".into(),
        ..Default::default()
    };
    config.apply_defaults();

    let client = Arc::new(IntranetClient::new(
        ClientConfig {
            source_ip: "127.0.0.1".into(),
            ..Default::default()
        },
        envelope(),
    ));

    let db = matrix_db::open_in_memory().await.unwrap();
    let records = RecordStore::new(db.clone());
    let metrics = Arc::new(ServerMetrics::new());
    let load = Arc::new(LoadProbe::new());
    let custom_parsers = Arc::new(CustomParserRegistry::new());

    let domain = Arc::new(DomainCache::new(
        Arc::clone(&client),
        &gateway,
        16,
        Duration::from_secs(300),
    ));
    let auth = Arc::new(matrix_worker::auth::AuthResolver::new(
        Arc::clone(&client),
        &gateway,
        1_000,
        Duration::from_secs(300),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&client),
        &gateway,
        Arc::clone(&load),
    ));
    let shared = Arc::new(SharedConfigureStore::new(Arc::clone(&client), &gateway));
    let invoker = Arc::new(Invoker::new(
        Arc::clone(&domain),
        custom_parsers,
        EventLogStore::new(db.clone()),
        RuntimeLogStore::new(db),
        Arc::clone(&metrics),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        Arc::clone(&domain),
        Arc::clone(&registry),
        invoker,
        shared,
        records,
        load,
        auth,
    ));

    // Register the demo worker with its custom/task executors.
    let worker = RegisteredWorker::new(Worker {
        server_id: "srv-test".into(),
        project: "demo".into(),
        version_label: "0.0.1".into(),
        context: "main".into(),
        entity: "user_info".into(),
        mode: WorkerMode::Command,
        ..Default::default()
    })
    .with_custom_executor("slow", Arc::new(SlowExecutor))
    .with_task_executor("notify", Arc::new(SlowExecutor));
    registry.register_worker(worker).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Arc::new(IntranetServer::new(
        Arc::clone(&dispatcher),
        envelope(),
        Arc::clone(&metrics),
        false,
    ));
    tokio::spawn(server.serve(listener, shutdown_rx));

    Harness {
        addr,
        client,
        dispatcher,
        metrics,
        domain,
        gateway_hits,
        _shutdown: shutdown_tx,
    }
}

fn sample_event(code: &str) -> Event {
    let mut event = Event {
        id: "evt-1".into(),
        project: "demo".into(),
        version: "0.0.1".into(),
        context: "main".into(),
        entity: "user_info".into(),
        event: code.into(),
        source: "test".into(),
        params: r#"{"name":"alice"}"#.into(),
        ..Default::default()
    };
    event.sign_with(SECRET);
    event
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ping_roundtrip() {
    let harness = boot().await;

    let mut stream = TcpStream::connect(&harness.addr).await.unwrap();
    stream
        .write_all(&RequestPacket::ping().pack(false))
        .await
        .unwrap();

    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = Header::unpack(&header_buf).unwrap();
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).await.unwrap();

    let response = ResponsePacket::unpack(&body, header.compressed).unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.content_type, PayloadType::Ping);
    assert!(response.payload.is_empty());
    assert_eq!(harness.metrics.request_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_header_closes_connection() {
    let harness = boot().await;

    let mut stream = TcpStream::connect(&harness.addr).await.unwrap();
    // Body length 16, invalid compression flag 0x02.
    stream
        .write_all(&[0x00, 0x00, 0x00, 0x10, 0x02, 0x01, 0x00, 0x00])
        .await
        .unwrap();

    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = Header::unpack(&header_buf).unwrap();
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).await.unwrap();

    let response = ResponsePacket::unpack(&body, header.compressed).unwrap();
    assert_eq!(
        response.status_code,
        matrix_protocol::response::STATUS_INVALID_HEADER
    );

    // The server closes after answering: the next read hits EOF.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).await.unwrap(), 0);
    assert_eq!(harness.metrics.error_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_builtin_create_dispatch() {
    let harness = boot().await;

    let event = sample_event("create");
    let payload = serde_json::to_vec(&event).unwrap();
    let response = harness
        .client
        .post(
            &harness.addr,
            EventType::WtwEventCall.as_u16(),
            PayloadType::Json,
            &payload,
        )
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    let envelope: EventResponse = serde_json::from_slice(&response.payload).unwrap();
    assert!(envelope.is_success(), "unexpected: {envelope:?}");
    assert_eq!(envelope.total, 1);
    assert_eq!(envelope.list[0]["name"], "alice");
    assert!(!envelope.list[0]["id"].as_str().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_signature_rejected() {
    let harness = boot().await;

    let mut event = sample_event("create");
    event.params = r#"{"name":"mallory"}"#.into();
    let payload = serde_json::to_vec(&event).unwrap();
    let response = harness
        .client
        .post(
            &harness.addr,
            EventType::WtwEventCall.as_u16(),
            PayloadType::Json,
            &payload,
        )
        .await
        .unwrap();

    assert_eq!(response.status_code, 401);
    let envelope: EventResponse = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(envelope.code, "11");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executor_timeout_answers_408() {
    let harness = boot().await;
    let errors_before = harness.metrics.error_count();

    let event = sample_event("slow");
    let payload = serde_json::to_vec(&event).unwrap();
    let response = harness
        .client
        .post(
            &harness.addr,
            EventType::WtwEventCall.as_u16(),
            PayloadType::Json,
            &payload,
        )
        .await
        .unwrap();

    assert_eq!(response.status_code, 408);
    let envelope: EventResponse = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(envelope.code, "9");
    assert_eq!(harness.metrics.error_count(), errors_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_public_surface_rejects_task_events() {
    let harness = boot().await;

    let (status, response) = harness
        .dispatcher
        .dispatch_public(sample_event("notify"), "203.0.113.9")
        .await;
    assert_eq!(status, 403);
    assert_eq!(response.code, "8");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_returns_to_pool() {
    let harness = boot().await;

    let event = sample_event("create");
    let payload = serde_json::to_vec(&event).unwrap();
    for _ in 0..3 {
        harness
            .client
            .post(
                &harness.addr,
                EventType::WtwEventCall.as_u16(),
                PayloadType::Json,
                &payload,
            )
            .await
            .unwrap();
    }
    // All calls funneled through one pooled connection.
    assert_eq!(harness.metrics.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_domain_cache_read_through_and_flush() {
    let harness = boot().await;
    let hits_after_boot = harness.gateway_hits.load(Ordering::SeqCst);

    harness
        .domain
        .entity_attrs("demo", "main", "user_info", "0.0.1")
        .await;
    harness
        .domain
        .entity_attrs("demo", "main", "user_info", "0.0.1")
        .await;
    assert_eq!(
        harness.gateway_hits.load(Ordering::SeqCst),
        hits_after_boot + 1,
        "second lookup must be served from cache"
    );

    harness.domain.flush();
    harness
        .domain
        .entity_attrs("demo", "main", "user_info", "0.0.1")
        .await;
    assert_eq!(
        harness.gateway_hits.load(Ordering::SeqCst),
        hits_after_boot + 2,
        "flush must force a fresh read-through"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_event_code_unsupported() {
    let harness = boot().await;

    let mut event = sample_event("does_not_exist");
    event.sign_with(SECRET);
    let payload = serde_json::to_vec(&event).unwrap();
    let response = harness
        .client
        .post(
            &harness.addr,
            EventType::WtwEventCall.as_u16(),
            PayloadType::Json,
            &payload,
        )
        .await
        .unwrap();

    let envelope: EventResponse = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(envelope.code, "5");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plugin_dispatch_by_code() {
    use matrix_worker::{Plugin, PluginRequest};

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn event_types(&self) -> Vec<u16> {
            vec![30_001]
        }
        async fn handle(&self, request: PluginRequest) -> EventResponse {
            assert_eq!(request.surface, Surface::Intranet);
            EventResponse::with_record(serde_json::json!({
                "echo": String::from_utf8_lossy(&request.payload),
            }))
        }
    }

    let harness = boot().await;
    harness
        .dispatcher
        .register_plugin(Arc::new(EchoPlugin))
        .unwrap();

    let response = harness
        .client
        .post(&harness.addr, 30_001, PayloadType::Text, b"hello plugin")
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    let envelope: EventResponse = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(envelope.list[0]["echo"], "hello plugin");
}
