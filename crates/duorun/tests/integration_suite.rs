//! Integration tests for the duorun client and server.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use duorpc::ApiError;
use duorpc::Property;
use duorpc::Protocol;
use duorpc::Scalar;
use duorpc::ServiceCatalog;
use duorpc::ServiceId;
use duorpc::TypeSchema;
use duorpc::Value;
use duorpc::error::INTERNAL_ERR;
use duorpc::error::INVALID_REQUEST;
use duorpc::error::UNHANDLED_API;
use duorpc::frame;
use duorun::ApiCall;
use duorun::CallError;
use duorun::Client;
use duorun::ClientOptions;
use duorun::ClientStatus;
use duorun::Decision;
use duorun::HandlerError;
use duorun::Inbound;
use duorun::MemorySocket;
use duorun::MsgCall;
use duorun::PeerInfo;
use duorun::Server;
use duorun::ServerBuilder;
use duorun::Socket;
use duorun::StreamOptions;
use duorun::handlers;
use duorun::memory;
use duorun::memory::MemoryAcceptor;
use duorun::memory::MemoryConnector;
use duorun::server;
use duorun::stream::TcpAcceptor;
use duorun::stream::TcpConnector;
use duorun::transport::Acceptor;

// --- Fixtures ---

#[derive(Debug, Default)]
struct Session {
    peer: String,
}

fn catalog() -> ServiceCatalog {
    ServiceCatalog::new()
        .with_api(1, "Test", "TestReq", "TestRes")
        .with_message(2, "Chat", "ChatMsg")
        .with_api(3, "Slow", "TestReq", "TestRes")
        .with_api(4, "Whoami", "Empty", "TestRes")
        .with_type("TestReq", TypeSchema::interface([Property::required("name", TypeSchema::String)]))
        .with_type("TestRes", TypeSchema::interface([Property::required("reply", TypeSchema::String)]))
        .with_type("Empty", TypeSchema::interface([]))
        .with_type(
            "ChatMsg",
            TypeSchema::interface([
                Property::required("content", TypeSchema::String),
                Property::optional("room", TypeSchema::Number(Scalar::UInt)),
            ]),
        )
}

fn protocol() -> Protocol {
    Protocol::new(&catalog()).unwrap()
}

fn name_of(call: &ApiCall<Session>) -> String {
    call.request().get("name").and_then(Value::as_str).unwrap_or_default().to_string()
}

fn reply(text: impl Into<String>) -> Value {
    Value::object([("reply", text.into())])
}

fn chat(content: &str) -> Value {
    Value::object([("content", content)])
}

fn implement_hello(builder: &mut ServerBuilder<Session>) {
    builder
        .implement_api("Test", |call: Arc<ApiCall<Session>>| async move {
            let name = name_of(&call);
            call.succeed(reply(format!("Hello, {}", name))).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
}

struct Harness {
    server: Server<Session>,
    client: Client,
    connector: MemoryConnector,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut ServerBuilder<Session>)) -> Self {
        Self::start_with(ClientOptions::default().timeout(Duration::from_secs(5)), configure).await
    }

    async fn start_with(options: ClientOptions, configure: impl FnOnce(&mut ServerBuilder<Session>)) -> Self {
        duorun::logging::init();
        let mut builder = ServerBuilder::new(protocol());
        configure(&mut builder);
        let server = builder.start();

        let (acceptor, connector) = memory::listener();
        let serving = server.clone();
        tokio::spawn(async move {
            serving
                .serve(acceptor, |peer: &PeerInfo| Session { peer: peer.peer_addr.clone().unwrap_or_default() })
                .await
        });

        let client = Client::new(protocol(), connector.clone(), options);
        client.connect().await.unwrap();
        Self { server, client, connector }
    }

    async fn second_client(&self) -> Client {
        let client = Client::new(protocol(), self.connector.clone(), ClientOptions::default());
        client.connect().await.unwrap();
        client
    }
}

/// A server-side connection driven by hand, for sending raw frames.
fn raw_connection(server: &Server<Session>) -> MemorySocket {
    let (local, remote) = MemorySocket::pair();
    let peer = PeerInfo::new("10.0.0.9");
    server.accept(Arc::new(remote), peer, Session::default());
    local
}

async fn next_output(socket: &MemorySocket) -> Vec<u8> {
    loop {
        let inbound = tokio::time::timeout(Duration::from_secs(2), socket.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        match inbound {
            Some(Inbound::Binary(bytes)) => return bytes,
            Some(Inbound::Text(_)) => continue,
            None => panic!("socket closed"),
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn forward_messages(
    tx: mpsc::UnboundedSender<Value>,
) -> impl Fn(Value) -> futures::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static {
    move |message| {
        let _ = tx.send(message);
        futures::future::ready(Ok(()))
    }
}

async fn recv_value(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

// --- Test 1: Request / response ---

#[tokio::test]
async fn test_api_round_trip() {
    let h = Harness::start(implement_hello).await;
    assert_eq!(h.client.status(), ClientStatus::Open);

    let res = h.client.call_api("Test", Value::object([("name", "World")])).await.unwrap();
    assert_eq!(res, reply("Hello, World"));
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let h = Harness::start(implement_hello).await;

    let calls = (0..20).map(|i| {
        let client = h.client.clone();
        async move { client.call_api("Test", Value::object([("name", format!("n{}", i))])).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, res) in results.into_iter().enumerate() {
        assert_eq!(res.unwrap(), reply(format!("Hello, n{}", i)));
    }
}

#[tokio::test]
async fn test_handler_sees_session_and_remote_address() {
    let h = Harness::start(|b| {
        b.implement_api("Whoami", |call: Arc<ApiCall<Session>>| async move {
            assert_eq!(call.session().peer, call.connection().remote_address());
            let peer = call.session().peer.clone();
            call.succeed(reply(peer)).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
    })
    .await;

    let res = h.client.call_api("Whoami", Value::Object(Default::default())).await.unwrap();
    let peer = res.get("reply").and_then(Value::as_str).unwrap().to_string();
    assert!(peer.starts_with("memory:"), "unexpected peer {}", peer);
}

#[tokio::test]
async fn test_only_first_response_is_sent() {
    let h = Harness::start(|b| {
        b.implement_api("Test", |call: Arc<ApiCall<Session>>| async move {
            call.succeed(reply("first")).await?;
            call.succeed(reply("second")).await?;
            call.error("too late", None).await?;
            assert!(call.response_sent());
            Ok::<_, HandlerError>(())
        })
        .unwrap();
    })
    .await;

    let res = h.client.call_api("Test", Value::object([("name", "x")])).await.unwrap();
    assert_eq!(res, reply("first"));
    // A stray second response would be counted as late.
    let res = h.client.call_api("Test", Value::object([("name", "y")])).await.unwrap();
    assert_eq!(res, reply("first"));
    assert_eq!(h.client.late_responses(), 0);
}

// --- Test 2: Messages ---

#[tokio::test]
async fn test_client_message_reaches_server_listeners_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = Harness::start(move |b| {
        for tag in ["a", "b"] {
            let tx = tx.clone();
            b.listen_message("Chat", move |call: Arc<MsgCall<Session>>| {
                let tx = tx.clone();
                async move {
                    let content = call.message().get("content").and_then(Value::as_str).unwrap_or_default();
                    let _ = tx.send(Value::from(format!("{}:{}", tag, content)));
                    Ok(())
                }
            })
            .unwrap();
        }
    })
    .await;

    h.client.send_message("Chat", chat("one")).await.unwrap();
    h.client.send_message("Chat", chat("two")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(recv_value(&mut rx).await);
    }
    let expected: Vec<Value> = ["a:one", "b:one", "a:two", "b:two"].into_iter().map(Value::from).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_failing_listener_does_not_stop_the_others() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = Harness::start(move |b| {
        b.listen_message("Chat", |_: Arc<MsgCall<Session>>| async move {
            Err(HandlerError::internal(anyhow::anyhow!("listener broke")))
        })
        .unwrap();
        b.listen_message("Chat", |_: Arc<MsgCall<Session>>| async move {
            if true {
                panic!("listener panicked");
            }
            Ok(())
        })
        .unwrap();
        b.listen_message("Chat", move |call: Arc<MsgCall<Session>>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(call.message().clone());
                Ok(())
            }
        })
        .unwrap();
    })
    .await;

    h.client.send_message("Chat", chat("still here")).await.unwrap();
    assert_eq!(recv_value(&mut rx).await, chat("still here"));
}

#[tokio::test]
async fn test_server_push_reaches_client_listener() {
    let h = Harness::start(|b| {
        b.listen_message("Chat", |call: Arc<MsgCall<Session>>| async move {
            let echoed = call.message().clone();
            call.connection().send_message("Chat", &echoed).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    h.client.listen_message("Chat", forward_messages(tx)).unwrap();
    h.client
        .send_message("Chat", Value::object([("content", Value::from("ping")), ("room", Value::from(7u64))]))
        .await
        .unwrap();

    let echoed = recv_value(&mut rx).await;
    assert_eq!(echoed.get("content").and_then(Value::as_str), Some("ping"));
    assert_eq!(echoed.get("room").and_then(Value::as_u64), Some(7));
}

#[tokio::test]
async fn test_client_listener_can_call_back_into_its_client() {
    let h = Harness::start(|b| {
        implement_hello(b);
        b.listen_message("Chat", |call: Arc<MsgCall<Session>>| async move {
            let echoed = call.message().clone();
            call.connection().send_message("Chat", &echoed).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = h.client.clone();
    h.client
        .listen_message("Chat", move |message: Value| {
            let client = client.clone();
            let tx = tx.clone();
            async move {
                let name = message.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
                let res = client
                    .call_api_with_timeout("Test", Value::object([("name", name)]), Some(Duration::from_secs(2)))
                    .await;
                let _ = tx.send(res);
                Ok::<_, HandlerError>(())
            }
        })
        .unwrap();
    h.client.send_message("Chat", chat("L")).await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("listener never finished its call")
        .expect("channel closed");
    assert_eq!(res, Ok(reply("Hello, L")));
    assert_eq!(h.client.status(), ClientStatus::Open);
}

#[tokio::test]
async fn test_multicast_and_unlisten() {
    let h = Harness::start(|_| {}).await;
    let other = h.second_client().await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let id_a = h.client.listen_message("Chat", forward_messages(tx_a)).unwrap();
    other.listen_message("Chat", forward_messages(tx_b)).unwrap();

    let server = h.server.clone();
    eventually(|| server.connection_count() == 2).await;

    let ids = h.server.connection_ids();
    assert_eq!(h.server.multicast_message(&ids, "Chat", &chat("hi all")).await, 2);
    assert_eq!(recv_value(&mut rx_a).await, chat("hi all"));
    assert_eq!(recv_value(&mut rx_b).await, chat("hi all"));

    assert_eq!(h.client.unlisten_message("Chat", Some(id_a)), 1);
    assert_eq!(h.server.multicast_message(&ids, "Chat", &chat("again")).await, 2);
    assert_eq!(recv_value(&mut rx_b).await, chat("again"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_send_to_unknown_connection_fails() {
    let h = Harness::start(|_| {}).await;
    let err = h.server.send_message(duorun::ConnId(999), "Chat", &chat("x")).await.unwrap_err();
    assert!(matches!(err, server::Error::UnknownConnection(duorun::ConnId(999))));
}

// --- Test 3: Client-side failures ---

#[tokio::test]
async fn test_call_while_closed_fails_with_network_error() {
    let (_acceptor, connector) = memory::listener();
    let client = Client::new(protocol(), connector, ClientOptions::default());
    assert_eq!(client.status(), ClientStatus::Closed);

    let err = client.call_api("Test", Value::object([("name", "x")])).await.unwrap_err();
    assert!(matches!(err, CallError::Network(_)));
    let err = client.send_message("Chat", chat("x")).await.unwrap_err();
    assert!(matches!(err, CallError::Network(_)));
}

#[tokio::test]
async fn test_connect_failure_returns_to_closed() {
    let (acceptor, connector) = memory::listener();
    drop(acceptor);
    let client = Client::new(protocol(), connector, ClientOptions::default());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, CallError::Network(_)));
    assert_eq!(client.status(), ClientStatus::Closed);
}

#[tokio::test]
async fn test_unknown_names_and_bad_bodies_fail_locally() {
    let h = Harness::start(implement_hello).await;

    let err = h.client.call_api("Nope", Value::Null).await.unwrap_err();
    assert!(matches!(err, CallError::Config(_)));
    let err = h.client.call_api("Chat", chat("x")).await.unwrap_err();
    assert!(matches!(err, CallError::Config(_)));
    let err = h.client.send_message("Test", Value::object([("name", "x")])).await.unwrap_err();
    assert!(matches!(err, CallError::Config(_)));
    assert!(matches!(h.client.listen_message("Test", forward_messages(mpsc::unbounded_channel().0)), Err(CallError::Config(_))));

    let err = h.client.call_api("Test", Value::object([("wrong", "x")])).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidRequest(_)));
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_timeout_then_late_response_is_counted() {
    let h = Harness::start(|b| {
        b.implement_api("Slow", |call: Arc<ApiCall<Session>>| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            call.succeed(reply("finally")).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
        implement_hello(b);
    })
    .await;

    let err = h
        .client
        .call_api_with_timeout("Slow", Value::object([("name", "x")]), Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout);
    assert_eq!(err.to_api_error().info_code(), Some(duorpc::error::TIMEOUT));
    assert_eq!(h.client.pending_calls(), 0);

    let client = h.client.clone();
    eventually(|| client.late_responses() == 1).await;

    let res = h.client.call_api("Test", Value::object([("name", "after")])).await.unwrap();
    assert_eq!(res, reply("Hello, after"));
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let h = Harness::start(|b| {
        b.implement_api("Slow", |_: Arc<ApiCall<Session>>| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .unwrap();
    })
    .await;

    let client = h.client.clone();
    let pending = tokio::spawn(async move { client.call_api_with_timeout("Slow", Value::object([("name", "x")]), None).await });

    let client = h.client.clone();
    eventually(|| client.pending_calls() == 1).await;
    h.client.disconnect().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Network(_)));
    assert_eq!(h.client.status(), ClientStatus::Closed);
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_server_stop_closes_clients() {
    let h = Harness::start(|b| {
        b.implement_api("Slow", |_: Arc<ApiCall<Session>>| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .unwrap();
    })
    .await;

    let mut status = h.client.watch_status();
    let client = h.client.clone();
    let pending = tokio::spawn(async move { client.call_api_with_timeout("Slow", Value::object([("name", "x")]), None).await });

    let server = h.server.clone();
    eventually(|| server.connection_count() == 1).await;
    let client = h.client.clone();
    eventually(|| client.pending_calls() == 1).await;
    h.server.stop().await;
    assert_eq!(h.server.connection_count(), 0);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Network(_)));
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| *s == ClientStatus::Closed))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stopped_server_refuses_new_connections() {
    let server = ServerBuilder::<Session>::new(protocol()).start();
    server.stop().await;

    let (local, remote) = MemorySocket::pair();
    let conn = server.accept(Arc::new(remote), PeerInfo::new("10.0.0.3"), Session::default());
    assert_eq!(server.connection_count(), 0);

    let closed = tokio::time::timeout(Duration::from_secs(2), local.recv()).await.unwrap().unwrap();
    assert_eq!(closed, None);
    eventually(|| conn.is_closed()).await;
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let h = Harness::start(implement_hello).await;
    h.client.disconnect().await;
    h.client.connect().await.unwrap();
    assert_eq!(h.client.status(), ClientStatus::Open);

    let res = h.client.call_api("Test", Value::object([("name", "again")])).await.unwrap();
    assert_eq!(res, reply("Hello, again"));
}

// --- Test 4: Flows and error mapping ---

#[tokio::test]
async fn test_flow_stop_short_circuits_handler() {
    let ran = Arc::new(AtomicBool::new(false));
    let handler_ran = ran.clone();
    let h = Harness::start(move |b| {
        b.api_flow().push_fn(|call: Arc<ApiCall<Session>>| async move {
            if name_of(&call) == "intruder" {
                call.error("Forbidden", Some(Value::from("FORBIDDEN"))).await?;
                return Ok(Decision::Stop);
            }
            Ok::<_, HandlerError>(Decision::Continue)
        });
        b.implement_api("Test", move |call: Arc<ApiCall<Session>>| {
            let ran = handler_ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                call.succeed(reply("welcome")).await?;
                Ok::<_, HandlerError>(())
            }
        })
        .unwrap();
    })
    .await;

    let err = h.client.call_api("Test", Value::object([("name", "intruder")])).await.unwrap_err();
    assert_eq!(err, CallError::Remote(ApiError::with_info("Forbidden", "FORBIDDEN")));
    assert!(!ran.load(Ordering::SeqCst));

    let res = h.client.call_api("Test", Value::object([("name", "friend")])).await.unwrap();
    assert_eq!(res, reply("welcome"));
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_flow_errors_are_mapped() {
    let h = Harness::start(|b| {
        b.api_flow().push_fn(|call: Arc<ApiCall<Session>>| async move {
            match name_of(&call).as_str() {
                "banned" => Err(ApiError::with_info("Account banned", "BANNED").into()),
                "crash" => Err(HandlerError::internal(anyhow::anyhow!("token table corrupted"))),
                _ => Ok(Decision::Continue),
            }
        });
        implement_hello(b);
    })
    .await;

    let err = h.client.call_api("Test", Value::object([("name", "banned")])).await.unwrap_err();
    assert_eq!(err, CallError::Remote(ApiError::with_info("Account banned", "BANNED")));

    let err = h.client.call_api("Test", Value::object([("name", "crash")])).await.unwrap_err();
    match err {
        CallError::Remote(e) => {
            assert_eq!(e.message, duorun::error::INTERNAL_ERROR_MESSAGE);
            assert!(!e.message.contains("token table"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    let res = h.client.call_api("Test", Value::object([("name", "fine")])).await.unwrap();
    assert_eq!(res, reply("Hello, fine"));
}

#[tokio::test]
async fn test_message_flow_stop_skips_listeners() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = Harness::start(move |b| {
        b.msg_flow().push_fn(|call: Arc<MsgCall<Session>>| async move {
            let muted = call.message().get("content").and_then(Value::as_str) == Some("spam");
            Ok(if muted { Decision::Stop } else { Decision::Continue })
        });
        b.listen_message("Chat", move |call: Arc<MsgCall<Session>>| {
            let counter = counter.clone();
            let tx = tx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(call.message().clone());
                Ok(())
            }
        })
        .unwrap();
    })
    .await;

    h.client.send_message("Chat", chat("spam")).await.unwrap();
    h.client.send_message("Chat", chat("ham")).await.unwrap();
    assert_eq!(recv_value(&mut rx).await, chat("ham"));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_business_error_is_sent_verbatim() {
    let h = Harness::start(|b| {
        b.implement_api("Test", |_: Arc<ApiCall<Session>>| async move {
            Err(ApiError::with_info("Name taken", "TAKEN").into())
        })
        .unwrap();
    })
    .await;

    let err = h.client.call_api("Test", Value::object([("name", "x")])).await.unwrap_err();
    assert_eq!(err, CallError::Remote(ApiError::with_info("Name taken", "TAKEN")));
}

#[tokio::test]
async fn test_internal_errors_and_panics_are_masked() {
    let h = Harness::start(|b| {
        b.implement_api("Test", |_: Arc<ApiCall<Session>>| async move {
            Err(HandlerError::internal(anyhow::anyhow!("secret connection string")))
        })
        .unwrap();
        b.implement_api("Slow", |_: Arc<ApiCall<Session>>| async move {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .unwrap();
    })
    .await;

    let expected = CallError::Remote(ApiError::with_info(duorun::error::INTERNAL_ERROR_MESSAGE, INTERNAL_ERR));
    let err = h.client.call_api("Test", Value::object([("name", "x")])).await.unwrap_err();
    assert_eq!(err, expected);
    let err = h.client.call_api("Slow", Value::object([("name", "x")])).await.unwrap_err();
    assert_eq!(err, expected);

    // The connection survives both.
    assert_eq!(h.server.connection_count(), 1);
}

#[tokio::test]
async fn test_unhandled_api_gets_error_response() {
    let h = Harness::start(implement_hello).await;
    let err = h.client.call_api("Slow", Value::object([("name", "x")])).await.unwrap_err();
    match err {
        CallError::Remote(e) => {
            assert_eq!(e.message, "Unhandled API: Slow");
            assert_eq!(e.info_code(), Some(UNHANDLED_API));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_builder_rejects_duplicate_and_unknown_registrations() {
    let mut builder = ServerBuilder::<Session>::new(protocol());
    implement_hello(&mut builder);

    let err = builder
        .implement_api("Test", |_: Arc<ApiCall<Session>>| async move { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, server::Error::Handlers(handlers::Error::AlreadyImplemented(ref n)) if n == "Test"));

    let err = builder
        .implement_api("Chat", |_: Arc<ApiCall<Session>>| async move { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, server::Error::UnknownService(_)));

    let err = builder
        .listen_message("Test", |_: Arc<MsgCall<Session>>| async move { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, server::Error::UnknownService(_)));

    let id = builder
        .listen_message("Chat", |_: Arc<MsgCall<Session>>| async move { Ok(()) })
        .unwrap();
    assert_eq!(builder.unlisten_message("Chat", Some(id)), 1);
}

// --- Test 5: Hostile input ---

fn test_request_frame(protocol: &Protocol, name: &str, seq: u64) -> Vec<u8> {
    let service = protocol.registry().lookup_api_by_name("Test").unwrap();
    let payload = protocol.encode_request(service, &Value::object([("name", name)])).unwrap();
    frame::encode_input(service.id, &payload, Some(seq)).unwrap()
}

#[tokio::test]
async fn test_garbage_frames_do_not_disturb_valid_calls() {
    let h = Harness::start(implement_hello).await;
    let raw = raw_connection(&h.server);
    let protocol = protocol();

    let garbage: Vec<Vec<u8>> = {
        let mut rng = rand::thread_rng();
        (0..50)
            .map(|_| {
                let len = rng.gen_range(0..48);
                (0..len).map(|_| rng.r#gen::<u8>()).collect()
            })
            .collect()
    };
    for bytes in &garbage {
        raw.send(bytes).await.unwrap();
    }
    raw.send_text("not rpc traffic").await.unwrap();
    // Unknown service, and an API frame without a sequence.
    raw.send(&frame::encode_input(ServiceId(77), &[], Some(1)).unwrap()).await.unwrap();
    raw.send(&frame::encode_input(ServiceId(1), &[], None).unwrap()).await.unwrap();

    raw.send(&test_request_frame(&protocol, "survivor", 4242)).await.unwrap();

    loop {
        let bytes = next_output(&raw).await;
        let out = frame::decode_output(&bytes).unwrap();
        if out.sequence == Some(4242) {
            assert_eq!(out.succeeded, Some(true));
            let service = protocol.registry().lookup_by_id(out.service_id).unwrap();
            assert_eq!(protocol.decode_response(service, out.payload).unwrap(), reply("Hello, survivor"));
            break;
        }
    }

    // The regular client is unaffected too.
    let res = h.client.call_api("Test", Value::object([("name", "ok")])).await.unwrap();
    assert_eq!(res, reply("Hello, ok"));
}

#[tokio::test]
async fn test_invalid_request_body_gets_invalid_request_error() {
    let h = Harness::start(implement_hello).await;
    let raw = raw_connection(&h.server);
    let protocol = protocol();

    let chat_service = protocol.registry().lookup_message_by_name("Chat").unwrap();
    let wrong_body = protocol.encode_message(chat_service, &chat("not a TestReq")).unwrap();
    raw.send(&frame::encode_input(ServiceId(1), &wrong_body, Some(9)).unwrap()).await.unwrap();

    let bytes = next_output(&raw).await;
    let out = frame::decode_output(&bytes).unwrap();
    assert_eq!(out.service_id, ServiceId(1));
    assert_eq!(out.sequence, Some(9));
    assert_eq!(out.succeeded, Some(false));
    let error = ApiError::decode(out.payload).unwrap();
    assert_eq!(error.info_code(), Some(INVALID_REQUEST));
}

#[tokio::test]
async fn test_forwarded_for_sets_remote_address() {
    let server = ServerBuilder::<Session>::new(protocol()).start();
    let (_local, remote) = MemorySocket::pair();
    let peer = PeerInfo::new("10.0.0.2").with_forwarded_for("::ffff:203.0.113.5, 10.0.0.1");
    let conn = server.accept(Arc::new(remote), peer, Session::default());
    assert_eq!(conn.remote_address(), "203.0.113.5");
    assert_eq!(server.connection_ids(), vec![conn.id()]);

    let err = conn.send_message("Nope", &Value::Null).await.unwrap_err();
    assert!(matches!(err, duorun::connection::Error::UnknownMessage(ref n) if n == "Nope"));
}

#[tokio::test]
async fn test_client_discards_fabricated_and_unlistened_frames() {
    let (acceptor, connector) = memory::listener();
    let client = Client::new(protocol(), connector, ClientOptions::default().timeout(Duration::from_secs(5)));
    client.connect().await.unwrap();
    let (raw, _) = duorun::transport::Acceptor::accept(&acceptor).await.unwrap().unwrap();

    let protocol = protocol();
    let test = protocol.registry().lookup_api_by_name("Test").unwrap().clone();
    let chat_service = protocol.registry().lookup_message_by_name("Chat").unwrap().clone();

    // A response nobody asked for, and a message nobody listens to.
    let body = protocol.encode_response(&test, &reply("fabricated")).unwrap();
    raw.send(&frame::encode_output(test.id, &body, Some(999), Some(true)).unwrap()).await.unwrap();
    let body = protocol.encode_message(&chat_service, &chat("nobody home")).unwrap();
    raw.send(&frame::encode_output(chat_service.id, &body, None, None).unwrap()).await.unwrap();

    let calling = client.clone();
    let pending = tokio::spawn(async move { calling.call_api("Test", Value::object([("name", "real")])).await });

    let request = loop {
        match raw.recv().await.unwrap() {
            Some(Inbound::Binary(bytes)) => break bytes,
            Some(Inbound::Text(_)) => continue,
            None => panic!("client closed"),
        }
    };
    let input = frame::decode_input(&request).unwrap();
    assert_eq!(input.service_id, test.id);
    let seq = input.sequence.unwrap();
    assert_ne!(seq, 999);

    let body = protocol.encode_response(&test, &reply("genuine")).unwrap();
    raw.send(&frame::encode_output(test.id, &body, Some(seq), Some(true)).unwrap()).await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), reply("genuine"));
    assert_eq!(client.late_responses(), 1);
    assert_eq!(client.status(), ClientStatus::Open);
}

#[tokio::test]
async fn test_client_drops_status_flag_without_sequence() {
    let (acceptor, connector) = memory::listener();
    let client = Client::new(protocol(), connector, ClientOptions::default().timeout(Duration::from_secs(5)));
    client.connect().await.unwrap();
    let (raw, _) = duorun::transport::Acceptor::accept(&acceptor).await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.listen_message("Chat", forward_messages(tx)).unwrap();

    let protocol = protocol();
    let chat_service = protocol.registry().lookup_message_by_name("Chat").unwrap().clone();
    let flagged = protocol.encode_message(&chat_service, &chat("flagged")).unwrap();
    raw.send(&frame::encode_output(chat_service.id, &flagged, None, Some(true)).unwrap()).await.unwrap();
    let plain = protocol.encode_message(&chat_service, &chat("plain")).unwrap();
    raw.send(&frame::encode_output(chat_service.id, &plain, None, None).unwrap()).await.unwrap();

    assert_eq!(recv_value(&mut rx).await, chat("plain"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(client.late_responses(), 0);
    assert_eq!(client.status(), ClientStatus::Open);
}

/// Fails its first accept the way a process out of descriptors would.
struct FlakyAcceptor {
    attempts: Arc<AtomicUsize>,
    inner: MemoryAcceptor,
}

#[async_trait::async_trait]
impl Acceptor for FlakyAcceptor {
    async fn accept(&self) -> duorun::transport::Result<Option<(Arc<dyn Socket>, PeerInfo)>> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(duorun::transport::Error::Io("too many open files".into()));
        }
        self.inner.accept().await
    }
}

#[tokio::test]
async fn test_serve_survives_failed_accept() {
    duorun::logging::init();
    let mut builder = ServerBuilder::new(protocol());
    implement_hello(&mut builder);
    let server = builder.start();

    let (inner, connector) = memory::listener();
    let attempts = Arc::new(AtomicUsize::new(0));
    let acceptor = FlakyAcceptor { attempts: attempts.clone(), inner };
    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.serve(acceptor, |_: &PeerInfo| Session::default()).await });

    let client = Client::new(protocol(), connector, ClientOptions::default().timeout(Duration::from_secs(5)));
    client.connect().await.unwrap();
    let res = client.call_api("Test", Value::object([("name", "again")])).await.unwrap();
    assert_eq!(res, reply("Hello, again"));
    assert!(attempts.load(Ordering::SeqCst) >= 2);
    assert!(!serve.is_finished());

    server.stop().await;
    tokio::time::timeout(Duration::from_secs(2), serve).await.unwrap().unwrap().unwrap();
}

// --- Test 6: TCP ---

#[tokio::test]
async fn test_tcp_round_trip() {
    let mut builder = ServerBuilder::new(protocol());
    implement_hello(&mut builder);
    builder
        .implement_api("Whoami", |call: Arc<ApiCall<Session>>| async move {
            let peer = call.session().peer.clone();
            call.succeed(reply(peer)).await?;
            Ok::<_, HandlerError>(())
        })
        .unwrap();
    let server = builder.start();

    let acceptor = TcpAcceptor::bind("127.0.0.1:0", StreamOptions::default()).await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        serving
            .serve(acceptor, |peer: &PeerInfo| Session { peer: peer.peer_addr.clone().unwrap_or_default() })
            .await
    });

    let client = Client::new(
        protocol(),
        TcpConnector::new(addr.to_string(), StreamOptions::default()),
        ClientOptions::default().timeout(Duration::from_secs(5)),
    );
    client.connect().await.unwrap();

    let res = client.call_api("Test", Value::object([("name", "tcp")])).await.unwrap();
    assert_eq!(res, reply("Hello, tcp"));
    let res = client.call_api("Whoami", Value::Object(Default::default())).await.unwrap();
    assert_eq!(res, reply("127.0.0.1"));

    client.disconnect().await;
    let server_view = server.clone();
    eventually(|| server_view.connection_count() == 0).await;
}
