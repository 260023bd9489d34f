mod support;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redimux::{cmd, Error, Multiplexer, MultiplexerEvent, Options, Reply, TimeoutPhase};
use support::{bulk, default_handshake, error, int, Action, MockServer};

fn upper(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_uppercase()
}

fn fallback(args: &[Vec<u8>]) -> Action {
    match default_handshake(args) {
        Some(reply) => Action::Reply(reply),
        None => Action::Reply(error(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&args[0])
        ))),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let until = Instant::now() + deadline;
    while !check() {
        assert!(Instant::now() < until, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn simple_round_trip() {
    let store: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let handler_store = store.clone();
    let server = MockServer::start(move |args| match upper(&args[0]).as_str() {
        "SET" => {
            *handler_store.lock().unwrap() = Some(args[2].clone());
            Action::Reply(support::simple("OK"))
        }
        "GET" => match handler_store.lock().unwrap().clone() {
            Some(value) => Action::Reply(bulk(&value)),
            None => Action::Reply(support::nil()),
        },
        _ => fallback(args),
    })
    .await;

    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let pong = mux.execute(cmd("PING")).await.unwrap();
    assert_eq!(pong, Reply::Simple(b"PONG".to_vec()));

    let ok = mux
        .execute(cmd("SET").arg_key("foo").arg("bar"))
        .await
        .unwrap();
    assert!(ok.is_okay());

    let value = mux.execute(cmd("GET").arg_key("foo")).await.unwrap();
    assert_eq!(value, Reply::Bulk(Some(b"bar".to_vec())));

    mux.close(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_ordering_under_concurrency() {
    let counter = Arc::new(Mutex::new(0i64));
    let handler_counter = counter.clone();
    let server = MockServer::start(move |args| match upper(&args[0]).as_str() {
        "INCR" => {
            let mut counter = handler_counter.lock().unwrap();
            *counter += 1;
            Action::Reply(int(*counter))
        }
        "GET" => Action::Reply(bulk(
            handler_counter.lock().unwrap().to_string().as_bytes(),
        )),
        _ => fallback(args),
    })
    .await;

    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    const TASKS: usize = 8;
    const PER_TASK: usize = 125;
    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let mux = mux.clone();
        handles.push(tokio::spawn(async move {
            let mut replies = Vec::with_capacity(PER_TASK);
            for _ in 0..PER_TASK {
                let reply = mux.execute(cmd("INCR").arg_key("counter")).await.unwrap();
                replies.push(reply.as_int().expect("INCR replies are integers"));
            }
            replies
        }));
    }

    let mut observed = Vec::with_capacity(TASKS * PER_TASK);
    for handle in handles {
        observed.extend(handle.await.unwrap());
    }
    observed.sort_unstable();
    let expected: Vec<i64> = (1..=(TASKS * PER_TASK) as i64).collect();
    assert_eq!(observed, expected);

    let total = mux.execute(cmd("GET").arg_key("counter")).await.unwrap();
    assert_eq!(total, Reply::Bulk(Some(b"1000".to_vec())));

    mux.close(true).await;
}

#[tokio::test]
async fn reconnect_preserves_backlog() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "HOLD" => Action::Ignore,
        "GET" => Action::Reply(bulk(b"value")),
        _ => fallback(args),
    })
    .await;

    let mut options = server.options();
    options.backlog_disconnect_timeout = Duration::from_secs(5);
    let mux = Multiplexer::connect_with(options, &[]).await.unwrap();
    let mut events = mux.events();

    // Two commands written to the wire that will never see a reply.
    let in_flight: Vec<_> = (0..2)
        .map(|_| {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(cmd("HOLD")).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.force_disconnect();

    // The drop is observed when the read loop dies; both in-flight sinks
    // fail with the connection error, in dispatch order.
    let failed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(MultiplexerEvent::ConnectionFailed { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(failed.is_ok(), "expected a ConnectionFailed event");

    for handle in in_flight {
        let result = handle.await.unwrap();
        assert!(
            matches!(result, Err(Error::ConnectionFailed { .. })),
            "in-flight commands fail with ConnectionFailed, got {result:?}"
        );
    }

    // Backlog three commands while disconnected; the 5s allowance keeps
    // them queued until the bridge re-establishes.
    let queued: Vec<_> = (0..3)
        .map(|_| {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(cmd("GET").arg_key("a")).await })
        })
        .collect();

    for handle in queued {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(Some(b"value".to_vec())));
    }
    assert_eq!(server.count_commands("GET"), 3);

    mux.close(false).await;
}

#[tokio::test]
async fn expired_in_flight_times_out_without_breaking_matching() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "HOLD" => Action::Ignore,
        _ => fallback(args),
    })
    .await;

    let mut options = server.options();
    options.async_timeout = Duration::from_millis(200);
    let mux = Multiplexer::connect_with(options, &[]).await.unwrap();

    let result = mux.execute(cmd("HOLD")).await;
    assert_eq!(
        result,
        Err(Error::Timeout {
            phase: TimeoutPhase::InFlight
        })
    );

    mux.close(false).await;
}

#[tokio::test]
async fn backlog_overflow_fails_fast() {
    // Nothing listens on the endpoint; commands pile into the backlog.
    let mut options = Options::parse("127.0.0.1:1").unwrap();
    support::tune(&mut options);
    options.abort_connect = false;
    options.backlog_limit = 2;
    let mux = Multiplexer::connect_with(options, &[]).await.unwrap();

    let parked: Vec<_> = (0..2)
        .map(|_| {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(cmd("PING")).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let overflow = mux.execute(cmd("PING")).await;
    assert_eq!(overflow, Err(Error::BacklogOverflow));

    for handle in parked {
        assert!(handle.await.unwrap().is_err());
    }
    mux.close(false).await;
}

#[tokio::test]
async fn closed_multiplexer_rejects_new_work() {
    let server = MockServer::start(fallback).await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();
    mux.close(true).await;

    let result = mux.execute(cmd("PING")).await;
    assert_eq!(result, Err(Error::MultiplexerClosed));
}

#[tokio::test]
async fn admin_commands_require_allow_admin() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "FLUSHDB" => Action::Reply(support::simple("OK")),
        _ => fallback(args),
    })
    .await;

    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();
    let denied = mux.execute(cmd("FLUSHDB")).await;
    assert_eq!(denied, Err(Error::CommandNotAvailable("FLUSHDB")));
    mux.close(false).await;

    let mut options = server.options();
    options.allow_admin = true;
    let mux = Multiplexer::connect_with(options, &[]).await.unwrap();
    let allowed = mux.execute(cmd("FLUSHDB")).await.unwrap();
    assert!(allowed.is_okay());
    mux.close(false).await;
}

#[tokio::test]
async fn server_handle_bypasses_selection() {
    let server = MockServer::start(fallback).await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let addr = redimux::EndpointAddr::new("127.0.0.1", server.port);
    let handle = mux.get_server(&addr).expect("configured endpoint is known");
    assert!(handle.is_connected());

    let info = handle.execute(cmd("INFO").arg("REPLICATION")).await.unwrap();
    assert!(info.as_text().unwrap().contains("role:master"));

    let counters = handle.counters();
    assert!(counters.operation_count > 0);
    assert_eq!(counters.sent_awaiting_response, 0);

    mux.close(false).await;
}

#[tokio::test]
async fn connection_events_are_published() {
    let server = MockServer::start(fallback).await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();
    let mut events = mux.events();

    server.force_disconnect();

    let mut saw_failed = false;
    let mut saw_restored = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_failed && saw_restored) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "expected failure and restoration events");
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(MultiplexerEvent::ConnectionFailed { .. })) => saw_failed = true,
            Ok(Ok(MultiplexerEvent::ConnectionRestored { .. })) => saw_restored = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_failed && saw_restored);

    // And the connection is usable again.
    wait_for("reconnect", Duration::from_secs(3), || {
        mux.get_server(&redimux::EndpointAddr::new("127.0.0.1", server.port))
            .is_some_and(|handle| handle.is_connected())
    })
    .await;
    let pong = mux.execute(cmd("PING")).await.unwrap();
    assert_eq!(pong, Reply::Simple(b"PONG".to_vec()));

    mux.close(false).await;
}
