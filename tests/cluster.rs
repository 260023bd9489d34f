mod support;

use std::time::{Duration, Instant};

use redimux::{cmd, hash_slot, CommandFlags, Error, Multiplexer, MultiplexerEvent, Reply};
use support::{bulk, default_handshake, error, simple, Action, MockServer};

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

#[tokio::test]
async fn moved_redirect_updates_the_slot_map() {
    let slot = hash_slot(b"{x}y");

    // B owns the slot and answers for real.
    let server_b = MockServer::start(|args| match upper(&args[0]).as_str() {
        "SET" => Action::Reply(simple("OK")),
        "GET" => Action::Reply(bulk(b"1")),
        _ => fallback(args),
    })
    .await;
    let b_port = server_b.port;

    // A believes it no longer owns the slot and bounces keyed commands.
    let server_a = MockServer::start(move |args| match upper(&args[0]).as_str() {
        "SET" | "GET" if args.get(1).is_some_and(|key| key == b"{x}y") => Action::Reply(error(
            &format!("MOVED {slot} 127.0.0.1:{b_port}"),
        )),
        _ => fallback(args),
    })
    .await;

    let mux = Multiplexer::connect_with(server_a.options(), &[]).await.unwrap();
    let mut events = mux.events();

    let reply = mux
        .execute(cmd("SET").arg_key("{x}y").arg("1"))
        .await
        .unwrap();
    assert!(reply.is_okay());
    assert_eq!(server_b.count_commands("SET"), 1);

    let moved = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(MultiplexerEvent::HashSlotMoved {
                slot: moved_slot,
                to,
                ..
            }) = events.recv().await
            {
                return (moved_slot, to);
            }
        }
    })
    .await
    .expect("a HashSlotMoved event is published");
    assert_eq!(moved.0, slot);
    assert_eq!(moved.1, redimux::EndpointAddr::new("127.0.0.1", b_port));

    // The next command for the slot goes straight to B.
    let value = mux.execute(cmd("GET").arg_key("{x}y")).await.unwrap();
    assert_eq!(value, Reply::Bulk(Some(b"1".to_vec())));
    assert!(
        !server_a.saw_command_with_arg("GET", b"{x}y"),
        "A must not see the GET after the map converged",
    );
    assert!(server_b.saw_command_with_arg("GET", b"{x}y"));

    mux.close(false).await;
}

#[tokio::test]
async fn cross_slot_commands_are_rejected_before_dispatch() {
    let server = MockServer::start(fallback).await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let result = mux
        .execute(cmd("MGET").arg_key("foo").arg_key("bar"))
        .await;
    assert_eq!(result, Err(Error::CrossSlot));
    assert_eq!(server.count_commands("MGET"), 0);

    // NO_REDIRECT does not waive the check; selection is still dynamic and
    // no single node can own both slots.
    let result = mux
        .execute(
            cmd("MGET")
                .arg_key("foo")
                .arg_key("bar")
                .flags(CommandFlags::NO_REDIRECT),
        )
        .await;
    assert_eq!(result, Err(Error::CrossSlot));
    assert_eq!(server.count_commands("MGET"), 0);

    // Nor does pre-selecting the endpoint through the admin handle.
    let handle = mux
        .get_server(&redimux::EndpointAddr::new("127.0.0.1", server.port))
        .unwrap();
    let result = handle
        .execute(cmd("MGET").arg_key("foo").arg_key("bar"))
        .await;
    assert_eq!(result, Err(Error::CrossSlot));
    assert_eq!(server.count_commands("MGET"), 0);

    // Keys sharing a hash tag are admitted.
    let result = mux
        .execute(cmd("MGET").arg_key("{u}.a").arg_key("{u}.b"))
        .await;
    assert!(matches!(result, Err(Error::Server(_))), "reached the server");
    assert_eq!(server.count_commands("MGET"), 1);

    mux.close(false).await;
}

#[tokio::test]
async fn redirect_depth_is_bounded() {
    // A single server that answers every keyed GET with MOVED back to
    // itself: the client must give up rather than loop.
    let server = MockServer::start(move |args| match upper(&args[0]).as_str() {
        "GET" => Action::Reply(error("MOVED 1 127.0.0.1:1")),
        _ => fallback(args),
    })
    .await;

    // Port 1 never answers, so redirected attempts land nowhere; cap the
    // damage with a small redirect limit and a short connect timeout.
    let mut options = server.options();
    options.redirect_limit = 1;
    options.connect_timeout = Duration::from_millis(300);
    options.async_timeout = Duration::from_millis(300);
    let mux = Multiplexer::connect_with(options, &[]).await.unwrap();

    let started = Instant::now();
    let result = mux.execute(cmd("GET").arg_key("foo")).await;
    assert!(
        matches!(
            result,
            Err(Error::TooManyRedirects)
                | Err(Error::Timeout { .. })
                | Err(Error::ConnectionFailed { .. })
        ),
        "redirect loop must terminate, got {result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    mux.close(false).await;
}
