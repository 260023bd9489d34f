mod support;

use redimux::{cmd, Condition, Error, Multiplexer, Reply, Transaction};
use support::{array, bulk, default_handshake, error, int, null_array, simple, Action, MockServer};

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
async fn transaction_commits_and_fans_out_replies() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "WATCH" | "MULTI" => Action::Reply(simple("OK")),
        "EXISTS" => Action::Reply(int(1)),
        "SET" | "DEL" => Action::Reply(simple("QUEUED")),
        "EXEC" => Action::Reply(array(vec![simple("OK"), int(1)])),
        _ => fallback(args),
    })
    .await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.condition(Condition::KeyExists(b"{t}.guard".to_vec()));
    txn.command(cmd("SET").arg_key("{t}.a").arg("1"));
    txn.command(cmd("DEL").arg_key("{t}.b"));

    let replies = mux.run_transaction(&txn).await.unwrap();
    assert_eq!(replies, vec![Reply::Simple(b"OK".to_vec()), Reply::Int(1)]);

    // MULTI, body and EXEC went out as one block on one connection.
    assert_eq!(server.count_commands("MULTI"), 1);
    assert_eq!(server.count_commands("EXEC"), 1);
    assert_eq!(server.count_commands("WATCH"), 1);

    mux.close(false).await;
}

#[tokio::test]
async fn tripped_watch_aborts_the_transaction() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "WATCH" | "MULTI" => Action::Reply(simple("OK")),
        "GET" => Action::Reply(bulk(b"v1")),
        "SET" => Action::Reply(simple("QUEUED")),
        // Another client touched the watched key: EXEC answers null.
        "EXEC" => Action::Reply(null_array()),
        _ => fallback(args),
    })
    .await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.condition(Condition::KeyEquals(b"k".to_vec(), b"v1".to_vec()));
    txn.command(cmd("SET").arg_key("k").arg("v3"));

    let result = mux.run_transaction(&txn).await;
    assert_eq!(result, Err(Error::TransactionAborted));
    assert_eq!(server.count_commands("EXEC"), 1);

    mux.close(false).await;
}

#[tokio::test]
async fn failed_precondition_unwatches_and_aborts() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "WATCH" | "UNWATCH" => Action::Reply(simple("OK")),
        "EXISTS" => Action::Reply(int(0)),
        _ => fallback(args),
    })
    .await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.condition(Condition::KeyExists(b"missing".to_vec()));
    txn.command(cmd("SET").arg_key("missing").arg("x"));

    let result = mux.run_transaction(&txn).await;
    assert_eq!(result, Err(Error::TransactionAborted));
    // The body never started.
    assert_eq!(server.count_commands("UNWATCH"), 1);
    assert_eq!(server.count_commands("MULTI"), 0);
    assert_eq!(server.count_commands("EXEC"), 0);

    mux.close(false).await;
}

#[tokio::test]
async fn rejected_command_discards_on_pre_execabort_servers() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        // Old server: no EXECABORT support, the client must check QUEUED
        // replies itself.
        "INFO" => Action::Reply(bulk(
            b"# Replication\r\nrole:master\r\nredis_version:2.4.0\r\n",
        )),
        "MULTI" | "DISCARD" => Action::Reply(simple("OK")),
        "SET" => Action::Reply(simple("QUEUED")),
        "BADSET" => Action::Reply(error("ERR unknown command 'BADSET'")),
        _ => fallback(args),
    })
    .await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.command(cmd("SET").arg_key("{t}.a").arg("1"));
    txn.command(cmd("BADSET").arg_key("{t}.b"));

    let result = mux.run_transaction(&txn).await;
    assert_eq!(result, Err(Error::TransactionRejected));
    assert_eq!(server.count_commands("DISCARD"), 1);
    assert_eq!(server.count_commands("EXEC"), 0);

    mux.close(false).await;
}

#[tokio::test]
async fn execabort_reply_maps_to_rejected() {
    let server = MockServer::start(|args| match upper(&args[0]).as_str() {
        "MULTI" => Action::Reply(simple("OK")),
        "SET" => Action::Reply(simple("QUEUED")),
        "BADSET" => Action::Reply(error("ERR unknown command 'BADSET'")),
        "EXEC" => Action::Reply(error(
            "EXECABORT Transaction discarded because of previous errors.",
        )),
        _ => fallback(args),
    })
    .await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.command(cmd("SET").arg_key("{t}.a").arg("1"));
    txn.command(cmd("BADSET").arg_key("{t}.b"));

    let result = mux.run_transaction(&txn).await;
    assert_eq!(result, Err(Error::TransactionRejected));

    mux.close(false).await;
}

#[tokio::test]
async fn cross_slot_transactions_are_rejected() {
    let server = MockServer::start(fallback).await;
    let mux = Multiplexer::connect_with(server.options(), &[]).await.unwrap();

    let mut txn = Transaction::new();
    txn.command(cmd("SET").arg_key("foo").arg("1"));
    txn.command(cmd("SET").arg_key("bar").arg("2"));

    let result = mux.run_transaction(&txn).await;
    assert_eq!(result, Err(Error::CrossSlot));
    assert_eq!(server.count_commands("MULTI"), 0);

    mux.close(false).await;
}
