use std::thread;
use std::time::Duration;

use storm_client::{
    ClientConfig, ClientError, Cmd, CommitResult, KVClient, Plan, Reply, RetryPolicy,
    TransactionSession, TxOutcome, TxState,
};
use storm_testkit::TestServer;

fn setup() -> (TestServer, KVClient) {
    let server = TestServer::start().expect("server");
    let config = ClientConfig {
        addr: server.addr_string(),
        read_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::default()
    };
    let client = KVClient::with_config(config).expect("client");
    (server, client)
}

fn balance(client: &KVClient, key: &str) -> i64 {
    client
        .execute::<Option<i64>>(&Cmd::get(key))
        .expect("get")
        .unwrap_or(0)
}

#[test]
fn commit_applies_staged_commands_in_order() {
    let (_server, client) = setup();
    client.set("a", 100).expect("seed");

    let outcome: TxOutcome<()> = client
        .transaction(&["a", "b"], |tx| {
            let a: i64 = tx.get("a")?;
            assert_eq!(a, 100);
            Ok(Plan::Commit(vec![Cmd::decr_by("a", 30), Cmd::incr_by("b", 30)]))
        })
        .expect("transaction");

    match outcome {
        TxOutcome::Committed { replies, attempts } => {
            assert_eq!(attempts, 1);
            assert_eq!(replies, vec![Reply::Integer(70), Reply::Integer(30)]);
        }
        other => panic!("expected commit, got {:?}", other),
    }
    assert_eq!(balance(&client, "a"), 70);
    assert_eq!(balance(&client, "b"), 30);
}

#[test]
fn abort_leaves_values_untouched() {
    let (_server, client) = setup();
    client.mset(&[("a", "10"), ("b", "0")]).expect("seed");

    let outcome = client
        .transaction(&["a", "b"], |tx| {
            let a: i64 = tx.get("a")?;
            if a < 50 {
                return Ok(Plan::Abort(a));
            }
            Ok(Plan::Commit(vec![Cmd::decr_by("a", 50)]))
        })
        .expect("transaction");

    assert_eq!(
        outcome,
        TxOutcome::Aborted {
            reason: 10,
            attempts: 1
        }
    );
    assert_eq!(balance(&client, "a"), 10);
    assert_eq!(balance(&client, "b"), 0);
}

#[test]
fn conflict_is_retried_with_fresh_reads() {
    let (_server, client) = setup();
    client.set("counter", 1).expect("seed");

    let mut seen = Vec::new();
    let outcome: TxOutcome<()> = client
        .transaction(&["counter"], |tx| {
            let current: i64 = tx.get("counter")?;
            seen.push(current);
            if tx.attempt() == 1 {
                // Another connection writes between our read and our commit.
                client.incr_by("counter", 10).expect("concurrent write");
            }
            Ok(Plan::Commit(vec![Cmd::set("counter", current * 2)]))
        })
        .expect("transaction");

    assert_eq!(outcome.attempts(), 2);
    assert!(outcome.is_committed());
    assert_eq!(seen, vec![1, 11]);
    assert_eq!(balance(&client, "counter"), 22);
}

#[test]
fn bounded_policy_reports_exhaustion() {
    let (_server, client) = setup();
    client.set("hot", 0).expect("seed");

    let result = client.transaction_with(RetryPolicy::bounded(3), &["hot"], |tx| {
        let _: i64 = tx.get("hot")?;
        client.incr("hot").expect("interfering write");
        Ok(Plan::<()>::Commit(vec![Cmd::set("hot", -1)]))
    });

    match result {
        Err(ClientError::TransactionConflictExceeded { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected conflict bound, got {:?}", other),
    }
    // Only the interfering writes landed.
    assert_eq!(balance(&client, "hot"), 3);
}

#[test]
fn configured_policy_is_used_by_default() {
    let server = TestServer::start().expect("server");
    let config = ClientConfig {
        addr: server.addr_string(),
        transaction_max_attempts: Some(1),
        ..ClientConfig::default()
    };
    let client = KVClient::with_config(config).expect("client");

    let result = client.transaction(&["k"], |tx| {
        let _: Option<i64> = tx.get("k")?;
        client.set("k", 1).expect("interfering write");
        Ok(Plan::<()>::Commit(vec![Cmd::set("k", 2)]))
    });
    assert!(matches!(
        result,
        Err(ClientError::TransactionConflictExceeded { attempts: 1 })
    ));
}

#[test]
fn exactly_one_of_two_competing_sessions_commits() {
    let (_server, client) = setup();
    client.set("x", 0).expect("seed");

    let mut first = client.dedicated().expect("first connection");
    let mut second = client.dedicated().expect("second connection");
    let mut one = TransactionSession::new(&mut first);
    let mut two = TransactionSession::new(&mut second);

    one.watch(&["x"]).expect("watch one");
    two.watch(&["x"]).expect("watch two");
    let _: i64 = one.read(&Cmd::get("x")).expect("read one");
    let _: i64 = two.read(&Cmd::get("x")).expect("read two");

    one.multi().expect("multi one");
    one.queue(Cmd::set("x", 1)).expect("queue one");
    two.multi().expect("multi two");
    two.queue(Cmd::set("x", 2)).expect("queue two");

    assert!(matches!(one.commit().expect("commit one"), CommitResult::Committed(_)));
    assert_eq!(two.commit().expect("commit two"), CommitResult::Conflict);
    assert_eq!(one.state(), TxState::Committed);
    assert_eq!(two.state(), TxState::Conflict);

    drop(one);
    drop(two);
    assert_eq!(balance(&client, "x"), 1);
}

#[test]
fn empty_watch_set_is_rejected_before_running() {
    let (_server, client) = setup();
    let mut ran = false;
    let result = client.transaction(&[] as &[&str], |_tx| {
        ran = true;
        Ok(Plan::<()>::Commit(vec![Cmd::set("k", 1)]))
    });

    match result {
        Err(ClientError::InvalidArgument(message)) => assert!(message.contains("watched key")),
        other => panic!("expected invalid argument, got {:?}", other),
    }
    assert!(!ran);
    assert_eq!(client.get("k").expect("get"), None);
}

#[test]
fn out_of_order_calls_fail_locally() {
    let (_server, client) = setup();
    let mut conn = client.dedicated().expect("connection");
    let mut session = TransactionSession::new(&mut conn);

    assert!(matches!(
        session.queue(Cmd::set("k", 1)),
        Err(ClientError::InvalidState {
            actual: TxState::Idle,
            ..
        })
    ));
    assert!(matches!(
        session.read::<Reply>(&Cmd::get("k")),
        Err(ClientError::InvalidState { .. })
    ));
    assert!(matches!(session.commit(), Err(ClientError::InvalidState { .. })));

    session.multi().expect("multi");
    session.queue(Cmd::set("k", 1)).expect("queue");
    assert!(matches!(
        session.watch(&["k"]),
        Err(ClientError::InvalidState {
            actual: TxState::Staging,
            ..
        })
    ));
    assert!(matches!(session.commit().expect("commit"), CommitResult::Committed(_)));
    assert!(matches!(
        session.multi(),
        Err(ClientError::InvalidState {
            actual: TxState::Committed,
            ..
        })
    ));
}

#[test]
fn dropped_session_releases_its_watch() {
    let (_server, client) = setup();
    let mut conn = client.dedicated().expect("connection");

    {
        let mut session = TransactionSession::new(&mut conn);
        session.watch(&["k"]).expect("watch");
        let _: Option<String> = session.read(&Cmd::get("k")).expect("read");
    }

    // Without the UNWATCH sent on drop this write would doom the next EXEC.
    client.set("k", "changed").expect("concurrent write");

    let mut session = TransactionSession::new(&mut conn);
    session.multi().expect("multi");
    session.queue(Cmd::set("k", "mine")).expect("queue");
    assert!(matches!(session.commit().expect("commit"), CommitResult::Committed(_)));
    drop(session);
    assert_eq!(client.get_string("k").expect("get"), Some("mine".to_string()));
}

#[test]
fn rejected_queued_command_aborts_the_attempt() {
    let (_server, client) = setup();
    let mut conn = client.dedicated().expect("connection");
    let mut session = TransactionSession::new(&mut conn);

    session.multi().expect("multi");
    session.queue(Cmd::set("k", 1)).expect("queue");
    session.queue(Cmd::new("NOSUCHCOMMAND")).expect("queue");

    match session.commit() {
        Err(ClientError::Server(err)) => {
            assert_eq!(err.kind, "ERR");
            assert!(err.detail.contains("unknown command"));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    assert_eq!(session.state(), TxState::Aborted);
    drop(session);
    assert_eq!(client.get("k").expect("get"), None);
}

#[test]
fn concurrent_increments_are_never_lost() {
    let (_server, client) = setup();
    client.set("shared", 0).expect("seed");

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let outcome: TxOutcome<()> = client
                        .transaction(&["shared"], |tx| {
                            let value: i64 = tx.get("shared")?;
                            Ok(Plan::Commit(vec![Cmd::set("shared", value + 1)]))
                        })
                        .expect("transaction");
                    assert!(outcome.is_committed());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker");
    }
    assert_eq!(balance(&client, "shared"), 100);
}
