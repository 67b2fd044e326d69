use std::thread;
use std::time::Duration;

use storm_client::{ClientConfig, ClientError, KVClient, ListenControl, Message};
use storm_testkit::TestServer;

const WAIT: Duration = Duration::from_secs(5);

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

fn payload(message: &Message) -> String {
    message.payload_str().unwrap_or_default().to_string()
}

#[test]
fn messages_arrive_in_publish_order() {
    let (_server, client) = setup();
    let mut subscription = client.subscribe(&["notifications"]).expect("subscribe");
    assert_eq!(subscription.channels(), &["notifications".to_string()]);

    for i in 1..=5 {
        let receivers = client
            .publish("notifications", format!("Message {}", i))
            .expect("publish");
        assert_eq!(receivers, 1);
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        let message = subscription
            .next_message_timeout(WAIT)
            .expect("message")
            .expect("stream open");
        assert_eq!(message.channel, "notifications");
        assert_eq!(message.pattern, None);
        received.push(payload(&message));
    }
    let expected: Vec<String> = (1..=5).map(|i| format!("Message {}", i)).collect();
    assert_eq!(received, expected);
}

#[test]
fn handler_stop_ends_listen_without_losing_messages() {
    let (_server, client) = setup();
    let mut subscription = client.subscribe(&["notifications"]).expect("subscribe");

    let listener = thread::spawn(move || {
        let mut seen = Vec::new();
        let delivered = subscription
            .listen(|message| {
                seen.push(payload(message));
                if message.payload_str() == Some("STOP") {
                    ListenControl::Stop
                } else {
                    ListenControl::Continue
                }
            })
            .expect("listen");
        // Unsubscribe was confirmed, so the stream drains and ends.
        let rest = subscription.next_message_timeout(WAIT).expect("drain");
        (delivered, seen, rest)
    });

    for text in ["first", "second", "third", "STOP"] {
        client.publish("notifications", text).expect("publish");
    }

    let (delivered, seen, rest) = listener.join().expect("listener thread");
    assert_eq!(delivered, 4);
    assert_eq!(seen, vec!["first", "second", "third", "STOP"]);
    assert_eq!(rest, None);
}

#[test]
fn unsubscribe_ends_the_stream() {
    let (_server, client) = setup();
    let mut subscription = client.subscribe(&["a", "b"]).expect("subscribe");

    subscription.unsubscribe().expect("unsubscribe");
    assert_eq!(subscription.next_message_timeout(WAIT).expect("end"), None);
    assert!(subscription.is_ended());
    assert_eq!(subscription.next_message().expect("ended"), None);
    assert_eq!(client.publish("a", "late").expect("publish"), 0);
}

#[test]
fn pattern_subscriptions_report_the_pattern() {
    let (_server, client) = setup();
    let mut subscription = client.psubscribe(&["news.*"]).expect("psubscribe");

    client.publish("sport.eu", "ignored").expect("publish");
    client.publish("news.eu", "hello").expect("publish");

    let message = subscription
        .next_message_timeout(WAIT)
        .expect("message")
        .expect("stream open");
    assert_eq!(message.pattern.as_deref(), Some("news.*"));
    assert_eq!(message.channel, "news.eu");
    assert_eq!(payload(&message), "hello");
}

#[test]
fn idle_subscription_does_not_block_other_traffic() {
    let (_server, client) = setup();
    let mut subscription = client.subscribe(&["quiet"]).expect("subscribe");

    client.set("k", "v").expect("set while subscribed");
    assert_eq!(client.get_string("k").expect("get"), Some("v".to_string()));

    assert!(matches!(
        subscription.next_message_timeout(Duration::from_millis(50)),
        Err(ClientError::Timeout)
    ));
    // A timeout is not fatal; the subscription still receives.
    client.publish("quiet", "now").expect("publish");
    let message = subscription
        .next_message_timeout(WAIT)
        .expect("message")
        .expect("stream open");
    assert_eq!(payload(&message), "now");
}

#[test]
fn close_ends_the_stream_immediately() {
    let (_server, client) = setup();
    let mut subscription = client.subscribe(&["c"]).expect("subscribe");
    subscription.close();
    assert_eq!(subscription.next_message_timeout(WAIT).expect("closed"), None);
}

#[test]
fn subscription_needs_a_channel() {
    let (_server, client) = setup();
    assert!(matches!(client.subscribe(&[]), Err(ClientError::InvalidArgument(_))));
}

#[test]
fn server_shutdown_ends_the_stream() {
    let (mut server, client) = setup();
    let mut subscription = client.subscribe(&["notifications"]).expect("subscribe");
    client.publish("notifications", "before").expect("publish");
    let message = subscription
        .next_message_timeout(WAIT)
        .expect("message")
        .expect("stream open");
    assert_eq!(payload(&message), "before");

    server.shutdown();
    assert_eq!(subscription.next_message_timeout(WAIT).expect("end of stream"), None);
    assert!(subscription.is_ended());
}
