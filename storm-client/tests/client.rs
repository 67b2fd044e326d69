use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use storm_client::{
    Batch, ClientConfig, ClientError, ClientTtl, Cmd, ConnectionPool, KVClient, Reply,
};

fn spawn_server(expected_commands: usize, handler: fn(usize, Vec<Vec<u8>>, &mut TcpStream)) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = read_command(&mut reader).expect("read command");
            handler(idx, args, &mut stream);
        }
    });

    addr
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"))
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{}\r\n", msg).as_bytes());
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("-{}\r\n", msg).as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut frame = format!("${}\r\n", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    write_raw(stream, &frame);
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{}\r\n", value).as_bytes());
}

fn config_with_addr(addr: String) -> ClientConfig {
    ClientConfig {
        addr,
        max_idle: 1,
        max_total: 1,
        read_timeout: Some(Duration::from_secs(1)),
        write_timeout: Some(Duration::from_secs(1)),
        connect_timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    }
}

fn client_with_addr(addr: String) -> KVClient {
    KVClient::with_config(config_with_addr(addr)).expect("client")
}

#[test]
fn client_set_get_roundtrip() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"key");
            assert_eq!(args[2], b"value");
            write_simple(stream, "OK");
        } else {
            assert_eq!(args[0], b"GET");
            assert_eq!(args[1], b"key");
            write_bulk(stream, b"value");
        }
    });

    let client = client_with_addr(addr);
    client.set("key", "value").expect("set");
    let value = client.get("key").expect("get");
    assert_eq!(value.as_deref(), Some(&b"value"[..]));
}

#[test]
fn client_ttl_and_delete() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args[0], b"TTL");
            assert_eq!(args[1], b"key");
            write_integer(stream, 5);
        } else {
            assert_eq!(args[0], b"DEL");
            assert_eq!(args[1], b"key");
            write_integer(stream, 1);
        }
    });

    let client = client_with_addr(addr);
    let ttl = client.ttl("key").expect("ttl");
    assert_eq!(ttl, ClientTtl::ExpiresIn(Duration::from_secs(5)));
    let removed = client.delete(&["key"]).expect("delete");
    assert_eq!(removed, 1);
}

#[test]
fn server_error_keeps_connection_usable() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args[0], b"INCR");
            write_error(stream, "ERR value is not an integer or out of range");
        } else {
            assert_eq!(args[0], b"PING");
            write_simple(stream, "PONG");
        }
    });

    let client = client_with_addr(addr);
    match client.incr("name") {
        Err(ClientError::Server(err)) => {
            assert_eq!(err.kind, "ERR");
            assert!(err.detail.contains("not an integer"));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    // Same single pooled connection answers the next command.
    assert_eq!(client.ping().expect("ping"), "PONG");
}

#[test]
fn malformed_reply_breaks_connection() {
    let addr = spawn_server(1, |_, _, stream| {
        write_raw(stream, b"?garbage\r\n");
    });

    let pool = ConnectionPool::new(config_with_addr(addr)).expect("pool");
    {
        let mut conn = pool.acquire().expect("acquire");
        let result = conn.execute(&Cmd::get("key"));
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert!(conn.is_broken());
        assert!(matches!(conn.execute(&Cmd::ping()), Err(ClientError::Closed)));
    }
    assert_eq!(pool.stats(), (0, 0));
}

#[test]
fn pipeline_replies_follow_submission_order() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args[0], b"SET");
            write_simple(stream, "OK");
        }
        1 => {
            assert_eq!(args[0], b"INCR");
            write_error(stream, "WRONGTYPE Operation against a key holding the wrong kind of value");
        }
        _ => {
            assert_eq!(args[0], b"GET");
            write_bulk(stream, b"1");
        }
    });

    let client = client_with_addr(addr);
    let batch: Batch = vec![Cmd::set("a", "1"), Cmd::incr("list"), Cmd::get("a")]
        .into_iter()
        .collect();
    let replies = client.pipeline(batch).expect("pipeline");
    assert_eq!(replies.len(), 3);
    assert!(replies[0].is_ok());
    assert_eq!(replies[1].as_error().map(|err| err.kind.as_str()), Some("WRONGTYPE"));
    assert_eq!(replies[2].clone().into_typed::<i64>().expect("typed"), 1);
}

#[test]
fn pool_exhaustion_fails_fast() {
    let addr = spawn_server(0, |_, _, _| {});
    let client = client_with_addr(addr);
    let _held = client.dedicated().expect("first connection");
    assert!(matches!(client.dedicated(), Err(ClientError::PoolExhausted)));
}

#[test]
fn closer_unblocks_pending_execute() {
    let addr = spawn_server(1, |_, _, _| {
        // Never answer; keep the socket open past the client's wait.
        thread::sleep(Duration::from_secs(3));
    });

    let mut config = config_with_addr(addr);
    config.read_timeout = Some(Duration::from_secs(10));
    let client = KVClient::with_config(config).expect("client");
    let mut conn = client.dedicated().expect("connection");
    let closer = conn.closer().expect("closer");

    let started = Instant::now();
    let closing = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        closer.close().expect("close");
    });

    let result = conn.execute(&Cmd::get("slow"));
    closing.join().expect("closer thread");
    assert!(matches!(result, Err(ClientError::Connection(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(conn.is_broken());
}

#[test]
fn mapping_replies_convert_to_pairs() {
    let addr = spawn_server(1, |_, args, stream| {
        assert_eq!(args[0], b"ZREVRANGE");
        assert_eq!(args[4], b"WITHSCORES");
        write_raw(stream, b"*4\r\n$5\r\nalice\r\n$3\r\n100\r\n$4\r\ncara\r\n$2\r\n92\r\n");
    });

    let client = client_with_addr(addr);
    let top = client.zrevrange_withscores("board", 0, 1).expect("zrevrange");
    assert_eq!(top, vec![("alice".to_string(), 100.0), ("cara".to_string(), 92.0)]);
}

#[test]
fn exec_null_array_decodes_to_nil() {
    let addr = spawn_server(1, |_, args, stream| {
        assert_eq!(args[0], b"EXEC");
        write_raw(stream, b"*-1\r\n");
    });

    let client = client_with_addr(addr);
    let reply: Reply = client.execute(&Cmd::exec()).expect("exec");
    assert!(reply.is_nil());
}

const SUBSCRIBED: &[u8] = b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n";

#[test]
fn subscription_ends_when_server_hangs_up_between_pushes() {
    let addr = spawn_server(1, |_, args, stream| {
        assert_eq!(args[0], b"SUBSCRIBE");
        write_raw(stream, SUBSCRIBED);
        write_raw(stream, b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n");
        // Returning drops the socket right after a complete push.
    });
    let client = client_with_addr(addr);
    let mut subscription = client.subscribe(&["news"]).expect("subscribe");

    let message = subscription
        .next_message_timeout(Duration::from_secs(2))
        .expect("message")
        .expect("stream open");
    assert_eq!(message.payload_str(), Some("hello"));
    assert_eq!(
        subscription
            .next_message_timeout(Duration::from_secs(2))
            .expect("clean end"),
        None
    );
    assert!(subscription.is_ended());
}

#[test]
fn subscription_reports_hang_up_inside_a_push() {
    let addr = spawn_server(1, |_, _, stream| {
        write_raw(stream, SUBSCRIBED);
        write_raw(stream, b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhel");
    });
    let client = client_with_addr(addr);
    let mut subscription = client.subscribe(&["news"]).expect("subscribe");

    assert!(matches!(
        subscription.next_message_timeout(Duration::from_secs(2)),
        Err(ClientError::Connection(_))
    ));
    assert_eq!(
        subscription
            .next_message_timeout(Duration::from_secs(2))
            .expect("ended"),
        None
    );
}
