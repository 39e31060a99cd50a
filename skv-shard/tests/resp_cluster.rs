use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use skv_shard::{connect_sharded, ShardConfig};

type Seen = Arc<Mutex<Vec<Vec<String>>>>;

/// Minimal RESP server with GET/SET/MGET/DEL over a private map.
fn spawn_store() -> (String, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    thread::spawn(move || {
        let mut store: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            while let Ok(args) = read_command(&mut reader) {
                log.lock()
                    .unwrap()
                    .push(args.iter().map(|arg| String::from_utf8_lossy(arg).into_owned()).collect());
                let reply = handle(&mut store, &args);
                let _ = stream.write_all(&reply);
                let _ = stream.flush();
            }
        }
    });

    (addr, seen)
}

fn handle(store: &mut HashMap<Vec<u8>, Vec<u8>>, args: &[Vec<u8>]) -> Vec<u8> {
    match args[0].as_slice() {
        b"SET" => {
            store.insert(args[1].clone(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        b"GET" => bulk(store.get(&args[1])),
        b"DEL" => format!(":{}\r\n", store.remove(&args[1]).is_some() as i64).into_bytes(),
        b"MGET" => {
            let mut reply = format!("*{}\r\n", args.len() - 1).into_bytes();
            for key in &args[1..] {
                reply.extend_from_slice(&bulk(store.get(key)));
            }
            reply
        }
        _ => b"-ERR unknown command\r\n".to_vec(),
    }
}

fn bulk(value: Option<&Vec<u8>>) -> Vec<u8> {
    match value {
        Some(data) => {
            let mut reply = format!("${}\r\n", data.len()).into_bytes();
            reply.extend_from_slice(data);
            reply.extend_from_slice(b"\r\n");
            reply
        }
        None => b"$-1\r\n".to_vec(),
    }
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let header = read_line(reader)?;
    let count = parse_len(&header, b'*')?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let line = read_line(reader)?;
        let len = parse_len(&line, b'$')?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        data.truncate(len);
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    line.truncate(line.len().saturating_sub(2));
    Ok(line)
}

fn parse_len(line: &[u8], prefix: u8) -> std::io::Result<usize> {
    if line.first() != Some(&prefix) {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad prefix"));
    }
    std::str::from_utf8(&line[1..])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length"))
}

fn config_for(groups: &[&[&str]]) -> ShardConfig {
    let json = serde_json::json!({
        "groups": groups,
        "pool": { "max_idle": 2, "max_total": 2, "read_timeout_ms": 1000, "connect_timeout_ms": 1000 },
    });
    ShardConfig::from_json(&json.to_string()).expect("config")
}

#[test]
fn keys_reach_only_their_own_server() {
    let (first, first_seen) = spawn_store();
    let (second, second_seen) = spawn_store();
    let client = connect_sharded(&config_for(&[&[&first], &[&second]])).expect("client");

    client.set_entry("a", "alpha", None).expect("set a");
    client.set_entry("b", "beta", None).expect("set b");
    assert_eq!(client.get_string("a").expect("get a").as_deref(), Some("alpha"));

    let values = client.get_values(&["a", "b", "user:2"]).expect("mget");
    assert_eq!(
        values,
        vec![Some("alpha".to_string()), None, Some("beta".to_string())]
    );

    let first_seen = first_seen.lock().unwrap().clone();
    let second_seen = second_seen.lock().unwrap().clone();
    assert_eq!(first_seen[0], vec!["SET", "a", "alpha"]);
    assert_eq!(first_seen[1], vec!["GET", "a"]);
    assert_eq!(first_seen[2], vec!["MGET", "a", "user:2"]);
    assert_eq!(second_seen, vec![vec!["SET", "b", "beta"], vec!["MGET", "b"]]);

    assert_eq!(client.cached_connections(), 2);
    assert_eq!(client.dispose(), 2);
}

#[test]
fn mirrors_on_separate_servers_both_receive_writes() {
    let (primary, primary_seen) = spawn_store();
    let (replica, replica_seen) = spawn_store();
    let client = connect_sharded(&config_for(&[&[&primary, &replica]])).expect("client");

    assert!(client.set("k", &5u32).expect("set"));
    assert_eq!(client.get::<u32>("k").expect("get"), Some(5));
    assert!(client.remove("k").expect("remove"));

    let primary_seen = primary_seen.lock().unwrap().clone();
    let replica_seen = replica_seen.lock().unwrap().clone();
    assert_eq!(primary_seen.len(), 3);
    assert_eq!(replica_seen, vec![vec!["SET", "k", "5"], vec!["DEL", "k"]]);
}

#[test]
fn pipeline_sends_one_batch_per_server() {
    let (primary, primary_seen) = spawn_store();
    let (replica, replica_seen) = spawn_store();
    let client = connect_sharded(&config_for(&[&[&primary, &replica]])).expect("client");

    let mut pipeline = client.create_pipeline::<String>().expect("pipeline");
    pipeline.queue_set("x", &"1".to_string(), None).expect("queue");
    pipeline.queue_set("y", &"2".to_string(), None).expect("queue");
    pipeline.flush().expect("flush");
    drop(pipeline);

    assert_eq!(client.get::<String>("y").expect("get").as_deref(), Some("2"));
    let expected = vec![
        vec!["SET".to_string(), "x".into(), "\"1\"".into()],
        vec!["SET".to_string(), "y".into(), "\"2\"".into()],
    ];
    assert_eq!(replica_seen.lock().unwrap().clone(), expected);
    assert_eq!(primary_seen.lock().unwrap()[..2].to_vec(), expected);
}
