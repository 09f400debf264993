//! Wire-level sessions against a live server on a loopback socket.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netshell::{Attr, Server, ShmCache};

static TOKEN_SEQ: AtomicU32 = AtomicU32::new(0);

struct TestServer {
    handle: Option<JoinHandle<()>>,
    port: u16,
    stop: Arc<AtomicBool>,
    token: PathBuf,
}

impl TestServer {
    fn start(tag: &str) -> TestServer {
        let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        let token = std::env::temp_dir().join(format!(
            "netshell-srv-{tag}-{}-{seq}.mmap",
            std::process::id()
        ));
        let _ = fs::remove_file(&token);

        let attr = Attr {
            mem_limit: 2 * 1024 * 1024,
            item_size_min: 64,
            item_size_max: 64 * 1024,
            nbuckets: 1024,
            ..Attr::default()
        };

        // The server is bound to its thread (the event loop is single
        // threaded and not Send), so the binding details come back over a
        // channel.
        let (tx, rx) = mpsc::channel();
        let thread_token = token.clone();
        let handle = thread::spawn(move || {
            let shmc = ShmCache::create(&thread_token, &attr).expect("create cache");
            let mut server = Server::new(shmc, 0, None).expect("bind server");
            tx.send((server.port(), server.stop_flag())).unwrap();
            server.run().expect("event loop");
            server.into_inner().destroy();
        });
        let (port, stop) = rx.recv().unwrap();

        TestServer {
            handle: Some(handle),
            port,
            stop,
            token,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.token);
    }
}

fn expect(stream: &mut TcpStream, want: &[u8]) {
    let mut got = vec![0u8; want.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(
        got,
        want,
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(want),
        String::from_utf8_lossy(&got)
    );
}

fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).unwrap();
    stream.flush().unwrap();
}

#[test]
fn get_of_a_missing_key_is_just_end() {
    let server = TestServer::start("miss");
    let mut s = server.connect();
    send(&mut s, b"get missing\r\n");
    expect(&mut s, b"END\r\n");
}

#[test]
fn set_then_get_echoes_value_and_flags() {
    let server = TestServer::start("setget");
    let mut s = server.connect();

    send(&mut s, b"set k 7 0 5\r\nhello\r\n");
    expect(&mut s, b"STORED\r\n");

    send(&mut s, b"get k\r\n");
    expect(&mut s, b"VALUE k 7 5\r\nhello\r\nEND\r\n");
}

#[test]
fn exptime_is_accepted_and_ignored() {
    let server = TestServer::start("exptime");
    let mut s = server.connect();

    send(&mut s, b"set e 0 9999 1\r\nz\r\n");
    expect(&mut s, b"STORED\r\n");
    send(&mut s, b"get e\r\n");
    expect(&mut s, b"VALUE e 0 1\r\nz\r\nEND\r\n");
}

#[test]
fn storage_command_responses() {
    let server = TestServer::start("storage");
    let mut s = server.connect();

    send(&mut s, b"add k 0 0 2\r\nhi\r\n");
    expect(&mut s, b"STORED\r\n");
    send(&mut s, b"add k 0 0 2\r\nhi\r\n");
    expect(&mut s, b"EXISTS\r\n");

    send(&mut s, b"replace missing 0 0 2\r\nhi\r\n");
    expect(&mut s, b"NOT_FOUND\r\n");
    send(&mut s, b"prepend missing 0 0 2\r\nhi\r\n");
    expect(&mut s, b"NOT_FOUND\r\n");
    send(&mut s, b"append missing 0 0 2\r\nhi\r\n");
    expect(&mut s, b"NOT_FOUND\r\n");

    send(&mut s, b"replace k 0 0 3\r\nbye\r\n");
    expect(&mut s, b"STORED\r\n");
    send(&mut s, b"append k 0 0 1\r\n!\r\n");
    expect(&mut s, b"STORED\r\n");
    send(&mut s, b"get k\r\n");
    expect(&mut s, b"VALUE k 0 4\r\nbye!\r\nEND\r\n");
}

#[test]
fn payload_may_arrive_in_pieces() {
    let server = TestServer::start("nread");
    let mut s = server.connect();

    send(&mut s, b"set kk 0 0 4\r\nab");
    thread::sleep(Duration::from_millis(50));
    send(&mut s, b"cd\r\n");
    expect(&mut s, b"STORED\r\n");

    send(&mut s, b"get kk\r\n");
    expect(&mut s, b"VALUE kk 0 4\r\nabcd\r\nEND\r\n");
}

#[test]
fn arithmetic_over_the_wire() {
    let server = TestServer::start("arith");
    let mut s = server.connect();

    send(&mut s, b"incr c 5\r\n");
    expect(&mut s, b"5\r\n");
    send(&mut s, b"decr c 3\r\n");
    expect(&mut s, b"2\r\n");
    send(&mut s, b"decr c 7\r\n");
    expect(&mut s, b"0\r\n");

    send(&mut s, b"delete c\r\n");
    expect(&mut s, b"DELETED\r\n");
    send(&mut s, b"delete c\r\n");
    expect(&mut s, b"NOT_FOUND\r\n");
}

#[test]
fn unknown_commands_are_client_errors() {
    let server = TestServer::start("unknown");
    let mut s = server.connect();
    send(&mut s, b"flush_all\r\n");
    expect(&mut s, b"CLIENT_ERROR unknow command\r\n");
}

#[test]
fn an_unterminated_header_overflows() {
    let server = TestServer::start("overflow");
    let mut s = server.connect();

    send(&mut s, &[b'a'; 312]);
    expect(&mut s, b"ERROR request header too long\r\n");

    // The connection stays usable afterwards.
    send(&mut s, b"get still-alive\r\n");
    expect(&mut s, b"END\r\n");
}

#[test]
fn stats_report_counters_and_attributes() {
    let server = TestServer::start("stats");
    let mut s = server.connect();

    send(&mut s, b"get warm-up\r\n");
    expect(&mut s, b"END\r\n");

    send(&mut s, b"stats\r\n");
    let mut body = Vec::new();
    let mut chunk = [0u8; 512];
    while !body.ends_with(b"\r\nEND\r\n") {
        let n = s.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-stats");
        body.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("STAT cmd_get 1\r\n"), "{text}");
    assert!(text.contains("STAT get_misses 1\r\n"), "{text}");
    assert!(text.contains("STAT nbuckets 1024\r\n"), "{text}");
    assert!(text.contains("STAT limit_maxbytes 2097152\r\n"), "{text}");
    assert!(text.contains("STAT max_depth"), "{text}");
}

#[test]
fn quit_closes_the_connection() {
    let server = TestServer::start("quit");
    let mut s = server.connect();

    send(&mut s, b"quit\r\n");
    let mut buf = [0u8; 1];
    assert_eq!(s.read(&mut buf).unwrap(), 0);
}

#[test]
fn dump_and_load_over_the_wire() {
    let server = TestServer::start("snapshot");
    let snapshot = std::env::temp_dir().join(format!(
        "netshell-srv-snap-{}.txt",
        std::process::id()
    ));
    let _ = fs::remove_file(&snapshot);

    let mut s = server.connect();
    send(&mut s, b"set k 0 0 5\r\nhello\r\n");
    expect(&mut s, b"STORED\r\n");

    let cmd = format!("dump {}\r\n", snapshot.display());
    send(&mut s, cmd.as_bytes());
    expect(&mut s, b"DUMPED\r\n");

    send(&mut s, b"delete k\r\n");
    expect(&mut s, b"DELETED\r\n");

    let cmd = format!("load {}\r\n", snapshot.display());
    send(&mut s, cmd.as_bytes());
    expect(&mut s, b"LOADED\r\n");

    send(&mut s, b"get k\r\n");
    expect(&mut s, b"VALUE k 0 5\r\nhello\r\nEND\r\n");

    let _ = fs::remove_file(&snapshot);
}
