//! Live TCP round trips against a bound server.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use beansd::config::Config;
use beansd::context::ServerContext;
use beansd::runtime::Reactor;
use beansd::store::MemStore;

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    handles: Vec<JoinHandle<()>>,
    _home: tempfile::TempDir,
}

impl TestServer {
    fn start() -> TestServer {
        Self::start_with(|_| {})
    }

    fn start_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
        let home = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.listen = "127.0.0.1".to_string();
        config.port = 0;
        config.threads = 2;
        config.maxconns = 64;
        config.homes = vec![home.path().to_path_buf()];
        tweak(&mut config);

        let store =
            Arc::new(MemStore::open(&config.homes, config.height, 0, config.threads).unwrap());
        let ctx = ServerContext::new(store, &config);
        let reactor = Reactor::bind(&config).unwrap();
        let addr = reactor.local_addr();
        let handles = reactor.spawn(Arc::clone(&ctx)).unwrap();

        TestServer {
            addr,
            ctx,
            handles,
            _home: home,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ctx.request_quit();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn expect(client: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(
        buf,
        expected,
        "got {:?}, want {:?}",
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

#[test]
fn test_set_get_round_trip() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"set K 0 1 5\r\nhello\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"get K\r\n").unwrap();
    expect(&mut client, b"VALUE K 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn test_multi_key_get_omits_misses() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"set A 0 1 1\r\n1\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");
    client.write_all(b"set B 0 1 1\r\n2\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"get A B C\r\n").unwrap();
    expect(
        &mut client,
        b"VALUE A 0 1\r\n1\r\nVALUE B 0 1\r\n2\r\nEND\r\n",
    );
}

#[test]
fn test_incr_and_delete() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"set K 0 1 2\r\n10\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"incr K 3\r\n").unwrap();
    expect(&mut client, b"13\r\n");

    client.write_all(b"delete K\r\n").unwrap();
    expect(&mut client, b"DELETED\r\n");
    client.write_all(b"delete K\r\n").unwrap();
    expect(&mut client, b"NOT_FOUND\r\n");
}

#[test]
fn test_append() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"set K 0 1 2\r\nhi\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"append K 0 1 3\r\nXYZ\r\n").unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"get K\r\n").unwrap();
    expect(&mut client, b"VALUE K 0 5\r\nhiXYZ\r\nEND\r\n");
}

#[test]
fn test_noreply_set_sends_zero_bytes() {
    let server = TestServer::start();
    let mut client = server.connect();

    client
        .write_all(b"set K 0 1 5 noreply\r\nhello\r\nget K\r\n")
        .unwrap();
    // The very next bytes on the wire are the get reply.
    expect(&mut client, b"VALUE K 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn test_pipelined_reply_per_command() {
    let server = TestServer::start();
    let mut client = server.connect();

    client
        .write_all(
            b"set A 0 1 1\r\n1\r\nset B 0 1 1 noreply\r\n2\r\nget B\r\nversion\r\n",
        )
        .unwrap();

    let version = format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION"));
    let mut expected = b"STORED\r\nVALUE B 0 1\r\n2\r\nEND\r\n".to_vec();
    expected.extend_from_slice(version.as_bytes());
    expect(&mut client, &expected);
}

#[test]
fn test_large_value_round_trip() {
    let server = TestServer::start();
    let mut client = server.connect();

    // Large enough that the reply spans several message headers and the
    // command body outgrows the initial read buffer.
    let value = vec![b'v'; 8000];
    let mut cmd = b"set BIG 0 1 8000\r\n".to_vec();
    cmd.extend_from_slice(&value);
    cmd.extend_from_slice(b"\r\n");
    client.write_all(&cmd).unwrap();
    expect(&mut client, b"STORED\r\n");

    client.write_all(b"get BIG\r\n").unwrap();
    let mut expected = b"VALUE BIG 0 8000\r\n".to_vec();
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\nEND\r\n");
    expect(&mut client, &expected);
}

#[test]
fn test_bad_data_chunk_keeps_framing() {
    let server = TestServer::start();
    let mut client = server.connect();

    // Body is 7 bytes (vlen + 2) but does not end in CRLF.
    client.write_all(b"set K 0 1 5\r\nhelloXY").unwrap();
    expect(&mut client, b"CLIENT_ERROR bad data chunk\r\n");

    client.write_all(b"version\r\n").unwrap();
    let version = format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION"));
    expect(&mut client, version.as_bytes());
}

#[test]
fn test_unknown_command_keeps_connection() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"bogus stuff here\r\n").unwrap();
    expect(&mut client, b"ERROR\r\n");

    client.write_all(b"get nothing\r\n").unwrap();
    expect(&mut client, b"END\r\n");
}

#[test]
fn test_stats_and_reset() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"get warmup\r\n").unwrap();
    expect(&mut client, b"END\r\n");

    client.write_all(b"stats\r\n").unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    while !reply.ends_with(b"END\r\n") {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "stats reply truncated");
        reply.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("STAT pid "));
    assert!(text.contains("STAT cmd_get 1\r\n"));
    assert!(text.contains("STAT curr_connections 1\r\n"));

    client.write_all(b"stats reset\r\n").unwrap();
    expect(&mut client, b"RESET\r\n");
}

#[test]
fn test_flush_all_and_optimize_stat() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"flush_all\r\n").unwrap();
    expect(&mut client, b"OK\r\n");

    client.write_all(b"flush_all 100 @0\r\n").unwrap();
    expect(&mut client, b"OK\r\n");

    client.write_all(b"flush_all bogus\r\n").unwrap();
    expect(&mut client, b"CLIENT_ERROR bad command line format\r\n");

    client.write_all(b"optimize_stat\r\n").unwrap();
    expect(&mut client, b"success\r\n");
}

#[test]
fn test_version_and_quit() {
    let server = TestServer::start();
    let mut client = server.connect();

    let version = format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION"));
    client.write_all(b"version\r\n").unwrap();
    expect(&mut client, version.as_bytes());

    client.write_all(b"quit\r\n").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_stopme_requires_flag() {
    let server = TestServer::start();
    let mut client = server.connect();

    // Without -S the command is unknown.
    client.write_all(b"stopme\r\n").unwrap();
    expect(&mut client, b"ERROR\r\n");
    drop(client);
    drop(server);

    let server = TestServer::start_with(|config| config.stopme = true);
    let mut client = server.connect();
    client.write_all(b"stopme\r\n").unwrap();
    // No reply; the workers observe the quit flag and exit.
    std::thread::sleep(Duration::from_millis(600));
    assert!(server.ctx.quit_requested());
}

#[test]
fn test_verbosity_command() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.write_all(b"verbosity 2\r\n").unwrap();
    expect(&mut client, b"OK\r\n");

    client.write_all(b"verbosity 99\r\n").unwrap();
    expect(&mut client, b"OK\r\n");

    client.write_all(b"verbosity abc\r\n").unwrap();
    expect(&mut client, b"CLIENT_ERROR bad command line format\r\n");
}
