//! Shared utilities for integration tests.
//!
//! Provides a running engine on an ephemeral port plus raw-socket helpers
//! for speaking HTTP/1.x by hand. These helpers reduce duplication across
//! test modules.

#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::net::SocketAddr;

use hawser::{
    EngineConfig, Request, Response, Server, ServerHandle, Service, ServiceResponse, service_fn,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};

/// Service echoing the request body back with a 200.
pub fn echo_service() -> impl Service {
    service_fn(|request: Request| async move {
        ServiceResponse::new(Response::new(200).body(request.body.clone()))
    })
}

/// A running engine plus the means to stop it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    /// Trigger shutdown and wait for the engine to drain.
    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

/// Start an engine on an ephemeral port with the given factory.
pub async fn start<F, S>(factory: F, workers: usize, config: EngineConfig) -> TestServer
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Service,
{
    let bound = Server::new(factory)
        .workers(workers)
        .config(config)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = bound.local_addr();
    let handle = bound.handle();
    let task = tokio::spawn(bound.run_with_shutdown(std::future::pending::<()>()));
    TestServer { addr, handle, task }
}

/// Start the echo engine with default configuration and one worker.
pub async fn start_echo() -> TestServer {
    start(echo_service, 1, EngineConfig::default()).await
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

/// Read exactly one response: the head through its blank line, then the
/// body its `Content-Length` announces.
pub async fn read_response(stream: &mut TcpStream) -> String {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "stream ended mid-response");
        collected.push(byte[0]);
        if collected.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(collected.clone()).unwrap();
    let body_len: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("response missing Content-Length")
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.unwrap();
    collected.extend_from_slice(&body);
    String::from_utf8(collected).unwrap()
}

/// Write a minimal request carrying `body` on the stream.
pub async fn send_request(stream: &mut TcpStream, target: &str, body: &str) {
    let request = format!(
        "POST {target} HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
}
