//! Connection lifetime: socket intake, exchange driving, and teardown.
//!
//! Each accepted socket gets one `Connection` on its owning event-loop
//! thread. The connection pins a region of its intake store, awaits the
//! socket, commits whatever arrived, and hands the committed window to the
//! current exchange. Exchanges never see the socket; they signal pause,
//! resume, and end through the flow-control capability, and the driver
//! applies the transition.

pub mod control;
mod counter;

use std::{any::Any, net::SocketAddr, rc::Rc, sync::Arc};

use control::{ControlHandle, EndAction, FlowControl};
use counter::ActiveConnection;
pub use counter::active_connection_count;
use futures::FutureExt;
use log::{error, info, warn};
use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, tcp::OwnedReadHalf},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::EngineConfig,
    exchange::Exchange,
    input::InputBuffer,
    metrics,
    output::{self, Outbound},
    pool::BufferPool,
    registry::{ConnectionId, ConnectionRegistry},
    service::Service,
};

/// Shared per-connection context handed to each exchange.
pub(crate) struct ConnCtx<S> {
    pub(crate) id: ConnectionId,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) control: Rc<dyn FlowControl>,
    pub(crate) outbound: Outbound,
    pub(crate) service: S,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) max_head_bytes: usize,
    pub(crate) max_body_bytes: usize,
}

/// Driver owning the receive half of one socket.
pub(crate) struct Connection<S: Service> {
    ctx: Rc<ConnCtx<S>>,
    control: ControlHandle,
    teardown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    input: InputBuffer,
    read_chunk: usize,
}

impl<S: Service> Connection<S> {
    /// Register `socket` and start its driver and writer tasks.
    ///
    /// Must be called on the connection's owning event-loop thread, inside
    /// a `LocalSet`; both tasks hold thread-local state. The teardown token
    /// is a child of `loop_shutdown`, so cancelling the loop ends every
    /// connection on it, and both tasks join `tracker` so the loop can
    /// drain them before its thread exits.
    pub(crate) fn spawn(
        socket: TcpStream,
        service: S,
        config: &EngineConfig,
        pool: &Arc<BufferPool>,
        registry: &Arc<ConnectionRegistry>,
        loop_shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) -> ConnectionId {
        let id = registry.allocate_id();
        let peer = socket.peer_addr().ok();
        let teardown = loop_shutdown.child_token();
        registry.insert(id, teardown.clone(), peer);

        let (read_half, write_half) = socket.into_split();
        let control = ControlHandle::new(teardown.clone());
        let control_dyn: Rc<dyn FlowControl> = Rc::new(control.clone());
        let (outbound, writer) = output::outbound(config.output_backlog_limit);
        tracker.spawn_local(writer.run(
            write_half,
            Rc::clone(&control_dyn),
            teardown.clone(),
            id,
        ));

        let ctx = Rc::new(ConnCtx {
            id,
            peer,
            control: control_dyn,
            outbound,
            service,
            pool: Arc::clone(pool),
            max_head_bytes: config.max_head_bytes,
            max_body_bytes: config.max_body_bytes,
        });
        let input = InputBuffer::new(pool.lease(config.read_chunk), config.max_input_buffer);
        let connection = Self {
            ctx,
            control,
            teardown,
            registry: Arc::clone(registry),
            input,
            read_chunk: config.read_chunk,
        };
        tracker.spawn_local(connection.run(read_half));
        id
    }

    /// Drive the connection until it ends, then tear it down.
    async fn run(mut self, mut socket: OwnedReadHalf) {
        let guard = ActiveConnection::new();
        info!(
            "connection opened: hawser_active_connections={}, id={}, peer={:?}",
            active_connection_count(),
            self.ctx.id,
            self.ctx.peer
        );

        let mut seq = 0;
        let mut exchange = Exchange::new(Rc::clone(&self.ctx), seq);
        loop {
            // Paused intake defers the next read, never drops bytes.
            self.control.wait_while_paused().await;
            if self.control.is_torn_down() {
                break;
            }
            let Some(n) = self.fill(&mut socket).await else {
                break;
            };
            if n > 0 {
                metrics::add_socket_bytes(metrics::Direction::Inbound, n as u64);
            }
            if !self.pump(&mut exchange, &mut seq).await {
                break;
            }
        }

        self.teardown.cancel();
        self.registry.remove(&self.ctx.id);
        info!(
            "connection closed: id={}, peer={:?}",
            self.ctx.id, self.ctx.peer
        );
        drop(guard);
    }

    /// Pin, read, and commit one chunk. `None` ends the connection.
    async fn fill(&mut self, socket: &mut OwnedReadHalf) -> Option<usize> {
        let region = match self.input.pin(self.read_chunk) {
            Ok(region) => region,
            Err(err) => {
                warn!("intake stalled: id={}, error={err}", self.ctx.id);
                metrics::inc_errors();
                self.ctx.control.end(EndAction::Disconnect);
                return None;
            }
        };
        let read = tokio::select! {
            biased;
            () = self.teardown.cancelled() => return None,
            res = socket.read(region) => res,
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                warn!("connection read failed: id={}, error={err}", self.ctx.id);
                metrics::inc_errors();
                self.ctx.control.end(EndAction::Disconnect);
                return None;
            }
        };
        match self.input.commit(n) {
            Ok(()) => Some(n),
            Err(err) => {
                // Unreachable while fill is the only committer.
                error!("intake commit rejected: id={}, error={err}", self.ctx.id);
                self.ctx.control.end(EndAction::Disconnect);
                None
            }
        }
    }

    /// Run exchanges over the committed window until more bytes are needed.
    ///
    /// A finished exchange that asked to keep the connection alive is
    /// replaced and the fresh exchange consumes immediately, so pipelined
    /// requests never wait for another read event. Returns `false` when the
    /// connection is done.
    async fn pump(&mut self, exchange: &mut Exchange<S>, seq: &mut u64) -> bool {
        loop {
            let outcome = std::panic::AssertUnwindSafe(exchange.consume(&mut self.input))
                .catch_unwind()
                .await;
            if let Err(payload) = outcome {
                let panic = panic_text(payload.as_ref());
                // Emit via both `log` and `tracing` for tests that capture
                // either.
                error!(
                    "exchange panicked: id={}, exchange={}, state={}, panic={panic}",
                    self.ctx.id,
                    exchange.seq(),
                    exchange.state_name()
                );
                tracing::error!(panic = %panic, id = %self.ctx.id, "exchange panicked");
                metrics::inc_errors();
                self.ctx.control.end(EndAction::Disconnect);
                return false;
            }
            match self.control.take_end() {
                None => return true,
                Some(EndAction::KeepAlive) => {
                    *seq += 1;
                    *exchange = Exchange::new(Rc::clone(&self.ctx), *seq);
                }
                Some(EndAction::HalfClose) => {
                    // Send direction closes behind queued data; intake keeps
                    // draining through the completed exchange until eof.
                    let _ = self.ctx.outbound.finish_send();
                    return true;
                }
                Some(EndAction::Disconnect) => return false,
            }
        }
    }
}

/// Best-effort text of a panic payload; `panic!` produces a `String` or a
/// `&'static str`, anything else stays opaque.
fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else if let Some(text) = payload.downcast_ref::<&'static str>() {
        *text
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::LocalSet,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::{
        http::{Request, Response},
        service::{ServiceResponse, service_fn},
    };

    fn echo() -> impl Service {
        service_fn(|request: Request| async move {
            ServiceResponse::new(Response::new(200).body(request.body.clone()))
        })
    }

    async fn accept_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn wait_until_removed(registry: &Arc<ConnectionRegistry>) {
        timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Read one response head plus `Content-Length` body off the stream.
    async fn read_one_response(client: &mut TcpStream) -> String {
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = client.read(&mut byte).await.unwrap();
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
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();
        collected.extend_from_slice(&body);
        String::from_utf8(collected).unwrap()
    }

    #[tokio::test]
    async fn serves_pipelined_requests_on_one_connection() {
        LocalSet::new()
            .run_until(async {
                let (mut client, server) = accept_pair().await;
                let registry = Arc::new(ConnectionRegistry::new());
                let pool = BufferPool::with_defaults();
                let config = EngineConfig::default();
                let loop_shutdown = CancellationToken::new();
                let tracker = TaskTracker::new();
                Connection::spawn(
                    server,
                    echo(),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );

                client
                    .write_all(
                        b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nonePOST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo",
                    )
                    .await
                    .unwrap();
                let first = read_one_response(&mut client).await;
                let second = read_one_response(&mut client).await;
                assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(first.ends_with("one"));
                assert!(second.ends_with("two"));

                client.shutdown().await.unwrap();
                wait_until_removed(&registry).await;
            })
            .await;
    }

    #[tokio::test]
    async fn immediate_fin_closes_without_a_response() {
        LocalSet::new()
            .run_until(async {
                let (mut client, server) = accept_pair().await;
                let registry = Arc::new(ConnectionRegistry::new());
                let pool = BufferPool::with_defaults();
                let config = EngineConfig::default();
                let loop_shutdown = CancellationToken::new();
                let tracker = TaskTracker::new();
                Connection::spawn(
                    server,
                    echo(),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );

                client.shutdown().await.unwrap();
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());
                wait_until_removed(&registry).await;
            })
            .await;
    }

    #[tokio::test]
    async fn http10_response_is_followed_by_server_fin() {
        LocalSet::new()
            .run_until(async {
                let (mut client, server) = accept_pair().await;
                let registry = Arc::new(ConnectionRegistry::new());
                let pool = BufferPool::with_defaults();
                let config = EngineConfig::default();
                let loop_shutdown = CancellationToken::new();
                let tracker = TaskTracker::new();
                Connection::spawn(
                    server,
                    echo(),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );

                client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
                let mut all = Vec::new();
                client.read_to_end(&mut all).await.unwrap();
                let text = String::from_utf8(all).unwrap();
                assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
                assert!(text.contains("Connection: close\r\n"));

                // The send direction closed; draining our half ends it.
                client.shutdown().await.unwrap();
                wait_until_removed(&registry).await;
            })
            .await;
    }

    #[tokio::test]
    async fn registry_disconnect_tears_the_connection_down() {
        LocalSet::new()
            .run_until(async {
                let (mut client, server) = accept_pair().await;
                let registry = Arc::new(ConnectionRegistry::new());
                let pool = BufferPool::with_defaults();
                let config = EngineConfig::default();
                let loop_shutdown = CancellationToken::new();
                let tracker = TaskTracker::new();
                let id = Connection::spawn(
                    server,
                    echo(),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );

                assert!(registry.disconnect(&id));
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());
                wait_until_removed(&registry).await;
                // A second disconnect of a gone connection is a no-op.
                assert!(!registry.disconnect(&id));
            })
            .await;
    }

    #[tokio::test]
    async fn panicking_service_disconnects_without_killing_the_loop() {
        LocalSet::new()
            .run_until(async {
                let (mut client, server) = accept_pair().await;
                let registry = Arc::new(ConnectionRegistry::new());
                let pool = BufferPool::with_defaults();
                let config = EngineConfig::default();
                let loop_shutdown = CancellationToken::new();
                let tracker = TaskTracker::new();
                async fn exploding(_request: Request) -> ServiceResponse {
                    panic!("handler blew up")
                }
                Connection::spawn(
                    server,
                    service_fn(exploding),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );

                client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                wait_until_removed(&registry).await;

                // The loop survived: a fresh connection still works.
                let (mut client2, server2) = accept_pair().await;
                Connection::spawn(
                    server2,
                    echo(),
                    &config,
                    &pool,
                    &registry,
                    &loop_shutdown,
                    &tracker,
                );
                client2.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
                let reply = read_one_response(&mut client2).await;
                assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
            })
            .await;
    }
}
