//! Listener, acceptor, and worker fan-out.
//!
//! The server binds one listening socket, spawns a fixed set of event-loop
//! threads, and assigns accepted sockets to loops round-robin. Each
//! accepted socket is re-armed on its owning loop's reactor; from then on
//! every byte of that connection is handled on that one thread.

use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    task,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::EngineConfig,
    connection::Connection,
    event_loop::{EventLoop, LoopHandle},
    metrics,
    pool::BufferPool,
    registry::{ConnectionId, ConnectionRegistry},
    service::Service,
};

/// Builder for a socket engine serving one service factory.
///
/// The factory runs once per connection, on the connection's owning loop
/// thread, so the service it builds may hold non-`Send` state.
pub struct Server<F> {
    factory: F,
    config: EngineConfig,
    workers: usize,
}

impl<F, S> Server<F>
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Service,
{
    /// Create a server from a service factory.
    pub fn new(factory: F) -> Self {
        let workers = thread::available_parallelism().map_or(1, std::num::NonZero::get);
        Self {
            factory,
            config: EngineConfig::default(),
            workers,
        }
    }

    /// Set the number of event-loop threads.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Replace the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind to `addr` and start the event-loop threads.
    ///
    /// # Errors
    /// Binding, loop spawning, and configuration validation failures all
    /// surface as [`io::Error`].
    pub fn bind(self, addr: SocketAddr) -> io::Result<BoundServer<F>> {
        let listener = StdTcpListener::bind(addr)?;
        self.bind_listener(listener)
    }

    /// Adopt an already-bound listener and start the event-loop threads.
    ///
    /// # Errors
    /// Loop spawning and configuration validation failures surface as
    /// [`io::Error`].
    pub fn bind_listener(self, listener: StdTcpListener) -> io::Result<BoundServer<F>> {
        self.config
            .validate()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let local_addr = listener.local_addr()?;
        let loops = (0..self.workers)
            .map(|i| EventLoop::spawn(&format!("hawser-loop-{i}")))
            .collect::<io::Result<Vec<_>>>()?;
        let pool = BufferPool::new(&self.config.pool);
        Ok(BoundServer {
            listener,
            local_addr,
            factory: self.factory,
            config: self.config,
            loops,
            registry: Arc::new(ConnectionRegistry::new()),
            pool,
            shutdown: CancellationToken::new(),
        })
    }
}

/// A bound engine ready to accept connections.
pub struct BoundServer<F> {
    listener: StdTcpListener,
    local_addr: SocketAddr,
    factory: F,
    config: EngineConfig,
    loops: Vec<EventLoop>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
}

/// Cloneable control surface for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Ask the server to stop accepting and drain its connections.
    pub fn shutdown(&self) { self.shutdown.cancel(); }

    /// Tear down one connection from outside its loop. `false` when the
    /// connection is already gone.
    pub fn disconnect(&self, id: &ConnectionId) -> bool { self.registry.disconnect(id) }

    /// Tear down every live connection; returns how many were signalled.
    pub fn disconnect_all(&self) -> usize { self.registry.disconnect_all() }

    /// Number of connections currently registered.
    #[must_use]
    pub fn active_connections(&self) -> usize { self.registry.len() }

    /// Identifiers of all live connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> { self.registry.active_ids() }

    /// Peer address of one live connection.
    #[must_use]
    pub fn peer(&self, id: &ConnectionId) -> Option<SocketAddr> { self.registry.peer(id) }
}

impl<F, S> BoundServer<F>
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Service,
{
    /// Address the listener actually bound, with any zero port resolved.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Control surface usable from any thread.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Serve until interrupted with Ctrl-C, then drain gracefully.
    ///
    /// # Errors
    /// Listener conversion failures surface as [`io::Error`].
    pub async fn run(self) -> io::Result<()> {
        self.run_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Serve until `trigger` completes or [`ServerHandle::shutdown`] is
    /// called, then drain gracefully.
    ///
    /// # Errors
    /// Listener conversion failures surface as [`io::Error`].
    pub async fn run_with_shutdown(self, trigger: impl Future<Output = ()>) -> io::Result<()> {
        let Self {
            listener,
            local_addr,
            factory,
            config,
            loops,
            registry,
            pool,
            shutdown,
        } = self;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let handles: Vec<LoopHandle> = loops.iter().map(EventLoop::handle).collect();
        info!(
            "server listening: addr={local_addr}, workers={}",
            loops.len()
        );

        let accept = accept_loop(
            &listener,
            &handles,
            &factory,
            &config,
            &pool,
            &registry,
            &shutdown,
        );
        tokio::select! {
            () = accept => {}
            () = trigger => info!("shutdown requested: addr={local_addr}"),
        }
        shutdown.cancel();

        // Stop intake on every live connection, then let each loop finish
        // its final writes and teardown.
        let signalled = registry.disconnect_all();
        if signalled > 0 {
            info!("draining connections: count={signalled}");
        }
        for event_loop in &loops {
            event_loop.shutdown();
        }
        let drained = task::spawn_blocking(move || {
            for event_loop in loops {
                event_loop.join();
            }
        })
        .await;
        if drained.is_err() {
            warn!("loop drain task failed: addr={local_addr}");
        }
        info!("server stopped: addr={local_addr}");
        Ok(())
    }
}

/// Accept until shutdown, assigning sockets to loops round-robin.
///
/// Transient accept errors back off exponentially up to one second and the
/// delay resets after the next successful accept.
async fn accept_loop<F, S>(
    listener: &TcpListener,
    handles: &[LoopHandle],
    factory: &F,
    config: &EngineConfig,
    pool: &Arc<BufferPool>,
    registry: &Arc<ConnectionRegistry>,
    shutdown: &CancellationToken,
) where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Service,
{
    let mut next = 0usize;
    let mut delay = Duration::from_millis(10);
    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                delay = Duration::from_millis(10);
                dispatch(stream, peer, &handles[next], factory, config, pool, registry);
                next = (next + 1) % handles.len();
            }
            Err(err) => {
                warn!("accept failed: error={err}");
                metrics::inc_errors();
                sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(1));
            }
        }
    }
}

/// Hand one accepted socket to its owning loop.
///
/// The socket leaves the acceptor's reactor here and is re-armed on the
/// loop thread, which then owns it for the connection's whole life.
fn dispatch<F, S>(
    stream: TcpStream,
    peer: SocketAddr,
    handle: &LoopHandle,
    factory: &F,
    config: &EngineConfig,
    pool: &Arc<BufferPool>,
    registry: &Arc<ConnectionRegistry>,
) where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Service,
{
    let std_stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(err) => {
            warn!("socket detach failed: peer={peer}, error={err}");
            metrics::inc_errors();
            return;
        }
    };
    let factory = factory.clone();
    let config = config.clone();
    let pool = Arc::clone(pool);
    let registry = Arc::clone(registry);
    let loop_handle = handle.clone();
    let posted = handle.post(move || {
        let stream = match TcpStream::from_std(std_stream) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("socket re-arm failed: error={err}");
                metrics::inc_errors();
                return;
            }
        };
        Connection::spawn(
            stream,
            factory(),
            &config,
            &pool,
            &registry,
            loop_handle.shutdown_token(),
            loop_handle.tracker(),
        );
    });
    if let Err(err) = posted {
        warn!("connection dropped at hand-off: peer={peer}, error={err}");
        metrics::inc_errors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{Request, Response},
        service::{ServiceResponse, service_fn},
    };

    fn trivial() -> impl Service {
        service_fn(|_request: Request| async move { ServiceResponse::new(Response::new(204)) })
    }

    #[test]
    fn worker_count_never_drops_to_zero() {
        let server = Server::new(trivial).workers(0);
        assert_eq!(server.workers, 1);
    }

    #[test]
    fn invalid_config_is_rejected_at_bind() {
        let config = EngineConfig::default().read_chunk(0);
        let err = Server::new(trivial)
            .config(config)
            .bind("127.0.0.1:0".parse().unwrap())
            .err()
            .expect("zero read chunk must fail validation");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn bound_server_resolves_port_zero() {
        let bound = Server::new(trivial)
            .workers(1)
            .bind("127.0.0.1:0".parse().unwrap())
            .unwrap();
        assert_ne!(bound.local_addr().port(), 0);
        let handle = bound.handle();
        assert_eq!(handle.active_connections(), 0);
        // Loops are up before run; stop them without serving.
        for event_loop in &bound.loops {
            event_loop.shutdown();
        }
        for event_loop in bound.loops {
            event_loop.join();
        }
    }
}
