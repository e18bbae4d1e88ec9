//! Scoped mirror server lifecycle
//!
//! The first [`CachedMirror::enter`] binds the port and starts the server on
//! a dedicated thread with its own runtime; later entries share it. The
//! server stops when the last [`MirrorGuard`] is dropped, after in-flight
//! downloads have finished writing to the cache or the mirror's shutdown
//! grace period has passed, whichever comes first.

use crate::error::{PkgmillError, PkgmillResult};
use crate::mirror::handler;
use crate::mirror::prune;
use crate::mirror::{MirrorConfig, MirrorContext};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct ServerSlot {
    listeners: usize,
    running: Option<RunningServer>,
}

/// A caching mirror of one distribution's package repository.
///
/// Cloning is cheap and clones share the same server.
#[derive(Clone)]
pub struct CachedMirror {
    ctx: Arc<MirrorContext>,
    slot: Arc<Mutex<ServerSlot>>,
}

/// Keeps a mirror's server running while held
#[must_use = "the mirror stops when the guard is dropped"]
pub struct MirrorGuard {
    mirror: CachedMirror,
}

impl MirrorGuard {
    /// Port the server is bound to
    pub fn port(&self) -> u16 {
        self.mirror.port()
    }

    /// Drop the guard from async code without stalling the executor while the
    /// server drains
    pub async fn release(self) {
        if let Err(e) = tokio::task::spawn_blocking(move || drop(self)).await {
            warn!("Stopping mirror failed: {}", e);
        }
    }
}

impl std::fmt::Debug for MirrorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorGuard").finish_non_exhaustive()
    }
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        self.mirror.exit();
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<MirrorContext>) {
    let service = service_fn(move |request| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(handler::handle(ctx, request).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection from {} ended: {}", peer, e);
    }
}

async fn accept_loop(listener: std::net::TcpListener, ctx: Arc<MirrorContext>, mut stop: oneshot::Receiver<()>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Mirror {} cannot listen: {}", ctx.config.name, e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, ctx.clone()));
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}

impl CachedMirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            ctx: Arc::new(MirrorContext::new(config)),
            slot: Arc::new(Mutex::new(ServerSlot::default())),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.ctx.config
    }

    pub fn name(&self) -> &str {
        &self.ctx.config.name
    }

    pub fn base_url(&self) -> &str {
        &self.ctx.config.base_url
    }

    /// Shell command pointing a container's package manager at this mirror
    pub fn install(&self) -> &str {
        &self.ctx.config.install
    }

    fn lock(&self) -> MutexGuard<'_, ServerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bound port while running, configured port otherwise
    pub fn port(&self) -> u16 {
        self.lock()
            .running
            .as_ref()
            .map_or(self.ctx.config.port, |server| server.port)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running.is_some()
    }

    /// Number of live guards
    pub fn listeners(&self) -> usize {
        self.lock().listeners
    }

    /// Start the server unless it is already running
    pub fn enter(&self) -> PkgmillResult<MirrorGuard> {
        let mut slot = self.lock();
        if slot.running.is_none() {
            slot.running = Some(self.start()?);
        }
        slot.listeners += 1;
        Ok(MirrorGuard {
            mirror: self.clone(),
        })
    }

    fn exit(&self) {
        // The lock is held until the thread is joined so a concurrent enter
        // waits for the port to be released.
        let mut slot = self.lock();
        slot.listeners = slot.listeners.saturating_sub(1);
        if slot.listeners > 0 {
            return;
        }
        if let Some(server) = slot.running.take() {
            let _ = server.shutdown.send(());
            if server.thread.join().is_err() {
                warn!("Mirror {} server thread panicked", self.name());
            }
            info!("Mirror {} stopped", self.name());
        }
    }

    fn start(&self) -> PkgmillResult<RunningServer> {
        let config = &self.ctx.config;
        std::fs::create_dir_all(&config.base_dir)
            .map_err(|e| PkgmillError::io(format!("creating {}", config.base_dir.display()), e))?;

        if let Some(pattern) = &config.package_version_pattern {
            match prune::prune(&config.base_dir, pattern) {
                Ok(0) => {}
                Ok(n) => info!("Pruned {} superseded files from the {} cache", n, config.name),
                Err(e) => warn!("Pruning the {} cache failed: {}", config.name, e),
            }
        }

        let listener = std::net::TcpListener::bind(("0.0.0.0", config.port)).map_err(|e| {
            PkgmillError::MirrorBind {
                port: config.port,
                source: e,
            }
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PkgmillError::io("configuring mirror socket", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| PkgmillError::io("reading mirror address", e))?
            .port();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name(format!("mirror-{}", config.name))
            .enable_all()
            .build()
            .map_err(|e| PkgmillError::io("starting mirror runtime", e))?;

        let (shutdown, stop) = oneshot::channel();
        let ctx = self.ctx.clone();
        let grace = config.timeouts.shutdown;
        let thread = std::thread::Builder::new()
            .name(format!("mirror-{}", config.name))
            .spawn(move || {
                runtime.block_on(accept_loop(listener, ctx, stop));
                runtime.shutdown_timeout(grace);
            })
            .map_err(|e| PkgmillError::io("spawning mirror thread", e))?;

        info!("Mirror {} listening on port {} => {}", config.name, port, config.base_url);
        Ok(RunningServer {
            port,
            shutdown,
            thread,
        })
    }

    /// Wrap `f` so every call runs with this mirror active
    pub fn decorate<F, T>(&self, f: F) -> impl Fn() -> PkgmillResult<T>
    where
        F: Fn() -> T,
    {
        let mirror = self.clone();
        move || {
            let _guard = mirror.enter()?;
            Ok(f())
        }
    }

    /// Await `future` with this mirror active
    pub async fn scoped<F: Future>(&self, future: F) -> PkgmillResult<F::Output> {
        let guard = self.enter()?;
        let output = future.await;
        guard.release().await;
        Ok(output)
    }

    /// Serve in the foreground until Ctrl+C, logging every request
    pub async fn serve(&self) -> PkgmillResult<()> {
        let guard = self.enter()?;
        let host = if cfg!(windows) { "localhost" } else { "0.0.0.0" };
        println!("http://{}:{} => {}", host, guard.port(), self.base_url());
        println!("Install via:\n{}", self.install());

        self.ctx.set_verbose(true);
        let interrupted = tokio::signal::ctrl_c().await;
        self.ctx.set_verbose(false);

        guard.release().await;
        interrupted.map_err(|e| PkgmillError::io("waiting for Ctrl+C", e))
    }
}

impl std::fmt::Debug for CachedMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedMirror")
            .field("name", &self.name())
            .field("base_url", &self.base_url())
            .field("port", &self.port())
            .finish()
    }
}
