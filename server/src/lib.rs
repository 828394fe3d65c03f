//! The PACS server: TCP listener, session registry
//! and the wiring of associations into the six-stage pipeline.
//!
//! Every accepted connection gets a [`Session`](session::Session)
//! holding its association state machine and reassembly state.
//! A per-connection reader thread frames the TCP byte stream
//! and feeds the pipeline; everything after that
//! (PDU decode, DIMSE dispatch, storage work, response encoding
//! and the socket writes) runs on the stage pools.
//!
//! The coordinator holds sessions by id only,
//! and sessions hold a cloneable coordinator handle,
//! so there is no strong reference cycle between the two.

pub mod config;
pub mod session;

pub use config::ServerConfig;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{info, warn};

use pacs_index::IndexDatabase;
use pacs_pipeline::PipelineCoordinator;
use pacs_services::{
    FileBlobStore, MoveScp, MppsScp, QueryScp, ServiceRegistry, StorageScp, VerificationScp,
    WorklistScp,
};

use session::SessionRegistry;

/// An error starting or running the server.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not open the storage index"))]
    OpenIndex {
        #[snafu(source(from(pacs_index::Error, Box::new)))]
        source: Box<pacs_index::Error>,
    },

    #[snafu(display("could not create the blob root at `{}`", path))]
    CreateBlobRoot {
        path: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not bind to {}:{}", host, port))]
    Bind {
        host: String,
        port: u16,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not accept a connection"))]
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The assembled server: index, blob store, service registry,
/// pipeline and listener.
pub struct PacsServer {
    config: ServerConfig,
    listener: TcpListener,
    pipeline: PipelineCoordinator,
    sessions: Arc<SessionRegistry>,
    registry: Arc<ServiceRegistry>,
    index: Arc<IndexDatabase>,
    shutdown: Arc<AtomicBool>,
}

impl PacsServer {
    /// Open the index and blob store, build the service registry
    /// and bind the listening socket.
    pub fn bind(config: ServerConfig) -> Result<PacsServer> {
        let index = Arc::new(IndexDatabase::open(&config.db_path).context(OpenIndexSnafu)?);

        std::fs::create_dir_all(&config.storage_dir).context(CreateBlobRootSnafu {
            path: config.storage_dir.display().to_string(),
        })?;
        let blobs: Arc<FileBlobStore> = Arc::new(FileBlobStore::new(&config.storage_dir));

        let pipeline = PipelineCoordinator::start_with_config(config.pipeline.clone());
        let cancels = Arc::clone(pipeline.cancels());

        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(VerificationScp));
        registry.register(Arc::new(StorageScp::new(
            Arc::clone(&index),
            blobs.clone(),
        )));
        registry.register(Arc::new(QueryScp::new(
            Arc::clone(&index),
            Arc::clone(&cancels),
        )));
        registry.register(Arc::new(MoveScp::new(
            Arc::clone(&index),
            blobs.clone(),
            Arc::clone(&cancels),
            config.ae_title.clone(),
            config.remote_nodes.iter().cloned(),
        )));
        registry.register(Arc::new(WorklistScp::new(
            Arc::clone(&index),
            Arc::clone(&cancels),
        )));
        registry.register(Arc::new(MppsScp::new(Arc::clone(&index))));

        let listener = TcpListener::bind((config.host.as_str(), config.port)).context(
            BindSnafu {
                host: config.host.clone(),
                port: config.port,
            },
        )?;

        info!(
            "`{}` listening on {} (db `{}`, blobs `{}`)",
            config.ae_title,
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            config.db_path,
            config.storage_dir.display()
        );

        Ok(PacsServer {
            sessions: Arc::new(SessionRegistry::new(cancels)),
            registry: Arc::new(registry),
            config,
            listener,
            pipeline,
            index,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound socket address, useful with an ephemeral port.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Access the storage index, e.g. for maintenance tooling.
    pub fn index(&self) -> &Arc<IndexDatabase> {
        &self.index
    }

    /// Access the pipeline, e.g. for metrics.
    pub fn pipeline(&self) -> &PipelineCoordinator {
        &self.pipeline
    }

    /// Accept connections until [`shutdown`](ServerHandle::shutdown).
    pub fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().context(AcceptSnafu)?;
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(error) = self.handle_connection(stream) {
                warn!("connection from {} not admitted: {}", peer, error);
            }
        }

        let dropped = self.pipeline.stop();
        self.sessions.close_all();
        info!("server stopped ({} queued jobs dropped)", dropped);
        Ok(())
    }

    /// Run the server on a background thread,
    /// returning a handle for orderly shutdown.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr().context(AcceptSnafu)?;
        let shutdown = Arc::clone(&self.shutdown);
        let thread = thread::Builder::new()
            .name("pacs-accept".to_string())
            .spawn(move || {
                if let Err(error) = self.run() {
                    warn!("server terminated: {}", error);
                }
            })
            .expect("failed to spawn the accept thread");

        Ok(ServerHandle {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }

    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        if let Some(timeout) = self.config.idle_timeout {
            let _ = stream.set_read_timeout(Some(timeout));
        }

        let machine = self.config.scp_options(&self.registry).build();
        let session = self
            .sessions
            .open(stream, machine, self.config.max_pdu_length, self.config.strict)
            .context(AcceptSnafu)?;

        let pipeline = self.pipeline.clone();
        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let name = format!("pacs-reader-{}", session.id());
        thread::Builder::new()
            .name(name)
            .spawn(move || session::reader_loop(session, pipeline, registry, sessions))
            .expect("failed to spawn the session reader thread");
        Ok(())
    }
}

/// A running server on a background thread.
pub struct ServerHandle {
    addr: std::net::SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// The address the server listens on.
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Stop accepting connections and join the accept thread.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        // unblock the accept call
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
