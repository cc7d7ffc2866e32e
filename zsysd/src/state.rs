use libzsys::config::DaemonConfig;
use libzsys::graph::DatasetGraph;
use libzsys::pooladapter::PoolAdapter;
use slog::Logger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Everything the RPC handlers share. The graph is read-mostly behind an
/// `RwLock`; any call that reaches the pool adapter also takes
/// `mutation_lock` for its duration, serializing every pool-mutating
/// operation process-wide.
pub struct AppState {
    pub graph: RwLock<DatasetGraph>,
    pub pool: Arc<dyn PoolAdapter>,
    pub mutation_lock: Mutex<()>,
    pub config: DaemonConfig,
    pub log: Logger,
    open_streams: AtomicUsize,
}

impl AppState {
    pub fn new(pool: Arc<dyn PoolAdapter>, config: DaemonConfig, log: Logger) -> anyhow::Result<Self> {
        let mut graph = DatasetGraph::new();
        graph.refresh(pool.as_ref())?;
        Ok(Self {
            graph: RwLock::new(graph),
            pool,
            mutation_lock: Mutex::new(()),
            config,
            log,
            open_streams: AtomicUsize::new(0),
        })
    }

    /// The daemon's own idle-exit timer is paused whenever any stream is
    /// open; callers bracket a connection's lifetime with these two calls.
    pub fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stream_closed(&self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn has_open_streams(&self) -> bool {
        self.open_streams.load(Ordering::SeqCst) > 0
    }
}
