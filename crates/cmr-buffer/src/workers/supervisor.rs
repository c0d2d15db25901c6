//! Starts and stops the worker threads of one buffer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmr_common::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use hashbrown::HashSet;
use tracing::{info, warn};

use super::{
    BufferAnalyzer, BufferEvictor, BufferIndexer, CancellationToken, Worker, WorkerConfig,
};
use crate::buffer::IngestBuffer;

/// How often shutdown re-wakes workers that may have missed the first wake-up.
const REWAKE_INTERVAL: Duration = Duration::from_millis(50);

/// Sends the worker's name when its thread ends, panicking or not.
struct ExitNotice {
    tx: Sender<String>,
    name: String,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.name));
    }
}

/// Owns the analyzer, indexer and evictor threads of a buffer.
///
/// Dropping the supervisor cancels the workers without waiting for them.
pub struct WorkerSupervisor<T: Send + Sync + 'static> {
    buffer: Arc<IngestBuffer<T>>,
    token: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
    exits: Receiver<String>,
}

impl<T: Send + Sync + 'static> WorkerSupervisor<T> {
    /// Starts the workers described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or a thread cannot be spawned;
    /// workers started before the failure are cancelled.
    pub fn spawn(buffer: &Arc<IngestBuffer<T>>, config: &WorkerConfig) -> Result<Self> {
        config.validate()?;

        let (exit_tx, exits) = channel::unbounded();
        let mut supervisor = Self {
            buffer: Arc::clone(buffer),
            token: CancellationToken::new(),
            workers: Vec::new(),
            exits,
        };

        for id in 0..config.analyzers {
            let analyzer = BufferAnalyzer::new(id, Arc::clone(buffer), config.poll_interval);
            supervisor.start(analyzer, &exit_tx)?;
        }
        for id in 0..config.indexers {
            supervisor.start(BufferIndexer::new(id, Arc::clone(buffer)), &exit_tx)?;
        }
        if config.evictor {
            let evictor = BufferEvictor::new(Arc::clone(buffer), config.poll_interval);
            supervisor.start(evictor, &exit_tx)?;
        }

        info!(
            analyzers = config.analyzers,
            indexers = config.indexers,
            evictor = config.evictor,
            "buffer workers started"
        );
        Ok(supervisor)
    }

    fn start<W: Worker>(&mut self, mut worker: W, exit_tx: &Sender<String>) -> Result<()> {
        let name = worker.name();
        let token = self.token.clone();
        let notice = ExitNotice {
            tx: exit_tx.clone(),
            name: name.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _notice = notice;
                worker.run(&token);
            })
            .map_err(|e| Error::Worker(format!("failed to start {name}: {e}")))?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// The token shared by all workers.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Names of the workers not yet joined.
    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Cancels every worker and waits up to `timeout` for them to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] with the number of workers still running
    /// when the timeout elapsed. Those threads are detached.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.token.cancel();
        self.buffer.wake_workers();

        let deadline = Instant::now().checked_add(timeout);
        let mut exited = HashSet::new();
        while exited.len() < self.workers.len() {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => REWAKE_INTERVAL,
            };
            if remaining.is_zero() {
                break;
            }
            match self.exits.recv_timeout(remaining.min(REWAKE_INTERVAL)) {
                Ok(name) => {
                    exited.insert(name);
                }
                Err(RecvTimeoutError::Timeout) => self.buffer.wake_workers(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut stragglers = 0;
        for (name, handle) in self.workers.drain(..) {
            if exited.contains(&name) {
                if handle.join().is_err() {
                    warn!(worker = %name, "worker panicked");
                }
            } else {
                warn!(worker = %name, "worker did not stop in time");
                stragglers += 1;
            }
        }

        if stragglers > 0 {
            return Err(Error::Shutdown { stragglers });
        }
        info!("buffer workers stopped");
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Drop for WorkerSupervisor<T> {
    fn drop(&mut self) {
        self.token.cancel();
        self.buffer.wake_workers();
    }
}
