use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::CommitRequest;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Transport for committed effects. The binder and the API surface are
/// external collaborators; implementations must be idempotent because the
/// workers retry transient failures.
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn submit(&self, request: &CommitRequest) -> anyhow::Result<()>;
}

/// Bounded pool of status-recording workers draining commit requests.
pub struct CommitWorkerPool {
    tx: mpsc::UnboundedSender<CommitRequest>,
    handles: Vec<JoinHandle<()>>,
}

impl CommitWorkerPool {
    pub fn start(sink: Arc<dyn CommitSink>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<CommitRequest>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = rx.clone();
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    let Some(request) = request else {
                        debug!("status worker {worker} shutting down");
                        return;
                    };
                    submit_with_backoff(sink.as_ref(), &request).await;
                }
            }));
        }
        Self { tx, handles }
    }

    /// Enqueues one committed effect; returns false when the pool has shut
    /// down and the request will be reconciled by the next cycle instead.
    pub fn enqueue(&self, request: CommitRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn submit_with_backoff(sink: &dyn CommitSink, request: &CommitRequest) {
    let mut delay = BACKOFF_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match sink.submit(request).await {
            Ok(()) => {
                debug!("committed {} request", request.kind());
                return;
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    "{} request failed (attempt {attempt}/{MAX_ATTEMPTS}): {e:#}",
                    request.kind()
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                // The next cycle observes the unchanged cluster and redoes
                // the decision from a fresh snapshot.
                error!("{} request permanently failed: {e:#}", request.kind());
            }
        }
    }
}

/// Sink that logs every request; the daemon default when no transport is
/// wired in.
pub struct LoggingSink;

#[async_trait]
impl CommitSink for LoggingSink {
    async fn submit(&self, request: &CommitRequest) -> anyhow::Result<()> {
        if let Some(bind_request) = request.as_bind_request() {
            log::info!("create BindRequest: {}", serde_json::to_string(&bind_request)?);
        } else {
            log::info!("commit: {}", serde_json::to_string(request)?);
        }
        Ok(())
    }
}

/// Records requests in memory; used by tests and by the daemon's dev mode
/// to feed decisions back into the cache.
#[derive(Default)]
pub struct RecordingSink {
    requests: Mutex<Vec<CommitRequest>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<CommitRequest> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }
}

#[async_trait]
impl CommitSink for RecordingSink {
    async fn submit(&self, request: &CommitRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        failures: AtomicU32,
        inner: RecordingSink,
    }

    #[async_trait]
    impl CommitSink for FlakySink {
        async fn submit(&self, request: &CommitRequest) -> anyhow::Result<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 { Some(f - 1) } else { None }
            }).is_ok()
            {
                anyhow::bail!("transient");
            }
            self.inner.submit(request).await
        }
    }

    fn bind(pod: &str) -> CommitRequest {
        CommitRequest::Bind {
            pod: pod.to_string(),
            node: "node-1".to_string(),
            gpu_groups: vec![],
            wait_for_release: false,
        }
    }

    #[tokio::test]
    async fn test_workers_drain_requests() {
        let sink = Arc::new(RecordingSink::new());
        let pool = CommitWorkerPool::start(sink.clone(), 3);
        for i in 0..10 {
            assert!(pool.enqueue(bind(&format!("pod-{i}"))));
        }
        pool.shutdown().await;
        assert_eq!(sink.take().len(), 10);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(FlakySink {
            failures: AtomicU32::new(2),
            inner: RecordingSink::new(),
        });
        let pool = CommitWorkerPool::start(sink.clone(), 1);
        assert!(pool.enqueue(bind("pod-0")));
        pool.shutdown().await;
        assert_eq!(sink.inner.take().len(), 1);
    }
}
