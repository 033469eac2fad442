//! Transfer worker pool
//!
//! N independent executors, each draining its own FIFO queue one task at a
//! time. Workers run concurrently with each other; routing (chunk index mod
//! pool size) is the caller's business.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult, TransportError};
use crate::protocol::{method, timeouts, MIN_POOL_SIZE};
use crate::remote::{Canister, ChunkId, ContentChunk};

/// A unit of work for one worker
#[derive(Debug, Clone)]
pub enum WorkerTask {
    UploadChunk { uid: String, chunk: ContentChunk },
    DownloadChunk { uid: String, chunk_id: ChunkId },
}

impl WorkerTask {
    pub fn method(&self) -> &'static str {
        match self {
            WorkerTask::UploadChunk { .. } => method::UPLOAD_CHUNK,
            WorkerTask::DownloadChunk { .. } => method::DOWNLOAD_CHUNK,
        }
    }

    fn validate(&self) -> Result<(), TransportError> {
        match self {
            WorkerTask::UploadChunk { uid, chunk } => {
                if uid.is_empty() {
                    return Err(TransportError::Preprocess("upload-chunk without uid".into()));
                }
                if chunk.chunk.is_empty() {
                    return Err(TransportError::Preprocess(format!(
                        "upload-chunk {} of \"{uid}\" carries no bytes",
                        chunk.chunk_id
                    )));
                }
            }
            WorkerTask::DownloadChunk { uid, .. } => {
                if uid.is_empty() {
                    return Err(TransportError::Preprocess("download-chunk without uid".into()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Uploaded(ChunkId),
    Downloaded(ContentChunk),
}

type Reply = oneshot::Sender<CacheResult<TaskOutput>>;

struct Queued {
    task: WorkerTask,
    reply: Reply,
}

#[derive(Default)]
struct WorkerSlot {
    queue: Mutex<VecDeque<Queued>>,
    wake: Notify,
}

/// Resolves when the submitted task completes, fails or is cancelled
pub struct TaskHandle {
    worker: usize,
    rx: oneshot::Receiver<CacheResult<TaskOutput>>,
}

impl Future for TaskHandle {
    type Output = CacheResult<TaskOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let worker = self.worker;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::WorkerUnavailable(worker).into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct WorkerPool {
    slots: Vec<Arc<WorkerSlot>>,
    handles: Vec<JoinHandle<()>>,
}

/// Host logical core count, never below [`MIN_POOL_SIZE`]
pub fn default_pool_size() -> usize {
    num_cpus::get().max(MIN_POOL_SIZE)
}

impl WorkerPool {
    /// Spawn the workers on the current tokio runtime.
    ///
    /// `size == 0` picks [`default_pool_size`]. `rpc_timeout_ms == 0` disables
    /// the per-task deadline.
    pub fn new(canister: Arc<dyn Canister>, size: usize, rpc_timeout_ms: u64) -> Self {
        let size = if size == 0 { default_pool_size() } else { size };
        let deadline = timeouts::rpc_deadline(rpc_timeout_ms);
        let mut slots = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let slot = Arc::new(WorkerSlot::default());
            let worker_slot = Arc::clone(&slot);
            let worker_canister = Arc::clone(&canister);
            handles.push(tokio::spawn(async move {
                run_worker(index, worker_slot, worker_canister, deadline).await;
            }));
            slots.push(slot);
        }
        debug!(size, ?deadline, "worker pool started");
        Self { slots, handles }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Tasks waiting (not yet started) on `worker`
    pub fn queued(&self, worker: usize) -> usize {
        self.slots.get(worker).map_or(0, |s| s.queue.lock().len())
    }

    /// Enqueue `task` on `worker`. Never blocks; order of calls is the
    /// order of execution on that worker.
    pub fn submit(&self, worker: usize, task: WorkerTask) -> TaskHandle {
        let (reply, rx) = oneshot::channel();
        let handle = TaskHandle { worker, rx };
        let Some(slot) = self.slots.get(worker) else {
            let _ = reply.send(Err(TransportError::WorkerUnavailable(worker).into()));
            return handle;
        };
        if let Err(e) = task.validate() {
            let _ = reply.send(Err(e.into()));
            return handle;
        }
        trace!(worker, method = task.method(), "task queued");
        slot.queue.lock().push_back(Queued { task, reply });
        slot.wake.notify_one();
        handle
    }

    /// Drop every not-yet-started task on `worker`; their handles resolve
    /// to `cancelled`. A running task is left alone.
    pub fn cancel_all(&self, worker: usize) -> usize {
        let Some(slot) = self.slots.get(worker) else {
            return 0;
        };
        let drained: Vec<Queued> = slot.queue.lock().drain(..).collect();
        let n = drained.len();
        for q in drained {
            let _ = q.reply.send(Err(TransportError::Cancelled.into()));
        }
        if n > 0 {
            debug!(worker, cancelled = n, "{}", method::CANCEL_ALL);
        }
        n
    }

    pub fn cancel_everything(&self) -> usize {
        (0..self.size()).map(|w| self.cancel_all(w)).sum()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

async fn run_worker(
    index: usize,
    slot: Arc<WorkerSlot>,
    canister: Arc<dyn Canister>,
    deadline: Option<Duration>,
) {
    loop {
        let next = slot.queue.lock().pop_front();
        match next {
            Some(Queued { task, reply }) => {
                let method = task.method();
                let res = execute(canister.as_ref(), task, deadline).await;
                if let Err(e) = &res {
                    debug!(worker = index, method, error = %e, "task failed");
                }
                // Receiver may be gone if the caller stopped waiting
                let _ = reply.send(res);
            }
            None => slot.wake.notified().await,
        }
    }
}

async fn execute(
    canister: &dyn Canister,
    task: WorkerTask,
    deadline: Option<Duration>,
) -> CacheResult<TaskOutput> {
    let method = task.method();
    let call = async move {
        match task {
            WorkerTask::UploadChunk { uid, chunk } => {
                let id = chunk.chunk_id;
                canister.add_chunk(&uid, chunk).await?;
                Ok::<_, CacheError>(TaskOutput::Uploaded(id))
            }
            WorkerTask::DownloadChunk { uid, chunk_id } => {
                let chunk = canister.fetch_chunk(&uid, chunk_id).await?;
                Ok(TaskOutput::Downloaded(chunk))
            }
        }
    };
    match deadline {
        None => call.await,
        Some(d) => match tokio::time::timeout(d, call).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout {
                method,
                ms: d.as_millis() as u64,
            }
            .into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;
    use crate::memory_canister::{MemoryCanister, RemoteCall};
    use crate::remote::ContentInfo;

    fn upload(uid: &str, id: ChunkId) -> WorkerTask {
        WorkerTask::UploadChunk {
            uid: uid.into(),
            chunk: ContentChunk {
                chunk_id: id,
                chunk: vec![id as u8 + 1],
            },
        }
    }

    async fn initiated(canister: &MemoryCanister, uid: &str, chunks: u64) {
        let info = ContentInfo {
            uid: uid.into(),
            name: uid.into(),
            size: chunks,
            total_chunks: chunks,
            dtype: "x/y".into(),
        };
        canister.initiate_upload(&info, true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_worker_runs_fifo_and_survives_failures() {
        let canister = Arc::new(MemoryCanister::with_latency(Duration::from_millis(5)));
        initiated(&canister, "a", 3).await;
        canister.fail_chunk("a", 1);
        canister.clear_calls();

        let pool = WorkerPool::new(canister.clone(), 1, 0);
        let handles: Vec<_> = (0..3).map(|i| pool.submit(0, upload("a", i))).collect();
        let results = futures::future::join_all(handles).await;

        assert_eq!(results[0], Ok(TaskOutput::Uploaded(0)));
        assert!(results[1].as_ref().unwrap_err().is_remote());
        assert_eq!(results[2], Ok(TaskOutput::Uploaded(2)));

        let order: Vec<ChunkId> = canister
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::AddChunk { chunk_id, .. } => Some(chunk_id),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_rejects_only_queued_tasks() {
        let canister = Arc::new(MemoryCanister::with_latency(Duration::from_millis(150)));
        canister.seed_asset("a", "a", &Payload::from("abcdef"), 2);
        let pool = WorkerPool::new(canister.clone(), 1, 0);

        let first = pool.submit(0, WorkerTask::DownloadChunk { uid: "a".into(), chunk_id: 0 });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = pool.submit(0, WorkerTask::DownloadChunk { uid: "a".into(), chunk_id: 1 });
        let third = pool.submit(0, WorkerTask::DownloadChunk { uid: "a".into(), chunk_id: 2 });
        assert_eq!(pool.queued(0), 2);

        assert_eq!(pool.cancel_all(0), 2);
        assert!(matches!(first.await, Ok(TaskOutput::Downloaded(_))));
        for h in [second, third] {
            let err = h.await.unwrap_err();
            assert_eq!(err, CacheError::Transport(TransportError::Cancelled));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_rejects_with_timeout() {
        let canister = Arc::new(MemoryCanister::with_latency(Duration::from_millis(300)));
        let pool = WorkerPool::new(canister, 2, 20);
        let err = pool
            .submit(1, WorkerTask::DownloadChunk { uid: "a".into(), chunk_id: 0 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn malformed_tasks_never_reach_the_remote() {
        let canister = Arc::new(MemoryCanister::new());
        let pool = WorkerPool::new(canister.clone(), 2, 0);

        let err = pool.submit(0, upload("", 0)).await.unwrap_err();
        assert_eq!(err.kind(), "preprocess");
        let err = pool.submit(9, upload("a", 0)).await.unwrap_err();
        assert_eq!(err.kind(), "workerUnavailable");
        assert!(canister.calls().is_empty());
    }

    #[test]
    fn default_size_has_a_floor() {
        assert!(default_pool_size() >= MIN_POOL_SIZE);
    }
}
