//! Structured-concurrency supervision tree.
//!
//! Every [`Worker`] is spawned from an explicit parent handle. The child is
//! registered in the parent's live set before [`Worker::spawn`] returns, and
//! is moved to the parent's finished queue once its body returns, fails or
//! panics. A parent drains that queue with [`Worker::join_children`].
//!
//! Blocking waits go through [`timeout_or_live`]: every expired per-attempt
//! timeout re-checks the hard limit and the parent's liveness before waiting
//! again, so a worker never keeps running under a dead parent.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{error_chain, Error, Result};

/// Default per-attempt wait before a liveness re-check.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Children {
    live: Vec<Arc<Node>>,
    finished: VecDeque<Arc<Node>>,
}

struct Node {
    id: u64,
    name: String,
    parent: Option<Arc<Node>>,
    children: Mutex<Children>,
    child_finished: Notify,
    done: AtomicBool,
}

impl Node {
    fn new(name: String, parent: Option<Arc<Node>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            parent,
            children: Mutex::new(Children::default()),
            child_finished: Notify::new(),
            done: AtomicBool::new(false),
        })
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn counts(&self) -> (usize, usize) {
        let children = self.children.lock();
        (children.live.len(), children.finished.len())
    }

    fn child_lives(&self, child: &Arc<Node>) {
        debug!("picking up {} worker", child.name);
        self.children.lock().live.push(child.clone());
    }

    fn child_dies(&self, child: &Arc<Node>) -> Result<()> {
        debug!("releasing {} worker", child.name);
        let found = {
            let mut children = self.children.lock();
            let pos = children.live.iter().position(|c| c.id == child.id);
            if let Some(pos) = pos {
                children.live.remove(pos);
                children.finished.push_back(child.clone());
            }
            pos.is_some()
        };
        self.child_finished.notify_one();

        if found {
            Ok(())
        } else {
            Err(Error::system(format!(
                "{} is not among the live workers of {}",
                child.name, self.name
            )))
        }
    }

    async fn next_finished(&self) -> Arc<Node> {
        loop {
            let next = self.children.lock().finished.pop_front();
            if let Some(node) = next {
                return node;
            }
            self.child_finished.notified().await;
        }
    }

    /// Mark the node dead and hand it over to its parent's finished queue.
    fn finish(node: &Arc<Node>) -> Result<()> {
        let orphans: Vec<String> = node
            .children
            .lock()
            .live
            .iter()
            .map(|c| c.name.clone())
            .collect();

        node.done.store(true, Ordering::SeqCst);

        let released = match &node.parent {
            Some(parent) => parent.child_dies(node),
            None => Ok(()),
        };

        if !orphans.is_empty() {
            error!(
                "{} worker finished while its children are still live: {}",
                node.name,
                orphans.join(", ")
            );
            return Err(Error::system(format!(
                "{} finished with {} live children",
                node.name,
                orphans.len()
            )));
        }
        released
    }
}

/// Releases a worker node exactly once, even if its body panics.
struct FinishGuard {
    node: Option<Arc<Node>>,
}

impl FinishGuard {
    fn release(&mut self) -> Result<()> {
        match self.node.take() {
            Some(node) => Node::finish(&node),
            None => Ok(()),
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            if let Err(e) = Node::finish(&node) {
                error!("Releasing an abandoned {} worker: {}", node.name, e);
            }
        }
    }
}

/// A handle on one node of the supervision tree.
///
/// Handles are passed into worker bodies and cloned freely; every spawn goes
/// through an explicit parent handle.
#[derive(Clone)]
pub struct Worker {
    node: Arc<Node>,
    timeout: Duration,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (live, finished) = self.node.counts();
        f.debug_struct("Worker")
            .field("name", &self.node.name)
            .field("live_children", &live)
            .field("finished_children", &finished)
            .field("done", &self.node.is_done())
            .finish()
    }
}

impl Worker {
    /// Create a parentless root of a supervision tree.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            node: Node::new(name.into(), None),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-attempt timeout inherited by children spawned from here.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether this worker's body has completed.
    pub fn is_finished(&self) -> bool {
        self.node.is_done()
    }

    pub fn live_children(&self) -> usize {
        self.node.counts().0
    }

    pub fn finished_children(&self) -> usize {
        self.node.counts().1
    }

    /// Fail with [`Error::Parent`] if any ancestor of this worker has
    /// terminated.
    pub fn live(&self) -> Result<()> {
        let mut ancestor = self.node.parent.as_ref();
        while let Some(node) = ancestor {
            if node.is_done() {
                return Err(Error::Parent {
                    worker: self.node.name.clone(),
                    parent: node.name.clone(),
                });
            }
            ancestor = node.parent.as_ref();
        }
        Ok(())
    }

    /// Spawn a child worker running `body`.
    ///
    /// The child is registered with this worker before the call returns. A
    /// failing body has its full cause chain logged and its error handed to
    /// whoever joins the returned handle.
    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, body: F) -> WorkerHandle<T>
    where
        F: FnOnce(Worker) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let node = Node::new(name.into(), Some(self.node.clone()));
        debug!("about to launch {}", node.name);
        self.node.child_lives(&node);

        let worker = Worker {
            node: node.clone(),
            timeout: self.timeout,
        };
        let mut guard = FinishGuard {
            node: Some(node.clone()),
        };

        let handle = tokio::spawn(async move {
            debug!("{} worker launched", worker.name());
            let result = body(worker.clone()).await;
            match &result {
                Ok(_) => debug!("{} worker done", worker.name()),
                Err(e) => log_failure(worker.name(), e),
            }

            match (result, guard.release()) {
                (Ok(value), Ok(())) => Ok(value),
                (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
                (Err(e), Err(supervision)) => {
                    warn!("...and {} also failed supervision: {}", worker.name(), supervision);
                    Err(e)
                }
            }
        });

        WorkerHandle { node, handle }
    }

    /// Wait until every child has finished and been drained.
    ///
    /// A `limit` bounds the whole join; children still running when it
    /// expires stay tracked by this worker.
    pub async fn join_children(&self, limit: Option<Duration>, timeout: Duration) -> Result<()> {
        let started_at = Instant::now();
        let (live, finished) = self.node.counts();
        debug!("joining workers of {}: {live} live, {finished} dead", self.name());

        loop {
            let (live, finished) = self.node.counts();
            if live == 0 && finished == 0 {
                return Ok(());
            }

            let remaining = limit.map(|l| l.saturating_sub(started_at.elapsed()));
            let node = timeout_or_live(
                self,
                remaining,
                timeout,
                || format!("joining workers of {}: {live} live, {finished} dead", self.name()),
                self.node.next_finished(),
            )
            .await
            .map_err(|e| match (e, limit) {
                (Error::TimeLimit { what, .. }, Some(limit)) => Error::TimeLimit { what, limit },
                (e, _) => e,
            })?;
            debug!("joining the late {} worker", node.name);
        }
    }

    /// Mark this worker dead, then reap its children.
    ///
    /// Children fail their next liveness check with [`Error::Parent`] and are
    /// drained within `limit`.
    pub async fn shutdown(&self, limit: Option<Duration>) -> Result<()> {
        debug!("shutting down {} worker", self.name());
        self.node.done.store(true, Ordering::SeqCst);
        self.join_children(limit, self.timeout).await
    }
}

/// Join handle of a spawned [`Worker`].
pub struct WorkerHandle<T> {
    node: Arc<Node>,
    handle: JoinHandle<Result<T>>,
}

impl<T> fmt::Debug for WorkerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.node.name)
            .field("finished", &self.node.is_done())
            .finish()
    }
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn is_finished(&self) -> bool {
        self.node.is_done()
    }

    /// A handle cancelling the worker's body. A cancelled worker still
    /// leaves the tree as finished.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the worker and return the outcome of its body.
    pub async fn join(self) -> Result<T> {
        let name = self.node.name.clone();
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::Worker {
                name,
                message: "panicked".to_string(),
            }),
            Err(_) => Err(Error::Worker {
                name,
                message: "cancelled".to_string(),
            }),
        }
    }
}

/// Wait for `fut`, re-checking `limit` and the liveness of `worker` every
/// time a per-attempt `timeout` expires.
///
/// The effective per-attempt timeout is `min(timeout, limit)`. Retries are
/// logged only when their count has more than doubled since the last log.
pub async fn timeout_or_live<F, T, L>(
    worker: &Worker,
    limit: Option<Duration>,
    timeout: Duration,
    log: L,
    fut: F,
) -> Result<T>
where
    F: Future<Output = T>,
    L: Fn() -> String,
{
    let started_at = Instant::now();
    let attempt = limit.map_or(timeout, |l| timeout.min(l));
    let mut timeouts = 0u32;
    let mut logged_timeouts = 1u32;

    tokio::pin!(fut);
    loop {
        match tokio::time::timeout(attempt, &mut fut).await {
            Ok(value) => return Ok(value),
            Err(_) => {
                timeouts += 1;
                if let Some(limit) = limit {
                    if started_at.elapsed() >= limit {
                        return Err(Error::time_limit(format!("while {}", log()), limit));
                    }
                }
                if timeouts > 2 * logged_timeouts {
                    info!("A little bit of timeout {} (#{timeouts})", log());
                    logged_timeouts = timeouts;
                }
                worker.live()?;
            }
        }
    }
}

fn log_failure(name: &str, err: &Error) {
    let chain = error_chain(err);
    warn!("{:?} error raised in {} worker: {}", err.kind(), name, chain[0]);
    for cause in chain.iter().skip(1) {
        warn!("...caused by: {}", cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn child_registers_before_spawn_returns() {
        let root = Worker::root("root");
        let (tx, rx) = oneshot::channel::<()>();

        let child = root.spawn("gated", |_| async move {
            let _ = rx.await;
            Ok(7)
        });
        assert_eq!(root.live_children(), 1);
        assert!(!child.is_finished());

        tx.send(()).unwrap();
        assert_eq!(child.join().await.unwrap(), 7);
        assert_eq!(root.live_children(), 0);
        assert_eq!(root.finished_children(), 1);

        root.join_children(None, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(root.finished_children(), 0);
    }

    #[tokio::test]
    async fn failure_propagates_to_joiner() {
        let root = Worker::root("root");
        let child = root.spawn("failing", |_| async move {
            Err::<(), _>(Error::configuration("bad timeline"))
        });
        let err = child.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        root.join_children(None, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn panic_is_released_and_reported() {
        let root = Worker::root("root");
        let explode = true;
        let child = root.spawn("panicking", move |_| async move {
            if explode {
                panic!("boom");
            }
            Ok(())
        });
        let err = child.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Worker);
        assert_eq!(root.live_children(), 0);
        root.join_children(Some(Duration::from_secs(1)), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orphan_fails_liveness_check() {
        let root = Worker::root("root");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let parent = root.spawn("parent", move |worker| async move {
            let child = worker.spawn("child", |child| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                child.live()
            });
            let _ = tx.send(child);
            Ok(())
        });

        let err = parent.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);

        let child = rx.recv().await.unwrap();
        let err = child.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parent);
    }

    #[tokio::test]
    async fn dead_ancestor_fails_grandchild() {
        let root = Worker::root("root");
        let (tx, rx) = oneshot::channel();

        let middle = root.spawn("middle", move |worker| async move {
            let grandchild = worker.spawn("grandchild", |w| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                w.live()
            });
            let _ = tx.send(grandchild);
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        });

        let grandchild = rx.await.unwrap();
        root.shutdown(None).await.ok();
        let err = grandchild.join().await.unwrap_err();
        assert_matches::assert_matches!(err, Error::Parent { ref parent, .. } if parent == "root");
        middle.join().await.unwrap();
    }

    #[tokio::test]
    async fn join_children_respects_limit() {
        let root = Worker::root("root");
        for i in 0..2 {
            let _ = root.spawn(format!("slow {i}"), |worker| async move {
                let started = Instant::now();
                while started.elapsed() < Duration::from_secs(5) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    worker.live()?;
                }
                Ok(())
            });
        }

        let err = root
            .join_children(Some(Duration::from_millis(100)), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeLimit);
        assert_eq!(root.live_children(), 2);

        root.shutdown(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(root.live_children(), 0);
    }

    #[tokio::test]
    async fn timeout_or_live_retries_until_ready() {
        let root = Worker::root("root");
        let value = timeout_or_live(
            &root,
            None,
            Duration::from_millis(5),
            || "sleeping".to_string(),
            async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                3
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 3);
    }
}
