// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-order executor for eager nodes.
//!
//! [`EagerExecutor::add`] prepares a node on the caller's thread so its output
//! handles carry inferred shapes before `add` returns. Prepared nodes are
//! queued and a single dispatch task calls [`EagerNode::run_async`] on them in
//! the order they were added. Completion is reported through the node's
//! `done` callback, which may fire on any runtime worker.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::config::ExecutorConfig;
use crate::error::{EagerError, Status};

/// Completion callback handed to [`EagerNode::run_async`]. Invoked exactly once.
pub type StatusCallback = Box<dyn FnOnce(Status) + Send + 'static>;

/// An element of the executor queue.
pub trait EagerNode: Send + 'static {
    /// Synchronous setup done before the node is queued.
    fn prepare(&mut self) -> Status;

    /// Starts the node and returns without waiting for it to finish.
    fn run_async(self: Box<Self>, done: StatusCallback);

    /// Drops a node that will never run, failing its outputs with `status`.
    fn abort(self: Box<Self>, status: EagerError);
}

struct ExecutorState {
    status: Mutex<Option<EagerError>>,
    pending: watch::Sender<usize>,
    max_pending: usize,
}

impl ExecutorState {
    fn status(&self) -> Status {
        match &*self.status.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn try_reserve(&self) -> bool {
        let max = self.max_pending;
        self.pending.send_if_modified(|n| {
            if *n < max {
                *n += 1;
                true
            } else {
                false
            }
        })
    }

    fn release(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn complete(&self, status: Status) {
        if let Err(err) = status {
            let mut slot = self.status.lock();
            if slot.is_none() {
                warn!(target: "dynamo_eager::executor", error = %err, "Executor entering error state");
                *slot = Some(err);
            } else {
                debug!(target: "dynamo_eager::executor", error = %err, "Additional node failure");
            }
        }
        self.release();
    }
}

pub struct EagerExecutor {
    tx: flume::Sender<Box<dyn EagerNode>>,
    state: Arc<ExecutorState>,
    closed: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EagerExecutor {
    /// Starts the dispatch task on `runtime`.
    pub fn new(config: &ExecutorConfig, runtime: &tokio::runtime::Handle) -> Self {
        let (tx, rx) = flume::unbounded();
        let (pending, _) = watch::channel(0usize);
        let state = Arc::new(ExecutorState {
            status: Mutex::new(None),
            pending,
            max_pending: config.max_pending_nodes,
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn_on(dispatch_loop(rx, state.clone(), cancel.clone()), runtime);
        tracker.close();

        Self {
            tx,
            state,
            closed: AtomicBool::new(false),
            cancel,
            tracker,
        }
    }

    /// Prepares `node` and queues it for dispatch.
    ///
    /// Fails without queueing when the executor is shut down or in an error
    /// state, when too many nodes are pending, or when `prepare` fails. A
    /// rejected node is aborted with the returned error.
    pub fn add(&self, mut node: Box<dyn EagerNode>) -> Status {
        if self.closed.load(Ordering::Acquire) {
            let err = EagerError::failed_precondition("Executor is shut down");
            node.abort(err.clone());
            return Err(err);
        }
        if let Err(err) = self.state.status() {
            node.abort(err.clone());
            return Err(err);
        }
        if !self.state.try_reserve() {
            let err = EagerError::unavailable(format!(
                "Executor has {} pending nodes",
                self.state.max_pending
            ));
            node.abort(err.clone());
            return Err(err);
        }

        if let Err(err) = node.prepare() {
            self.state.release();
            node.abort(err.clone());
            return Err(err);
        }

        if let Err(flume::SendError(node)) = self.tx.send(node) {
            self.state.release();
            let err = EagerError::cancelled("Executor dispatch task has exited");
            node.abort(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// First error reported by a completed node, if any.
    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn num_pending(&self) -> usize {
        *self.state.pending.borrow()
    }

    /// Resolves once every added node has completed or been aborted.
    pub async fn wait_for_all_pending_nodes(&self) -> Status {
        let mut rx = self.state.pending.subscribe();
        // the sender lives in `state`, which we hold
        let _ = rx.wait_for(|n| *n == 0).await;
        self.state.status()
    }

    /// Rejects further nodes, drains the ones already added, then stops the
    /// dispatch task.
    pub async fn shutdown(&self) -> Status {
        self.closed.store(true, Ordering::Release);
        let status = self.wait_for_all_pending_nodes().await;
        self.cancel.cancel();
        self.tracker.wait().await;
        status
    }
}

impl Drop for EagerExecutor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(
    rx: flume::Receiver<Box<dyn EagerNode>>,
    state: Arc<ExecutorState>,
    cancel: CancellationToken,
) {
    loop {
        let node = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            node = rx.recv_async() => match node {
                Ok(node) => node,
                Err(_) => break,
            },
        };

        if let Err(err) = state.status() {
            node.abort(err);
            state.release();
            continue;
        }

        let done_state = state.clone();
        trace!(target: "dynamo_eager::executor", "Dispatching node");
        node.run_async(Box::new(move |status| done_state.complete(status)));
    }

    for node in rx.drain() {
        node.abort(EagerError::cancelled("Executor shut down before the node ran"));
        state.release();
    }
    debug!(target: "dynamo_eager::executor", "Executor dispatch task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    struct FakeNode {
        name: &'static str,
        prepare: Status,
        result: Status,
        journal: Arc<Journal>,
    }

    impl FakeNode {
        fn ok(name: &'static str, journal: &Arc<Journal>) -> Box<Self> {
            Box::new(Self {
                name,
                prepare: Ok(()),
                result: Ok(()),
                journal: journal.clone(),
            })
        }
    }

    impl EagerNode for FakeNode {
        fn prepare(&mut self) -> Status {
            self.journal.push(format!("prepare {}", self.name));
            self.prepare.clone()
        }

        fn run_async(self: Box<Self>, done: StatusCallback) {
            self.journal.push(format!("run {}", self.name));
            let result = self.result.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done(result);
            });
        }

        fn abort(self: Box<Self>, status: EagerError) {
            self.journal
                .push(format!("abort {} {}", self.name, status.code().as_str()));
        }
    }

    fn executor(max_pending_nodes: usize) -> EagerExecutor {
        EagerExecutor::new(
            &ExecutorConfig { max_pending_nodes },
            &tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_nodes_run_in_add_order() {
        let journal = Arc::new(Journal::default());
        let executor = executor(16);

        for name in ["a", "b", "c"] {
            executor.add(FakeNode::ok(name, &journal)).unwrap();
        }
        executor.wait_for_all_pending_nodes().await.unwrap();

        let runs: Vec<String> = journal
            .events()
            .into_iter()
            .filter(|e| e.starts_with("run"))
            .collect();
        assert_eq!(runs, vec!["run a", "run b", "run c"]);
        assert_eq!(executor.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_returned_and_aborts() {
        let journal = Arc::new(Journal::default());
        let executor = executor(16);

        let err = executor
            .add(Box::new(FakeNode {
                name: "bad",
                prepare: Err(EagerError::not_found("no such op")),
                result: Ok(()),
                journal: journal.clone(),
            }))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(
            journal.events(),
            vec!["prepare bad".to_string(), "abort bad not_found".to_string()]
        );
        // prepare failures do not poison the executor
        executor.status().unwrap();
        assert_eq!(executor.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_first_failure_becomes_executor_status() {
        let journal = Arc::new(Journal::default());
        let executor = executor(16);

        executor
            .add(Box::new(FakeNode {
                name: "fails",
                prepare: Ok(()),
                result: Err(EagerError::unavailable("worker gone")),
                journal: journal.clone(),
            }))
            .unwrap();
        let status = executor.wait_for_all_pending_nodes().await;
        assert_eq!(status.unwrap_err().code(), ErrorCode::Unavailable);

        let err = executor.add(FakeNode::ok("later", &journal)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(journal
            .events()
            .contains(&"abort later unavailable".to_string()));
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let journal = Arc::new(Journal::default());
        let executor = executor(1);

        executor.add(FakeNode::ok("first", &journal)).unwrap();
        let err = executor.add(FakeNode::ok("second", &journal)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        executor.wait_for_all_pending_nodes().await.unwrap();
        executor.add(FakeNode::ok("third", &journal)).unwrap();
        executor.wait_for_all_pending_nodes().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let journal = Arc::new(Journal::default());
        let executor = executor(16);

        executor.add(FakeNode::ok("a", &journal)).unwrap();
        executor.shutdown().await.unwrap();
        assert!(journal.events().contains(&"run a".to_string()));

        let err = executor.add(FakeNode::ok("b", &journal)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }
}
