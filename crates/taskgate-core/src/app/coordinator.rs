//! InterruptCoordinator - 中断可能なストリーム実行の調停
//!
//! # フロー
//! 1. シグナルチャネルを購読（以降の STOP を取りこぼさない）
//! 2. CAS で RUNNING を獲得（失敗なら AlreadyRunning）
//! 3. producer / listener / supervisor の 3 タスクを起動
//! 4. supervisor が内部キューから TaskStream へ転送
//! 5. 終了時に listener・producer を片付け、最終状態を CAS で書き込む
//!
//! ```text
//!   producer ──(Data/Done/Cancelled/Error)──► queue ──► supervisor ──► TaskStream
//!      ▲                                                    │
//!      └──── CancellationToken ◄── listener ◄── "chan:<key>" │
//!                                                            ▼
//!                                               StateStore (final state)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::app::stream::TaskStream;
use crate::config::CoordinatorConfig;
use crate::domain::{InterruptSignal, TaskKey, TaskState};
use crate::error::{BackendError, BoxError, InterruptError};
use crate::ports::{SignalChannel, StateStore, Subscription};

/// Tagged messages from the producer task to the supervisor.
enum Tagged<T> {
    Data(T),
    Done,
    Cancelled,
    Error(InterruptError),
}

/// How the producer task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerExit {
    Finished,
    Cancelled,
    Failed,
}

/// Process-local bookkeeping for one in-flight run.
struct LocalTask {
    run_id: Ulid,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Snapshot of a run executing in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub key: TaskKey,
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    channel: Arc<dyn SignalChannel>,
    config: CoordinatorConfig,
    local_tasks: Mutex<HashMap<TaskKey, LocalTask>>,
    idle: Notify,
}

impl Inner {
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, LocalTask>> {
        self.local_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, key: &TaskKey, run_id: Ulid, cancel: CancellationToken) {
        let stale = self.tasks().insert(
            key.clone(),
            LocalTask {
                run_id,
                cancel,
                started_at: Utc::now(),
            },
        );
        if let Some(stale) = stale {
            // the previous run's record expired while it was still going
            warn!(task = %key, stale_run = %stale.run_id, "replacing local entry of an expired run");
        }
    }

    /// Drop the entry for `key` if it still belongs to `run_id`.
    fn unregister(&self, key: &TaskKey, run_id: Ulid) {
        let mut tasks = self.tasks();
        if tasks.get(key).is_some_and(|t| t.run_id == run_id) {
            tasks.remove(key);
        }
        if tasks.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Persist the final state unless the run already recorded `ERROR`.
    ///
    /// Runs as a negated CAS against `ERROR` so the check and the write are
    /// one backend step.
    async fn reconcile(&self, key: &TaskKey, final_state: TaskState) -> Result<TaskState, BackendError> {
        let written = self
            .store
            .set_if_not_equal(
                key.as_str(),
                final_state,
                TaskState::Error,
                self.config.finished_ttl,
            )
            .await?;
        Ok(if written { final_state } else { TaskState::Error })
    }
}

/// Handles of the tasks spawned for one run.
struct Run {
    key: TaskKey,
    run_id: Ulid,
    cancel: CancellationToken,
    producer: JoinHandle<ProducerExit>,
    listener: JoinHandle<ListenExit>,
}

/// Runs cancellable streaming producers, at most one per task key across
/// every process sharing the backend, and routes stop signals to them.
///
/// Cheap to clone; clones share the same store, channel and bookkeeping.
#[derive(Clone)]
pub struct InterruptCoordinator {
    inner: Arc<Inner>,
}

impl InterruptCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        channel: Arc<dyn SignalChannel>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                channel,
                config,
                local_tasks: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Run the stream built by `producer` for `(user_id, session_id)`.
    ///
    /// Fails with [`InterruptError::AlreadyRunning`] if the key is already
    /// running anywhere; nothing is spawned and no state changes in that case.
    pub async fn run_and_stream<F, S, T, E>(
        &self,
        user_id: &str,
        session_id: &str,
        producer: F,
    ) -> Result<TaskStream<T>, InterruptError>
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.run_key(TaskKey::new(user_id, session_id), producer)
            .await
    }

    /// [`run_and_stream`](Self::run_and_stream) for an already-derived key.
    pub async fn run_key<F, S, T, E>(
        &self,
        key: TaskKey,
        producer: F,
    ) -> Result<TaskStream<T>, InterruptError>
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        let channel = key.channel(&inner.config.channel_prefix);

        // Subscribe before taking the slot: a stop published after this call
        // returns must reach the listener.
        let subscription = inner.channel.subscribe(&channel).await?;

        let acquired = inner
            .store
            .set_if_not_equal(
                key.as_str(),
                TaskState::Running,
                TaskState::Running,
                inner.config.running_ttl,
            )
            .await?;
        if !acquired {
            info!(task = %key, "rejected, already running");
            return Err(InterruptError::AlreadyRunning(key));
        }

        let run_id = Ulid::new();
        let cancel = CancellationToken::new();
        inner.register(&key, run_id, cancel.clone());
        info!(task = %key, %run_id, channel = %channel, "task started");

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let producer = tokio::spawn(produce(
            inner.store.clone(),
            key.clone(),
            inner.config.running_ttl,
            producer,
            queue_tx,
            cancel.clone(),
        ));
        let listener = tokio::spawn(listen(subscription, key.clone(), cancel.clone()));

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(
            self.inner.clone(),
            Run {
                key: key.clone(),
                run_id,
                cancel,
                producer,
                listener,
            },
            queue_rx,
            out_tx,
        ));

        Ok(TaskStream::new(key, out_rx))
    }

    /// Ask whichever process runs `(user_id, session_id)` to stop it.
    ///
    /// Does not check that anything is running; with no listener the signal
    /// is simply dropped.
    pub async fn stop(&self, user_id: &str, session_id: &str) -> Result<(), InterruptError> {
        self.stop_key(&TaskKey::new(user_id, session_id)).await
    }

    pub async fn stop_key(&self, key: &TaskKey) -> Result<(), InterruptError> {
        let channel = key.channel(&self.inner.config.channel_prefix);
        info!(task = %key, channel = %channel, "publishing stop signal");
        self.inner
            .channel
            .publish(&channel, InterruptSignal::Stop.as_str())
            .await?;
        Ok(())
    }

    /// Persisted state of `(user_id, session_id)`, as every process sees it.
    pub async fn state(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<TaskState>, InterruptError> {
        let key = TaskKey::new(user_id, session_id);
        Ok(self.inner.store.get_task_state(key.as_str()).await?)
    }

    /// Delete the persisted state of `(user_id, session_id)`.
    ///
    /// This frees a slot held by a crashed worker without waiting for its TTL.
    /// It does not stop a run that is still alive.
    pub async fn reset(&self, user_id: &str, session_id: &str) -> Result<(), InterruptError> {
        let key = TaskKey::new(user_id, session_id);
        info!(task = %key, "deleting task state");
        Ok(self.inner.store.delete_task_state(key.as_str()).await?)
    }

    pub fn is_active_locally(&self, key: &TaskKey) -> bool {
        self.inner.tasks().contains_key(key)
    }

    /// Runs currently executing in this process.
    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut active: Vec<ActiveTask> = self
            .inner
            .tasks()
            .iter()
            .map(|(key, task)| ActiveTask {
                key: key.clone(),
                run_id: task.run_id,
                started_at: task.started_at,
            })
            .collect();
        active.sort_by(|a, b| a.key.cmp(&b.key));
        active
    }

    /// Cancel every local run, wait up to the shutdown grace for their
    /// teardown, then close the store and the channel.
    pub async fn close(&self) -> Result<(), InterruptError> {
        let inner = &self.inner;
        let pending: Vec<CancellationToken> =
            inner.tasks().values().map(|t| t.cancel.clone()).collect();
        if !pending.is_empty() {
            info!(runs = pending.len(), "cancelling local runs");
        }
        for cancel in pending {
            cancel.cancel();
        }

        let drained = tokio::time::timeout(inner.config.shutdown_grace, async {
            loop {
                let notified = inner.idle.notified();
                if inner.tasks().is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = inner.tasks().len(),
                "shutdown grace elapsed with runs still tearing down"
            );
        }

        let store = inner.store.close().await;
        let channel = inner.channel.close().await;
        store?;
        channel?;
        Ok(())
    }
}

/// Producer task: drain the caller's stream into the queue.
///
/// The stream is dropped on every exit path, which is what closes whatever
/// the producer holds open.
async fn produce<F, S, T, E>(
    store: Arc<dyn StateStore>,
    key: TaskKey,
    running_ttl: std::time::Duration,
    factory: F,
    queue: mpsc::UnboundedSender<Tagged<T>>,
    cancel: CancellationToken,
) -> ProducerExit
where
    F: FnOnce() -> S,
    S: Stream<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    let mut stream = Box::pin(factory());

    if let Err(err) = store
        .set_task_state(key.as_str(), TaskState::Running, running_ttl)
        .await
    {
        error!(task = %key, error = %err, "failed to refresh running state");
        record_error(store.as_ref(), &key, running_ttl).await;
        let _ = queue.send(Tagged::Error(err.into()));
        return ProducerExit::Failed;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = queue.send(Tagged::Cancelled);
                return ProducerExit::Cancelled;
            }
            next = stream.next() => match next {
                Some(Ok(item)) => {
                    let _ = queue.send(Tagged::Data(item));
                }
                Some(Err(err)) => {
                    let err: BoxError = err.into();
                    warn!(task = %key, error = %err, "producer failed");
                    record_error(store.as_ref(), &key, running_ttl).await;
                    let _ = queue.send(Tagged::Error(InterruptError::Producer(err)));
                    return ProducerExit::Failed;
                }
                None => {
                    let _ = queue.send(Tagged::Done);
                    return ProducerExit::Finished;
                }
            },
        }
    }
}

async fn record_error(store: &dyn StateStore, key: &TaskKey, ttl: std::time::Duration) {
    if let Err(err) = store.set_task_state(key.as_str(), TaskState::Error, ttl).await {
        error!(task = %key, error = %err, "failed to record ERROR state");
    }
}

/// How the listener task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenExit {
    Stopped,
    ChannelClosed,
}

/// Listener task: turn a STOP on the key's channel into cancellation.
async fn listen(
    mut subscription: Subscription,
    key: TaskKey,
    target: CancellationToken,
) -> ListenExit {
    while let Some(message) = subscription.next().await {
        match message.parse::<InterruptSignal>() {
            Ok(InterruptSignal::Stop) => {
                info!(task = %key, "stop signal received");
                target.cancel();
                return ListenExit::Stopped;
            }
            Ok(signal) => debug!(task = %key, %signal, "ignoring unsupported signal"),
            Err(err) => debug!(task = %key, error = %err, "ignoring message"),
        }
    }
    if target.is_cancelled() {
        debug!(task = %key, channel = subscription.channel(), "signal channel closed");
    } else {
        // the run is still live but can no longer be stopped remotely
        warn!(
            task = %key,
            channel = subscription.channel(),
            "signal channel closed while the run is active, stop signals will not be delivered"
        );
    }
    ListenExit::ChannelClosed
}

/// Supervisor task: forward items, then tear the run down and reconcile.
///
/// `out` is dropped last, so a consumer reading to the end observes the
/// final persisted state.
async fn supervise<T>(
    inner: Arc<Inner>,
    run: Run,
    mut queue: mpsc::UnboundedReceiver<Tagged<T>>,
    out: mpsc::UnboundedSender<Result<T, InterruptError>>,
) {
    let Run {
        key,
        run_id,
        cancel,
        producer,
        listener,
    } = run;

    loop {
        tokio::select! {
            _ = out.closed() => {
                debug!(task = %key, "consumer dropped the stream");
                break;
            }
            tagged = queue.recv() => match tagged {
                Some(Tagged::Data(item)) => {
                    if out.send(Ok(item)).is_err() {
                        break;
                    }
                }
                Some(Tagged::Error(err)) => {
                    let _ = out.send(Err(err));
                    break;
                }
                // `None`: the producer task died without a terminal tag
                Some(Tagged::Done) | Some(Tagged::Cancelled) | None => break,
            },
        }
    }

    if !listener.is_finished() {
        listener.abort();
    }
    if let Err(err) = listener.await {
        if !err.is_cancelled() {
            warn!(task = %key, error = %err, "listener task failed");
        }
    }

    if !producer.is_finished() {
        cancel.cancel();
    }
    let exit = match producer.await {
        Ok(exit) => exit,
        Err(err) => {
            error!(task = %key, error = %err, "producer task panicked");
            record_error(inner.store.as_ref(), &key, inner.config.running_ttl).await;
            let _ = out.send(Err(InterruptError::ProducerPanicked(key.clone())));
            ProducerExit::Failed
        }
    };

    let final_state = if exit == ProducerExit::Cancelled {
        TaskState::Stopped
    } else {
        TaskState::Finished
    };
    match inner.reconcile(&key, final_state).await {
        Ok(state) => info!(task = %key, %run_id, %state, "task ended"),
        Err(err) => {
            error!(task = %key, error = %err, "failed to persist final state");
            let _ = out.send(Err(err.into()));
        }
    }

    inner.unregister(&key, run_id);
}
