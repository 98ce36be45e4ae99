//! Worker lifecycle and transport
//!
//! Spawns a worker task, speaks the init/run/stop protocol with it and
//! exposes its event stream to the dispatcher.

#![allow(dead_code)]

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::ipc::{ControllerMessage, RunPayload, WorkerInitParams, WorkerMessage};
use crate::suite::Suite;

use super::WorkerMain;

/// Cooperative cancellation flag shared between host and worker
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once stop has been requested. Registers for notification
    /// before checking the flag, so a concurrent `request` is never missed.
    pub async fn requested(&self) {
        let notified = self.notify.notified();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// Controller-side handle to one worker
///
/// The worker runs as a spawned task behind message channels; all
/// coordination is asynchronous message passing.
pub struct WorkerHost {
    pub worker_index: usize,
    pub parallel_index: usize,
    /// The worker hash this process is bound to.
    pub hash: String,
    stop: Arc<StopSignal>,
    to_worker: mpsc::Sender<ControllerMessage>,
    from_worker: mpsc::Receiver<WorkerMessage>,
    join: Option<JoinHandle<()>>,
    did_send_stop: bool,
}

impl WorkerHost {
    /// Spawn a worker, send `init` and await its ready acknowledgment.
    pub async fn start(
        params: WorkerInitParams,
        suite: Arc<Suite>,
        hash: String,
    ) -> Result<WorkerHost> {
        let (to_worker, control_rx) = mpsc::channel(16);
        let (event_tx, from_worker) = mpsc::channel(256);
        let stop = Arc::new(StopSignal::new());
        let worker_index = params.worker_index;
        let parallel_index = params.parallel_index;

        let join = tokio::spawn(worker_loop(suite, control_rx, event_tx, stop.clone()));
        let mut host = WorkerHost {
            worker_index,
            parallel_index,
            hash,
            stop,
            to_worker,
            from_worker,
            join: Some(join),
            did_send_stop: false,
        };
        host.to_worker
            .send(ControllerMessage::Init(params))
            .await
            .context("worker went away before init")?;
        match host.from_worker.recv().await {
            Some(WorkerMessage::Ready) => {
                debug!(worker = worker_index, "worker ready");
                Ok(host)
            }
            other => Err(anyhow!("worker {worker_index} failed to start: {other:?}")),
        }
    }

    pub async fn run_job(&self, payload: RunPayload) -> Result<()> {
        self.to_worker
            .send(ControllerMessage::Run(payload))
            .await
            .map_err(|_| anyhow!("worker {} is gone", self.worker_index))
    }

    /// Next event from the worker; `None` means the worker is gone.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.from_worker.recv().await
    }

    /// Ask the worker to drain. Idempotent.
    pub fn signal_stop(&mut self) {
        if !self.did_send_stop {
            self.did_send_stop = true;
            self.stop.request();
        }
    }

    pub fn did_send_stop(&self) -> bool {
        self.did_send_stop
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Stop the worker and await its exit.
    pub async fn shutdown(mut self) {
        self.signal_stop();
        let _ = self.to_worker.send(ControllerMessage::Stop).await;
        // Drain remaining events until the channel closes.
        while let Some(message) = self.from_worker.recv().await {
            if matches!(message, WorkerMessage::Exit) {
                break;
            }
        }
        if let Some(join) = self.join.take() {
            if let Err(join_error) = join.await {
                error!(worker = self.worker_index, %join_error, "worker task panicked");
            }
        }
        debug!(worker = self.worker_index, "worker stopped");
    }
}

/// The worker task: init once, run jobs until stopped, tear down, exit.
async fn worker_loop(
    suite: Arc<Suite>,
    mut control: mpsc::Receiver<ControllerMessage>,
    events: mpsc::Sender<WorkerMessage>,
    stop: Arc<StopSignal>,
) {
    let mut main: Option<WorkerMain> = None;
    loop {
        let message = tokio::select! {
            message = control.recv() => message,
            _ = stop.requested() => Some(ControllerMessage::Stop),
        };
        match message {
            Some(ControllerMessage::Init(params)) => {
                main = Some(WorkerMain::new(
                    params,
                    suite.clone(),
                    events.clone(),
                    stop.clone(),
                ));
                let _ = events.send(WorkerMessage::Ready).await;
            }
            Some(ControllerMessage::Run(payload)) => {
                let Some(main) = main.as_mut() else {
                    let _ = events.send(WorkerMessage::Done(Default::default())).await;
                    continue;
                };
                let done = main.run_job(payload).await;
                let _ = events.send(WorkerMessage::Done(done)).await;
            }
            Some(ControllerMessage::Stop) | None => break,
        }
    }
    if let Some(main) = main.as_mut() {
        for teardown_error in main.shutdown().await {
            error!(%teardown_error, "worker teardown failed");
        }
    }
    let _ = events.send(WorkerMessage::Exit).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;
    use crate::fixtures::{FixturePool, RegistrationIds};
    use crate::ipc::{RunEntry, WorkerOptions};
    use crate::suite::{TestCase, TestStatus};

    fn params(worker_index: usize) -> WorkerInitParams {
        WorkerInitParams {
            worker_index,
            parallel_index: 0,
            repeat_each_index: 0,
            project_index: 0,
            options: WorkerOptions {
                default_timeout_ms: 5_000,
            },
        }
    }

    fn one_test_suite() -> Arc<Suite> {
        let mut ids = RegistrationIds::new();
        let pool = Arc::new(FixturePool::build(&[], &mut ids, None, false).unwrap());
        Arc::new(Suite::new("").add_test(TestCase::new(
            "t1",
            "t1",
            Location::new("spec.rs", 1, 1),
            pool,
            "spec.rs",
            &[],
            |_p| async { Ok(()) },
        )))
    }

    #[tokio::test]
    async fn init_run_done_exit_round_trip() {
        let suite = one_test_suite();
        let mut host = WorkerHost::start(params(0), suite, "hash".to_string())
            .await
            .unwrap();
        host.run_job(RunPayload {
            require_file: "spec.rs".to_string(),
            entries: vec![RunEntry {
                test_id: "t1".to_string(),
                retry: 0,
            }],
        })
        .await
        .unwrap();

        let mut saw_pass = false;
        loop {
            match host.recv().await {
                Some(WorkerMessage::TestEnd(end)) => {
                    assert_eq!(end.status, TestStatus::Passed);
                    saw_pass = true;
                }
                Some(WorkerMessage::Done(done)) => {
                    assert!(done.fatal_errors.is_empty());
                    break;
                }
                Some(_) => {}
                None => panic!("worker died mid-job"),
            }
        }
        assert!(saw_pass);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn stop_signal_wakes_waiters_registered_before_and_after() {
        let signal = Arc::new(StopSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.requested().await })
        };
        tokio::task::yield_now().await;
        signal.request();
        waiter.await.unwrap();
        // A waiter arriving after the request returns immediately.
        signal.requested().await;
    }
}
