//! Single-lane executor
//!
//! Every native call runs on one dedicated OS thread. Work is submitted as
//! boxed closures over a FIFO queue and answered through a oneshot channel,
//! so callers on any runtime thread simply await the reply. The engine is
//! built by a factory on the lane thread itself and never leaves it.

use crate::config::BridgeConfig;
use crate::engine::NativeEngine;
use crate::error::{panic_message, BridgeError, Result};
use crate::state::{SessionMachine, SessionStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// A unit of lane work
pub(crate) type Job = Box<dyn FnOnce(&mut LaneWorker) + Send + 'static>;

/// Lane-side owner of the session machine
///
/// Only reachable from inside a submitted unit.
pub struct LaneWorker {
    machine: SessionMachine,
    config: BridgeConfig,
    initialized: bool,
    status: watch::Sender<SessionStatus>,
    generating: watch::Sender<bool>,
}

impl LaneWorker {
    pub fn machine(&mut self) -> &mut SessionMachine {
        &mut self.machine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// One-time backend setup; a failure leaves the lane uninitialized so the
    /// next unit tries again
    pub(crate) fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let engine = self.machine.engine_mut();
        if self.config.logging.redirect_native {
            engine.install_log_redirect();
        }
        engine.backend_init(self.config.lane.numa)?;
        info!(system_info = %engine.system_info().trim(), "native backend initialized");

        self.initialized = true;
        Ok(())
    }

    /// Run a state transition and publish the resulting status
    pub(crate) fn transition<R>(
        &mut self,
        f: impl FnOnce(&mut SessionMachine) -> Result<R>,
    ) -> Result<R> {
        let result = f(&mut self.machine);
        self.publish_status();
        result
    }

    pub(crate) fn publish_status(&self) {
        self.status.send_replace(self.machine.status());
    }

    pub(crate) fn set_generating(&self, generating: bool) {
        self.generating.send_replace(generating);
    }

    fn teardown(&mut self) {
        if self.machine.unload() {
            self.publish_status();
        }
        if self.initialized {
            self.machine.engine_mut().backend_free();
            self.initialized = false;
            debug!("native backend released");
        }
    }
}

/// Submission side of the lane queue
///
/// Clones share one sender; closing the lane takes it, so a clone held by a
/// stream that was never polled cannot keep the lane thread alive.
#[derive(Clone)]
pub(crate) struct LaneQueue {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Job>>>>,
}

impl LaneQueue {
    /// Queue a raw job; fails only when the lane is closed or gone
    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock().map_err(|_| BridgeError::LaneClosed)?;
        sender
            .as_ref()
            .ok_or(BridgeError::LaneClosed)?
            .send(job)
            .map_err(|_| BridgeError::LaneClosed)
    }

    fn close(&self) {
        match self.sender.lock() {
            Ok(mut sender) => {
                sender.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }
}

/// Handle to the lane thread
pub(crate) struct Lane {
    queue: LaneQueue,
    closing: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    status: watch::Receiver<SessionStatus>,
    generating: watch::Receiver<bool>,
}

impl Lane {
    /// Start the lane thread; `factory` builds the engine on that thread
    pub(crate) fn spawn<F>(config: BridgeConfig, factory: F) -> Result<Self>
    where
        F: FnOnce(&BridgeConfig) -> Result<Box<dyn NativeEngine>> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let (status_tx, status) = watch::channel(SessionStatus::Idle);
        let (generating_tx, generating) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let closing = Arc::new(AtomicBool::new(false));
        let lane_closing = Arc::clone(&closing);

        let thread = thread::Builder::new()
            .name(config.lane.thread_name.clone())
            .spawn(move || {
                let engine = match factory(&config) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let batch_size = config.context.n_batch;
                let mut worker = LaneWorker {
                    machine: SessionMachine::new(engine, batch_size),
                    config,
                    initialized: false,
                    status: status_tx,
                    generating: generating_tx,
                };

                debug!("lane started");
                while let Some(job) = receiver.blocking_recv() {
                    if lane_closing.load(Ordering::Acquire) {
                        // dropping the job drops its reply channel
                        debug!("lane closing, dropping queued unit");
                        continue;
                    }
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut worker))) {
                        error!(panic = %panic_message(payload.as_ref()), "lane unit panicked");
                        worker.set_generating(false);
                        worker.publish_status();
                    }
                }

                worker.teardown();
                debug!("lane stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(BridgeError::EngineFailure(
                    "engine factory panicked on the lane".to_string(),
                ));
            }
        }

        Ok(Self {
            queue: LaneQueue {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            closing,
            thread: Some(thread),
            status,
            generating,
        })
    }

    /// Queue handle for units that are enqueued later, such as a generation
    /// on its first poll
    pub(crate) fn queue(&self) -> LaneQueue {
        self.queue.clone()
    }

    /// Run `unit` on the lane after one-time initialization and await its
    /// result
    pub(crate) async fn submit<R, F>(&self, unit: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut LaneWorker) -> Result<R> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();

        self.queue.enqueue(Box::new(move |worker: &mut LaneWorker| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                worker.ensure_initialized()?;
                unit(worker)
            }))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "lane unit panicked");
                Err(BridgeError::EngineFailure(format!(
                    "lane unit panicked: {}",
                    message
                )))
            });
            if reply.send(result).is_err() {
                debug!("submitter went away before the unit finished");
            }
        }))?;

        response.await.unwrap_or(Err(BridgeError::Cancelled))
    }

    pub(crate) fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub(crate) fn generating(&self) -> watch::Receiver<bool> {
        self.generating.clone()
    }

    /// Stop accepting work, drop queued units and release native resources
    pub(crate) fn close(&mut self) -> Option<thread::JoinHandle<()>> {
        self.closing.store(true, Ordering::Release);
        self.queue.close();
        self.thread.take()
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        // teardown continues on the lane thread; not joined here
        if self.close().is_some() {
            debug!("session dropped, lane closing");
        }
    }
}

/// Wait for the lane thread to finish its teardown
pub(crate) fn join(thread: thread::JoinHandle<()>) {
    if thread.join().is_err() {
        warn!("lane thread panicked during teardown");
    }
}
