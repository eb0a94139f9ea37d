//! Supervised processes: a mailbox plus a handler loop that is restarted
//! when the handler fails or panics.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mailbox::{Mailbox, RoutineId};

/// What a handler wants the loop to do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// When the supervisor relaunches a failed handler loop.
#[derive(Debug, Clone, Default)]
pub enum RestartPolicy {
    /// Restart after every failure.
    #[default]
    Always,
    /// Give up on the first failure.
    Never,
    /// Restart up to `max_restarts` times, sleeping `backoff` before each.
    Limited { max_restarts: u64, backoff: Duration },
}

impl RestartPolicy {
    fn restart_delay(&self, restart_count: u64) -> Option<Duration> {
        match self {
            Self::Always => Some(Duration::ZERO),
            Self::Never => None,
            Self::Limited {
                max_restarts,
                backoff,
            } => (restart_count < *max_restarts).then_some(*backoff),
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The handler returned [`Flow::Stop`].
    Stopped,
    /// The mailbox was closed and drained.
    MailboxClosed,
    /// The restart policy refused another restart.
    GaveUp,
    /// The process was aborted through its handle.
    Aborted,
}

/// The most recent failure of a handler loop.
#[derive(Debug, Clone)]
pub struct ProcessFault {
    /// Panic payload, or the error with its causes.
    pub message: String,
    /// Stack trace at the fault. Always present for panics; present for
    /// errors when `anyhow` captured one.
    pub backtrace: Option<String>,
}

tokio::task_local! {
    static PANIC_TRACE: Arc<Mutex<Option<String>>>;
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that stores a backtrace for panics raised inside a
/// process worker. Every panic still reaches the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_TRACE.try_with(|slot| {
                *slot.lock() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

/// A registered mailbox waiting for a handler.
#[derive(Debug)]
pub struct Process {
    id: RoutineId,
    mailbox: Arc<Mailbox>,
}

impl Process {
    pub(crate) fn new(id: RoutineId, mailbox: Arc<Mailbox>) -> Self {
        Self { id, mailbox }
    }

    pub fn id(&self) -> RoutineId {
        self.id
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Run `handler` on every message, restarting after any failure.
    pub fn run<F, Fut>(self, handler: F) -> ProcessHandle
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
    {
        self.run_with_policy(handler, RestartPolicy::default())
    }

    pub fn run_with_policy<F, Fut>(self, handler: F, policy: RestartPolicy) -> ProcessHandle
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
    {
        install_panic_hook();
        let restarts = Arc::new(AtomicU64::new(0));
        let last_fault = Arc::new(Mutex::new(None));
        let task = tokio::spawn(supervise(
            self.id,
            self.mailbox,
            Arc::new(handler),
            policy,
            Arc::clone(&restarts),
            Arc::clone(&last_fault),
        ));
        ProcessHandle {
            id: self.id,
            restarts,
            last_fault,
            task,
        }
    }
}

/// Handle to a running process.
#[derive(Debug)]
pub struct ProcessHandle {
    id: RoutineId,
    restarts: Arc<AtomicU64>,
    last_fault: Arc<Mutex<Option<ProcessFault>>>,
    task: JoinHandle<ProcessExit>,
}

impl ProcessHandle {
    pub fn id(&self) -> RoutineId {
        self.id
    }

    /// How many times the handler loop has been relaunched.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    /// The last error or panic the handler raised, if any.
    pub fn last_fault(&self) -> Option<ProcessFault> {
        self.last_fault.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the supervisor and its current worker.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn wait(self) -> ProcessExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) if e.is_cancelled() => ProcessExit::Aborted,
            Err(e) => {
                error!(routine = self.id, "Process supervisor failed: {e}");
                ProcessExit::GaveUp
            }
        }
    }
}

/// Aborts the wrapped worker when the supervisor itself is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn supervise<F, Fut>(
    id: RoutineId,
    mailbox: Arc<Mailbox>,
    handler: Arc<F>,
    policy: RestartPolicy,
    restarts: Arc<AtomicU64>,
    last_fault: Arc<Mutex<Option<ProcessFault>>>,
) -> ProcessExit
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
{
    let mut restart_count = 0u64;
    loop {
        let trace = Arc::new(Mutex::new(None));
        let mut worker = AbortOnDrop(tokio::spawn(PANIC_TRACE.scope(
            Arc::clone(&trace),
            work(Arc::clone(&mailbox), Arc::clone(&handler)),
        )));

        let fault = match (&mut worker.0).await {
            Ok(Ok(exit)) => {
                info!(routine = id, ?exit, "Process exited");
                return exit;
            }
            Ok(Err(e)) => {
                error!(routine = id, "Process handler failed: {e:?}");
                let backtrace = e.backtrace();
                ProcessFault {
                    message: format!("{e:#}"),
                    backtrace: (backtrace.status() == BacktraceStatus::Captured)
                        .then(|| backtrace.to_string()),
                }
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                let backtrace = trace.lock().take();
                error!(
                    routine = id,
                    "Process handler panicked: {message}\nstack backtrace:\n{}",
                    backtrace.as_deref().unwrap_or("<not captured>")
                );
                ProcessFault { message, backtrace }
            }
            Err(e) => {
                debug!(routine = id, "Process worker cancelled: {e}");
                return ProcessExit::Aborted;
            }
        };
        *last_fault.lock() = Some(fault);

        let Some(backoff) = policy.restart_delay(restart_count) else {
            warn!(routine = id, restarts = restart_count, "Process gave up");
            return ProcessExit::GaveUp;
        };
        if backoff > Duration::ZERO {
            tokio::time::sleep(backoff).await;
        }
        restart_count += 1;
        restarts.store(restart_count, Ordering::Release);
        warn!(routine = id, restarts = restart_count, "Restarting process");
    }
}

async fn work<F, Fut>(mailbox: Arc<Mailbox>, handler: Arc<F>) -> anyhow::Result<ProcessExit>
where
    F: Fn(Bytes) -> Fut,
    Fut: Future<Output = anyhow::Result<Flow>>,
{
    while let Some(message) = mailbox.recv().await {
        if handler(message).await? == Flow::Stop {
            return Ok(ProcessExit::Stopped);
        }
    }
    Ok(ProcessExit::MailboxClosed)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
