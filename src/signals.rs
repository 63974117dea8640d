/// Signal handling for graceful shutdown.
///
/// Handles SIGTERM and SIGINT. The OS-level handler (owned by tokio) only
/// writes to a self-pipe; a dedicated listener task observes it and spawns
/// the reaction. The reaction runs once per process: the first signal or
/// manual trigger sets the flag and runs every registered callback in order,
/// later ones are logged and dropped.
///
/// The dispositions in place before registration are captured and put back
/// by `unregister_handlers`.
use crate::services::ServiceError;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const HANDLED: [Signal; 2] = [Signal::SIGTERM, Signal::SIGINT];

/// Serializes every read-modify-write of a process signal disposition.
static DISPOSITIONS: Mutex<()> = Mutex::new(());

/// Set once any handler has put the old dispositions back. tokio never
/// reinstalls its process handler, so registration stays closed afterwards.
static RESTORED: AtomicBool = AtomicBool::new(false);

type CallbackResult = Result<(), ServiceError>;
type CallbackFuture = Pin<Box<dyn Future<Output = CallbackResult> + Send>>;

enum ShutdownCallback {
    Sync(Box<dyn Fn() -> CallbackResult + Send + Sync>),
    Async(Box<dyn Fn() -> CallbackFuture + Send + Sync>),
}

/// What started the shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(Signal),
    Manual(String),
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownTrigger::Signal(sig) => write!(f, "{}", sig.as_str()),
            ShutdownTrigger::Manual(reason) => write!(f, "manual trigger ({reason})"),
        }
    }
}

/// Outcome of the reaction, available once every callback has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub trigger: ShutdownTrigger,
    pub callbacks_run: usize,
    pub callbacks_failed: usize,
}

struct Inner {
    shutdown_timeout: Duration,
    shutting_down: AtomicBool,
    requested: watch::Sender<bool>,
    completed: watch::Sender<Option<ShutdownSummary>>,
    callbacks: Mutex<Vec<Arc<ShutdownCallback>>>,
    registration: Mutex<Registration>,
}

enum Registration {
    Idle,
    Installed {
        listener: JoinHandle<()>,
        previous: Vec<(Signal, SigAction)>,
    },
}

/// Bridges SIGTERM/SIGINT into a single, deadline-bounded shutdown reaction.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SignalHandler {
    inner: Arc<Inner>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl SignalHandler {
    /// Create a handler whose [`shutdown`](Self::shutdown) gives up after `shutdown_timeout`.
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (requested, _) = watch::channel(false);
        let (completed, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                shutdown_timeout,
                shutting_down: AtomicBool::new(false),
                requested,
                completed,
                callbacks: Mutex::new(Vec::new()),
                registration: Mutex::new(Registration::Idle),
            }),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.inner.shutdown_timeout
    }

    /// Install SIGTERM and SIGINT handlers and start the listener task.
    ///
    /// Must be called from within a tokio runtime, once. The dispositions
    /// found beforehand are kept for [`unregister_handlers`](Self::unregister_handlers).
    pub fn register_handlers(&self) -> Result<(), SignalError> {
        let mut registration = lock(&self.inner.registration);
        if matches!(*registration, Registration::Installed { .. }) {
            return Err(SignalError::AlreadyInstalled);
        }

        let _dispositions = lock(&DISPOSITIONS);
        if RESTORED.load(Ordering::SeqCst) {
            return Err(SignalError::Restored);
        }
        let mut previous = Vec::with_capacity(HANDLED.len());
        for sig in HANDLED {
            let action = current_action(sig).map_err(|e| SignalError::Install {
                signal: sig,
                source: e.into(),
            })?;
            previous.push((sig, action));
        }

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| SignalError::Install {
            signal: Signal::SIGTERM,
            source: e,
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| SignalError::Install {
            signal: Signal::SIGINT,
            source: e,
        })?;

        let handler = self.clone();
        let listener = tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    Some(()) = sigterm.recv() => Signal::SIGTERM,
                    Some(()) = sigint.recv() => Signal::SIGINT,
                    else => break,
                };
                debug!(signal = sig.as_str(), "signal delivered");
                // Keep listening while the reaction runs so a repeat is logged.
                let reaction = handler.clone();
                tokio::spawn(async move {
                    reaction.react(ShutdownTrigger::Signal(sig)).await;
                });
            }
        });
        *registration = Registration::Installed { listener, previous };

        info!("signal handlers registered for SIGTERM and SIGINT");
        Ok(())
    }

    /// Stop the listener and put back the dispositions captured by
    /// [`register_handlers`](Self::register_handlers). With the default
    /// disposition restored, SIGTERM terminates the process again.
    ///
    /// Handlers cannot be registered again afterwards, by this or any other
    /// handler in the process. A no-op if nothing is installed.
    pub fn unregister_handlers(&self) -> Result<(), SignalError> {
        let mut registration = lock(&self.inner.registration);
        let Registration::Installed { listener, previous } =
            std::mem::replace(&mut *registration, Registration::Idle)
        else {
            return Ok(());
        };
        listener.abort();

        let _dispositions = lock(&DISPOSITIONS);
        RESTORED.store(true, Ordering::SeqCst);
        for (sig, action) in previous {
            // SAFETY: `action` was returned by sigaction for this signal, so it
            // is a disposition the process already ran with.
            unsafe { sigaction(sig, &action) }.map_err(|e| SignalError::Restore {
                signal: sig,
                source: e.into(),
            })?;
            debug!(signal = sig.as_str(), "restored previous signal disposition");
        }
        info!("signal handlers unregistered");
        Ok(())
    }

    /// Append a synchronous callback to run during the reaction.
    pub fn register_shutdown_callback<F>(&self, callback: F)
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.push_callback(ShutdownCallback::Sync(Box::new(callback)));
    }

    /// Append an async callback to run during the reaction.
    pub fn register_async_shutdown_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.push_callback(ShutdownCallback::Async(Box::new(move || {
            Box::pin(callback()) as CallbackFuture
        })));
    }

    fn push_callback(&self, callback: ShutdownCallback) {
        if self.is_shutting_down() {
            warn!("shutdown callback registered after shutdown began, it will not run");
        }
        lock(&self.inner.callbacks).push(Arc::new(callback));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Start the reaction without an OS signal. Returns false if shutdown
    /// was already under way.
    pub async fn trigger(&self, reason: impl Into<String>) -> bool {
        self.react(ShutdownTrigger::Manual(reason.into())).await
    }

    /// The reaction. Idempotent: only the first call has any effect.
    async fn react(&self, trigger: ShutdownTrigger) -> bool {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            warn!(%trigger, "shutdown already in progress, ignoring");
            return false;
        }
        self.inner.requested.send_replace(true);
        info!("received {trigger}, initiating graceful shutdown");

        let callbacks: Vec<_> = lock(&self.inner.callbacks).clone();
        let mut failed = 0;
        for (index, callback) in callbacks.iter().enumerate() {
            let result = match callback.as_ref() {
                ShutdownCallback::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or_else(|_| Err("shutdown callback panicked".into())),
                ShutdownCallback::Async(f) => match tokio::spawn(f()).await {
                    Ok(result) => result,
                    Err(e) => Err(format!("shutdown callback task failed: {e}").into()),
                },
            };
            if let Err(e) = result {
                failed += 1;
                error!(callback = index, error = %e, "error in shutdown callback");
            }
        }

        self.inner.completed.send_replace(Some(ShutdownSummary {
            trigger,
            callbacks_run: callbacks.len(),
            callbacks_failed: failed,
        }));
        true
    }

    /// Receiver that flips to `true` when shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.requested.subscribe()
    }

    /// Wait until a signal or manual trigger starts the shutdown.
    pub async fn wait_for_shutdown_request(&self) {
        let mut rx = self.subscribe();
        if rx.wait_for(|requested| *requested).await.is_err() {
            // Unreachable while `self` holds the sender.
            warn!("shutdown request channel closed");
        }
    }

    /// Drive shutdown to completion within the configured deadline.
    ///
    /// Starts the reaction if nothing has yet, then waits for every callback
    /// to return. On expiry returns [`SignalError::Timeout`]; the caller is
    /// expected to force-exit.
    pub async fn shutdown(&self) -> Result<ShutdownSummary, SignalError> {
        let deadline = self.inner.shutdown_timeout;
        match tokio::time::timeout(deadline, self.execute_shutdown()).await {
            Ok(summary) => Ok(summary),
            Err(_) => {
                error!(timeout = ?deadline, "shutdown timeout exceeded, forcing exit");
                Err(SignalError::Timeout { after: deadline })
            }
        }
    }

    async fn execute_shutdown(&self) -> ShutdownSummary {
        if !self.is_shutting_down() {
            // Spawned so a deadline expiry here doesn't cancel callbacks mid-flight.
            let reaction = self.clone();
            tokio::spawn(async move {
                reaction.trigger("shutdown requested").await;
            });
        }

        let mut rx = self.inner.completed.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(summary) = current {
                return summary;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Read the disposition of `sig`. There is no query-only call, so it is
/// swapped for SIG_IGN and put straight back; a delivery in between is dropped.
fn current_action(sig: Signal) -> nix::Result<SigAction> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_IGN runs no code in signal context, and the original action
    // is reinstated unchanged.
    let previous = unsafe { sigaction(sig, &ignore) }?;
    unsafe { sigaction(sig, &previous) }?;
    Ok(previous)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Errors from signal handling.
#[derive(Debug)]
pub enum SignalError {
    Install {
        signal: Signal,
        source: std::io::Error,
    },
    AlreadyInstalled,
    /// Handlers were unregistered earlier in this process.
    Restored,
    /// A captured disposition could not be put back.
    Restore {
        signal: Signal,
        source: std::io::Error,
    },
    /// The shutdown reaction did not finish within the deadline.
    Timeout {
        after: Duration,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Install { signal, source } => {
                write!(f, "failed to install {} handler: {source}", signal.as_str())
            }
            SignalError::AlreadyInstalled => write!(f, "signal handlers are already installed"),
            SignalError::Restored => {
                write!(f, "signal handlers were unregistered and cannot be reinstalled")
            }
            SignalError::Restore { signal, source } => {
                write!(f, "failed to restore {} disposition: {source}", signal.as_str())
            }
            SignalError::Timeout { after } => {
                write!(f, "graceful shutdown did not finish within {after:?}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Install { source, .. } => Some(source),
            SignalError::Restore { source, .. } => Some(source),
            SignalError::AlreadyInstalled | SignalError::Restored | SignalError::Timeout { .. } => {
                None
            }
        }
    }
}
