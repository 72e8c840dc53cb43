use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use tokio::runtime::{Builder, Runtime};
use tracing::{warn, Span};

use crate::error::{ReceiveError, ReceiveResult};
use crate::project::{ProjectState, UserIdentity};

/// What a unit of work reports back. `Err` carries the failure or panic
/// message.
pub type WorkOutcome = Result<(), String>;

/// Process-wide bounded pool running commit processing off the protocol
/// thread.
///
/// Work beyond `pool_size` concurrent units queues until a thread frees
/// up. Submitted work is never interrupted; callers stop waiting instead.
pub struct ReceiveExecutor {
    runtime: Option<Runtime>,
    pool_size: usize,
    active: Arc<AtomicUsize>,
}

impl ReceiveExecutor {
    pub fn new(pool_size: usize) -> ReceiveResult<Self> {
        let pool_size = pool_size.max(1);
        // Only the blocking pool runs work; the runtime itself is never driven.
        let runtime = Builder::new_current_thread()
            .max_blocking_threads(pool_size)
            .thread_name("receive-commits")
            .build()
            .map_err(|err| ReceiveError::Executor(err.to_string()))?;
        Ok(Self {
            runtime: Some(runtime),
            pool_size,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Units currently running (not queued).
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn submit<F>(&self, work: F) -> ReceiveResult<WorkHandle>
    where
        F: FnOnce() -> WorkOutcome + Send + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ReceiveError::Executor("executor shut down".to_string()))?;
        let (tx, rx) = bounded(1);
        let active = Arc::clone(&self.active);
        runtime.spawn_blocking(move || {
            active.fetch_add(1, Ordering::AcqRel);
            let outcome = catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                let message = panic_message(payload);
                warn!(error = %message, "receive worker panicked");
                Err(message)
            });
            active.fetch_sub(1, Ordering::AcqRel);
            // The waiter may have given up already.
            let _ = tx.send(outcome);
        });
        Ok(WorkHandle { completion: rx })
    }
}

impl Drop for ReceiveExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub struct WorkHandle {
    completion: Receiver<WorkOutcome>,
}

impl WorkHandle {
    pub fn completion(&self) -> &Receiver<WorkOutcome> {
        &self.completion
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Identity of the request that submitted a unit of work.
///
/// Thread-local context does not follow work onto the pool, so the scope
/// is moved into the closure and the caller's span re-entered there.
#[derive(Debug, Clone)]
pub struct RequestScope {
    project: ProjectState,
    user: UserIdentity,
    span: Span,
}

impl RequestScope {
    pub fn new(project: ProjectState, user: UserIdentity, span: Span) -> Self {
        Self {
            project,
            user,
            span,
        }
    }

    pub fn current(project: ProjectState, user: UserIdentity) -> Self {
        Self::new(project, user, Span::current())
    }

    pub fn project(&self) -> &ProjectState {
        &self.project
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn wrap<F, T>(&self, work: F) -> impl FnOnce() -> T + Send + 'static
    where
        F: FnOnce() -> T + Send + 'static,
        T: 'static,
    {
        let span = self.span.clone();
        move || span.in_scope(work)
    }
}
