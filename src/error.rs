use std::{any::Any, fmt, io, sync::Arc};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

/// A panic raised by a work function, captured so it can be re-raised in
/// every caller that was waiting on the same call.
///
/// Every attached caller unwinds with the same `PanicError` payload, which
/// shares the original panic payload. Recover it with
/// [`std::panic::catch_unwind`], `downcast_ref::<PanicError>()` and then
/// [`PanicError::downcast_ref`] for the type passed to `panic!`/`panic_any`.
#[derive(Clone, thiserror::Error)]
#[error("singleflight work panicked: {message}")]
pub struct PanicError {
    message: Arc<str>,
    payload: Arc<Mutex<Box<dyn Any + Send>>>,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("Box<dyn Any>")
        };
        Self {
            message,
            payload: Arc::new(Mutex::new(payload)),
        }
    }

    /// The worker thread for a channel call could not be started. The io error
    /// becomes the payload.
    pub(crate) fn spawn_failed(err: io::Error) -> Self {
        Self {
            message: Arc::from(format!("failed to spawn worker thread: {err}")),
            payload: Arc::new(Mutex::new(Box::new(err))),
        }
    }

    /// Message of the original panic, when it carried a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the original payload is of type `P`.
    pub fn is<P: Any>(&self) -> bool {
        self.payload.lock().is::<P>()
    }

    /// Locks the original payload and returns it as `P`, if it is one.
    ///
    /// All clones share one payload, so hold the guard briefly.
    pub fn downcast_ref<P: Any>(&self) -> Option<MappedMutexGuard<'_, P>> {
        MutexGuard::try_map(self.payload.lock(), |payload| {
            (**payload).downcast_mut::<P>()
        })
        .ok()
    }

    pub(crate) fn resume(self) -> ! {
        std::panic::resume_unwind(Box::new(self))
    }
}

impl fmt::Debug for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicError")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
