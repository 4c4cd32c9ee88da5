use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::{error::PanicError, Response};

/// What a work function ended with.
#[derive(Clone, Debug)]
pub(crate) enum Outcome<T, E> {
    Value(T),
    Failure(E),
    Panicked(PanicError),
}

impl<T, E> Outcome<T, E> {
    pub(crate) fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(failure) => Outcome::Failure(failure),
        }
    }

    /// Converts back into the work function's result, re-raising a captured panic.
    pub(crate) fn into_result(self) -> Result<T, E> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
            Outcome::Panicked(panic) => panic.resume(),
        }
    }
}

/// One in-flight (or just finished) execution for a key.
///
/// The slot is written exactly once by the thread running the work, after the
/// call has been detached from the registry. Blocking waiters park on `done`;
/// channel waiters are parked in `sinks`.
pub(crate) struct Call<T, E> {
    slot: Mutex<Option<Outcome<T, E>>>,
    done: Condvar,
    duplicates: AtomicUsize,
    sinks: Mutex<Vec<oneshot::Sender<Response<T, E>>>>,
}

impl<T, E> Call<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
            duplicates: AtomicUsize::new(0),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_sink(sink: oneshot::Sender<Response<T, E>>) -> Self {
        let call = Self::new();
        call.sinks.lock().push(sink);
        call
    }

    // Both attach methods must be called with the registry guard held.
    pub(crate) fn attach_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attach_sink(&self, sink: oneshot::Sender<Response<T, E>>) {
        self.attach_duplicate();
        self.sinks.lock().push(sink);
    }

    pub(crate) fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::Relaxed)
    }
}

impl<T: Clone, E: Clone> Call<T, E> {
    /// Blocks until the outcome has been published.
    pub(crate) fn wait(&self) -> Outcome<T, E> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }

    /// Fires the completion signal and drains every result sink.
    pub(crate) fn publish(&self, outcome: &Outcome<T, E>, shared: bool) {
        {
            let mut slot = self.slot.lock();
            debug_assert!(slot.is_none(), "call outcome published twice");
            *slot = Some(outcome.clone());
        }
        self.done.notify_all();

        let sinks = std::mem::take(&mut *self.sinks.lock());
        for sink in sinks {
            // The receiver may have been dropped; its caller lost interest.
            let _ = sink.send(Response::new(outcome.clone(), shared));
        }
    }
}
