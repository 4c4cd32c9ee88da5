//! Duplicate call suppression for concurrent work.
//!
//! A [`Group`] makes sure that at most one execution of a work function is in
//! flight per key. Callers that arrive while it runs do not execute their own
//! function; they wait for the running one and receive the same outcome. Once
//! the work returns the key is forgotten, so the next caller starts afresh.
//! Nothing is cached past the end of a call.
//!
//! Two calling conventions are offered:
//!
//! - [`Group::work`] blocks the calling thread and returns the result directly.
//! - [`Group::work_chan`] returns immediately with a [`ResponseReceiver`], which
//!   can be awaited or received on with `blocking_recv`.
//!
//! ```
//! use singleflight_group::Group;
//!
//! let group: Group<String, String, String> = Group::new();
//! let (result, shared) = group.work("user:42".to_string(), || Ok("alice".to_string()));
//! assert_eq!(result.unwrap(), "alice");
//! assert!(!shared);
//! ```
//!
//! If a work function panics, the panic is captured and re-raised in every
//! caller attached to that call with a [`PanicError`] payload, which still
//! hands out the original payload through [`PanicError::downcast_ref`].

use std::{
    collections::HashMap,
    hash::Hash,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

mod call;
mod error;

use call::{Call, Outcome};
pub use error::PanicError;

type SharedMapping<K, T, E> = Arc<Mutex<HashMap<K, Arc<Call<T, E>>>>>;

/// Receiving half handed out by [`Group::work_chan`].
///
/// Exactly one [`Response`] is delivered once the call completes.
pub type ResponseReceiver<T, E> = oneshot::Receiver<Response<T, E>>;

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Cloning a `Group` yields another handle to the same set of in-flight calls.
pub struct Group<K, T, E> {
    mapping: SharedMapping<K, T, E>,
}

impl<K, T, E> Default for Group<K, T, E> {
    fn default() -> Self {
        Self {
            mapping: Default::default(),
        }
    }
}

impl<K, T, E> Clone for Group<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            mapping: Arc::clone(&self.mapping),
        }
    }
}

impl<K, T, E> std::fmt::Debug for Group<K, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.mapping.lock().len())
            .finish()
    }
}

/// Outcome delivered through a [`ResponseReceiver`].
#[derive(Debug)]
pub struct Response<T, E> {
    outcome: Outcome<T, E>,
    shared: bool,
}

impl<T, E> Response<T, E> {
    pub(crate) fn new(outcome: Outcome<T, E>, shared: bool) -> Self {
        Self { outcome, shared }
    }

    /// Whether the outcome was handed to more than one caller.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Whether the work function panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self.outcome, Outcome::Panicked(_))
    }

    /// Returns what the work function returned.
    ///
    /// # Panics
    ///
    /// Resumes the work function's panic, with a [`PanicError`] payload, if it
    /// panicked.
    pub fn into_result(self) -> Result<T, E> {
        self.outcome.into_result()
    }

    /// Like [`Response::into_result`], paired with [`Response::shared`].
    pub fn into_parts(self) -> (Result<T, E>, bool) {
        let shared = self.shared;
        (self.outcome.into_result(), shared)
    }
}

impl<K, T, E> Group<K, T, E>
where
    K: Hash + Eq + Clone,
{
    /// Create a new Group to do work with.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute and return the result of a given function, making sure that only one
    /// execution is in-flight for a key at a given moment. If a duplicate call comes in,
    /// that caller will block until the original call completes and return the same result.
    ///
    /// The returned flag is true when the result was given to more than one caller.
    ///
    /// `func` must not call back into this group with the same key, or the caller
    /// deadlocks on itself.
    ///
    /// # Panics
    ///
    /// If the executing function panics, every caller attached to the call resumes
    /// unwinding with the same [`PanicError`] payload.
    pub fn work<F>(&self, key: K, func: F) -> (Result<T, E>, bool)
    where
        F: FnOnce() -> Result<T, E>,
        T: Clone,
        E: Clone,
    {
        let mut mapping = self.mapping.lock();
        if let Some(call) = mapping.get(&key) {
            let call = Arc::clone(call);
            call.attach_duplicate();
            drop(mapping);
            trace!("attached to in-flight call");
            return (call.wait().into_result(), true);
        }

        let call = Arc::new(Call::new());
        mapping.insert(key.clone(), Arc::clone(&call));
        drop(mapping);
        trace!("starting new call");

        let (outcome, shared) = complete(&self.mapping, &key, &call, func);
        (outcome.into_result(), shared)
    }

    /// Like [`Group::work`] but returns immediately with a receiver that will get the
    /// [`Response`] once the call completes.
    ///
    /// When no call is in flight for `key`, `func` is run on a newly spawned thread.
    ///
    /// If the worker thread cannot be spawned, every receiver attached to the call
    /// gets a panicked [`Response`] whose [`PanicError`] wraps the [`io::Error`].
    pub fn work_chan<F>(&self, key: K, func: F) -> ResponseReceiver<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        K: Send + 'static,
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let mut mapping = self.mapping.lock();
        if let Some(call) = mapping.get(&key) {
            call.attach_sink(tx);
            trace!("attached channel to in-flight call");
            return rx;
        }

        let call = Arc::new(Call::with_sink(tx));
        mapping.insert(key.clone(), Arc::clone(&call));
        drop(mapping);
        trace!("starting new call on worker thread");

        let worker = {
            let (mapping, key, call) = (Arc::clone(&self.mapping), key.clone(), Arc::clone(&call));
            thread::Builder::new()
                .name("singleflight-worker".to_string())
                .spawn(move || {
                    complete(&mapping, &key, &call, func);
                })
        };
        if let Err(err) = worker {
            warn!(error = %err, "failed to spawn worker thread");
            self.abandon(&key, &call, err);
        }
        rx
    }

    /// Settles a call whose work could not be started, so the key does not stay
    /// registered with nobody to complete it.
    fn abandon(&self, key: &K, call: &Arc<Call<T, E>>, err: io::Error)
    where
        T: Clone,
        E: Clone,
    {
        let outcome = Outcome::Panicked(PanicError::spawn_failed(err));
        settle(&self.mapping, key, call, &outcome);
    }

    /// Tells the group to forget about a key. Future calls for it will execute their
    /// function rather than wait for an earlier one; callers already attached still
    /// receive the earlier outcome.
    pub fn forget(&self, key: &K) {
        self.mapping.lock().remove(key);
    }

    /// Number of callers that attached to the call in flight for `key`, beyond the one
    /// executing it. `None` when no call is in flight.
    pub fn duplicates(&self, key: &K) -> Option<usize> {
        self.mapping.lock().get(key).map(|call| call.duplicates())
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.mapping.lock().len()
    }
}

/// Runs `func` for `call`, detaches the call from the registry and then releases
/// every waiter. Returns the outcome and whether it was shared.
fn complete<K, T, E, F>(
    mapping: &Mutex<HashMap<K, Arc<Call<T, E>>>>,
    key: &K,
    call: &Arc<Call<T, E>>,
    func: F,
) -> (Outcome<T, E>, bool)
where
    K: Hash + Eq,
    F: FnOnce() -> Result<T, E>,
    T: Clone,
    E: Clone,
{
    let outcome = match panic::catch_unwind(AssertUnwindSafe(func)) {
        Ok(result) => Outcome::from_result(result),
        Err(payload) => {
            let err = PanicError::from_payload(payload);
            warn!(panic = err.message(), "work function panicked");
            Outcome::Panicked(err)
        }
    };

    let shared = settle(mapping, key, call, &outcome);
    (outcome, shared)
}

/// Detaches `call` from the registry and then publishes `outcome` to its waiters.
/// Returns whether the outcome was shared.
fn settle<K, T, E>(
    mapping: &Mutex<HashMap<K, Arc<Call<T, E>>>>,
    key: &K,
    call: &Arc<Call<T, E>>,
    outcome: &Outcome<T, E>,
) -> bool
where
    K: Hash + Eq,
    T: Clone,
    E: Clone,
{
    // Detach before anyone is released, so a caller arriving after this point
    // never joins a finished call.
    let (duplicates, detached) = {
        let mut mapping = mapping.lock();
        let current = mapping
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(registered, call));
        if current {
            mapping.remove(key);
        }
        (call.duplicates(), current)
    };
    let shared = duplicates > 0;
    debug!(duplicates, detached, "call completed");

    call.publish(outcome, shared);
    shared
}
