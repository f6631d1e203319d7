//! Wait/notify cells shared between callers and control loops.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::Error;
use may::sync::{Condvar, Mutex};

enum Slot<T> {
    Waiting,
    Ready(Result<T, Error>),
    Taken,
}

/// single shot result holder
///
/// one side resolves it exactly once, the other side parks in `wait`
/// until the value or the failure is there
pub struct ResultCell<T> {
    inner: Arc<(Mutex<Slot<T>>, Condvar)>,
}

impl<T> Clone for ResultCell<T> {
    fn clone(&self) -> Self {
        ResultCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ResultCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCell")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        ResultCell::new()
    }
}

impl<T> ResultCell<T> {
    /// create an unresolved cell
    pub fn new() -> Self {
        ResultCell {
            inner: Arc::new((Mutex::new(Slot::Waiting), Condvar::new())),
        }
    }

    /// resolve the cell, returns false if it was already resolved
    pub fn complete(&self, result: Result<T, Error>) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock().unwrap();
        if !matches!(*slot, Slot::Waiting) {
            return false;
        }
        *slot = Slot::Ready(result);
        cvar.notify_all();
        true
    }

    /// resolve with a value
    pub fn set(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// resolve with a failure
    pub fn fail(&self, err: Error) -> bool {
        self.complete(Err(err))
    }

    /// true once the cell is resolved
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.inner.0.lock().unwrap(), Slot::Waiting)
    }

    /// park until resolved and take the result
    ///
    /// `None` waits forever, an elapsed timeout gives `Error::Timeout`
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Error> {
        let (lock, cvar) = &*self.inner;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = lock.lock().unwrap();
        loop {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(result) => return result,
                Slot::Taken => {
                    return Err(Error::IllegalState("result already taken".to_owned()))
                }
                Slot::Waiting => *slot = Slot::Waiting,
            }

            slot = match deadline {
                None => cvar.wait(slot).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    cvar.wait_timeout(slot, deadline - now).unwrap().0
                }
            };
        }
    }
}

/// completion signal of an asynchronous start or stop
///
/// any number of parties can wait on clones of the same completion
#[derive(Clone)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_complete())
            .finish()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::new()
    }
}

impl Completion {
    /// create a pending completion
    pub fn new() -> Self {
        Completion {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// create an already signalled completion
    pub fn done() -> Self {
        let c = Completion::new();
        c.signal();
        c
    }

    /// mark as complete and wake every waiter
    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// true once signalled
    pub fn is_complete(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// park until signalled
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    /// park until signalled or the timeout elapsed, returns true if signalled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut done = lock.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = cvar.wait_timeout(done, deadline - now).unwrap().0;
        }
        true
    }
}
