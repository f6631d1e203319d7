//! Single coroutine task loops.
//!
//! Every piece of mutable state (pool entries, pending requests, service
//! registrations) is owned by exactly one loop; other threads only ever
//! submit closures that the loop runs against that state, one at a time, in
//! submission order.
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use may::coroutine;
use may::go;
use may::sync::{mpsc, Mutex};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Command<S> {
    Run(Task<S>),
    Halt,
}

/// handle of a running control loop, cheap to clone
pub(crate) struct ControlLoop<S> {
    name: Arc<str>,
    tx: Arc<Mutex<mpsc::Sender<Command<S>>>>,
}

impl<S> Clone for ControlLoop<S> {
    fn clone(&self) -> Self {
        ControlLoop {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for ControlLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("name", &self.name)
            .finish()
    }
}

impl<S: Send + 'static> ControlLoop<S> {
    /// spawn the loop, the state is built with a handle to the loop itself
    pub fn spawn_with<F>(name: impl Into<String>, init: F) -> Result<Self, Error>
    where
        F: FnOnce(ControlLoop<S>) -> S,
    {
        let name: Arc<str> = name.into().into();
        let (tx, rx) = mpsc::channel::<Command<S>>();
        let handle = ControlLoop {
            name: name.clone(),
            tx: Arc::new(Mutex::new(tx)),
        };
        let mut state = init(handle.clone());

        let builder = coroutine::Builder::new().name(name.to_string());
        go!(builder, move || {
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    Command::Run(task) => {
                        let ret =
                            panic::catch_unwind(AssertUnwindSafe(|| task(&mut state)));
                        if ret.is_err() {
                            error!("{}: task panicked", name);
                        }
                    }
                    Command::Halt => break,
                }
            }
            debug!("{}: control loop exit", name);
        })?;
        Ok(handle)
    }
}

impl<S: 'static> ControlLoop<S> {
    /// the loop name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// queue a task, fails once the loop is halted
    pub fn submit<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(Command::Run(Box::new(task)))
    }

    /// queue a task after the delay elapsed
    pub fn submit_after<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let this = self.clone();
        go!(move || {
            coroutine::sleep(delay);
            if this.submit(task).is_err() {
                debug!("{}: timer fired after halt", this.name);
            }
        });
    }

    /// stop the loop once the already queued tasks ran
    pub fn halt(&self) {
        self.send(Command::Halt).ok();
    }

    fn send(&self, cmd: Command<S>) -> Result<(), Error> {
        self.tx
            .lock()
            .unwrap()
            .send(cmd)
            .map_err(|_| Error::IllegalState(format!("{} is halted", self.name)))
    }
}

/// queue that runs closures one after another on a dedicated coroutine
///
/// pass one to an async call to have its callbacks delivered in order on a
/// single coroutine
#[derive(Clone, Debug)]
pub struct ExecutionQueue(ControlLoop<()>);

impl ExecutionQueue {
    /// spawn a new queue
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        ControlLoop::spawn_with(name, |_| ()).map(ExecutionQueue)
    }

    /// run the closure on the queue
    pub fn execute<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.submit(move |_| f())
    }

    /// stop the queue after the already queued closures ran
    pub fn shutdown(&self) {
        self.0.halt();
    }
}
