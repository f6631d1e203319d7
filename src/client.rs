//! Client side invoker: correlation ids, pending requests and service handles.
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::{ControlLoop, ExecutionQueue};
use crate::errors::Error;
use crate::frame::{Frame, RequestBuf, Response};
use crate::pool::{FrameHandler, PoolConfig, TransportPool};
use crate::strategy::{Bincode, Callback, Invocation, Reply, Serializer};
use crate::transport::{Connector, TcpConnector};
use crate::waiter::{Completion, ResultCell};

use bytes::Bytes;
use may::go;
use serde::de::DeserializeOwned;
use serde::Serialize;

static NEXT_INVOKER: AtomicU64 = AtomicU64::new(0);

/// client invoker settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// how long a blocking call waits for its response, `None` waits forever
    pub timeout: Option<Duration>,
    /// settings of every destination pool
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            // default timeout is 10s
            timeout: Some(Duration::from_secs(10)),
            pool: PoolConfig::default(),
        }
    }
}

type Delivery = Box<dyn FnOnce(Result<Bytes, Error>) + Send>;

// where the outcome of a call goes
enum PendingSink {
    Blocking(ResultCell<Bytes>),
    Async {
        deliver: Delivery,
        queue: Option<ExecutionQueue>,
    },
}

impl PendingSink {
    fn resolve(self, result: Result<Bytes, Error>) {
        match self {
            PendingSink::Blocking(cell) => {
                cell.complete(result);
            }
            PendingSink::Async {
                deliver,
                queue: Some(queue),
            } => {
                if queue.execute(move || deliver(result)).is_err() {
                    warn!("execution queue is shut down, callback dropped");
                }
            }
            PendingSink::Async {
                deliver,
                queue: None,
            } => {
                go!(move || deliver(result));
            }
        }
    }
}

struct Pending {
    sink: PendingSink,
    dispatched_at: Instant,
}

struct ClientState {
    pools: HashMap<SocketAddr, TransportPool>,
    pending: HashMap<String, Pending>,
    connector: Arc<dyn Connector>,
    control: ControlLoop<ClientState>,
    pool_config: PoolConfig,
}

impl ClientState {
    fn pool(&mut self, addr: SocketAddr) -> Result<&TransportPool, Error> {
        if !self.pools.contains_key(&addr) {
            let control = self.control.clone();
            let on_frame: FrameHandler = Arc::new(move |frame: Frame| {
                if control.submit(move |s: &mut ClientState| s.complete(frame)).is_err() {
                    debug!("{}: response after stop dropped", control.name());
                }
            });
            let pool = TransportPool::spawn(
                addr,
                self.pool_config.clone(),
                self.connector.clone(),
                on_frame,
            )?;
            info!("{}: new pool toward {}", self.control.name(), addr);
            self.pools.insert(addr, pool);
        }
        Ok(&self.pools[&addr])
    }

    fn dispatch(&mut self, addr: SocketAddr, id: String, frame: Frame, sink: PendingSink) {
        // responses are handled on this loop too, so registering after the
        // offer cannot miss one
        match self.pool(addr).and_then(|pool| pool.offer(frame)) {
            Ok(()) => {
                let pending = Pending {
                    sink,
                    dispatched_at: Instant::now(),
                };
                if self.pending.insert(id.clone(), pending).is_some() {
                    error!("{}: correlation id {} reused", self.control.name(), id);
                }
            }
            Err(e) => {
                warn!("{}: request id={} not sent, err={}", self.control.name(), id, e);
                sink.resolve(Err(e));
            }
        }
    }

    fn complete(&mut self, frame: Frame) {
        let rsp = match Response::decode(&frame) {
            Ok(rsp) => rsp,
            Err(e) => {
                error!("{}: decode rsp failed, err={}", self.control.name(), e);
                return;
            }
        };
        match self.pending.remove(&rsp.correlation_id) {
            Some(pending) => {
                debug!(
                    "receive rsp, id={}, elapsed={:?}",
                    rsp.correlation_id,
                    pending.dispatched_at.elapsed()
                );
                pending.sink.resolve(rsp.result.map_err(Error::Remote));
            }
            None => debug!("no pending request for rsp id={}, dropped", rsp.correlation_id),
        }
    }

    fn abandon(&mut self, id: &str) {
        if self.pending.remove(id).is_some() {
            debug!("{}: request id={} abandoned", self.control.name(), id);
        }
    }

    fn shutdown(&mut self, done: Completion) {
        info!(
            "{}: stopping {} pools, failing {} pending requests",
            self.control.name(),
            self.pools.len(),
            self.pending.len()
        );
        for (_, pending) in self.pending.drain() {
            pending.sink.resolve(Err(Error::IllegalState(
                "client invoker stopped".to_owned(),
            )));
        }
        let stops: Vec<Completion> = self.pools.drain().map(|(_, pool)| pool.stop()).collect();
        let control = self.control.clone();
        go!(move || {
            for stop in stops {
                stop.wait();
            }
            done.signal();
            control.halt();
        });
    }
}

struct Inner {
    prefix: String,
    next_id: AtomicU64,
    control: ControlLoop<ClientState>,
    config: ClientConfig,
    running: AtomicBool,
    stopped: Completion,
}

impl Inner {
    fn stop(&self) -> Completion {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let done = self.stopped.clone();
            if self.control.submit(move |s| s.shutdown(done)).is_err() {
                self.stopped.signal();
            }
        }
        self.stopped.clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// turns method calls into network round trips
///
/// one invoker can talk to any number of destinations, a pool is created
/// lazily for each of them
#[derive(Clone)]
pub struct ClientInvoker {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClientInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInvoker")
            .field("prefix", &self.inner.prefix)
            .field("timeout", &self.inner.config.timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ClientInvoker {
    /// create an invoker that connects over tcp
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let connector = Arc::new(TcpConnector::new(config.pool.codec.clone()));
        ClientInvoker::with_connector(config, connector)
    }

    /// create an invoker with a custom transport connector
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, Error> {
        let seq = NEXT_INVOKER.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("{:x}.{:x}", std::process::id(), seq);
        let pool_config = config.pool.clone();
        let control = ControlLoop::spawn_with(format!("client-{prefix}"), move |control| {
            ClientState {
                pools: HashMap::new(),
                pending: HashMap::new(),
                connector,
                control,
                pool_config,
            }
        })?;
        Ok(ClientInvoker {
            inner: Arc::new(Inner {
                prefix,
                next_id: AtomicU64::new(0),
                control,
                config,
                running: AtomicBool::new(true),
                stopped: Completion::new(),
            }),
        })
    }

    /// the invoker is ready once created, the completion is already signalled
    pub fn start(&self) -> Completion {
        Completion::done()
    }

    /// stop every pool and fail the calls still waiting for a response
    ///
    /// dropping the last handle of the invoker stops it as well
    pub fn stop(&self) -> Completion {
        self.inner.stop()
    }

    /// false once `stop` was called
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// the blocking call timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.config.timeout
    }

    /// create a handle forwarding calls to the service at `addr`
    pub fn proxy<S: Serializer>(
        &self,
        addr: SocketAddr,
        service_id: impl Into<String>,
        serializer: S,
    ) -> ServiceHandle<S> {
        ServiceHandle {
            invoker: self.clone(),
            addr,
            service_id: service_id.into().into(),
            serializer,
        }
    }

    fn next_correlation_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}.{:x}", self.inner.prefix, n)
    }

    fn max_frame_len(&self) -> usize {
        self.inner.config.pool.codec.max_frame_len
    }

    fn send(
        &self,
        addr: SocketAddr,
        id: String,
        frame: Frame,
        sink: PendingSink,
    ) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::IllegalState("client invoker is stopped".to_owned()));
        }
        self.inner
            .control
            .submit(move |s| s.dispatch(addr, id, frame, sink))
    }

    fn abandon(&self, id: String) {
        self.inner.control.submit(move |s| s.abandon(&id)).ok();
    }
}

/// call-forwarding handle toward one remote service
#[derive(Clone)]
pub struct ServiceHandle<S: Serializer = Bincode> {
    invoker: ClientInvoker,
    addr: SocketAddr,
    service_id: Arc<str>,
    serializer: S,
}

impl<S: Serializer> fmt::Debug for ServiceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("addr", &self.addr)
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl<S: Serializer> ServiceHandle<S> {
    /// the remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// the remote service id
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// the serializer used for arguments and results
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// invoke a remote method
    ///
    /// `args` is serialized as one unit on the calling thread, usually a
    /// tuple of the method arguments
    pub fn invoke<A, R>(
        &self,
        method: &str,
        param_types: &[&str],
        args: &A,
        invocation: Invocation<R>,
    ) -> Result<Reply<R>, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + 'static,
    {
        let id = self.invoker.next_correlation_id();
        let mut req = RequestBuf::new(&id, &self.service_id, method, param_types)?;
        self.serializer.encode_into(&mut req, args)?;
        let frame = req.finish(self.invoker.max_frame_len())?;
        debug!("request id={}, {}.{}", id, self.service_id, method);

        match invocation {
            Invocation::Blocking => {
                let cell = ResultCell::new();
                let sink = PendingSink::Blocking(cell.clone());
                self.invoker.send(self.addr, id.clone(), frame, sink)?;
                match cell.wait(self.invoker.timeout()) {
                    Ok(bytes) => self.serializer.decode(&bytes).map(Reply::Value),
                    Err(Error::Timeout) => {
                        self.invoker.abandon(id);
                        Err(Error::Timeout)
                    }
                    Err(e) => Err(e),
                }
            }
            Invocation::Async { callback, queue } => {
                let serializer = self.serializer.clone();
                let deliver: Delivery = Box::new(move |result: Result<Bytes, Error>| {
                    match result.and_then(|bytes| serializer.decode::<R>(&bytes)) {
                        Ok(value) => callback.on_success(value),
                        Err(e) => callback.on_failure(e),
                    }
                });
                let sink = PendingSink::Async { deliver, queue };
                self.invoker.send(self.addr, id, frame, sink)?;
                Ok(Reply::Dispatched)
            }
        }
    }

    /// blocking call, parks until the response is there or the timeout elapsed
    pub fn call<A, R>(&self, method: &str, param_types: &[&str], args: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + 'static,
    {
        match self.invoke(method, param_types, args, Invocation::Blocking)? {
            Reply::Value(v) => Ok(v),
            Reply::Dispatched => Err(Error::IllegalState(
                "blocking call returned without a value".to_owned(),
            )),
        }
    }

    /// async call, the callback runs on `queue` or on a fresh coroutine
    pub fn call_async<A, R, C>(
        &self,
        method: &str,
        param_types: &[&str],
        args: &A,
        callback: C,
        queue: Option<ExecutionQueue>,
    ) -> Result<(), Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + 'static,
        C: Callback<R>,
    {
        let invocation = Invocation::Async {
            callback: Box::new(callback),
            queue,
        };
        self.invoke(method, param_types, args, invocation).map(|_| ())
    }
}
