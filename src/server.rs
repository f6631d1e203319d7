//! Server side invoker: service registry, dispatch and responses.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::{CodecConfig, WriteStatus};
use crate::control::ControlLoop;
use crate::errors::{Error, RemoteError};
use crate::frame::{Frame, MethodId, RequestHeader, ResponseBuf};
use crate::strategy::Serializer;
use crate::transport::{TransportId, TransportListener, TransportRef, TransportServer};
use crate::waiter::Completion;

use may::go;
use may::sync::Mutex;
use serde::Serialize;

/// server invoker settings
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// codec settings of every accepted connection
    pub codec: CodecConfig,
}

/// a registered service behind one fixed entry point
///
/// the implementation resolves the method, decodes `args` and answers through
/// the responder, either before returning or later from any thread
pub trait Service: Send + Sync + 'static {
    /// handle one call
    fn invoke(&self, method: &MethodId, args: &[u8], responder: Responder) -> Result<(), Error>;
}

/// hands out service instances, one per call
pub trait ServiceFactory: Send + Sync + 'static {
    /// get an instance for the next call
    fn acquire(&self) -> Result<Arc<dyn Service>, Error>;

    /// give the instance back once the call returned
    fn release(&self, _service: Arc<dyn Service>) {}
}

/// factory that shares one instance between all calls
pub struct Shared(Arc<dyn Service>);

impl Shared {
    /// wrap the instance
    pub fn new<S: Service>(service: S) -> Self {
        Shared(Arc::new(service))
    }
}

impl ServiceFactory for Shared {
    fn acquire(&self) -> Result<Arc<dyn Service>, Error> {
        Ok(self.0.clone())
    }
}

/// factory that builds a fresh instance for every call
pub struct PerCall<F>(pub F);

impl<F, S> ServiceFactory for PerCall<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service,
{
    fn acquire(&self) -> Result<Arc<dyn Service>, Error> {
        Ok(Arc::new((self.0)()))
    }
}

struct ResponderInner {
    correlation_id: String,
    transport: TransportRef,
    control: ControlLoop<ServerState>,
    sent: AtomicBool,
    max_frame_len: usize,
}

impl ResponderInner {
    fn claim(&self) -> bool {
        let first = !self.sent.swap(true, Ordering::AcqRel);
        if !first {
            debug!("rsp id={} already sent, ignored", self.correlation_id);
        }
        first
    }

    fn build<F>(&self, write: F) -> Result<Frame, Error>
    where
        F: FnOnce(&mut ResponseBuf) -> Result<(), Error>,
    {
        let max = self.max_frame_len;
        let mut rsp = ResponseBuf::new(&self.correlation_id)?;
        let failure = match write(&mut rsp) {
            Ok(()) if rsp.len() <= max => return rsp.finish(max),
            Ok(()) => RemoteError::from_error(&Error::FrameTooLarge {
                len: rsp.len() as i64,
                max,
            }),
            Err(e) => RemoteError::from_error(&e),
        };
        error!("encode rsp id={} failed, err={}", self.correlation_id, failure);

        // write the failure in place of the value
        rsp.rewind();
        rsp.write_failure(&failure)?;
        rsp.finish(max)
    }

    fn reply<F>(&self, write: F)
    where
        F: FnOnce(&mut ResponseBuf) -> Result<(), Error>,
    {
        let frame = match self.build(write) {
            Ok(frame) => frame,
            Err(e) => {
                error!("rsp id={} dropped, err={}", self.correlation_id, e);
                return;
            }
        };
        let transport = self.transport.clone();
        let id = self.correlation_id.clone();
        let ret = self.control.submit(move |s| {
            info!("send rsp: id={}", id);
            match transport.offer(&frame) {
                Ok(WriteStatus::Full) => s.backlogged(transport.id()),
                Ok(_) => {}
                Err(e) => warn!("send rsp id={} failed, err={}", id, e),
            }
        });
        if ret.is_err() {
            warn!("server stopped, rsp id={} dropped", self.correlation_id);
        }
    }
}

impl Drop for ResponderInner {
    fn drop(&mut self) {
        if !self.sent.swap(true, Ordering::AcqRel) {
            warn!("no rsp for id={}, sending a failure", self.correlation_id);
            let failure = RemoteError::new("no-response", "service returned without a response");
            self.reply(|rsp| rsp.write_failure(&failure));
        }
    }
}

/// answers one call, only the first response is sent
///
/// a responder dropped without answering sends a `no-response` failure
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("correlation_id", &self.inner.correlation_id)
            .field("sent", &self.is_sent())
            .finish()
    }
}

impl Responder {
    fn new(
        correlation_id: String,
        transport: TransportRef,
        control: ControlLoop<ServerState>,
        max_frame_len: usize,
    ) -> Self {
        Responder {
            inner: Arc::new(ResponderInner {
                correlation_id,
                transport,
                control,
                sent: AtomicBool::new(false),
                max_frame_len,
            }),
        }
    }

    /// the id of the call
    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    /// true once a response was sent
    pub fn is_sent(&self) -> bool {
        self.inner.sent.load(Ordering::Acquire)
    }

    /// respond with an already serialized value
    ///
    /// returns false if the call was already answered
    pub fn respond(&self, value: &[u8]) -> bool {
        if !self.inner.claim() {
            return false;
        }
        self.inner.reply(|rsp| {
            rsp.begin_value()?;
            rsp.write_all(value)?;
            Ok(())
        });
        true
    }

    /// serialize the value straight into the response
    ///
    /// a value that fails to serialize, or is too large, is replaced by a
    /// failure response
    pub fn respond_with<S, T>(&self, serializer: &S, value: &T) -> bool
    where
        S: Serializer,
        T: Serialize + ?Sized,
    {
        if !self.inner.claim() {
            return false;
        }
        self.inner.reply(|rsp| {
            rsp.begin_value()?;
            serializer.encode_into(&mut *rsp, value)
        });
        true
    }

    /// respond with a failure
    pub fn fail(&self, failure: RemoteError) -> bool {
        if !self.inner.claim() {
            return false;
        }
        self.inner.reply(|rsp| rsp.write_failure(&failure));
        true
    }
}

struct ServerState {
    services: HashMap<String, Arc<dyn ServiceFactory>>,
    transports: HashMap<TransportId, TransportRef>,
    // transports whose output is above the high-water mark
    backlog: HashSet<TransportId>,
    stopping: bool,
    control: ControlLoop<ServerState>,
    max_frame_len: usize,
}

impl ServerState {
    fn new(control: ControlLoop<ServerState>, max_frame_len: usize) -> Self {
        ServerState {
            services: HashMap::new(),
            transports: HashMap::new(),
            backlog: HashSet::new(),
            stopping: false,
            control,
            max_frame_len,
        }
    }

    fn connected(&mut self, transport: TransportRef) {
        if self.stopping {
            debug!("transport {} accepted while stopping, closed", transport.id());
            transport.stop();
            return;
        }
        self.transports.insert(transport.id(), transport);
    }

    fn closed(&mut self, id: TransportId) {
        self.transports.remove(&id);
        self.backlog.remove(&id);
    }

    fn backlogged(&mut self, id: TransportId) {
        if self.backlog.insert(id) {
            warn!("transport {} output above the high-water mark, peer is slow", id);
        }
    }

    fn drained(&mut self, id: TransportId) {
        if self.backlog.remove(&id) {
            info!("transport {} output drained", id);
        }
    }

    fn dispatch(&mut self, transport: TransportRef, frame: Frame) {
        let header = match RequestHeader::decode(&frame) {
            Ok(header) => header,
            Err(e) => {
                error!("transport {} decode req failed, err={}", transport.id(), e);
                return;
            }
        };
        info!("get request: id={}", header.correlation_id);

        let responder = Responder::new(
            header.correlation_id.clone(),
            transport,
            self.control.clone(),
            self.max_frame_len,
        );
        let factory = match self.services.get(&header.service_id) {
            Some(factory) => factory.clone(),
            None => {
                warn!(
                    "req id={} for unknown service {}",
                    header.correlation_id, header.service_id
                );
                let err = Error::UnknownService(header.service_id);
                responder.fail(RemoteError::from_error(&err));
                return;
            }
        };

        // user code runs off the control loop
        go!(move || {
            if let Err(e) = invoke(&*factory, &header, &frame, &responder) {
                warn!("req id={} failed, err={}", header.correlation_id, e);
                responder.fail(RemoteError::from_error(&e));
            }
        });
    }

    fn shutdown(&mut self, done: Completion) {
        info!("server: stopping {} transports", self.transports.len());
        self.stopping = true;
        self.backlog.clear();
        self.services.clear();
        let stops: Vec<Completion> = self.transports.drain().map(|(_, t)| t.stop()).collect();
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

fn invoke(
    factory: &dyn ServiceFactory,
    header: &RequestHeader,
    frame: &Frame,
    responder: &Responder,
) -> Result<(), Error> {
    let (method, args) = header.decode_body(frame)?;
    debug!("req id={} invoke {}", header.correlation_id, method);
    let service = factory.acquire()?;
    let ret = panic::catch_unwind(AssertUnwindSafe(|| {
        service.invoke(&method, args, responder.clone())
    }));
    factory.release(service);
    match ret {
        Ok(ret) => ret,
        Err(payload) => Err(Error::Remote(RemoteError::from_panic(payload))),
    }
}

// feeds connection events into the server loop
struct ServerListener {
    control: ControlLoop<ServerState>,
}

impl ServerListener {
    fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut ServerState) + Send + 'static,
    {
        if self.control.submit(task).is_err() {
            debug!("server stopped, connection event ignored");
        }
    }
}

impl TransportListener for ServerListener {
    fn on_connected(&self, transport: &TransportRef) {
        let accepted = transport.clone();
        if self.control.submit(move |s| s.connected(accepted)).is_err() {
            debug!("server stopped, transport {} closed", transport.id());
            transport.stop();
        }
    }

    fn on_disconnected(&self, transport: &TransportRef) {
        let id = transport.id();
        self.schedule(move |s| s.closed(id));
    }

    fn on_frame(&self, transport: &TransportRef, frame: Frame) {
        let transport = transport.clone();
        self.schedule(move |s| s.dispatch(transport, frame));
    }

    fn on_refill(&self, transport: &TransportRef) {
        let id = transport.id();
        self.schedule(move |s| s.drained(id));
    }

    fn on_failure(&self, transport: &TransportRef, err: &Error) {
        warn!("server: transport {} failed, err={}", transport.id(), err);
        let id = transport.id();
        self.schedule(move |s| s.closed(id));
    }
}

/// accepts connections and runs the registered services
pub struct ServerInvoker {
    config: ServerConfig,
    control: ControlLoop<ServerState>,
    server: Mutex<Option<TransportServer>>,
    running: AtomicBool,
    stopped: Completion,
}

impl fmt::Debug for ServerInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInvoker")
            .field("local_addr", &self.local_addr())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServerInvoker {
    /// create the invoker, nothing is bound before `start`
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let max_frame_len = config.codec.max_frame_len;
        let control = ControlLoop::spawn_with("server", move |control| {
            ServerState::new(control, max_frame_len)
        })?;
        Ok(ServerInvoker {
            config,
            control,
            server: Mutex::new(None),
            running: AtomicBool::new(true),
            stopped: Completion::new(),
        })
    }

    /// register a service factory under the id, replacing any previous one
    pub fn register<F: ServiceFactory>(
        &self,
        service_id: impl Into<String>,
        factory: F,
    ) -> Result<Completion, Error> {
        let id = service_id.into();
        let factory: Arc<dyn ServiceFactory> = Arc::new(factory);
        let done = Completion::new();
        let signal = done.clone();
        self.control.submit(move |s| {
            if s.services.insert(id.clone(), factory).is_some() {
                warn!("service {} replaced", id);
            }
            info!("service {} registered", id);
            signal.signal();
        })?;
        Ok(done)
    }

    /// register one instance shared by all calls
    pub fn register_service<S: Service>(
        &self,
        service_id: impl Into<String>,
        service: S,
    ) -> Result<Completion, Error> {
        self.register(service_id, Shared::new(service))
    }

    /// remove a service, calls already dispatched still complete
    pub fn unregister(&self, service_id: &str) -> Result<Completion, Error> {
        let id = service_id.to_owned();
        let done = Completion::new();
        let signal = done.clone();
        self.control.submit(move |s| {
            if s.services.remove(&id).is_some() {
                info!("service {} unregistered", id);
            }
            signal.signal();
        })?;
        Ok(done)
    }

    /// bind the address and start accepting, returns the bound address
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> Result<SocketAddr, Error> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::IllegalState("server invoker is stopped".to_owned()));
        }
        let mut server = self.server.lock().unwrap();
        if server.is_some() {
            return Err(Error::IllegalState("server invoker already started".to_owned()));
        }
        let listener = Arc::new(ServerListener {
            control: self.control.clone(),
        });
        let bound = TransportServer::bind(addr, self.config.codec.clone(), listener)?;
        let local_addr = bound.local_addr();
        info!("server listening on {}", local_addr);
        *server = Some(bound);
        Ok(local_addr)
    }

    /// the bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().unwrap().as_ref().map(|s| s.local_addr())
    }

    /// stop accepting and close every connection
    pub fn stop(&self) -> Completion {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let server = self.server.lock().unwrap().take();
            let closed = Completion::new();
            let signal = closed.clone();
            if self.control.submit(move |s| s.shutdown(signal)).is_err() {
                closed.signal();
            }
            // the accept coroutine goes last, once its connections are closed
            let done = self.stopped.clone();
            go!(move || {
                closed.wait();
                if let Some(mut server) = server {
                    server.stop();
                }
                done.signal();
            });
        }
        self.stopped.clone()
    }
}

impl Drop for ServerInvoker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WriteStatus;
    use crate::frame::{RequestBuf, Response, FRAME_MAX_LEN};
    use crate::strategy::Bincode;
    use crate::waiter::ResultCell;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder {
        id: TransportId,
        status: WriteStatus,
        frames: StdMutex<Vec<Frame>>,
        stopped: AtomicBool,
    }

    impl crate::transport::Transport for Recorder {
        fn id(&self) -> TransportId {
            self.id
        }

        fn start(&self) -> Result<(), Error> {
            Ok(())
        }

        fn offer(&self, frame: &Frame) -> Result<WriteStatus, Error> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(self.status)
        }

        fn stop(&self) -> Completion {
            self.stopped.store(true, Ordering::Release);
            Completion::done()
        }
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Recorder::with_status(WriteStatus::WasEmpty)
        }

        fn with_status(status: WriteStatus) -> Arc<Self> {
            Arc::new(Recorder {
                id: TransportId::next(),
                status,
                frames: StdMutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            })
        }

        // wait for the n-th response and decode it
        fn response(&self, n: usize) -> Response {
            let deadline = Instant::now() + WAIT;
            loop {
                if let Some(frame) = self.frames.lock().unwrap().get(n) {
                    return Response::decode(frame).unwrap();
                }
                assert!(Instant::now() < deadline, "no response");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn state(max_frame_len: usize) -> ControlLoop<ServerState> {
        ControlLoop::spawn_with("server-test", move |control| {
            ServerState::new(control, max_frame_len)
        })
        .unwrap()
    }

    fn responder(max_frame_len: usize) -> (Responder, Arc<Recorder>) {
        let recorder = Recorder::new();
        let responder = Responder::new(
            "abc".to_owned(),
            recorder.clone(),
            state(max_frame_len),
            max_frame_len,
        );
        (responder, recorder)
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not today"))
        }
    }

    #[test]
    fn only_the_first_response_is_sent() {
        let (responder, recorder) = responder(FRAME_MAX_LEN);
        assert!(responder.respond_with(&Bincode, "first"));
        assert!(responder.is_sent());
        assert!(!responder.respond_with(&Bincode, "second"));
        assert!(!responder.clone().fail(RemoteError::new("x", "y")));
        drop(responder);

        let rsp = recorder.response(0);
        assert_eq!(rsp.correlation_id, "abc");
        let value: String = Bincode.decode(&rsp.result.unwrap()).unwrap();
        assert_eq!(value, "first");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn encode_failure_is_replaced_by_a_failure_response() {
        let (responder, recorder) = responder(FRAME_MAX_LEN);
        assert!(responder.respond_with(&Bincode, &Unserializable));
        let failure = recorder.response(0).result.unwrap_err();
        assert_eq!(failure.kind, "serialize");
        assert!(failure.message.contains("not today"));
    }

    #[test]
    fn oversized_value_is_replaced_by_a_failure_response() {
        let (responder, recorder) = responder(128);
        assert!(responder.respond(&[0; 1024]));
        let failure = recorder.response(0).result.unwrap_err();
        assert_eq!(failure.kind, "frame-too-large");
    }

    #[test]
    fn dropped_responder_answers_with_a_failure() {
        let (responder, recorder) = responder(FRAME_MAX_LEN);
        drop(responder);
        assert_eq!(recorder.response(0).result.unwrap_err().kind, "no-response");
    }

    struct Faulty;

    impl Service for Faulty {
        fn invoke(
            &self,
            method: &MethodId,
            _args: &[u8],
            responder: Responder,
        ) -> Result<(), Error> {
            match method.name.as_str() {
                "panic" => panic!("service blew up"),
                "wrapped" => {
                    let cause = io::Error::new(io::ErrorKind::Other, "disk on fire");
                    Err(Error::invocation(cause))
                }
                "ok" => {
                    responder.respond_with(&Bincode, &42u32);
                    Ok(())
                }
                _ => Err(Error::UnknownMethod(method.to_string())),
            }
        }
    }

    fn request(service: &str, method: &str) -> Frame {
        let mut req = RequestBuf::new("abc", service, method, &[]).unwrap();
        Bincode.encode_into(&mut req, &()).unwrap();
        req.finish(FRAME_MAX_LEN).unwrap()
    }

    fn call(service: &str, method: &str) -> Response {
        let control = state(FRAME_MAX_LEN);
        control
            .submit(|s| {
                let factory: Arc<dyn ServiceFactory> = Arc::new(PerCall(|| Faulty));
                s.services.insert("faulty".to_owned(), factory);
            })
            .unwrap();
        let recorder = Recorder::new();
        let transport: TransportRef = recorder.clone();
        let frame = request(service, method);
        control.submit(move |s| s.dispatch(transport, frame)).unwrap();
        recorder.response(0)
    }

    #[test]
    fn dispatch_answers_every_outcome() {
        let value: u32 = Bincode.decode(&call("faulty", "ok").result.unwrap()).unwrap();
        assert_eq!(value, 42);

        let failure = call("faulty", "panic").result.unwrap_err();
        assert_eq!(failure, RemoteError::new("panic", "service blew up"));

        let failure = call("faulty", "wrapped").result.unwrap_err();
        assert_eq!(failure, RemoteError::new("application", "disk on fire"));

        let failure = call("faulty", "missing").result.unwrap_err();
        assert_eq!(failure.kind, "unknown-method");

        let failure = call("nobody", "ok").result.unwrap_err();
        assert_eq!(failure.kind, "unknown-service");
    }

    fn query<T, F>(control: &ControlLoop<ServerState>, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&ServerState) -> T + Send + 'static,
    {
        let cell = ResultCell::new();
        let out = cell.clone();
        control
            .submit(move |s| {
                out.set(f(s));
            })
            .unwrap();
        cell.wait(Some(WAIT)).unwrap()
    }

    #[test]
    fn full_output_is_tracked_until_refill() {
        let control = state(FRAME_MAX_LEN);
        let recorder = Recorder::with_status(WriteStatus::Full);
        let responder =
            Responder::new("abc".to_owned(), recorder.clone(), control.clone(), FRAME_MAX_LEN);
        assert!(responder.respond(b"x"));
        recorder.response(0);
        assert_eq!(query(&control, |s| s.backlog.len()), 1);

        let listener = ServerListener {
            control: control.clone(),
        };
        let transport: TransportRef = recorder.clone();
        listener.on_refill(&transport);
        assert_eq!(query(&control, |s| s.backlog.len()), 0);
    }

    fn wait_stopped(recorder: &Recorder) {
        let deadline = Instant::now() + WAIT;
        while !recorder.stopped.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "late transport left open");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn connection_accepted_during_shutdown_is_closed() {
        let control = state(FRAME_MAX_LEN);
        let listener = ServerListener {
            control: control.clone(),
        };

        // shutdown in progress, the loop still runs tasks
        control.submit(|s| s.stopping = true).unwrap();
        let recorder = Recorder::new();
        let transport: TransportRef = recorder.clone();
        listener.on_connected(&transport);
        wait_stopped(&recorder);
        assert_eq!(query(&control, |s| s.transports.len()), 0);

        // the loop is gone
        control.halt();
        let deadline = Instant::now() + WAIT;
        while control.submit(|_| ()).is_ok() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        let recorder = Recorder::new();
        let transport: TransportRef = recorder.clone();
        listener.on_connected(&transport);
        wait_stopped(&recorder);
    }
}
