//! Connections to a peer and the listener contract the invokers build on.
use std::fmt;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::codec::{CodecConfig, FrameCodec, OutputQueue, WriteStatus};
use crate::errors::Error;
use crate::frame::Frame;
use crate::waiter::Completion;

use bytes::BytesMut;
use co_managed::Manager;
use may::net::{TcpListener, TcpStream};
use may::sync::{mpsc, Mutex};
use may::{coroutine, go};

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// process unique transport id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    /// mint a fresh id
    pub fn next() -> Self {
        TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// one logical connection to a peer
pub trait Transport: Send + Sync + 'static {
    /// the transport id
    fn id(&self) -> TransportId;
    /// start connecting, `on_connected` fires once the transport is usable
    fn start(&self) -> Result<(), Error>;
    /// buffer a frame for writing, `on_refill` fires once it is flushed
    fn offer(&self, frame: &Frame) -> Result<WriteStatus, Error>;
    /// close the connection, no callback fires after this
    fn stop(&self) -> Completion;
}

/// shared transport handle
pub type TransportRef = Arc<dyn Transport>;

/// callbacks fired by a transport
///
/// they run on the transport's own coroutines and must not block
pub trait TransportListener: Send + Sync + 'static {
    /// the connection is established
    fn on_connected(&self, transport: &TransportRef);
    /// the peer closed the connection
    fn on_disconnected(&self, transport: &TransportRef);
    /// a complete frame was received
    fn on_frame(&self, transport: &TransportRef, frame: Frame);
    /// the outbound buffer is drained
    fn on_refill(&self, transport: &TransportRef);
    /// the connection failed, the transport is unusable
    fn on_failure(&self, transport: &TransportRef, err: &Error);
}

/// creates client side transports
pub trait Connector: Send + Sync + 'static {
    /// create a transport toward the address, not started yet
    fn connect(
        &self,
        addr: SocketAddr,
        listener: Arc<dyn TransportListener>,
    ) -> Result<TransportRef, Error>;
}

enum Kick {
    Flush,
    Halt,
}

/// transport over a coroutine tcp stream
///
/// a reader coroutine decodes inbound frames and a writer coroutine flushes
/// the outbound queue whenever `offer` finds it empty, producers never wait
/// on the socket
pub struct TcpTransport {
    id: TransportId,
    me: Weak<TcpTransport>,
    peer: SocketAddr,
    config: CodecConfig,
    listener: Arc<dyn TransportListener>,
    // kept for shutdown
    stream: Mutex<Option<TcpStream>>,
    output: Mutex<OutputQueue>,
    kick: Mutex<Option<mpsc::Sender<Kick>>>,
    stopped: AtomicBool,
    done: Completion,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpTransport {
    /// create an unconnected transport toward `peer`
    pub fn new(
        peer: SocketAddr,
        config: CodecConfig,
        listener: Arc<dyn TransportListener>,
    ) -> Arc<Self> {
        let output = Mutex::new(OutputQueue::new(&config));
        Arc::new_cyclic(|me| TcpTransport {
            id: TransportId::next(),
            me: me.clone(),
            peer,
            config,
            listener,
            stream: Mutex::new(None),
            output,
            kick: Mutex::new(None),
            stopped: AtomicBool::new(false),
            done: Completion::new(),
        })
    }

    /// the remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn handle(&self) -> Option<TransportRef> {
        self.me.upgrade().map(|t| t as TransportRef)
    }

    // wire the stream in, spawn the writer and hand back the read half
    fn attach(&self, stream: TcpStream) -> Result<FrameCodec<TcpStream>, Error> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::IllegalState(format!("transport {} dropped", self.id)))?;
        stream.set_nodelay(true)?;
        let reader = FrameCodec::new(stream.try_clone()?, self.config.clone());
        let writer = stream.try_clone()?;

        let (tx, rx) = mpsc::channel();
        *self.stream.lock().unwrap() = Some(stream);
        *self.kick.lock().unwrap() = Some(tx);
        let builder = coroutine::Builder::new().name(format!("transport-{}-writer", self.id.0));
        go!(builder, move || me.run_write_loop(writer, rx))?;

        if self.stopped.load(Ordering::Acquire) {
            // stopped while connecting
            self.close();
            return Err(Error::IllegalState(format!("transport {} is stopped", self.id)));
        }
        Ok(reader)
    }

    fn run_read_loop(&self, mut reader: FrameCodec<TcpStream>) {
        let me = match self.handle() {
            Some(me) => me,
            None => return,
        };
        loop {
            match reader.read() {
                Ok(Some(frame)) => {
                    debug!("transport {} recv frame: len={}", self.id, frame.len());
                    self.listener.on_frame(&me, frame);
                }
                Ok(None) => continue,
                Err(Error::PeerDisconnected) => {
                    info!("transport {} decode frame: connection closed", self.id);
                    self.disconnected();
                    break;
                }
                Err(e) => {
                    if !self.stopped.load(Ordering::Acquire) {
                        error!("transport {} decode frame: err = {:?}", self.id, e);
                    }
                    self.fail(e);
                    break;
                }
            }
        }
    }

    fn run_write_loop(&self, mut stream: TcpStream, kicks: mpsc::Receiver<Kick>) {
        let mut active = BytesMut::with_capacity(self.config.capacity);
        while let Ok(Kick::Flush) = kicks.recv() {
            loop {
                // the lock is only held for the swap, never across a write
                let more = self.output.lock().unwrap().swap(&mut active);
                if !more {
                    break;
                }
                if let Err(e) = stream.write_all(&active) {
                    if !self.stopped.load(Ordering::Acquire) {
                        error!("transport {} flush failed, err={}", self.id, e);
                    }
                    self.fail(e.into());
                    return;
                }
            }

            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            if let Some(me) = self.handle() {
                self.listener.on_refill(&me);
            }
        }
    }

    fn close(&self) {
        if let Some(stream) = self.stream.lock().unwrap().as_ref() {
            stream.shutdown(Shutdown::Both).ok();
        }
        if let Some(kick) = self.kick.lock().unwrap().take() {
            kick.send(Kick::Halt).ok();
        }
    }

    fn disconnected(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close();
        if let Some(me) = self.handle() {
            self.listener.on_disconnected(&me);
        }
        self.done.signal();
    }

    fn fail(&self, err: Error) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close();
        if let Some(me) = self.handle() {
            self.listener.on_failure(&me, &err);
        }
        self.done.signal();
    }
}

impl Transport for TcpTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn start(&self) -> Result<(), Error> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::IllegalState(format!("transport {} dropped", self.id)))?;
        let builder = coroutine::Builder::new().name(format!("transport-{}-reader", self.id.0));
        go!(builder, move || {
            let stream = match TcpStream::connect(me.peer) {
                Ok(s) => s,
                Err(e) => {
                    error!("transport {} connect to {} failed: {}", me.id, me.peer, e);
                    me.fail(e.into());
                    return;
                }
            };
            let reader = match me.attach(stream) {
                Ok(r) => r,
                Err(e) => {
                    me.fail(e);
                    return;
                }
            };
            info!("transport {} connected to {}", me.id, me.peer);
            if let Some(handle) = me.handle() {
                me.listener.on_connected(&handle);
            }
            me.run_read_loop(reader);
        })?;
        Ok(())
    }

    fn offer(&self, frame: &Frame) -> Result<WriteStatus, Error> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::IllegalState(format!("transport {} is stopped", self.id)));
        }
        let kick = self.kick.lock().unwrap();
        let kick = match kick.as_ref() {
            Some(kick) => kick,
            None => {
                return Err(Error::IllegalState(format!(
                    "transport {} is not connected",
                    self.id
                )))
            }
        };
        let status = self.output.lock().unwrap().push(frame);
        if status == WriteStatus::WasEmpty {
            kick.send(Kick::Flush).ok();
        }
        Ok(status)
    }

    fn stop(&self) -> Completion {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("transport {} stopped", self.id);
            self.close();
            self.done.signal();
        }
        self.done.clone()
    }
}

/// connector creating [`TcpTransport`]s
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: CodecConfig,
}

impl TcpConnector {
    /// create a connector, every transport gets its own codec with this config
    pub fn new(config: CodecConfig) -> Self {
        TcpConnector { config }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        addr: SocketAddr,
        listener: Arc<dyn TransportListener>,
    ) -> Result<TransportRef, Error> {
        Ok(TcpTransport::new(addr, self.config.clone(), listener))
    }
}

/// accepts inbound connections, every one becomes a started [`TcpTransport`]
pub struct TransportServer {
    local_addr: SocketAddr,
    instance: Option<coroutine::JoinHandle<()>>,
}

impl fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TransportServer {
    /// bind the address and spawn the accept coroutine
    pub fn bind<L: ToSocketAddrs>(
        addr: L,
        config: CodecConfig,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Self, Error> {
        let tcp = TcpListener::bind(addr)?;
        let local_addr = tcp.local_addr()?;
        let builder = coroutine::Builder::new().name("TransportServer".to_owned());
        let instance = go!(builder, move || {
            let manager = Manager::new();
            for stream in tcp.incoming() {
                let stream = t!(stream);
                let peer = t!(stream.peer_addr());
                let transport = TcpTransport::new(peer, config.clone(), listener.clone());
                let reader = t!(transport.attach(stream));
                info!("transport {} accepted from {}", transport.id, peer);
                let handle: TransportRef = transport.clone();
                listener.on_connected(&handle);
                manager.add(move || transport.run_read_loop(reader));
            }
        })?;
        Ok(TransportServer {
            local_addr,
            instance: Some(instance),
        })
    }

    /// the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// stop accepting, the connection coroutines are cancelled with it
    pub fn stop(&mut self) {
        if let Some(s) = self.instance.take() {
            unsafe { s.coroutine().cancel() };
            s.join().ok();
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}
