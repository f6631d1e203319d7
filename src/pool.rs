//! A bounded set of transports toward one destination.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{CodecConfig, WriteStatus};
use crate::control::ControlLoop;
use crate::errors::Error;
use crate::frame::Frame;
use crate::transport::{Connector, TransportId, TransportListener, TransportRef};
use crate::waiter::Completion;
use may::go;

/// pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// max number of transports, connecting ones included
    pub pool_size: usize,
    /// idle time after which a transport is closed, zero disables eviction
    pub eviction_delay: Duration,
    /// codec settings of every transport
    pub codec: CodecConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 1,
            eviction_delay: Duration::ZERO,
            codec: CodecConfig::default(),
        }
    }
}

/// receives every frame read by the pool's transports
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

struct Entry {
    transport: TransportRef,
    // `None` while the transport is connecting or has output in flight
    idle_since: Option<Instant>,
}

struct PoolState {
    addr: SocketAddr,
    entries: HashMap<TransportId, Entry>,
    queue: VecDeque<Frame>,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn TransportListener>,
    control: ControlLoop<PoolState>,
    config: PoolConfig,
}

impl PoolState {
    fn offer(&mut self, frame: Frame) {
        let idle = self
            .entries
            .iter()
            .find(|(_, e)| e.idle_since.is_some())
            .map(|(id, _)| *id);
        self.queue.push_back(frame);
        match idle {
            Some(id) => self.drain(id),
            None if self.entries.len() < self.config.pool_size => self.open(),
            None => {}
        }
    }

    fn open(&mut self) {
        let transport = match self.connector.connect(self.addr, self.listener.clone()) {
            Ok(t) => t,
            Err(e) => {
                error!("pool {}: connect failed, err={}", self.addr, e);
                return;
            }
        };
        let id = transport.id();
        self.entries.insert(
            id,
            Entry {
                transport: transport.clone(),
                idle_since: None,
            },
        );
        if let Err(e) = transport.start() {
            error!("pool {}: transport {} start failed, err={}", self.addr, id, e);
            self.entries.remove(&id);
            return;
        }
        debug!("pool {}: opened transport {}", self.addr, id);
    }

    // write queued frames while the transport accepts them, or mark it idle
    fn drain(&mut self, id: TransportId) {
        let entry = match self.entries.get_mut(&id) {
            Some(e) => e,
            None => return,
        };

        let mut wrote = false;
        while let Some(frame) = self.queue.pop_front() {
            match entry.transport.offer(&frame) {
                Ok(status) => {
                    wrote = true;
                    if status == WriteStatus::Full {
                        break;
                    }
                }
                Err(e) => {
                    warn!("pool {}: transport {} refused frame, err={}", self.addr, id, e);
                    self.queue.push_front(frame);
                    self.remove(id);
                    return;
                }
            }
        }

        if wrote {
            entry.idle_since = None;
            return;
        }

        let stamp = Instant::now();
        entry.idle_since = Some(stamp);
        let delay = self.config.eviction_delay;
        if !delay.is_zero() {
            self.control
                .submit_after(delay, move |s: &mut PoolState| s.evict(id, stamp));
        }
    }

    fn evict(&mut self, id: TransportId, stamp: Instant) {
        let unchanged = match self.entries.get(&id) {
            Some(e) => e.idle_since == Some(stamp),
            None => false,
        };
        if unchanged {
            info!("pool {}: evicting idle transport {}", self.addr, id);
            self.remove(id);
        }
    }

    fn remove(&mut self, id: TransportId) {
        if let Some(entry) = self.entries.remove(&id) {
            debug!("pool {}: removed transport {}", self.addr, id);
            entry.transport.stop();
        }
    }

    fn shutdown(&mut self, done: Completion) {
        info!("pool {}: stopping {} transports", self.addr, self.entries.len());
        let stops: Vec<Completion> = self
            .entries
            .drain()
            .map(|(_, e)| e.transport.stop())
            .collect();
        let control = self.control.clone();
        go!(move || {
            for stop in stops {
                stop.wait();
            }
            let signal = done.clone();
            let ret = control.submit(move |s: &mut PoolState| {
                if !s.queue.is_empty() {
                    warn!("pool {}: dropping {} queued frames", s.addr, s.queue.len());
                }
                s.queue.clear();
                signal.signal();
                s.control.halt();
            });
            if ret.is_err() {
                done.signal();
            }
        });
    }
}

// feeds transport callbacks into the pool loop
struct PoolListener {
    control: ControlLoop<PoolState>,
    on_frame: FrameHandler,
}

impl PoolListener {
    fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut PoolState) + Send + 'static,
    {
        if self.control.submit(task).is_err() {
            debug!("{}: callback after stop ignored", self.control.name());
        }
    }
}

impl TransportListener for PoolListener {
    fn on_connected(&self, transport: &TransportRef) {
        let id = transport.id();
        self.schedule(move |s| s.drain(id));
    }

    fn on_disconnected(&self, transport: &TransportRef) {
        let id = transport.id();
        self.schedule(move |s| s.remove(id));
    }

    fn on_frame(&self, _transport: &TransportRef, frame: Frame) {
        (self.on_frame)(frame);
    }

    fn on_refill(&self, transport: &TransportRef) {
        let id = transport.id();
        self.schedule(move |s| s.drain(id));
    }

    fn on_failure(&self, transport: &TransportRef, err: &Error) {
        warn!("{}: transport {} failed, err={}", self.control.name(), transport.id(), err);
        let id = transport.id();
        self.schedule(move |s| s.remove(id));
    }
}

/// up to `pool_size` transports toward one address
///
/// frames are written to an idle transport, or queued until a transport
/// drains its output
pub struct TransportPool {
    addr: SocketAddr,
    running: AtomicBool,
    control: ControlLoop<PoolState>,
    stopped: Completion,
}

impl fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPool")
            .field("addr", &self.addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl TransportPool {
    /// spawn the pool loop, no transport is opened before the first offer
    pub fn spawn(
        addr: SocketAddr,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        on_frame: FrameHandler,
    ) -> Result<Self, Error> {
        let control = ControlLoop::spawn_with(format!("pool-{addr}"), move |control| {
            let listener = Arc::new(PoolListener {
                control: control.clone(),
                on_frame,
            });
            PoolState {
                addr,
                entries: HashMap::new(),
                queue: VecDeque::new(),
                connector,
                listener,
                control,
                config,
            }
        })?;
        Ok(TransportPool {
            addr,
            running: AtomicBool::new(true),
            control,
            stopped: Completion::new(),
        })
    }

    /// the destination
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// false once `stop` was called
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// send the frame through an idle transport or queue it
    pub fn offer(&self, frame: Frame) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::IllegalState(format!("pool {} is stopped", self.addr)));
        }
        self.control.submit(move |s| s.offer(frame))
    }

    /// stop every transport and drop the queued frames
    pub fn stop(&self) -> Completion {
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

impl Drop for TransportPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::ResultCell;
    use std::sync::{Mutex, Weak};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    struct MockTransport {
        id: TransportId,
        me: Weak<MockTransport>,
        auto_connect: bool,
        listener: Arc<dyn TransportListener>,
        written: Mutex<Vec<Frame>>,
        stopped: AtomicBool,
    }

    impl MockTransport {
        fn handle(&self) -> TransportRef {
            self.me.upgrade().unwrap()
        }
    }

    impl crate::transport::Transport for MockTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        fn start(&self) -> Result<(), Error> {
            if self.auto_connect {
                self.listener.on_connected(&self.handle());
            }
            Ok(())
        }

        fn offer(&self, frame: &Frame) -> Result<WriteStatus, Error> {
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::IllegalState("stopped".to_owned()));
            }
            self.written.lock().unwrap().push(frame.clone());
            // flushed right away
            self.listener.on_refill(&self.handle());
            Ok(WriteStatus::WasEmpty)
        }

        fn stop(&self) -> Completion {
            self.stopped.store(true, Ordering::Release);
            Completion::done()
        }
    }

    #[derive(Default)]
    struct MockConnector {
        auto_connect: bool,
        created: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockConnector {
        fn created(&self) -> Vec<Arc<MockTransport>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            _addr: SocketAddr,
            listener: Arc<dyn TransportListener>,
        ) -> Result<TransportRef, Error> {
            let t = Arc::new_cyclic(|me| MockTransport {
                id: TransportId::next(),
                me: me.clone(),
                auto_connect: self.auto_connect,
                listener,
                written: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            });
            self.created.lock().unwrap().push(t.clone());
            Ok(t)
        }
    }

    fn spawn(config: PoolConfig, auto_connect: bool) -> (TransportPool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector {
            auto_connect,
            ..Default::default()
        });
        let addr = "127.0.0.1:4000".parse().unwrap();
        let on_frame: FrameHandler = Arc::new(|_: Frame| {});
        let pool = TransportPool::spawn(addr, config, connector.clone(), on_frame).unwrap();
        (pool, connector)
    }

    // run a closure against the pool state and wait for its result
    fn query<R, F>(pool: &TransportPool, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut PoolState) -> R + Send + 'static,
    {
        let cell = ResultCell::new();
        let out = cell.clone();
        pool.control
            .submit(move |s| {
                out.set(f(s));
            })
            .unwrap();
        cell.wait(Some(WAIT)).unwrap()
    }

    fn wait_until(pool: &TransportPool, f: fn(&mut PoolState) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !query(pool, f) {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn never_opens_more_than_pool_size() {
        let config = PoolConfig {
            pool_size: 2,
            ..Default::default()
        };
        let (pool, connector) = spawn(config, false);
        for i in 0..100u32 {
            pool.offer(Frame::from_payload(&i.to_be_bytes())).unwrap();
        }
        let (entries, queued) = query(&pool, |s| (s.entries.len(), s.queue.len()));
        assert_eq!(entries, 2);
        assert_eq!(queued, 100);
        assert_eq!(connector.created().len(), 2);
    }

    #[test]
    fn queued_frames_go_out_once_connected() {
        let (pool, connector) = spawn(PoolConfig::default(), true);
        for i in 0..10u8 {
            pool.offer(Frame::from_payload(&[i])).unwrap();
        }
        wait_until(&pool, |s| {
            s.queue.is_empty() && s.entries.values().all(|e| e.idle_since.is_some())
        });
        let created = connector.created();
        assert_eq!(created.len(), 1);
        let written: Vec<u8> = created[0]
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.payload()[0])
            .collect();
        assert_eq!(written, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn idle_transport_is_evicted_only_without_activity() {
        let config = PoolConfig {
            eviction_delay: Duration::from_millis(300),
            ..Default::default()
        };
        let (pool, connector) = spawn(config, true);
        let start = Instant::now();
        pool.offer(Frame::from_payload(b"first")).unwrap();
        wait_until(&pool, |s| s.entries.values().any(|e| e.idle_since.is_some()));

        // activity before the first check is due
        thread::sleep(Duration::from_millis(150).saturating_sub(start.elapsed()));
        let touched = Instant::now();
        pool.offer(Frame::from_payload(b"second")).unwrap();

        // the first check ran and must not have evicted
        thread::sleep(Duration::from_millis(350).saturating_sub(start.elapsed()));
        assert_eq!(query(&pool, |s| s.entries.len()), 1);

        wait_until(&pool, |s| s.entries.is_empty());
        assert!(touched.elapsed() >= Duration::from_millis(300));
        let created = connector.created();
        assert_eq!(created.len(), 1);
        assert!(created[0].stopped.load(Ordering::Acquire));
        assert_eq!(created[0].written.lock().unwrap().len(), 2);
    }

    #[test]
    fn failed_transport_is_removed() {
        let (pool, connector) = spawn(PoolConfig::default(), true);
        pool.offer(Frame::from_payload(b"x")).unwrap();
        wait_until(&pool, |s| s.entries.len() == 1);

        let t = connector.created()[0].clone();
        t.listener.on_failure(&t.handle(), &Error::PeerDisconnected);
        wait_until(&pool, |s| s.entries.is_empty());
        assert!(t.stopped.load(Ordering::Acquire));

        // the next offer opens a new transport
        pool.offer(Frame::from_payload(b"y")).unwrap();
        wait_until(&pool, |s| s.entries.len() == 1);
        assert_eq!(connector.created().len(), 2);
    }

    #[test]
    fn offer_after_stop_is_illegal() {
        let (pool, connector) = spawn(PoolConfig::default(), false);
        pool.offer(Frame::from_payload(b"queued")).unwrap();
        assert_eq!(query(&pool, |s| s.queue.len()), 1);

        let done = pool.stop();
        assert!(done.wait_timeout(WAIT));
        assert!(!pool.is_running());
        assert!(connector.created()[0].stopped.load(Ordering::Acquire));

        match pool.offer(Frame::from_payload(b"late")) {
            Err(Error::IllegalState(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connector.created().len(), 1);
        // stopping twice hands back the same completion
        assert!(pool.stop().is_complete());
    }
}
