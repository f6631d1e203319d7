use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use may::coroutine;
use may_remoting::{
    Bincode, ClientConfig, ClientInvoker, CodecConfig, Completion, Error, ExecutionQueue, Frame,
    FrameCodec, FrameHandler, MethodId, PoolConfig, RequestBuf, Responder, Response, Serializer,
    ServerConfig, ServerInvoker, Service, TcpConnector, TransportPool, FRAME_MAX_LEN,
};

const WAIT: Duration = Duration::from_secs(5);

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        may::config().set_stack_size(0x10000);
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[may_remoting::service]
trait Calc {
    /// add two u32
    fn add(&self, x: u32, y: u32) -> u32;
    /// sleep for `ms` then hand the tag back
    fn delay(&self, ms: u64, tag: u32) -> u32;
    /// always panics
    fn explode(&self);
}

#[derive(may_remoting::Service)]
#[service(Calc)]
struct CalcImpl;

impl Calc for CalcImpl {
    fn add(&self, x: u32, y: u32) -> u32 {
        x + y
    }

    fn delay(&self, ms: u64, tag: u32) -> u32 {
        coroutine::sleep(Duration::from_millis(ms));
        tag
    }

    fn explode(&self) {
        panic!("kaboom")
    }
}

/// hand written service without the macro
struct Echo;

impl Service for Echo {
    fn invoke(&self, method: &MethodId, args: &[u8], responder: Responder) -> Result<(), Error> {
        if method.matches("echo", &["String"]) {
            let (s,): (String,) = Bincode.decode(args)?;
            responder.respond_with(&Bincode, &s);
            Ok(())
        } else if method.matches("fail", &[]) {
            Err(Error::invocation("boom"))
        } else {
            Err(Error::UnknownMethod(method.to_string()))
        }
    }
}

fn start_server() -> (ServerInvoker, SocketAddr) {
    setup();
    let server = ServerInvoker::new(ServerConfig::default()).unwrap();
    server.register_service("echo", Echo).unwrap().wait();
    server.register_service("calc", CalcImpl).unwrap().wait();
    let addr = server.start("127.0.0.1:0").unwrap();
    (server, addr)
}

fn client(config: ClientConfig) -> ClientInvoker {
    let invoker = ClientInvoker::new(config).unwrap();
    assert!(invoker.start().is_complete());
    invoker
}

#[test]
fn raw_request_gets_its_echo() {
    let (server, addr) = start_server();

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    let mut req = RequestBuf::new("abc", "echo", "echo", &["String"]).unwrap();
    Bincode.encode_into(&mut req, &("hi",)).unwrap();
    let frame = req.finish(FRAME_MAX_LEN).unwrap();
    stream.write_all(frame.as_bytes()).unwrap();

    let mut codec = FrameCodec::new(stream, CodecConfig::default());
    let deadline = Instant::now() + WAIT;
    let frame = loop {
        if let Some(frame) = codec.read().unwrap() {
            break frame;
        }
        assert!(Instant::now() < deadline, "no response");
    };
    let rsp = Response::decode(&frame).unwrap();
    assert_eq!(rsp.correlation_id, "abc");
    let value: String = Bincode.decode(&rsp.result.unwrap()).unwrap();
    assert_eq!(value, "hi");

    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn blocking_calls_through_a_handle() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig::default());
    let echo = invoker.proxy(addr, "echo", Bincode);

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        let value: String = echo.call("echo", &["String"], &(s.as_str(),)).unwrap();
        assert_eq!(value, s);
    }

    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn remote_failures_reach_the_caller() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig::default());
    let echo = invoker.proxy(addr, "echo", Bincode);

    match echo.call::<_, String>("fail", &[], &()) {
        Err(Error::Remote(e)) => {
            assert_eq!(e.kind, "application");
            assert_eq!(e.message, "boom");
        }
        other => panic!("unexpected {other:?}"),
    }

    let calc = CalcClient::connect(&invoker, addr, "calc");
    match calc.explode() {
        Err(Error::Remote(e)) => {
            assert_eq!(e.kind, "panic");
            assert_eq!(e.message, "kaboom");
        }
        other => panic!("unexpected {other:?}"),
    }

    match echo.call::<_, String>("nope", &[], &()) {
        Err(Error::Remote(e)) => assert_eq!(e.kind, "unknown-method"),
        other => panic!("unexpected {other:?}"),
    }

    let ghost = invoker.proxy(addr, "ghost", Bincode);
    match ghost.call::<_, String>("echo", &["String"], &("hi",)) {
        Err(Error::Remote(e)) => assert_eq!(e.kind, "unknown-service"),
        other => panic!("unexpected {other:?}"),
    }

    // the connection survives failed calls
    assert_eq!(calc.add(1, 2).unwrap(), 3);
    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn concurrent_calls_resolve_out_of_order() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig::default());
    let calc = CalcClient::connect(&invoker, addr, "calc");

    // the first callers wait the longest
    let handles: Vec<_> = (0..50u32)
        .map(|i| {
            let calc = calc.clone();
            may::go!(move || {
                let ms = u64::from(50 - i) * 2;
                assert_eq!(calc.delay(ms, i).unwrap(), i);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn async_callbacks_on_an_execution_queue() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig::default());
    let calc = CalcClient::connect(&invoker, addr, "calc");

    // fresh coroutine delivery
    let (tx, rx) = mpsc::channel();
    calc.add_async(1, 2, move |r: Result<u32, Error>| {
        tx.send(r.map_err(|e| e.to_string())).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(3));

    // queued delivery
    let queue = ExecutionQueue::new("calc-callbacks").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Completion::new();
    for i in 0..20u32 {
        let seen = seen.clone();
        let done = done.clone();
        calc.handle()
            .call_async(
                "add",
                &["u32", "u32"],
                &(i, 1u32),
                move |r: Result<u32, Error>| {
                    let mut seen = seen.lock().unwrap();
                    seen.push(r.unwrap());
                    if seen.len() == 20 {
                        done.signal();
                    }
                },
                Some(queue.clone()),
            )
            .unwrap();
    }
    assert!(done.wait_timeout(WAIT));
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (1..21).collect::<Vec<_>>());
    queue.shutdown();

    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn late_response_after_timeout_is_dropped() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let calc = CalcClient::connect(&invoker, addr, "calc");

    assert!(matches!(calc.delay(300, 1), Err(Error::Timeout)));
    // the late response of the first call must not satisfy this one
    assert_eq!(calc.delay(0, 2).unwrap(), 2);
    coroutine::sleep(Duration::from_millis(300));
    assert_eq!(calc.delay(0, 3).unwrap(), 3);

    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(server.stop().wait_timeout(WAIT));
}

#[test]
fn calls_after_stop_are_rejected() {
    let (server, addr) = start_server();

    let connector = Arc::new(TcpConnector::new(CodecConfig::default()));
    let on_frame: FrameHandler = Arc::new(|_: Frame| {});
    let pool = TransportPool::spawn(addr, PoolConfig::default(), connector, on_frame).unwrap();
    pool.offer(Frame::from_payload(b"ignored by the server")).unwrap();
    assert!(pool.stop().wait_timeout(WAIT));
    assert!(matches!(
        pool.offer(Frame::from_payload(b"late")),
        Err(Error::IllegalState(_))
    ));

    let invoker = client(ClientConfig::default());
    let calc = CalcClient::connect(&invoker, addr, "calc");
    assert_eq!(calc.add(2, 2).unwrap(), 4);
    assert!(invoker.stop().wait_timeout(WAIT));
    assert!(matches!(calc.add(2, 2), Err(Error::IllegalState(_))));

    assert!(server.stop().wait_timeout(WAIT));
    assert!(matches!(
        server.start("127.0.0.1:0"),
        Err(Error::IllegalState(_))
    ));
}

fn assert_closed(stream: &mut std::net::TcpStream) {
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "unexpected data"),
        Err(e) => assert!(
            !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            "connection still open"
        ),
    }
}

#[test]
fn server_stops_with_open_connections() {
    let (server, addr) = start_server();
    let invoker = client(ClientConfig::default());
    let calc = CalcClient::connect(&invoker, addr, "calc");
    assert_eq!(calc.add(1, 1).unwrap(), 2);

    let mut idle = std::net::TcpStream::connect(addr).unwrap();
    // both connections sit idle on the server
    thread::sleep(Duration::from_millis(300));
    assert!(server.stop().wait_timeout(WAIT));
    assert_closed(&mut idle);

    assert!(invoker.stop().wait_timeout(WAIT));
}
