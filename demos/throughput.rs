#[macro_use]
extern crate may;

use std::time::{Duration, Instant};

use may_remoting::{ClientConfig, ClientInvoker, PoolConfig, ServerConfig, ServerInvoker};

#[may_remoting::service]
trait RpcSpec {
    fn ack(&self);
}

#[derive(may_remoting::Service)]
#[service(RpcSpec)]
struct Server;

impl RpcSpec for Server {
    fn ack(&self) {}
}

fn main() {
    env_logger::init();
    may::config().set_workers(2);

    let server = ServerInvoker::new(ServerConfig::default()).unwrap();
    server.register_service("ack", Server).unwrap().wait();
    let addr = server.start("127.0.0.1:4000").unwrap();

    let config = ClientConfig {
        pool: PoolConfig {
            pool_size: 4,
            eviction_delay: Duration::from_secs(5),
            ..Default::default()
        },
        ..Default::default()
    };
    let invoker = ClientInvoker::new(config).unwrap();
    let client = RpcSpecClient::connect(&invoker, addr, "ack");

    let mut vec = vec![];
    let now = Instant::now();
    for _i in 0..100 {
        let client = client.clone();
        let h = go!(move || {
            for _j in 0..10000 {
                if let Err(err) = client.ack() {
                    println!("recv err = {err:?}");
                }
            }
        });
        vec.push(h);
    }

    for h in vec {
        h.join().unwrap();
    }

    let dur = now.elapsed().as_secs_f32();
    println!("{} rpc/second", 1_000_000.0 / dur);

    invoker.stop().wait();
    server.stop().wait();
}
