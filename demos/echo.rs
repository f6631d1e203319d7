use may_remoting::{
    Bincode, ClientConfig, ClientInvoker, Error, MethodId, Responder, Serializer, ServerConfig,
    ServerInvoker, Service,
};

/// answers `echo(String)` without the service macro
struct Echo;

impl Service for Echo {
    fn invoke(&self, method: &MethodId, args: &[u8], responder: Responder) -> Result<(), Error> {
        if !method.matches("echo", &["String"]) {
            return Err(Error::UnknownMethod(method.to_string()));
        }
        let (data,): (String,) = Bincode.decode(args)?;
        println!("req = {data:?}");
        responder.respond_with(&Bincode, &data);
        Ok(())
    }
}

fn main() {
    env_logger::init();
    let server = ServerInvoker::new(ServerConfig::default()).unwrap();
    server.register_service("echo", Echo).unwrap().wait();
    let addr = server.start("127.0.0.1:4000").unwrap();

    let invoker = ClientInvoker::new(ClientConfig::default()).unwrap();
    let echo = invoker.proxy(addr, "echo", Bincode);

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        let data: Result<String, _> = echo.call("echo", &["String"], &(s,));
        println!("recv = {data:?}");
    }

    invoker.stop().wait();
    server.stop().wait();
}
