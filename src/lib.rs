//! may_remoting is a point to point remote invocation transport based on coroutines.
//!
//! A call travels as one length prefixed frame over a pooled tcp connection and
//! its result, or the failure raised by the remote side, comes back the same way.
//!
//! ## Layers
//! - [`FrameCodec`] turns a byte channel into discrete frames and throttles
//!   producers once too much output is buffered.
//! - [`TransportPool`] keeps up to `pool_size` [`Transport`]s toward one address,
//!   queues frames while none is idle and evicts idle ones.
//! - [`ClientInvoker`] mints correlation ids, keeps the pending requests and hands
//!   out [`ServiceHandle`]s, the call-forwarding handles.
//! - [`ServerInvoker`] accepts connections and runs registered [`Service`]s on
//!   worker coroutines, answering through a [`Responder`].
//! - [`Invocation`] picks, per call, between parking the caller and delivering the
//!   result to a [`Callback`].
//!
//! Every piece of shared mutable state is owned by one control coroutine; other
//! threads only submit tasks to it.
//!
//! Example usage:
//!
//! ```rust
//! #[may_remoting::service]
//! trait Hello {
//!     /// Returns a greeting for name.
//!     fn hello(&self, name: String) -> String;
//! }
//!
//! #[derive(may_remoting::Service)]
//! #[service(Hello)]
//! struct HelloImpl;
//!
//! impl Hello for HelloImpl {
//!     fn hello(&self, name: String) -> String {
//!         format!("Hello, {name}!")
//!     }
//! }
//!
//! fn main() {
//!     use may_remoting::{ClientConfig, ClientInvoker, ServerConfig, ServerInvoker};
//!
//!     let server = ServerInvoker::new(ServerConfig::default()).unwrap();
//!     server.register_service("hello", HelloImpl).unwrap().wait();
//!     let addr = server.start("127.0.0.1:0").unwrap();
//!
//!     let invoker = ClientInvoker::new(ClientConfig::default()).unwrap();
//!     let client = HelloClient::connect(&invoker, addr, "hello");
//!     assert_eq!(client.hello("Mom".to_owned()).unwrap(), "Hello, Mom!");
//!
//!     invoker.stop().wait();
//!     server.stop().wait();
//! }
//! ```
//!

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub extern crate bincode;
#[doc(hidden)]
pub extern crate may;
pub extern crate serde;

mod client;
mod codec;
mod control;
mod errors;
mod frame;
mod pool;
mod server;
mod strategy;
mod transport;
mod waiter;

pub use client::{ClientConfig, ClientInvoker, ServiceHandle};
pub use codec::{CodecConfig, FlushStatus, FrameCodec, OutputQueue, WriteStatus};
pub use control::ExecutionQueue;
pub use errors::{Error, RemoteError};
pub use frame::{
    Frame, MethodId, RequestBuf, RequestHeader, Response, ResponseBuf, FRAME_MAX_LEN, HEADER_LEN,
};
pub use pool::{FrameHandler, PoolConfig, TransportPool};
pub use server::{
    PerCall, Responder, ServerConfig, ServerInvoker, Service, ServiceFactory, Shared,
};
pub use strategy::{Bincode, Callback, Invocation, Reply, Serializer};
pub use transport::{
    Connector, TcpConnector, TcpTransport, Transport, TransportId, TransportListener,
    TransportRef, TransportServer,
};
pub use waiter::{Completion, ResultCell};

pub use may_remoting_derive::{derive_serde, service, Service};
