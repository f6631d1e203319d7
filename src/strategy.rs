//! How a call is encoded and how its result reaches the caller.
use std::fmt;
use std::io::Write;

use crate::control::ExecutionQueue;
use crate::errors::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// pluggable body (de)serialization
///
/// the envelope is always written by the invokers, a serializer only sees
/// the argument tuple and the returned value
pub trait Serializer: Clone + Send + Sync + 'static {
    /// serialize the value into the writer
    fn encode_into<W, T>(&self, writer: W, value: &T) -> Result<(), Error>
    where
        W: Write,
        T: Serialize + ?Sized;

    /// deserialize a value from the bytes
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error>;
}

/// the default serializer, bincode with its default options
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl Serializer for Bincode {
    fn encode_into<W, T>(&self, writer: W, value: &T) -> Result<(), Error>
    where
        W: Write,
        T: Serialize + ?Sized,
    {
        bincode::serialize_into(writer, value).map_err(|e| Error::Serialize(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

/// receives the outcome of an async call
pub trait Callback<T>: Send + 'static {
    /// the call returned a value
    fn on_success(self: Box<Self>, value: T);
    /// the call failed locally or remotely
    fn on_failure(self: Box<Self>, err: Error);
}

impl<T, F> Callback<T> for F
where
    F: FnOnce(Result<T, Error>) + Send + 'static,
{
    fn on_success(self: Box<Self>, value: T) {
        (*self)(Ok(value))
    }

    fn on_failure(self: Box<Self>, err: Error) {
        (*self)(Err(err))
    }
}

/// the invocation discipline of one call
pub enum Invocation<T> {
    /// park the caller until the result is there
    Blocking,
    /// return right away, the callback gets the result
    Async {
        /// receives the result
        callback: Box<dyn Callback<T>>,
        /// where the callback runs, a fresh coroutine when `None`
        queue: Option<ExecutionQueue>,
    },
}

impl<T> Invocation<T> {
    /// async invocation with the callback run on a fresh coroutine
    pub fn callback<C: Callback<T>>(callback: C) -> Self {
        Invocation::Async {
            callback: Box::new(callback),
            queue: None,
        }
    }

    /// async invocation with the callback run on the queue
    pub fn queued<C: Callback<T>>(callback: C, queue: ExecutionQueue) -> Self {
        Invocation::Async {
            callback: Box::new(callback),
            queue: Some(queue),
        }
    }
}

impl<T> fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Blocking => f.write_str("Blocking"),
            Invocation::Async { queue, .. } => f
                .debug_struct("Async")
                .field("queue", queue)
                .finish_non_exhaustive(),
        }
    }
}

/// what an invocation gives back to the caller
#[derive(Debug, PartialEq, Eq)]
pub enum Reply<T> {
    /// blocking invocation result
    Value(T),
    /// async invocation was sent, the callback takes it from here
    Dispatched,
}

impl<T> Reply<T> {
    /// the value of a blocking invocation
    pub fn into_value(self) -> Option<T> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::Dispatched => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn bincode_round_trips_argument_tuples() {
        let mut buf = Vec::new();
        Bincode
            .encode_into(&mut buf, &("hi".to_owned(), 7u32))
            .unwrap();
        let (s, n): (String, u32) = Bincode.decode(&buf).unwrap();
        assert_eq!((s.as_str(), n), ("hi", 7));
        assert!(matches!(
            Bincode.decode::<String>(&buf[..2]),
            Err(Error::Deserialize(_))
        ));
    }

    #[test]
    fn closures_are_callbacks() {
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let ok: Box<dyn Callback<u8>> = Box::new(move |r: Result<u8, Error>| {
            tx.send(r.map_err(|e| e.to_string())).unwrap();
        });
        ok.on_success(3);
        let err: Box<dyn Callback<u8>> = Box::new(move |r: Result<u8, Error>| {
            tx2.send(r.map_err(|e| e.to_string())).unwrap();
        });
        err.on_failure(Error::Timeout);
        assert_eq!(rx.recv().unwrap(), Ok(3));
        assert!(rx.recv().unwrap().is_err());
    }
}
