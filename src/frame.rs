use std::fmt;
use std::io::{self, Cursor, Read, Write};

use crate::errors::{Error, RemoteError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

// Frame layout
// len(i32) + payload([u8; len])

// req payload layout
// utf8(correlation_id) + utf8(service_id) + utf8(method) + types + args([u8; ..])

// rsp payload layout
// utf8(correlation_id) + failure(u8) [+ utf8(kind) + utf8(message)] + value([u8; ..])

// utf8 layout
// len(u16) + bytes([u8; len])

/// size of the length prefix
pub const HEADER_LEN: usize = 4;

/// default max frame len, header excluded
pub const FRAME_MAX_LEN: usize = 1024 * 1024;

const NO_FAILURE: u8 = 0;
const FAILURE: u8 = 1;

/// raw frame wrapper, low level protocol
///
/// the frame keeps its length prefix so it can be queued and written
/// again without any copy
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.payload().len())
            .finish()
    }
}

impl Frame {
    /// build a frame by prefixing the payload with its length
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        Frame { data: buf.freeze() }
    }

    /// wrap bytes that already carry a valid length prefix
    pub(crate) fn from_wire(data: Bytes) -> Self {
        debug_assert!(data.len() >= HEADER_LEN);
        Frame { data }
    }

    /// the payload, length prefix excluded
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// the complete wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// total wire length, length prefix included
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// true when the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.len() == HEADER_LEN
    }
}

fn write_utf8<W: Write>(w: &mut W, s: &str) -> Result<(), Error> {
    if s.len() > u16::MAX as usize {
        return Err(Error::Serialize(format!(
            "string too long for envelope. len={}",
            s.len()
        )));
    }
    w.write_u16::<BigEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_utf8<R: Read>(r: &mut R) -> Result<String, Error> {
    let len = r.read_u16::<BigEndian>().map_err(truncated)? as usize;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|e| Error::Deserialize(e.to_string()))
}

fn truncated(e: io::Error) -> Error {
    Error::Deserialize(format!("truncated envelope: {e}"))
}

// cut a message so that it fits into an utf8 field
fn clip(s: &str) -> &str {
    if s.len() <= u16::MAX as usize {
        return s;
    }
    let mut end = u16::MAX as usize;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// patch the length prefix of an encoded frame
fn seal(mut cursor: Cursor<Vec<u8>>, max_frame_len: usize) -> Result<Frame, Error> {
    let len = cursor.get_ref().len() - HEADER_LEN;
    if len > max_frame_len {
        return Err(Error::FrameTooLarge {
            len: len as i64,
            max: max_frame_len,
        });
    }

    // write from start
    cursor.set_position(0);
    cursor.write_u32::<BigEndian>(len as u32)?;
    debug!("encode len = {:?}", len);

    Ok(Frame::from_wire(Bytes::from(cursor.into_inner())))
}

/// the method a request targets: a name plus the declared parameter types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    /// method name
    pub name: String,
    /// declared parameter types, used to tell overloads apart
    pub param_types: Vec<String>,
}

impl MethodId {
    /// create a method id
    pub fn new(name: impl Into<String>, param_types: &[&str]) -> Self {
        MethodId {
            name: name.into(),
            param_types: param_types.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    /// check the id against a method signature
    pub fn matches(&self, name: &str, param_types: &[&str]) -> bool {
        self.name == name
            && self.param_types.len() == param_types.len()
            && self.param_types.iter().zip(param_types).all(|(a, b)| a == b)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param_types.join(", "))
    }
}

/// req frame buffer that the arguments can be serialized into
pub struct RequestBuf(Cursor<Vec<u8>>);

impl RequestBuf {
    /// create a `RequestBuf` with the envelope already written
    pub fn new(
        correlation_id: &str,
        service_id: &str,
        method: &str,
        param_types: &[&str],
    ) -> Result<Self, Error> {
        let mut buf = Vec::with_capacity(128);
        // leave enough space to write the len
        buf.resize(HEADER_LEN, 0);
        let mut cursor = Cursor::new(buf);
        cursor.set_position(HEADER_LEN as u64);

        write_utf8(&mut cursor, correlation_id)?;
        write_utf8(&mut cursor, service_id)?;
        write_utf8(&mut cursor, method)?;
        if param_types.len() > u16::MAX as usize {
            return Err(Error::Serialize("too many parameters".to_owned()));
        }
        cursor.write_u16::<BigEndian>(param_types.len() as u16)?;
        for ty in param_types {
            write_utf8(&mut cursor, ty)?;
        }
        Ok(RequestBuf(cursor))
    }

    /// convert self into a frame that can be sent
    pub fn finish(self, max_frame_len: usize) -> Result<Frame, Error> {
        seal(self.0, max_frame_len)
    }
}

impl Write for RequestBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// the leading part of a request, decoded on the dispatch path
#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// id echoed back in the response
    pub correlation_id: String,
    /// target service
    pub service_id: String,
    // where the method name starts
    body: usize,
}

impl RequestHeader {
    /// decode the correlation id and the service id from a request frame
    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        let mut r = Cursor::new(frame.payload());
        let correlation_id = read_utf8(&mut r)?;
        let service_id = read_utf8(&mut r)?;
        Ok(RequestHeader {
            correlation_id,
            service_id,
            body: r.position() as usize,
        })
    }

    /// decode the method id, the rest of the payload is the argument blob
    pub fn decode_body<'a>(&self, frame: &'a Frame) -> Result<(MethodId, &'a [u8]), Error> {
        let payload = frame.payload();
        let mut r = Cursor::new(&payload[self.body..]);
        let name = read_utf8(&mut r)?;
        let count = r.read_u16::<BigEndian>().map_err(truncated)?;
        let mut param_types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            param_types.push(read_utf8(&mut r)?);
        }
        let args = self.body + r.position() as usize;
        Ok((MethodId { name, param_types }, &payload[args..]))
    }
}

/// rsp frame buffer that the returned value can be serialized into
pub struct ResponseBuf {
    cursor: Cursor<Vec<u8>>,
    // position right after the correlation id
    mark: u64,
}

impl ResponseBuf {
    /// create a `ResponseBuf` for the given call
    pub fn new(correlation_id: &str) -> Result<Self, Error> {
        let mut buf = Vec::with_capacity(64);
        buf.resize(HEADER_LEN, 0);
        let mut cursor = Cursor::new(buf);
        cursor.set_position(HEADER_LEN as u64);
        write_utf8(&mut cursor, correlation_id)?;
        let mark = cursor.position();
        Ok(ResponseBuf { cursor, mark })
    }

    /// start a successful response, the value is written afterwards
    pub fn begin_value(&mut self) -> Result<(), Error> {
        self.cursor.write_u8(NO_FAILURE)?;
        Ok(())
    }

    /// drop everything written after the correlation id
    pub fn rewind(&mut self) {
        self.cursor.get_mut().truncate(self.mark as usize);
        self.cursor.set_position(self.mark);
    }

    /// write the failure slot, the value stays empty
    pub fn write_failure(&mut self, failure: &RemoteError) -> Result<(), Error> {
        self.cursor.write_u8(FAILURE)?;
        write_utf8(&mut self.cursor, clip(&failure.kind))?;
        write_utf8(&mut self.cursor, clip(&failure.message))?;
        Ok(())
    }

    /// payload length written so far
    pub fn len(&self) -> usize {
        self.cursor.get_ref().len() - HEADER_LEN
    }

    /// true when nothing but the header is written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// convert self into a frame that can be sent
    pub fn finish(self, max_frame_len: usize) -> Result<Frame, Error> {
        seal(self.cursor, max_frame_len)
    }
}

impl Write for ResponseBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// a decoded response frame
#[derive(Debug)]
pub struct Response {
    /// id of the call this response belongs to
    pub correlation_id: String,
    /// the returned value blob, or the remote failure
    pub result: Result<Bytes, RemoteError>,
}

impl Response {
    /// decode a response from the frame
    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        let mut r = Cursor::new(frame.payload());
        let correlation_id = read_utf8(&mut r)?;
        let ty = r.read_u8().map_err(truncated)?;
        let result = match ty {
            NO_FAILURE => {
                let start = HEADER_LEN + r.position() as usize;
                Ok(frame.data.slice(start..))
            }
            FAILURE => {
                let kind = read_utf8(&mut r)?;
                let message = read_utf8(&mut r)?;
                Err(RemoteError { kind, message })
            }
            _ => {
                let s = format!("invalid response type. ty={ty}");
                error!("{s}");
                return Err(Error::Deserialize(s));
            }
        };
        Ok(Response {
            correlation_id,
            result,
        })
    }
}
