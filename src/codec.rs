//! Length prefixed framing over a byte channel.
//!
//! The codec never waits for a complete frame: `read` hands out a frame once
//! enough bytes are buffered and `None` otherwise, `write` only buffers, and
//! `flush` pushes whatever the channel accepts.
use std::io::{ErrorKind, Read, Write};

use crate::errors::Error;
use crate::frame::{Frame, FRAME_MAX_LEN, HEADER_LEN};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};

/// buffer sizing of a [`FrameCodec`]
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// initial capacity of every buffer, a quarter of it is the write high-water mark
    pub capacity: usize,
    /// max accepted payload length
    pub max_frame_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            capacity: 1024 * 32,
            max_frame_len: FRAME_MAX_LEN,
        }
    }
}

/// outcome of [`FrameCodec::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// nothing was buffered before this frame, a flush must be scheduled
    WasEmpty,
    /// buffered data is above the high-water mark, producers should back off
    Full,
    /// the frame joined data that is already waiting
    NotEmpty,
}

/// outcome of [`FrameCodec::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// everything buffered reached the channel
    Empty,
    /// some data is still buffered
    NotEmpty,
}

/// producer side of an outbound byte stream
///
/// frames are appended under a short lock while a single flusher swaps the
/// accumulated bytes out and writes them without holding it
#[derive(Debug)]
pub struct OutputQueue {
    pending: BytesMut,
    // bytes handed to the flusher by the last `swap`
    in_flight: usize,
    high_water: usize,
}

impl OutputQueue {
    /// create an empty queue
    pub fn new(config: &CodecConfig) -> Self {
        OutputQueue {
            pending: BytesMut::with_capacity(config.capacity),
            in_flight: 0,
            high_water: config.capacity / 4,
        }
    }

    /// bytes waiting or being written
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.in_flight
    }

    /// append a frame
    pub fn push(&mut self, frame: &Frame) -> WriteStatus {
        let was_empty = self.buffered() == 0;
        reserve_doubling(&mut self.pending, frame.len());
        self.pending.extend_from_slice(frame.as_bytes());

        if was_empty {
            WriteStatus::WasEmpty
        } else if self.buffered() > self.high_water {
            WriteStatus::Full
        } else {
            WriteStatus::NotEmpty
        }
    }

    /// exchange the accumulated bytes with the flusher's drained buffer
    ///
    /// returns false when nothing was accumulated, the queue counts as empty
    /// from then on
    pub fn swap(&mut self, drained: &mut BytesMut) -> bool {
        drained.clear();
        std::mem::swap(&mut self.pending, drained);
        self.in_flight = drained.len();
        !drained.is_empty()
    }
}

/// frame codec on top of a readable/writable channel
#[derive(Debug)]
pub struct FrameCodec<C> {
    channel: C,
    config: CodecConfig,
    // the buffer being flushed
    active: BytesMut,
    // frames accumulated while `active` is flushed
    output: OutputQueue,
    read_buf: BytesMut,
}

// grow the buffer by doubling until `additional` more bytes fit
fn reserve_doubling(buf: &mut BytesMut, additional: usize) {
    let needed = buf.len() + additional;
    if needed <= buf.capacity() {
        return;
    }
    let mut capacity = buf.capacity().max(HEADER_LEN);
    while capacity < needed {
        capacity *= 2;
    }
    buf.reserve(capacity - buf.len());
}

impl<C: Read + Write> FrameCodec<C> {
    /// wrap the channel
    pub fn new(channel: C, config: CodecConfig) -> Self {
        FrameCodec {
            channel,
            active: BytesMut::with_capacity(config.capacity),
            output: OutputQueue::new(&config),
            read_buf: BytesMut::with_capacity(config.capacity),
            config,
        }
    }

    /// the wrapped channel
    pub fn get_ref(&self) -> &C {
        &self.channel
    }

    /// bytes buffered and not yet written to the channel
    pub fn buffered(&self) -> usize {
        self.active.len() + self.output.pending.len()
    }

    /// buffer a frame for writing
    pub fn write(&mut self, frame: &Frame) -> WriteStatus {
        self.output.push(frame)
    }

    /// push buffered data to the channel
    pub fn flush(&mut self) -> Result<FlushStatus, Error> {
        if self.active.is_empty() {
            self.output.swap(&mut self.active);
        }

        while !self.active.is_empty() {
            match self.channel.write(&self.active) {
                Ok(0) => return Err(Error::Io(ErrorKind::WriteZero.into())),
                Ok(n) => self.active.advance(n),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::NotEmpty)
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.channel.flush()?;

        // the accumulated frames go out with the next flush
        if self.output.swap(&mut self.active) {
            Ok(FlushStatus::NotEmpty)
        } else {
            Ok(FlushStatus::Empty)
        }
    }

    /// read one frame, `None` if not enough data is available yet
    pub fn read(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(frame) = self.decode()? {
            return Ok(Some(frame));
        }

        if self.read_buf.len() == self.read_buf.capacity() {
            // out of room: compacts when the consumed head is large enough,
            // otherwise doubles
            let capacity = self.read_buf.capacity().max(self.config.capacity);
            self.read_buf.reserve(capacity);
        }

        // one read fills at most `capacity` bytes of the free room
        let start = self.read_buf.len();
        let window = (self.read_buf.capacity() - start).min(self.config.capacity.max(1));
        self.read_buf.resize(start + window, 0);
        let n = match self.channel.read(&mut self.read_buf[start..]) {
            Ok(n) => n,
            Err(e) => {
                self.read_buf.truncate(start);
                return match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(None),
                    _ => Err(e.into()),
                };
            }
        };
        self.read_buf.truncate(start + n);

        if n == 0 {
            return Err(Error::PeerDisconnected);
        }
        self.decode()
    }

    fn decode(&mut self) -> Result<Option<Frame>, Error> {
        if self.read_buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = BigEndian::read_i32(&self.read_buf[..HEADER_LEN]);
        if len < 0 || len as usize > self.config.max_frame_len {
            let err = Error::FrameTooLarge {
                len: len as i64,
                max: self.config.max_frame_len,
            };
            error!("decode frame: {err}");
            return Err(err);
        }

        let total = HEADER_LEN + len as usize;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        let data = self.read_buf.split_to(total).freeze();
        debug!("decode len = {:?}", len);
        Ok(Some(Frame::from_wire(data)))
    }
}
