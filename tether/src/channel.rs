//! Per-connection transfer state: framed reads, FIFO writes, backpressure.
//!
//! A [`Channel`] owns one non-blocking stream and everything in flight on
//! it. Writes go straight to the socket while it accepts bytes; the
//! unwritten remainder is parked at the front of the send queue, and the
//! owning reactor flushes it in order when writability returns. Reads are
//! drained into the frame decoder until the socket runs dry.

use {
    crate::{
        error::FrameError,
        frame::{Frame, FrameDecoder},
        poller::{stream_interest, Poller},
    },
    bytes::{Buf, Bytes},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        net::TcpStream,
        os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    },
};

/// Outcome of filling the receive buffer from the socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    /// Socket drained; connection still open.
    Open,
    /// Peer closed its end. Already-buffered frames are still decodable.
    Closed,
}

/// One live connection's transfer state.
#[derive(Debug)]
pub(crate) struct Channel {
    stream: TcpStream,
    decoder: FrameDecoder,
    send_queue: VecDeque<Bytes>,
    writable: bool,
    bytes_sent: u64,
    bytes_recv: u64,
}

impl Channel {
    pub fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(max_frame_bytes),
            send_queue: VecDeque::new(),
            writable: true,
            bytes_sent: 0,
            bytes_recv: 0,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether the reactor should keep write-interest registered.
    pub fn wants_write(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv
    }

    /// Queue an encoded frame and, if the socket is currently writable,
    /// flush as much of the queue as it will take.
    pub fn enqueue(&mut self, frame: Bytes) -> io::Result<()> {
        self.send_queue.push_back(frame);
        if self.writable {
            self.flush()?;
        }
        Ok(())
    }

    /// Drain the send queue in order until it is empty or the socket
    /// stops accepting bytes. A short write leaves the remainder at the
    /// queue front, so ordering is preserved across calls.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.send_queue.front_mut() {
            match self.stream.write(front.as_ref()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.bytes_sent = self.bytes_sent.saturating_add(n as u64);
                    front.advance(n);
                    if front.is_empty() {
                        self.send_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.writable = true;
        Ok(())
    }

    /// Read everything currently available into the frame decoder.
    pub fn fill(&mut self) -> io::Result<FillOutcome> {
        let mut chunk = [0u8; 16384];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(FillOutcome::Closed),
                Ok(n) => {
                    self.bytes_recv = self.bytes_recv.saturating_add(n as u64);
                    self.decoder.extend(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FillOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Pull the next complete frame out of the receive buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.decoder.next_frame()
    }
}

/// Enqueue a frame and sync the poller's write-interest with the queue.
///
/// Any error here (write or epoll) is fatal for the connection; callers
/// tear it down.
pub(crate) fn send_on(channel: &mut Channel, poller: &Poller, frame: Bytes) -> io::Result<()> {
    channel.enqueue(frame)?;
    if channel.wants_write() {
        poller.modify(channel.as_fd(), stream_interest(true))?;
    }
    Ok(())
}

/// Flush the queue on a writability event and drop write-interest once
/// drained.
pub(crate) fn flush_on(channel: &mut Channel, poller: &Poller) -> io::Result<()> {
    channel.flush()?;
    poller.modify(channel.as_fd(), stream_interest(channel.wants_write()))?;
    Ok(())
}
