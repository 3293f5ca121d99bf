//! Control-socket transport.
//!
//! Length-prefixed bincode frames over a unix stream socket. File
//! descriptors ride as `SCM_RIGHTS` ancillary data on the sendmsg carrying
//! the frame that owns them; because the socket is a stream, descriptors
//! arrive no later than the frame bytes they accompany, so a simple FIFO
//! of received descriptors keeps the association.

use crate::error::{NodeError, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::{trace, warn};

const MAX_FRAME: usize = 1 << 20;
const RECV_CHUNK: usize = 8192;
const MAX_FDS_PER_MSG: usize = 16;

/// Sending half; cheap to clone a stream handle for, so the control lock
/// can own one while the receive loop owns the other half.
pub struct ConnTx {
    stream: UnixStream,
}

impl ConnTx {
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        self.send_with_fds(msg, &[])
    }

    /// Send one frame, attaching `fds` as ancillary data.
    pub fn send_with_fds<T: Serialize>(&mut self, msg: &T, fds: &[RawFd]) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        frame.extend_from_slice(&payload);

        let iov = [IoSlice::new(&frame)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &cmsgs };

        let sent = sendmsg::<()>(self.stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .map_err(|e| NodeError::Io(e.into()))?;
        if sent < frame.len() {
            // descriptors went out with the first chunk; finish the bytes
            self.stream.write_all(&frame[sent..])?;
        }
        Ok(())
    }
}

/// Receiving half with frame reassembly and the descriptor FIFO.
pub struct ConnRx {
    stream: UnixStream,
    staging: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl ConnRx {
    /// Receive the next frame, waiting at most `timeout`. `Ok(None)` on
    /// timeout, `Err(Disconnected)` when the peer went away.
    pub fn recv<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<Option<T>> {
        loop {
            if let Some(msg) = self.try_parse()? {
                return Ok(Some(msg));
            }
            self.stream
                .set_read_timeout(Some(timeout))
                .map_err(NodeError::Io)?;

            let mut buf = [0u8; RECV_CHUNK];
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);

            let received = match recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let n = msg.bytes;
                    if let Ok(cmsgs) = msg.cmsgs() {
                        for cmsg in cmsgs {
                            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                                for fd in raw {
                                    // Safety: the kernel just handed us this
                                    // descriptor, nobody else owns it.
                                    self.fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                                }
                            }
                        }
                    }
                    n
                }
                Err(nix::errno::Errno::EAGAIN) => return Ok(None),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(NodeError::Io(e.into())),
            };
            if received == 0 {
                return Err(NodeError::Disconnected);
            }
            self.staging.extend_from_slice(&buf[..received]);
        }
    }

    /// Pop the next `n` received descriptors, in arrival order.
    pub fn take_fds(&mut self, n: usize) -> Vec<OwnedFd> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.fds.pop_front() {
                Some(fd) => out.push(fd),
                None => {
                    warn!("event expected more descriptors than were received");
                    break;
                }
            }
        }
        out
    }

    fn try_parse<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.staging.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_ne_bytes(self.staging[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME {
            return Err(NodeError::Protocol(format!("oversized frame: {len} bytes")));
        }
        if self.staging.len() < 4 + len {
            return Ok(None);
        }
        let msg = bincode::deserialize(&self.staging[4..4 + len])?;
        self.staging.drain(..4 + len);
        trace!(len, "frame received");
        Ok(Some(msg))
    }
}

/// Connect to the server's control socket and split the stream.
pub fn connect(path: &Path) -> Result<(ConnTx, ConnRx)> {
    let stream = UnixStream::connect(path)?;
    split(stream)
}

/// Wrap an already-connected stream; used by tests to talk to a mock
/// server over a socketpair.
pub fn split(stream: UnixStream) -> Result<(ConnTx, ConnRx)> {
    let rx_stream = stream.try_clone()?;
    Ok((
        ConnTx { stream },
        ConnRx {
            stream: rx_stream,
            staging: Vec::with_capacity(RECV_CHUNK),
            fds: VecDeque::new(),
        },
    ))
}
