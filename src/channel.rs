//! Handle-transfer channel.
//!
//! A private, one-shot, one-directional channel between the coordinator and a
//! single worker, built on a Unix-domain stream socket pair. Framing on the
//! byte stream is a `u32` little-endian length followed by that many blob
//! bytes; the shared socket rides as `SCM_RIGHTS` ancillary data on the
//! length prefix. There is no resynchronization, so every short read or
//! write is a hard failure.

use crate::codec::ShareBlob;
use crate::error::TransferError;
use crate::platform;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Largest blob accepted by a reader.
pub const MAX_BLOB_LEN: u32 = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Open a fresh channel.
///
/// Both ends are close-on-exec in this process; the spawner clears the flag
/// on the readable end only inside the intended child. `timeout` bounds
/// every blocking read or write, `None` waits forever.
pub fn create(
    timeout: Option<Duration>,
) -> Result<(ChannelReader, ChannelWriter), TransferError> {
    let (read_end, write_end) = UnixStream::pair()?;
    let reader = ChannelReader::new(read_end);
    let writer = ChannelWriter::new(write_end);
    reader.set_timeout(timeout)?;
    writer.set_timeout(timeout)?;
    Ok((reader, writer))
}

/// Writable end, used exactly once by the coordinator.
#[derive(Debug)]
pub struct ChannelWriter {
    stream: UnixStream,
}

impl ChannelWriter {
    fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), TransferError> {
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Send one framed blob and close the channel.
    ///
    /// Returns the number of blob bytes written after the prefix.
    pub fn send(mut self, blob: ShareBlob) -> Result<usize, TransferError> {
        let (bytes, handle) = blob.into_parts();
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        if len > MAX_BLOB_LEN {
            return Err(TransferError::Oversized(len));
        }

        self.send_prefix(len, handle.as_fd())?;
        self.write_complete(&bytes)?;
        Ok(bytes.len())
    }

    fn send_prefix(&mut self, len: u32, handle: BorrowedFd<'_>) -> Result<(), TransferError> {
        let prefix = len.to_le_bytes();
        let fds = [handle.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(&prefix)];

        let sent = loop {
            match sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
                Ok(sent) => break sent,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(TransferError::TimedOut),
                Err(e) => return Err(io::Error::from(e).into()),
            }
        };

        if sent != LENGTH_PREFIX {
            return Err(TransferError::ShortWrite {
                expected: LENGTH_PREFIX,
                written: sent,
            });
        }
        Ok(())
    }

    /// A single write that must take every byte.
    fn write_complete(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let written = loop {
            match self.stream.write(bytes) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_timeout(e)),
            }
        };
        if written != bytes.len() {
            return Err(TransferError::ShortWrite {
                expected: bytes.len(),
                written,
            });
        }
        Ok(())
    }
}

/// Readable end; in a worker it is the descriptor inherited from the
/// coordinator.
#[derive(Debug)]
pub struct ChannelReader {
    stream: UnixStream,
}

impl ChannelReader {
    fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Take ownership of the channel descriptor inherited at spawn time.
    ///
    /// Rejects the standard streams, closed descriptors and anything that is
    /// not a socket.
    pub fn from_inherited(fd: RawFd) -> Result<Self, TransferError> {
        if fd <= libc::STDERR_FILENO {
            return Err(TransferError::InvalidDescriptor {
                fd,
                source: io::Error::new(io::ErrorKind::InvalidInput, "standard stream"),
            });
        }
        platform::descriptor_flags(fd)
            .map_err(|source| TransferError::InvalidDescriptor { fd, source })?;

        // SAFETY: the descriptor is open and was handed to this process by the
        // coordinator for its exclusive use; nothing else in the process owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        platform::socket_inode(owned.as_fd())
            .map_err(|source| TransferError::InvalidDescriptor { fd, source })?;

        Ok(Self::from(owned))
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), TransferError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Read one framed blob and close the channel.
    pub fn receive(mut self) -> Result<ShareBlob, TransferError> {
        let (len, handle) = self.receive_prefix()?;
        if len > MAX_BLOB_LEN {
            return Err(TransferError::Oversized(len));
        }
        let bytes = self.read_exact_bytes(len as usize)?;
        let handle = handle.ok_or(TransferError::MissingHandle)?;
        Ok(ShareBlob::new(bytes, handle))
    }

    fn receive_prefix(&mut self) -> Result<(u32, Option<OwnedFd>), TransferError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

        let (received, handle) = loop {
            let mut iov = [IoSliceMut::new(&mut prefix)];
            match recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                RECV_FLAGS,
            ) {
                Ok(msg) => {
                    let mut handle = None;
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            for fd in fds {
                                // SAFETY: SCM_RIGHTS installed a fresh descriptor we now own.
                                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                                if handle.is_none() {
                                    handle = Some(owned);
                                }
                            }
                        }
                    }
                    break (msg.bytes, handle);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(TransferError::TimedOut),
                Err(e) => return Err(io::Error::from(e).into()),
            }
        };

        if received == 0 {
            return Err(TransferError::ShortRead {
                expected: LENGTH_PREFIX,
                received: 0,
            });
        }
        if received < LENGTH_PREFIX {
            self.fill(&mut prefix[received..], LENGTH_PREFIX, received)?;
        }

        Ok((u32::from_le_bytes(prefix), handle))
    }

    /// Read exactly `n` bytes or fail.
    pub fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransferError> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf, n, 0)?;
        Ok(buf)
    }

    /// Fill `buf`, reporting short reads against the frame section of
    /// `expected` bytes of which `already` were read before.
    fn fill(
        &mut self,
        buf: &mut [u8],
        expected: usize,
        already: usize,
    ) -> Result<(), TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(TransferError::ShortRead {
                        expected,
                        received: already + filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_timeout(e)),
            }
        }
        Ok(())
    }
}

impl From<OwnedFd> for ChannelReader {
    fn from(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }
}

impl AsRawFd for ChannelReader {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for ChannelReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn map_timeout(err: io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransferError::TimedOut,
        _ => TransferError::Io(err),
    }
}
