//! Socket share codec.
//!
//! Turns a listening socket into a [`ShareBlob`] addressed to one target
//! process, and turns a received blob back into a `TcpListener` inside that
//! process. On Unix the kernel socket itself travels next to the blob bytes
//! as `SCM_RIGHTS` ancillary data; the bytes describe which socket it must be
//! and who may decode it.

use crate::error::TransferError;
use crate::platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsFd, OwnedFd};

/// Opaque, process-targeted serialization of a kernel socket.
///
/// Valid only inside the process it was generated for. Never reuse a blob
/// for a second worker; generate a fresh one per target.
pub struct ShareBlob {
    bytes: Vec<u8>,
    handle: OwnedFd,
}

impl ShareBlob {
    pub fn new(bytes: Vec<u8>, handle: OwnedFd) -> Self {
        Self { bytes, handle }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn handle(&self) -> &OwnedFd {
        &self.handle
    }

    pub fn into_parts(self) -> (Vec<u8>, OwnedFd) {
        (self.bytes, self.handle)
    }
}

impl fmt::Debug for ShareBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareBlob")
            .field("len", &self.bytes.len())
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait SocketShareCodec {
    /// Produce a blob that only `target_pid` can turn back into `socket`.
    ///
    /// Fails when the target has exited or may not be addressed by us. The
    /// original socket is left untouched.
    fn serialize_for(&self, socket: &TcpListener, target_pid: u32)
        -> Result<ShareBlob, TransferError>;

    /// Reconstruct the shared socket inside the target process.
    fn deserialize(&self, blob: ShareBlob) -> Result<TcpListener, TransferError>;
}

/// What the blob bytes carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ShareManifest {
    target_pid: u32,
    inode: u64,
    local_addr: SocketAddr,
}

/// Codec backed by descriptor duplication (`dup` + `SCM_RIGHTS`).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixShareCodec;

impl UnixShareCodec {
    pub fn new() -> Self {
        Self
    }
}

impl SocketShareCodec for UnixShareCodec {
    fn serialize_for(
        &self,
        socket: &TcpListener,
        target_pid: u32,
    ) -> Result<ShareBlob, TransferError> {
        if let Err(err) = platform::probe_process(target_pid) {
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) => TransferError::PermissionDenied(target_pid),
                _ => TransferError::TargetGone(target_pid),
            });
        }

        let manifest = ShareManifest {
            target_pid,
            inode: platform::socket_inode(socket.as_fd())?,
            local_addr: socket.local_addr()?,
        };
        let bytes = bincode::serialize(&manifest)
            .map_err(|e| TransferError::Malformed(e.to_string()))?;
        let handle = socket.as_fd().try_clone_to_owned()?;

        Ok(ShareBlob::new(bytes, handle))
    }

    fn deserialize(&self, blob: ShareBlob) -> Result<TcpListener, TransferError> {
        let (bytes, handle) = blob.into_parts();
        let manifest: ShareManifest =
            bincode::deserialize(&bytes).map_err(|e| TransferError::Malformed(e.to_string()))?;

        let actual = platform::current_pid();
        if manifest.target_pid != actual {
            return Err(TransferError::WrongTarget {
                expected: manifest.target_pid,
                actual,
            });
        }

        let inode = platform::socket_inode(handle.as_fd())
            .map_err(|e| TransferError::Mismatch(e.to_string()))?;
        if inode != manifest.inode {
            return Err(TransferError::Mismatch(format!(
                "socket inode {} does not match {}",
                inode, manifest.inode
            )));
        }
        if !platform::is_listening(handle.as_fd())? {
            return Err(TransferError::Mismatch(
                "socket is not listening".to_string(),
            ));
        }

        let listener = TcpListener::from(handle);
        let local_addr = listener.local_addr()?;
        if local_addr != manifest.local_addr {
            return Err(TransferError::Mismatch(format!(
                "socket is bound to {}, expected {}",
                local_addr, manifest.local_addr
            )));
        }

        Ok(listener)
    }
}
