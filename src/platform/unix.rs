use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::debug;

/// Prepare the execution environment of a worker child process
///
/// Between `fork` and `exec` the child makes `inherit_fd` survive `exec`,
/// joins `process_group` (or a fresh group when `None`) and, on Linux, arms
/// the parent death signal.
pub fn prepare_worker_command(cmd: &mut Command, inherit_fd: RawFd, process_group: Option<i32>) {
    let parent_pid = current_pid() as libc::pid_t;
    let pgid = process_group.unwrap_or(0);

    // Use RAII pattern to wrap unsafe operations
    unsafe {
        cmd.pre_exec(move || {
            if clear_close_on_exec(inherit_fd) != 0 {
                return Err(io::Error::last_os_error());
            }

            if set_process_group(pgid) != 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
                // The coordinator died before the death signal was armed.
                if libc::getppid() != parent_pid {
                    return Err(io::Error::from_raw_os_error(libc::ESRCH));
                }
            }
            #[cfg(not(target_os = "linux"))]
            let _ = parent_pid;

            Ok(())
        });
    }
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check that `pid` exists and may be signalled by this process
pub fn probe_process(pid: u32) -> io::Result<()> {
    send_signal(pid as libc::pid_t, 0).map_err(io::Error::from_raw_os_error)
}

/// Check if process is alive
pub fn process_alive(pid: u32) -> bool {
    match send_signal(pid as libc::pid_t, 0) {
        Ok(_) => true,                      // Signal sent successfully, process exists
        Err(errno) => errno == libc::EPERM, // EPERM means process exists but no permission
    }
}

/// Process group the given process currently belongs to
pub fn process_group_of(pid: u32) -> io::Result<i32> {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(pgid)
    }
}

/// Forcibly terminate a child process and reap it
pub fn kill_process(pid: u32) -> io::Result<()> {
    let target = Pid::from_raw(pid as i32);
    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    debug!("pid={} sent SIGKILL", pid);

    loop {
        match waitpid(target, None) {
            Ok(_) | Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Send a signal to every member of a process group
///
/// A group without members is treated as already terminated.
pub fn kill_process_group(pgid: i32, signal: Signal) -> io::Result<()> {
    match signal::killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => {
            debug!("Sent {:?} to process group {}", signal, pgid);
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Verify that `fd` is an open descriptor
pub fn descriptor_flags(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(flags)
    }
}

/// Kernel identity (inode number) of a socket descriptor
///
/// Fails with `InvalidInput` when the descriptor is not a socket.
pub fn socket_inode(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not a socket",
        ));
    }
    Ok(stat.st_ino as u64)
}

/// Whether the socket behind `fd` is in the listening state
pub fn is_listening(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value != 0)
    }
}

/// Clear `FD_CLOEXEC` so the descriptor survives `exec`
///
/// Only async-signal-safe calls; runs between `fork` and `exec`.
unsafe fn clear_close_on_exec(fd: RawFd) -> libc::c_int {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return flags;
    }
    unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) }
}

/// Safely set process group ID
///
/// Encapsulates unsafe setpgid call
unsafe fn set_process_group(pgid: libc::pid_t) -> libc::c_int {
    unsafe { libc::setpgid(0, pgid) }
}

/// Safely set parent death signal
///
/// Encapsulates unsafe prctl call
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}

/// Safely send signal
///
/// Encapsulates unsafe kill call and returns Result instead of raw error code
fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<(), libc::c_int> {
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsFd;

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(current_pid()));
        assert!(probe_process(current_pid()).is_ok());
    }

    #[test]
    fn test_listening_socket_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let inode = socket_inode(listener.as_fd()).unwrap();
        assert!(inode > 0);
        assert!(is_listening(listener.as_fd()).unwrap());

        let clone = listener.try_clone().unwrap();
        assert_eq!(socket_inode(clone.as_fd()).unwrap(), inode);
    }

    #[test]
    fn test_socket_inode_rejects_regular_files() {
        let file = tempfile::tempfile().unwrap();
        let err = socket_inode(file.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_descriptor_flags_on_closed_fd() {
        assert!(descriptor_flags(-1).is_err());
    }

    #[test]
    fn test_own_process_group() {
        let pgid = process_group_of(current_pid()).unwrap();
        assert!(pgid > 0);
    }
}
