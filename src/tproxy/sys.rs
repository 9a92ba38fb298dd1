//! Thin wrappers over the libc calls the supervisor needs. Everything unsafe
//! lives here.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

pub fn fork() -> io::Result<Fork> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

pub fn getppid() -> libc::pid_t {
    unsafe { libc::getppid() }
}

pub fn getpgrp() -> libc::pid_t {
    unsafe { libc::getpgrp() }
}

pub fn kill(pid: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    cvt(unsafe { libc::kill(pid, sig) }).map(|_| ())
}

/// True when the pid names a live process we may signal.
pub fn process_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Reap one exited child without blocking. `Ok(None)` when there is nothing
/// to reap. The second element is the exit code when the child exited
/// normally.
pub fn reap_one() -> io::Result<Option<(libc::pid_t, Option<i32>)>> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid == 0 {
        return Ok(None);
    }
    if pid < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ECHILD) {
            return Ok(None);
        }
        return Err(err);
    }
    let code = if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    };
    Ok(Some((pid, code)))
}

/// Non-blocking close-on-exec pipe pair.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })?;
    Ok((fds[0], fds[1]))
}

/// Best-effort single-byte write; EAGAIN and EINTR are swallowed.
pub fn write_byte(fd: RawFd, byte: u8) {
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

/// Drain everything currently readable from a non-blocking fd.
pub fn drain_bytes(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

/// Wait until the fd is readable or the timeout elapses. Returns whether it
/// became readable.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if res < 0 {
        let err = io::Error::last_os_error();
        // A signal interrupting the poll is itself a wake-up.
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(true);
        }
        return Err(err);
    }
    Ok(res > 0)
}

pub type SignalHandler = extern "C" fn(libc::c_int);

pub fn install_signal_handler(signo: libc::c_int, handler: SignalHandler) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        cvt(libc::sigaction(signo, &sa, std::ptr::null_mut())).map(|_| ())
    }
}

pub fn reset_signal(signo: libc::c_int) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        cvt(libc::sigaction(signo, &sa, std::ptr::null_mut())).map(|_| ())
    }
}

pub fn close_on_exec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }).map(|_| ())
}

/// Duplicate an fd. The duplicate does not carry close-on-exec, which is what
/// a live re-exec needs.
pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    cvt(unsafe { libc::dup(fd) })
}

pub fn fchmod(fd: RawFd, mode: libc::mode_t) -> io::Result<()> {
    cvt(unsafe { libc::fchmod(fd, mode) }).map(|_| ())
}

/// Seconds component of the fd's last status change time.
pub fn change_secs(fd: RawFd) -> io::Result<i64> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st.st_ctime)
}

/// Status change time with nanosecond resolution, for tests and tight
/// comparisons.
pub fn change_time(fd: RawFd) -> io::Result<(i64, i64)> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut st) })?;
    Ok((st.st_ctime, st.st_ctime_nsec))
}

pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

/// Set group then user of the current process.
pub fn set_owner_process(uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    if let Some(gid) = gid {
        cvt(unsafe { libc::setgid(gid as libc::gid_t) })?;
    }
    if let Some(uid) = uid {
        cvt(unsafe { libc::setuid(uid as libc::uid_t) })?;
    }
    Ok(())
}

pub fn uid_for_user(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    Some(unsafe { (*pw).pw_uid })
}

pub fn gid_for_group(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        return None;
    }
    Some(unsafe { (*gr).gr_gid })
}

/// Update the process title as seen in ps/top.
pub fn set_proctitle(title: &str) {
    #[cfg(target_os = "linux")]
    {
        let full = format!("tproxy: {title}");
        if let Ok(cstr) = CString::new(&full.as_bytes()[..full.len().min(15)]) {
            unsafe {
                libc::prctl(
                    libc::PR_SET_NAME,
                    cstr.as_ptr() as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = title;
    }
}

/// Standard daemonization. Skipped when the process was handed a listener
/// over `TPROXY_FD` (it is already a child of a running master).
pub fn daemonize() -> io::Result<()> {
    if std::env::var_os(super::net::TPROXY_FD_ENV).is_some() {
        return Ok(());
    }

    match fork()? {
        Fork::Parent(_) => unsafe { libc::_exit(0) },
        Fork::Child => {}
    }
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }
    match fork()? {
        Fork::Parent(_) => unsafe { libc::_exit(0) },
        Fork::Child => {}
    }

    umask(0);

    let dev_null = File::options().read(true).write(true).open("/dev/null")?;
    for std_fd in 0..=2 {
        cvt(unsafe { libc::dup2(dev_null.as_raw_fd(), std_fd) })?;
    }
    Ok(())
}

/// Replace the current image. Only returns on failure.
pub fn execvp(args: &[OsString]) -> io::Error {
    let cargs: Vec<CString> = args
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();
    if cargs.is_empty() {
        return io::Error::new(io::ErrorKind::InvalidInput, "empty argv");
    }
    let mut ptrs: Vec<*const libc::c_char> = cargs.iter().map(|a| a.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    unsafe {
        libc::execvp(ptrs[0], ptrs.as_ptr());
    }
    io::Error::last_os_error()
}

pub fn listener_from_fd(fd: RawFd) -> io::Result<TcpListener> {
    // Adopt the inherited fd; ENOTCONN-style failures surface on first use.
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Create, bind and listen with `SO_REUSEADDR` and an explicit backlog.
pub fn bind_listener(addr: &SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = cvt(unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;

    let (storage, len) = sockaddr_from(addr);
    cvt(unsafe {
        libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
    })?;
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(listener)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_wakeup_round_trip() {
        let (r, w) = pipe().unwrap();
        assert!(!wait_readable(r, 0).unwrap());
        write_byte(w, libc::SIGHUP as u8);
        assert!(wait_readable(r, 100).unwrap());
        assert_eq!(drain_bytes(r), vec![libc::SIGHUP as u8]);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn bind_listener_accepts_connections() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ln = bind_listener(&addr, 16).unwrap();
        let local = ln.local_addr().unwrap();
        let client = std::net::TcpStream::connect(local).unwrap();
        let (_sock, peer) = ln.accept().unwrap();
        assert_eq!(peer.ip(), client.local_addr().unwrap().ip());
    }

    #[test]
    fn fchmod_advances_change_time() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tproxy-sys-test-{}", std::process::id()));
        let file = File::create(&path).unwrap();
        let before = change_time(file.as_raw_fd()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fchmod(file.as_raw_fd(), 1).unwrap();
        let after = change_time(file.as_raw_fd()).unwrap();
        assert!(after > before);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(getpid()));
        assert!(!process_alive(-libc::pid_t::MAX));
    }
}
