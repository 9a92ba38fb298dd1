use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::config::Config;
use super::net;
use super::pidfile::Pidfile;
use super::sys::{self, Fork};
use super::worker::{Worker, WorkerError, WorkerTmp};

/// Exit code a worker uses to report it could not boot. Escalates to a full
/// halt to avoid infinite start/stop cycles.
pub const WORKER_BOOT_ERROR: i32 = 3;

const SIG_QUEUE_LIMIT: usize = 5;

/// Signals routed through the queue. SIGCHLD is handled separately: it only
/// wakes the master up.
const QUEUED_SIGNALS: [libc::c_int; 9] = [
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
];

/// Carried through the main loop to trigger shutdown with a reason and exit
/// status.
#[derive(Debug, Error)]
#[error("halting: {}", reason.as_deref().unwrap_or("signal"))]
pub struct HaltServer {
    pub reason: Option<String>,
    pub exit_status: i32,
}

/// Write end of the self-pipe, shared with the signal handler.
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = WAKEUP_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        sys::write_byte(fd, signo as u8);
    }
}

struct WorkerRecord {
    age: u64,
    tmp: File,
}

struct StartCtx {
    cwd: PathBuf,
    args: Vec<OsString>,
}

impl StartCtx {
    /// Prefer $PWD over getcwd when both name the same directory, so a
    /// re-exec keeps symlinked deploy paths.
    fn capture() -> Self {
        let getcwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let cwd = match std::env::var_os("PWD") {
            Some(pwd) => {
                let pwd = PathBuf::from(pwd);
                match (std::fs::metadata(&pwd), std::fs::metadata(&getcwd)) {
                    (Ok(a), Ok(b)) if a.ino() == b.ino() && a.dev() == b.dev() => pwd,
                    _ => getcwd,
                }
            }
            None => getcwd,
        };
        Self {
            cwd,
            args: std::env::args_os().collect(),
        }
    }
}

/// The master process: forks and reaps workers, routes signals to semantic
/// actions, murders stalled workers and performs live re-exec.
pub struct Arbiter {
    cfg: Arc<Config>,
    listener: Option<std::net::TcpListener>,
    workers: HashMap<libc::pid_t, WorkerRecord>,
    sig_queue: VecDeque<libc::c_int>,
    pipe: (RawFd, RawFd),
    num_workers: usize,
    worker_age: u64,
    pid: libc::pid_t,
    reexec_pid: libc::pid_t,
    master_name: &'static str,
    pidfile: Option<Pidfile>,
    start_ctx: StartCtx,
}

impl Arbiter {
    pub fn new(cfg: Arc<Config>) -> Self {
        let num_workers = cfg.workers;
        Self {
            cfg,
            listener: None,
            workers: HashMap::new(),
            sig_queue: VecDeque::new(),
            pipe: (-1, -1),
            num_workers,
            worker_age: 0,
            pid: 0,
            reexec_pid: 0,
            master_name: "Master",
            pidfile: None,
            start_ctx: StartCtx::capture(),
        }
    }

    pub fn run(mut self) -> ! {
        if let Err(err) = self.start() {
            tracing::error!("{err}");
            std::process::exit(1);
        }

        loop {
            let res = self.tick();
            if let Err(err) = res {
                match err.downcast::<HaltServer>() {
                    Ok(halt) => self.halt(halt),
                    Err(err) => {
                        tracing::error!("unhandled exception in main loop: {err}");
                        self.stop(false);
                        if let Some(pf) = &self.pidfile {
                            pf.unlink();
                        }
                        std::process::exit(-1);
                    }
                }
            }
        }
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.pid = sys::getpid();
        self.init_signals()?;

        if self.listener.is_none() {
            self.listener = Some(net::tcp_listener(&self.cfg.address, self.cfg.backlog)?);
        }
        if let Some(path) = &self.cfg.pidfile {
            self.pidfile = Some(Pidfile::create(path, self.pid)?);
        }

        sys::set_proctitle(&format!("master [{}]", self.cfg.name));
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "tproxy started");
        tracing::info!(address = %self.cfg.address, "listening");

        self.manage_workers()?;
        Ok(())
    }

    fn init_signals(&mut self) -> anyhow::Result<()> {
        let (read_fd, write_fd) = sys::pipe()?;
        self.pipe = (read_fd, write_fd);
        WAKEUP_FD.store(write_fd, Ordering::Relaxed);

        for sig in QUEUED_SIGNALS {
            sys::install_signal_handler(sig, on_signal)?;
        }
        sys::install_signal_handler(libc::SIGCHLD, on_signal)?;
        Ok(())
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        self.collect_signals();
        self.reap_workers()?;

        match self.sig_queue.pop_front() {
            None => {
                self.sleep();
                self.murder_workers();
                self.manage_workers()?;
            }
            Some(sig) => {
                tracing::info!(signal = signame(sig), "handling signal");
                self.dispatch(sig)?;
                self.wakeup();
            }
        }
        Ok(())
    }

    /// Pull everything the handler wrote into the bounded queue. SIGCHLD is
    /// only a wake-up; reaping runs every tick anyway.
    fn collect_signals(&mut self) {
        let mut dropped = 0usize;
        for byte in sys::drain_bytes(self.pipe.0) {
            let sig = byte as libc::c_int;
            if sig == libc::SIGCHLD {
                continue;
            }
            if self.sig_queue.len() < SIG_QUEUE_LIMIT {
                self.sig_queue.push_back(sig);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::warn!(count = dropped, "dropping signals, queue is full");
        }
    }

    fn dispatch(&mut self, sig: libc::c_int) -> anyhow::Result<()> {
        match sig {
            libc::SIGHUP => self.reload(),
            libc::SIGQUIT => Err(HaltServer {
                reason: None,
                exit_status: 0,
            }
            .into()),
            libc::SIGINT | libc::SIGTERM => {
                self.stop(false);
                Err(HaltServer {
                    reason: None,
                    exit_status: 0,
                }
                .into())
            }
            libc::SIGTTIN => {
                self.num_workers += 1;
                self.manage_workers()
            }
            libc::SIGTTOU => {
                if self.num_workers > 1 {
                    self.num_workers -= 1;
                    self.manage_workers()?;
                }
                Ok(())
            }
            libc::SIGUSR1 => {
                self.kill_workers(libc::SIGUSR1);
                Ok(())
            }
            libc::SIGUSR2 => self.reexec(),
            libc::SIGWINCH => {
                if self.daemonized() {
                    tracing::info!("graceful stop of workers");
                    self.num_workers = 0;
                    self.kill_workers(libc::SIGQUIT);
                } else {
                    tracing::info!("SIGWINCH ignored, not daemonized");
                }
                Ok(())
            }
            other => {
                tracing::info!(signal = other, "ignoring unknown signal");
                Ok(())
            }
        }
    }

    fn daemonized(&self) -> bool {
        sys::getppid() == 1 || sys::getpgrp() != self.pid
    }

    /// Sleep until the self-pipe is readable or one second passes.
    fn sleep(&mut self) {
        match sys::wait_readable(self.pipe.0, 1000) {
            Ok(true) => self.collect_signals(),
            Ok(false) => {}
            Err(err) => tracing::warn!("master sleep failed: {err}"),
        }
    }

    fn wakeup(&self) {
        sys::write_byte(self.pipe.1, libc::SIGCHLD as u8);
    }

    fn reload(&mut self) -> anyhow::Result<()> {
        tracing::info!("hang up: {}", self.master_name);

        // Spawn a fresh generation; the old one retires on the next
        // management pass.
        for _ in 0..self.cfg.workers {
            self.spawn_worker()?;
        }

        if let Some(pf) = self.pidfile.take() {
            pf.unlink();
        }
        if let Some(path) = &self.cfg.pidfile {
            self.pidfile = Some(Pidfile::create(path, self.pid)?);
        }

        self.manage_workers()
    }

    /// SIGKILL workers whose heartbeat ctime is older than the timeout.
    fn murder_workers(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let timeout = self.cfg.timeout.as_secs() as i64;

        let stalled: Vec<libc::pid_t> = self
            .workers
            .iter()
            .filter_map(|(pid, w)| {
                let ctime = sys::change_secs(w.tmp.as_raw_fd()).ok()?;
                (now - ctime > timeout).then_some(*pid)
            })
            .collect();

        for pid in stalled {
            tracing::error!(pid, "WORKER TIMEOUT");
            self.kill_worker(pid, libc::SIGKILL);
        }
    }

    fn reap_workers(&mut self) -> anyhow::Result<()> {
        while let Some((pid, exit_code)) = sys::reap_one()? {
            if pid == self.reexec_pid {
                self.reexec_pid = 0;
                continue;
            }
            if exit_code == Some(WORKER_BOOT_ERROR) {
                return Err(HaltServer {
                    reason: Some("worker failed to boot".to_string()),
                    exit_status: WORKER_BOOT_ERROR,
                }
                .into());
            }
            self.workers.remove(&pid);
        }
        Ok(())
    }

    /// Spawn or retire workers until the live count matches the target.
    fn manage_workers(&mut self) -> anyhow::Result<()> {
        while self.workers.len() < self.num_workers {
            self.spawn_worker()?;
        }

        if self.workers.len() > self.num_workers {
            let excess = self.workers.len() - self.num_workers;
            let mut by_age: Vec<(u64, libc::pid_t)> = self
                .workers
                .iter()
                .map(|(pid, w)| (w.age, *pid))
                .collect();
            by_age.sort_unstable();
            for (_, pid) in by_age.into_iter().take(excess) {
                self.kill_worker(pid, libc::SIGQUIT);
            }
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> anyhow::Result<()> {
        let Some(listener) = &self.listener else {
            anyhow::bail!("no listener to hand to a worker");
        };

        self.worker_age += 1;
        let worker = Worker::new(
            self.worker_age,
            self.pid,
            listener.try_clone()?,
            WorkerTmp::new()?,
            self.cfg.clone(),
        );
        let tmp_for_master = worker.tmp().file().try_clone()?;

        match sys::fork()? {
            Fork::Parent(pid) => {
                self.workers.insert(
                    pid,
                    WorkerRecord {
                        age: worker.age(),
                        tmp: tmp_for_master,
                    },
                );
                Ok(())
            }
            Fork::Child => {
                let pid = sys::getpid();
                tracing::info!(pid, "booting worker");
                let code = match worker.serve() {
                    Ok(()) => 0,
                    Err(WorkerError::Boot(err)) => {
                        tracing::error!("worker failed to boot: {err}");
                        WORKER_BOOT_ERROR
                    }
                    Err(WorkerError::Runtime(err)) => {
                        tracing::error!("exception in worker process: {err}");
                        -1
                    }
                };
                tracing::info!(pid, "worker exiting");
                std::process::exit(code);
            }
        }
    }

    fn kill_workers(&mut self, sig: libc::c_int) {
        let pids: Vec<libc::pid_t> = self.workers.keys().copied().collect();
        for pid in pids {
            self.kill_worker(pid, sig);
        }
    }

    fn kill_worker(&mut self, pid: libc::pid_t, sig: libc::c_int) {
        if let Err(err) = sys::kill(pid, sig) {
            if err.raw_os_error() == Some(libc::ESRCH) {
                self.workers.remove(&pid);
            } else {
                tracing::warn!(pid, "failed to signal worker: {err}");
            }
        }
    }

    /// Signal workers repeatedly until they are gone or the timeout elapses,
    /// then SIGKILL the rest. The listener is released only afterwards.
    fn stop(&mut self, graceful: bool) {
        let sig = if graceful {
            libc::SIGQUIT
        } else {
            libc::SIGTERM
        };

        let limit = Instant::now() + self.cfg.timeout;
        while !self.workers.is_empty() && Instant::now() < limit {
            self.kill_workers(sig);
            std::thread::sleep(Duration::from_millis(100));
            if let Err(err) = self.try_reap() {
                tracing::warn!("reap during stop failed: {err}");
            }
        }
        self.kill_workers(libc::SIGKILL);
        let _ = self.try_reap();
        self.workers.clear();
        self.listener = None;
    }

    /// Like reap_workers but boot-error escalation is moot mid-shutdown.
    fn try_reap(&mut self) -> std::io::Result<()> {
        while let Some((pid, _)) = sys::reap_one()? {
            if pid == self.reexec_pid {
                self.reexec_pid = 0;
                continue;
            }
            self.workers.remove(&pid);
        }
        Ok(())
    }

    /// Fork a child that re-execs the original command line with the bound
    /// listener handed over through the environment. The parent keeps running
    /// as "Old Master".
    fn reexec(&mut self) -> anyhow::Result<()> {
        if let Some(pf) = &mut self.pidfile {
            pf.rename(".oldbin")?;
        }

        match sys::fork()? {
            Fork::Parent(pid) => {
                self.reexec_pid = pid;
                self.master_name = "Old Master";
                Ok(())
            }
            Fork::Child => {
                let Some(listener) = &self.listener else {
                    std::process::exit(1);
                };
                match sys::dup(listener.as_raw_fd()) {
                    Ok(fd) => unsafe {
                        std::env::set_var(net::TPROXY_FD_ENV, fd.to_string());
                    },
                    Err(err) => {
                        tracing::error!("could not pass listener to new master: {err}");
                        std::process::exit(1);
                    }
                }
                let _ = std::env::set_current_dir(&self.start_ctx.cwd);
                let err = sys::execvp(&self.start_ctx.args);
                tracing::error!("re-exec failed: {err}");
                std::process::exit(1);
            }
        }
    }

    fn halt(&mut self, halt: HaltServer) -> ! {
        self.stop(true);
        tracing::info!("shutting down: {}", self.master_name);
        if let Some(reason) = &halt.reason {
            tracing::info!("reason: {reason}");
        }
        if let Some(pf) = &self.pidfile {
            pf.unlink();
        }
        std::process::exit(halt.exit_status);
    }
}

fn signame(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGHUP => "hup",
        libc::SIGQUIT => "quit",
        libc::SIGINT => "int",
        libc::SIGTERM => "term",
        libc::SIGTTIN => "ttin",
        libc::SIGTTOU => "ttou",
        libc::SIGUSR1 => "usr1",
        libc::SIGUSR2 => "usr2",
        libc::SIGWINCH => "winch",
        libc::SIGCHLD => "chld",
        _ => "unknown",
    }
}
