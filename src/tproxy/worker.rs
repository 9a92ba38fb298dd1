use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio::time;

use super::client::ClientConnection;
use super::config::Config;
use super::pipe::BoxedStream;
use super::route::RouteAdapter;
use super::scripts;
use super::sys;
use super::tls;

/// How long a stopping worker waits for in-flight connections to drain.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Signals whose inherited dispositions are reset after fork.
const RESET_SIGNALS: [libc::c_int; 8] = [
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
    libc::SIGCHLD,
];

/// The file whose ctime proves this worker is alive. Created named, then
/// unlinked; the fd is shared with the arbiter across the fork.
pub struct WorkerTmp {
    file: File,
    spin: u8,
}

impl WorkerTmp {
    pub fn new() -> io::Result<Self> {
        let dir = std::env::temp_dir();
        loop {
            let path = dir.join(format!(
                "tproxy-{}-{:08x}",
                sys::getpid(),
                rand::rng().random::<u32>()
            ));
            match std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    std::fs::remove_file(&path)?;
                    return Ok(Self { file, spin: 0 });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Advance the fd's ctime so the arbiter sees a fresh heartbeat.
    pub fn notify(&mut self) -> io::Result<()> {
        self.spin = (self.spin + 1) % 2;
        sys::fchmod(self.file.as_raw_fd(), self.spin as libc::mode_t)
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Per-worker state the connection handlers share. The counter only needs a
/// cooperative lock: all tasks run on one thread.
pub struct WorkerShared {
    pub adapter: RouteAdapter,
    pub counter: tokio::sync::Mutex<usize>,
    pub name: Option<String>,
}

impl WorkerShared {
    pub fn refresh_title(&self, connections: usize) {
        let title = match &self.name {
            Some(name) => format!("worker [{name}] - handling {connections} connections"),
            None => format!("worker - handling {connections} connections"),
        };
        sys::set_proctitle(&title);
    }
}

#[derive(Debug)]
pub enum WorkerError {
    /// Failed before the accept loop started; the arbiter treats the exit
    /// code as fatal to avoid start/stop storms.
    Boot(anyhow::Error),
    Runtime(anyhow::Error),
}

/// A child process owning an accept loop on the shared listener.
pub struct Worker {
    age: u64,
    ppid: libc::pid_t,
    listener: std::net::TcpListener,
    tmp: WorkerTmp,
    cfg: Arc<Config>,
}

impl Worker {
    pub fn new(
        age: u64,
        ppid: libc::pid_t,
        listener: std::net::TcpListener,
        tmp: WorkerTmp,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            age,
            ppid,
            listener,
            tmp,
            cfg,
        }
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn tmp(&self) -> &WorkerTmp {
        &self.tmp
    }

    /// Entry point in the forked child. Never accepts before init and script
    /// load have succeeded.
    pub fn serve(self) -> Result<(), WorkerError> {
        let (shared, acceptor) = self.init_process().map_err(WorkerError::Boot)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkerError::Boot(e.into()))?;

        runtime
            .block_on(self.accept_loop(shared, acceptor))
            .map_err(WorkerError::Runtime)
    }

    /// Post-fork initialization: drop privileges, reseed the RNG, pin the
    /// inherited fds, restore default signal dispositions, load the route
    /// script.
    fn init_process(&self) -> anyhow::Result<(Arc<WorkerShared>, Option<tokio_rustls::TlsAcceptor>)> {
        sys::set_owner_process(self.cfg.uid, self.cfg.gid)?;
        if let Some(mask) = self.cfg.umask {
            sys::umask(mask as libc::mode_t);
        }

        // The parent's RNG state came along with the fork.
        if let Err(err) = rand::rng().reseed() {
            tracing::warn!("rng reseed failed: {err}");
        }

        sys::close_on_exec(self.listener.as_raw_fd())?;
        sys::close_on_exec(self.tmp.file().as_raw_fd())?;

        for sig in RESET_SIGNALS {
            sys::reset_signal(sig)?;
        }

        let acceptor = match &self.cfg.ssl {
            Some(opts) => Some(tls::acceptor(opts)?),
            None => None,
        };

        let script = scripts::load(&self.cfg.script)?;
        let shared = Arc::new(WorkerShared {
            adapter: RouteAdapter::new(script),
            counter: tokio::sync::Mutex::new(0),
            name: Some(self.cfg.name.clone()),
        });
        shared.refresh_title(0);

        Ok((shared, acceptor))
    }

    async fn accept_loop(
        self,
        shared: Arc<WorkerShared>,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) -> anyhow::Result<()> {
        self.listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(self.listener.try_clone()?)?;

        let pool = Arc::new(Semaphore::new(self.cfg.worker_connections));

        let mut quit = signal(SignalKind::quit())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut winch = signal(SignalKind::window_change())?;

        let (orphan_tx, mut orphan_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(heartbeat(
            self.tmp,
            self.cfg.timeout / 2,
            self.ppid,
            orphan_tx,
        ));

        loop {
            let accept = async {
                let permit = pool
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("connection pool closed");
                (permit, listener.accept().await)
            };

            tokio::select! {
                _ = quit.recv() => {
                    tracing::info!("graceful stop");
                    break;
                }
                _ = term.recv() => break,
                _ = int.recv() => break,
                _ = winch.recv() => {
                    // Ignored in workers.
                }
                _ = orphan_rx.changed() => {
                    tracing::info!("parent changed, shutting down");
                    break;
                }
                (permit, res) = accept => {
                    match res {
                        Ok((sock, peer)) => {
                            let shared = shared.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                let stream: BoxedStream = match acceptor {
                                    Some(acceptor) => match acceptor.accept(sock).await {
                                        Ok(tls_stream) => Box::new(tls_stream),
                                        Err(err) => {
                                            tracing::debug!(peer = %peer, "tls accept failed: {err}");
                                            return;
                                        }
                                    },
                                    None => Box::new(sock),
                                };
                                ClientConnection::new(stream, peer.to_string(), shared)
                                    .handle()
                                    .await;
                            });
                        }
                        Err(err) => {
                            tracing::error!("accept failed: {err}");
                            time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        // Stop accepting, then wait for in-flight connections to drain.
        drop(listener);
        let title = match &shared.name {
            Some(name) => format!("worker [{name}] - stop accepting"),
            None => "worker - stop accepting".to_string(),
        };
        sys::set_proctitle(&title);

        let all = self.cfg.worker_connections as u32;
        if time::timeout(STOP_GRACE, pool.acquire_many(all)).await.is_err() {
            tracing::warn!("stopping with connections still in flight");
        }
        Ok(())
    }
}

/// Touch the heartbeat every half timeout; bail out when reparented.
async fn heartbeat(
    mut tmp: WorkerTmp,
    every: Duration,
    ppid: libc::pid_t,
    orphan: tokio::sync::watch::Sender<bool>,
) {
    loop {
        time::sleep(every).await;
        if sys::getppid() != ppid {
            let _ = orphan.send(true);
            return;
        }
        if let Err(err) = tmp.notify() {
            tracing::warn!("heartbeat update failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_tmp_notify_advances_ctime() {
        let mut tmp = WorkerTmp::new().unwrap();
        let fd = tmp.file().as_raw_fd();
        let before = sys::change_time(fd).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        tmp.notify().unwrap();
        let after = sys::change_time(fd).unwrap();
        assert!(after > before, "ctime did not advance: {before:?} -> {after:?}");
    }

    #[test]
    fn worker_tmp_survives_unlink() {
        let mut tmp = WorkerTmp::new().unwrap();
        // The path is already gone; only the fd keeps the inode alive.
        tmp.notify().unwrap();
        tmp.notify().unwrap();
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_permits() {
        let pool = Arc::new(Semaphore::new(2));
        let p1 = pool.clone().acquire_owned().await.unwrap();
        let _p2 = pool.clone().acquire_owned().await.unwrap();

        assert!(
            time::timeout(Duration::from_millis(50), pool.clone().acquire_owned())
                .await
                .is_err()
        );

        drop(p1);
        assert!(
            time::timeout(Duration::from_millis(50), pool.clone().acquire_owned())
                .await
                .is_ok()
        );
    }
}
