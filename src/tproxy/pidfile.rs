use std::{fs, io, path::Path, path::PathBuf};

use super::sys;

/// The master's pid on disk. Refuses to clobber a live master; cleans up
/// after itself only when the content is still its own pid.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    pid: libc::pid_t,
}

impl Pidfile {
    pub fn create(path: &Path, pid: libc::pid_t) -> io::Result<Self> {
        if let Some(old_pid) = read_pid(path) {
            if old_pid != pid && sys::process_alive(old_pid) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "already running on {} (pid {old_pid})",
                        path.display()
                    ),
                ));
            }
            // Stale file from a dead master.
            let _ = fs::remove_file(path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, format!("{pid}\n"))?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Rename in place; live re-exec moves the old master to `<name>.oldbin`.
    pub fn rename(&mut self, suffix: &str) -> io::Result<()> {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        let new_path = PathBuf::from(name);
        fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// Remove the file if it still holds our pid.
    pub fn unlink(&self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_pid(path: &Path) -> Option<libc::pid_t> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tproxy-pid-{tag}-{}", std::process::id()))
    }

    #[test]
    fn create_write_and_unlink() {
        let path = temp_path("basic");
        let pf = Pidfile::create(&path, 4242).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "4242");
        pf.unlink();
        assert!(!path.exists());
    }

    #[test]
    fn refuses_a_live_master() {
        let path = temp_path("live");
        let our_pid = sys::getpid();
        let _pf = Pidfile::create(&path, our_pid).unwrap();
        // Another "master" must not steal the file while our pid is alive.
        let err = Pidfile::create(&path, our_pid + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn stale_file_is_replaced() {
        let path = temp_path("stale");
        fs::write(&path, "999999999\n").unwrap();
        let pf = Pidfile::create(&path, 4242).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "4242");
        pf.unlink();
    }

    #[test]
    fn rename_appends_oldbin() {
        let path = temp_path("rename");
        let mut pf = Pidfile::create(&path, 4242).unwrap();
        pf.rename(".oldbin").unwrap();
        assert!(!path.exists());
        assert!(pf.path().to_string_lossy().ends_with(".oldbin"));
        pf.unlink();
        assert!(!pf.path().exists());
    }

    #[test]
    fn unlink_leaves_foreign_content_alone() {
        let path = temp_path("foreign");
        let pf = Pidfile::create(&path, 4242).unwrap();
        fs::write(&path, "7\n").unwrap();
        pf.unlink();
        assert!(path.exists());
        let _ = fs::remove_file(&path);
    }
}
