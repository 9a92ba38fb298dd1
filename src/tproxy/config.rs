use std::{io, path::PathBuf, time::Duration};

use clap::Parser;
use thiserror::Error;

use super::net::{self, Address};
use super::sys;
use super::tls::{CertReqs, TlsServerOptions};

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

/// Exception raised on config error. Fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0:?} is not a valid port number")]
    InvalidPort(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address not available: {0}")]
    AddressNotAvailable(String),

    #[error("connection in use: {0}")]
    AddressInUse(String),

    #[error("no such user: {0:?}")]
    NoSuchUser(String),

    #[error("no such group: {0:?}")]
    NoSuchGroup(String),

    #[error("invalid umask: {0:?}")]
    InvalidUmask(String),

    #[error("invalid ssl-cert-reqs: {0} (expected 0, 1 or 2)")]
    InvalidCertReqs(u8),

    #[error("no route script named {0:?}")]
    UnknownScript(String),

    #[error("value must be positive: {0}")]
    NotPositive(i64),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Command line surface. The positional argument names the route script.
#[derive(Debug, Parser)]
#[command(
    name = "tproxy",
    version,
    about = "tproxy - a content-aware TCP reverse proxy"
)]
pub struct Options {
    /// Name of the route script to run (e.g. "socks4", "host-header", "transparent").
    pub script: String,

    /// The socket to bind: 'HOST', 'HOST:PORT' or '[V6]:PORT'.
    #[arg(short = 'b', long, default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Maximum number of pending connections.
    #[arg(long, default_value_t = 2048)]
    pub backlog: i64,

    /// Number of worker processes.
    #[arg(short = 'w', long, default_value_t = 1)]
    pub workers: i64,

    /// Maximum number of simultaneous connections per worker.
    #[arg(long, default_value_t = 1000)]
    pub worker_connections: i64,

    /// Workers silent for more than this many seconds are killed and restarted.
    #[arg(short = 't', long, default_value_t = 30)]
    pub timeout: i64,

    /// Detach from the controlling terminal and run in the background.
    #[arg(short = 'D', long)]
    pub daemon: bool,

    /// File to write the master pid to.
    #[arg(short = 'p', long = "pid")]
    pub pid: Option<PathBuf>,

    /// Run worker processes as this user (name or uid).
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Run worker processes as this group (name or gid).
    #[arg(short = 'g', long)]
    pub group: Option<String>,

    /// Bit mask for the file mode on files written by tproxy ("0", "0x1FF", "022").
    #[arg(short = 'm', long)]
    pub umask: Option<String>,

    /// The log file to write to ("-" means stderr).
    #[arg(long = "log-file", default_value = "-")]
    pub log_file: String,

    /// Log granularity: debug, info, warning, error or critical.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// File of extra tracing filter directives layered over --log-level.
    #[arg(long = "log-config")]
    pub log_config: Option<PathBuf>,

    /// Base string used for process naming.
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// SSL key file for the listening socket.
    #[arg(long = "ssl-keyfile")]
    pub ssl_keyfile: Option<PathBuf>,

    /// SSL certificate file for the listening socket.
    #[arg(long = "ssl-certfile")]
    pub ssl_certfile: Option<PathBuf>,

    /// Concatenated "certification authority" certificates.
    #[arg(long = "ssl-ca-certs")]
    pub ssl_ca_certs: Option<PathBuf>,

    /// Client certificate requirement: 0 ignored, 1 optional, 2 required.
    #[arg(long = "ssl-cert-reqs", default_value_t = 0)]
    pub ssl_cert_reqs: u8,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
    pub config: Option<PathBuf>,
}

/// Flat, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub script: String,
    pub address: Address,
    pub backlog: i32,
    pub workers: usize,
    pub worker_connections: usize,
    pub timeout: Duration,
    pub daemon: bool,
    pub pidfile: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub umask: Option<u32>,
    pub logging: LoggingConfig,
    pub name: String,
    pub ssl: Option<TlsServerOptions>,
}

impl Config {
    pub fn from_options(opts: Options) -> Result<Config, ConfigError> {
        let address = net::parse_address(&opts.bind, 5000)?;

        let backlog = positive(opts.backlog)? as i32;
        let workers = positive(opts.workers)?.max(1) as usize;
        let worker_connections = positive(opts.worker_connections)?.max(1) as usize;
        let timeout = Duration::from_secs(positive(opts.timeout)?.max(1) as u64);

        let uid = opts.user.as_deref().map(resolve_user).transpose()?;
        let gid = opts.group.as_deref().map(resolve_group).transpose()?;
        let umask = opts.umask.as_deref().map(parse_umask).transpose()?;

        let ssl = match (&opts.ssl_keyfile, &opts.ssl_certfile) {
            (Some(keyfile), Some(certfile)) => Some(TlsServerOptions {
                keyfile: keyfile.clone(),
                certfile: certfile.clone(),
                ca_certs: opts.ssl_ca_certs.clone(),
                cert_reqs: CertReqs::from_int(opts.ssl_cert_reqs)
                    .ok_or(ConfigError::InvalidCertReqs(opts.ssl_cert_reqs))?,
            }),
            _ => None,
        };

        let name = opts.name.unwrap_or_else(|| opts.script.clone());

        Ok(Config {
            script: opts.script,
            address,
            backlog,
            workers,
            worker_connections,
            timeout,
            daemon: opts.daemon,
            pidfile: opts.pid,
            uid,
            gid,
            umask,
            logging: LoggingConfig {
                level: opts.log_level,
                file: opts.log_file,
                config: opts.log_config,
            },
            name,
            ssl,
        })
    }
}

fn positive(v: i64) -> Result<i64, ConfigError> {
    if v < 0 {
        return Err(ConfigError::NotPositive(v));
    }
    Ok(v)
}

fn resolve_user(val: &str) -> Result<u32, ConfigError> {
    if val.bytes().all(|b| b.is_ascii_digit()) && !val.is_empty() {
        return val
            .parse()
            .map_err(|_| ConfigError::NoSuchUser(val.to_string()));
    }
    sys::uid_for_user(val).ok_or_else(|| ConfigError::NoSuchUser(val.to_string()))
}

fn resolve_group(val: &str) -> Result<u32, ConfigError> {
    if val.bytes().all(|b| b.is_ascii_digit()) && !val.is_empty() {
        return val
            .parse()
            .map_err(|_| ConfigError::NoSuchGroup(val.to_string()));
    }
    sys::gid_for_group(val).ok_or_else(|| ConfigError::NoSuchGroup(val.to_string()))
}

/// Parse an umask the way `int(value, 0)` would: `0x` hex, `0o` or a leading
/// zero octal, plain decimal otherwise.
fn parse_umask(val: &str) -> Result<u32, ConfigError> {
    let s = val.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u32::from_str_radix(oct, 8)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };
    parsed.map_err(|_| ConfigError::InvalidUmask(val.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Options {
        Options::parse_from(["tproxy", "socks4"])
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::from_options(base_options()).unwrap();
        assert_eq!(cfg.address, Address::from(("127.0.0.1", 5000)));
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.worker_connections, 1000);
        assert_eq!(cfg.backlog, 2048);
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.name, "socks4");
        assert!(cfg.ssl.is_none());
        assert!(!cfg.daemon);
    }

    #[test]
    fn name_defaults_to_script() {
        let opts = Options::parse_from(["tproxy", "-n", "edge1", "socks4"]);
        let cfg = Config::from_options(opts).unwrap();
        assert_eq!(cfg.name, "edge1");
    }

    #[test]
    fn umask_accepts_python_int_forms() {
        assert_eq!(parse_umask("0").unwrap(), 0);
        assert_eq!(parse_umask("022").unwrap(), 0o22);
        assert_eq!(parse_umask("0o22").unwrap(), 0o22);
        assert_eq!(parse_umask("0xFF").unwrap(), 0xff);
        assert_eq!(parse_umask("18").unwrap(), 18);
        assert!(parse_umask("rw-").is_err());
    }

    #[test]
    fn numeric_user_and_group_pass_through() {
        assert_eq!(resolve_user("1000").unwrap(), 1000);
        assert_eq!(resolve_group("100").unwrap(), 100);
    }

    #[test]
    fn unknown_user_is_a_config_error() {
        assert!(matches!(
            resolve_user("no-such-user-tproxy"),
            Err(ConfigError::NoSuchUser(_))
        ));
    }

    #[test]
    fn bad_bind_port_is_rejected() {
        let opts = Options::parse_from(["tproxy", "-b", "127.0.0.1:http", "socks4"]);
        assert!(matches!(
            Config::from_options(opts),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn ssl_requires_both_key_and_cert() {
        let opts = Options::parse_from(["tproxy", "--ssl-keyfile", "/tmp/k.pem", "socks4"]);
        let cfg = Config::from_options(opts).unwrap();
        assert!(cfg.ssl.is_none());
    }
}
