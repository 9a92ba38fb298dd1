use std::{fmt, net::TcpListener, net::ToSocketAddrs, path::PathBuf, thread, time::Duration};

use super::config::ConfigError;
use super::sys;

/// Environment variable carrying an already-bound listener fd across a live
/// re-exec.
pub const TPROXY_FD_ENV: &str = "TPROXY_FD";

/// Where to bind or dial: a network endpoint or a filesystem path, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet { host, port } => {
                if is_ipv6(host) {
                    write!(f, "[{host}]:{port}")
                } else {
                    write!(f, "{host}:{port}")
                }
            }
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Address::Inet {
            host: host.to_string(),
            port,
        }
    }
}

pub fn is_ipv6(host: &str) -> bool {
    host.parse::<std::net::Ipv6Addr>().is_ok()
}

/// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or `unix:path`.
///
/// An empty host means all interfaces. The port must be all digits.
pub fn parse_address(netloc: &str, default_port: u16) -> Result<Address, ConfigError> {
    if let Some(path) = netloc.strip_prefix("unix:") {
        return Ok(Address::Unix(PathBuf::from(path)));
    }

    let host = if netloc.contains('[') && netloc.contains(']') {
        let inner = netloc.split(']').next().unwrap_or_default();
        inner.trim_start_matches('[').to_ascii_lowercase()
    } else if netloc.contains(':') {
        netloc.split(':').next().unwrap_or_default().to_ascii_lowercase()
    } else if netloc.is_empty() {
        "0.0.0.0".to_string()
    } else {
        netloc.to_ascii_lowercase()
    };

    // The port, if any, sits after the last ']'.
    let tail = netloc.rsplit(']').next().unwrap_or_default();
    let port = match tail.find(':') {
        Some(idx) => {
            let digits = &tail[idx + 1..];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::InvalidPort(digits.to_string()));
            }
            match digits.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => return Err(ConfigError::InvalidPort(digits.to_string())),
            }
        }
        None => default_port,
    };

    Ok(Address::Inet { host, port })
}

/// Build the listening socket.
///
/// When `TPROXY_FD` is set the fd is adopted as-is (live re-exec hands the
/// bound socket down that way) and bind is skipped. Otherwise the socket is
/// created with `SO_REUSEADDR`, bound and put in listen mode, retrying up to
/// five times on `EADDRINUSE` with a one second pause.
pub fn tcp_listener(addr: &Address, backlog: i32) -> Result<TcpListener, ConfigError> {
    let Address::Inet { host, port } = addr else {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    };

    if let Some(raw) = std::env::var_os(TPROXY_FD_ENV) {
        unsafe { std::env::remove_var(TPROXY_FD_ENV) };
        let fd = raw
            .to_string_lossy()
            .parse::<i32>()
            .map_err(|_| ConfigError::InvalidAddress(format!("{TPROXY_FD_ENV}={raw:?}")))?;
        let listener = sys::listener_from_fd(fd)?;
        listener.set_nonblocking(true)?;
        return Ok(listener);
    }

    let sockaddr = (host.as_str(), *port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;

    for attempt in 0..5 {
        match sys::bind_listener(&sockaddr, backlog) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                return Ok(listener);
            }
            Err(err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
                tracing::error!(address = %addr, "connection in use");
                if attempt < 4 {
                    tracing::error!("retrying in 1 second");
                    thread::sleep(Duration::from_secs(1));
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::EADDRNOTAVAIL) => {
                tracing::error!(address = %addr, "invalid address");
                return Err(ConfigError::AddressNotAvailable(addr.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(ConfigError::AddressInUse(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        assert_eq!(
            parse_address("127.0.0.1:5000", 8080).unwrap(),
            Address::from(("127.0.0.1", 5000))
        );
        assert_eq!(
            parse_address("proxy.example.com", 8080).unwrap(),
            Address::from(("proxy.example.com", 8080))
        );
    }

    #[test]
    fn parse_lowercases_host() {
        assert_eq!(
            parse_address("CouchOne.Example:80", 5000).unwrap(),
            Address::from(("couchone.example", 80))
        );
    }

    #[test]
    fn parse_empty_host_binds_all_interfaces() {
        assert_eq!(
            parse_address("", 5000).unwrap(),
            Address::from(("0.0.0.0", 5000))
        );
    }

    #[test]
    fn parse_bracketed_ipv6() {
        assert_eq!(
            parse_address("[::1]:6000", 5000).unwrap(),
            Address::from(("::1", 6000))
        );
        assert_eq!(
            parse_address("[2001:db8::1]", 5000).unwrap(),
            Address::from(("2001:db8::1", 5000))
        );
    }

    #[test]
    fn parse_unix_path() {
        assert_eq!(
            parse_address("unix:/tmp/tproxy.sock", 5000).unwrap(),
            Address::Unix(PathBuf::from("/tmp/tproxy.sock"))
        );
    }

    #[test]
    fn parse_rejects_non_digit_port() {
        assert!(matches!(
            parse_address("localhost:http", 5000),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_address("localhost:", 5000),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_address("localhost:0", 5000),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_address("localhost:70000", 5000),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn ipv6_detection_is_by_textual_parse() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("2001:db8::1"));
        assert!(!is_ipv6("127.0.0.1"));
        assert!(!is_ipv6("example.com"));
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(
            parse_address("[::1]:6000", 5000).unwrap().to_string(),
            "[::1]:6000"
        );
        assert_eq!(
            parse_address("0.0.0.0:80", 5000).unwrap().to_string(),
            "0.0.0.0:80"
        );
    }

    #[test]
    fn listener_binds_and_accepts() {
        let addr = Address::from(("127.0.0.1", 0));
        // Port 0 is rejected by parse_address but fine for an ephemeral bind.
        let ln = tcp_listener(&addr, 128).expect("bind");
        let local = ln.local_addr().unwrap();
        assert!(local.port() > 0);
    }
}
