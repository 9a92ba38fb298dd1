//! Builtin route scripts. The positional CLI argument selects one by name;
//! they double as end-to-end fixtures.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use super::config::ConfigError;
use super::error::ProxyError;
use super::pipe::Pipe;
use super::route::{Directive, RouteScript, Rewriter, SharedRouteScript};

pub fn load(name: &str) -> Result<SharedRouteScript, ConfigError> {
    match name {
        "socks4" => Ok(Arc::new(Socks4)),
        "host-header" => Ok(Arc::new(HostHeader::from_env())),
        "transparent" => Ok(Arc::new(Transparent::from_env())),
        other => Err(ConfigError::UnknownScript(other.to_string())),
    }
}

/// SOCKS4 CONNECT: acknowledge the handshake, then splice to the requested
/// destination. Anything after the user-id terminator is forwarded as-is.
pub struct Socks4;

impl RouteScript for Socks4 {
    fn name(&self) -> &str {
        "socks4"
    }

    fn proxy(&self, data: &[u8]) -> Option<Directive> {
        if data.len() < 9 {
            return None;
        }
        let command = data[1];
        let port = u16::from_be_bytes([data[2], data[3]]);
        let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
        // The user id runs from offset 8 to its NUL terminator.
        let nul = data[8..].iter().position(|&b| b == 0)? + 8;

        if command == 1 {
            Some(Directive {
                reply: Some(b"\x00\x5a\x00\x00\x00\x00\x00\x00".to_vec()),
                data: Some(data[nul + 1..].to_vec()),
                ..Directive::forward(format!("{ip}:{port}"))
            })
        } else {
            Some(Directive::close_with(
                &b"\x00\x5b\x00\x00\x00\x00\x00\x00"[..],
            ))
        }
    }
}

/// Content-aware routing on the HTTP Host header. Upstreams come from
/// `TPROXY_UPSTREAMS` (comma separated); with several candidates one is
/// picked at random per connection.
pub struct HostHeader {
    upstreams: Vec<String>,
}

impl HostHeader {
    pub fn from_env() -> Self {
        let upstreams = std::env::var("TPROXY_UPSTREAMS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec!["127.0.0.1:15984".to_string()]);
        Self { upstreams }
    }

    pub fn with_upstreams(upstreams: Vec<String>) -> Self {
        Self { upstreams }
    }

    fn lookup(&self, _host: &str) -> &str {
        if self.upstreams.len() == 1 {
            return &self.upstreams[0];
        }
        let i = rand::rng().random_range(0..self.upstreams.len());
        &self.upstreams[i]
    }
}

impl RouteScript for HostHeader {
    fn name(&self) -> &str {
        "host-header"
    }

    fn proxy(&self, data: &[u8]) -> Option<Directive> {
        let host = find_host_header(data)?;
        Some(Directive::forward(self.lookup(&host)))
    }
}

fn find_host_header(data: &[u8]) -> Option<String> {
    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            let value = String::from_utf8_lossy(&line[5..]);
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Forward everything to one fixed remote, running both directions through
/// pass-through rewriters. `TPROXY_REMOTE` overrides the destination.
pub struct Transparent {
    remote: String,
}

impl Transparent {
    pub fn from_env() -> Self {
        let remote =
            std::env::var("TPROXY_REMOTE").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
        Self { remote }
    }
}

struct Passthrough;

#[async_trait]
impl Rewriter for Passthrough {
    async fn rewrite(&self, pipe: &mut Pipe) -> Result<(), ProxyError> {
        loop {
            let data = pipe.read(8192).await?;
            if data.is_empty() {
                return Ok(());
            }
            pipe.write_all(&data).await?;
        }
    }
}

impl RouteScript for Transparent {
    fn name(&self) -> &str {
        "transparent"
    }

    fn proxy(&self, _data: &[u8]) -> Option<Directive> {
        Some(Directive::forward(self.remote.clone()))
    }

    fn rewrite_request(&self) -> Option<&dyn Rewriter> {
        Some(&Passthrough)
    }

    fn rewrite_response(&self) -> Option<&dyn Rewriter> {
        Some(&Passthrough)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tproxy::net::Address;
    use crate::tproxy::route::{Decision, RouteAdapter};

    const SOCKS4_CONNECT: &[u8] = b"\x04\x01\x1f\x90\x7f\x00\x00\x01user\x00";

    #[test]
    fn socks4_connect_decision() {
        let Decision::Forward(fwd) =
            Decision::from_directive(Socks4.proxy(SOCKS4_CONNECT)).unwrap()
        else {
            panic!("expected forward");
        };
        assert_eq!(fwd.remote, Address::from(("127.0.0.1", 8080)));
        assert_eq!(fwd.reply.unwrap(), b"\x00\x5a\x00\x00\x00\x00\x00\x00");
        // The whole request was consumed; nothing is forwarded upfront.
        assert_eq!(fwd.data.unwrap(), b"");
    }

    #[test]
    fn socks4_partial_request_needs_more() {
        assert!(Socks4.proxy(b"\x04\x01\x1f\x90").is_none());
        // Nine bytes but no user-id terminator yet.
        assert!(Socks4.proxy(b"\x04\x01\x1f\x90\x7f\x01\x01\x01u").is_none());
    }

    #[test]
    fn socks4_bind_command_is_refused() {
        let req = b"\x04\x02\x1f\x90\x7f\x00\x00\x01user\x00";
        let Decision::Close { reply } = Decision::from_directive(Socks4.proxy(req)).unwrap()
        else {
            panic!("expected close");
        };
        assert_eq!(reply.unwrap(), b"\x00\x5b\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn socks4_trailing_payload_becomes_data_override() {
        let req = b"\x04\x01\x1f\x90\x0a\x01\x01\x01user\x00GET /";
        let Decision::Forward(fwd) = Decision::from_directive(Socks4.proxy(req)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(fwd.remote, Address::from(("10.1.1.1", 8080)));
        assert_eq!(fwd.data.unwrap(), b"GET /");
    }

    #[test]
    fn host_header_routes_by_host() {
        let script = HostHeader::with_upstreams(vec!["127.0.0.1:15984".into()]);
        let req = b"GET / HTTP/1.1\r\nHost: alice\r\n\r\n";
        assert_eq!(req.len(), 35);

        let Decision::Forward(fwd) = Decision::from_directive(script.proxy(req)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(fwd.remote, Address::from(("127.0.0.1", 15984)));
        // No data override: all 35 buffered bytes go to the upstream.
        assert!(fwd.data.is_none());
    }

    #[test]
    fn host_header_waits_for_the_header() {
        let script = HostHeader::with_upstreams(vec!["127.0.0.1:15984".into()]);
        assert!(script.proxy(b"GET / HTTP/1.1\r\nHos").is_none());
    }

    #[test]
    fn host_header_is_case_insensitive() {
        let script = HostHeader::with_upstreams(vec!["127.0.0.1:15984".into()]);
        assert!(script.proxy(b"GET / HTTP/1.1\r\nhOST: x\r\n\r\n").is_some());
    }

    #[test]
    fn transparent_probes_both_rewriters() {
        let adapter = RouteAdapter::new(Arc::new(Transparent {
            remote: "127.0.0.1:8000".into(),
        }));
        assert!(adapter.caps().rewrite_request);
        assert!(adapter.caps().rewrite_response);
        assert!(!adapter.caps().request_wants_extra);
    }

    #[test]
    fn unknown_script_is_an_error() {
        assert!(matches!(
            load("no-such-script"),
            Err(ConfigError::UnknownScript(_))
        ));
    }
}
