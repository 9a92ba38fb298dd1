use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::config::ConfigError;
use super::error::ProxyError;
use super::net::{self, Address};
use super::pipe::Pipe;
use super::tls::TlsClientOptions;

/// Port assumed when a decision's `remote` carries none.
pub const DEFAULT_REMOTE_PORT: u16 = 5000;

/// The mapping a route script hands back from `proxy()`.
///
/// `remote` selects the Forward variant, `close` the Close variant. The
/// conversion into [`Decision`] is the validation seam between user code and
/// the core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Directive {
    /// Upstream to dial, as an address string.
    pub remote: Option<String>,
    /// Replaces the accumulated client buffer before forwarding.
    pub data: Option<Vec<u8>>,
    /// Sent back to the client before dialing.
    pub reply: Option<Vec<u8>>,
    pub ssl: bool,
    pub ssl_args: Option<TlsClientOptions>,
    /// Seconds allowed for the dial.
    pub connect_timeout: Option<f64>,
    /// Seconds allowed between reads on the response side.
    pub inactivity_timeout: Option<f64>,
    /// Opaque payload passed to rewriters that want it.
    pub extra: Option<serde_json::Value>,
    /// Presence selects the Close variant; a byte value is sent before
    /// closing.
    pub close: Option<CloseDirective>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CloseDirective {
    Silent(bool),
    Reply(Vec<u8>),
}

impl Directive {
    pub fn forward(remote: impl Into<String>) -> Self {
        Directive {
            remote: Some(remote.into()),
            ..Default::default()
        }
    }

    pub fn close() -> Self {
        Directive {
            close: Some(CloseDirective::Silent(true)),
            ..Default::default()
        }
    }

    pub fn close_with(reply: impl Into<Vec<u8>>) -> Self {
        Directive {
            close: Some(CloseDirective::Reply(reply.into())),
            ..Default::default()
        }
    }
}

/// The tagged result of inspecting the initial client bytes.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The accumulated buffer is not yet sufficient to decide.
    NeedMore,
    Close {
        reply: Option<Vec<u8>>,
    },
    Forward(Forward),
}

#[derive(Debug, Clone)]
pub struct Forward {
    pub remote: Address,
    pub ssl: bool,
    pub ssl_args: TlsClientOptions,
    pub data: Option<Vec<u8>>,
    pub reply: Option<Vec<u8>>,
    pub connect_timeout: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error(transparent)]
    Remote(#[from] ConfigError),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(f64),
}

impl Decision {
    /// Validate what the script returned. `None` means the script produced
    /// nothing yet; a mapping with neither `remote` nor `close` closes the
    /// connection silently.
    pub fn from_directive(directive: Option<Directive>) -> Result<Decision, DecisionError> {
        let Some(d) = directive else {
            return Ok(Decision::NeedMore);
        };

        if let Some(close) = d.close {
            let reply = match close {
                CloseDirective::Silent(_) => None,
                CloseDirective::Reply(bytes) => Some(bytes),
            };
            return Ok(Decision::Close { reply });
        }

        let Some(remote) = d.remote else {
            return Ok(Decision::Close { reply: None });
        };

        Ok(Decision::Forward(Forward {
            remote: net::parse_address(&remote, DEFAULT_REMOTE_PORT)?,
            ssl: d.ssl,
            ssl_args: d.ssl_args.unwrap_or_default(),
            data: d.data,
            reply: d.reply,
            connect_timeout: seconds(d.connect_timeout)?,
            inactivity_timeout: seconds(d.inactivity_timeout)?,
            extra: d.extra,
        }))
    }
}

fn seconds(v: Option<f64>) -> Result<Option<Duration>, DecisionError> {
    match v {
        None => Ok(None),
        Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(s) => Err(DecisionError::InvalidTimeout(s)),
    }
}

/// A user-supplied routing program.
///
/// `proxy` is required; the other entry points are probed once at load time.
pub trait RouteScript: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the bytes received so far and decide what to do with the
    /// connection. `None` means more bytes are needed.
    fn proxy(&self, data: &[u8]) -> Option<Directive>;

    fn rewrite_request(&self) -> Option<&dyn Rewriter> {
        None
    }

    fn rewrite_response(&self) -> Option<&dyn Rewriter> {
        None
    }

    fn error_hook(&self) -> Option<&dyn ErrorHook> {
        None
    }
}

pub type SharedRouteScript = Arc<dyn RouteScript>;

/// A stream processor for one side of the splice.
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Whether the rewriter also takes the decision's `extra` payload.
    fn wants_extra(&self) -> bool {
        false
    }

    async fn rewrite(&self, pipe: &mut Pipe) -> Result<(), ProxyError>;

    async fn rewrite_with_extra(
        &self,
        pipe: &mut Pipe,
        _extra: Option<&serde_json::Value>,
    ) -> Result<(), ProxyError> {
        self.rewrite(pipe).await
    }
}

/// Called when a connection failed before relaying started.
pub trait ErrorHook: Send + Sync {
    fn proxy_error(&self, conn: &ClientInfo, err: &ProxyError);
}

/// Snapshot of the failing connection handed to `proxy_error`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub peer: String,
    pub remote: Option<Address>,
    pub connected: bool,
}

/// Which optional entry points the loaded script defines, probed once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub rewrite_request: bool,
    pub request_wants_extra: bool,
    pub rewrite_response: bool,
    pub response_wants_extra: bool,
    pub proxy_error: bool,
}

/// Wraps a loaded route script; the connection layer consults the memoized
/// capability flags instead of re-probing per connection.
pub struct RouteAdapter {
    script: SharedRouteScript,
    caps: Capabilities,
}

impl RouteAdapter {
    pub fn new(script: SharedRouteScript) -> Self {
        let caps = Capabilities {
            rewrite_request: script.rewrite_request().is_some(),
            request_wants_extra: script
                .rewrite_request()
                .is_some_and(|r| r.wants_extra()),
            rewrite_response: script.rewrite_response().is_some(),
            response_wants_extra: script
                .rewrite_response()
                .is_some_and(|r| r.wants_extra()),
            proxy_error: script.error_hook().is_some(),
        };
        Self { script, caps }
    }

    pub fn name(&self) -> &str {
        self.script.name()
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn decide(&self, data: &[u8]) -> Result<Decision, DecisionError> {
        Decision::from_directive(self.script.proxy(data))
    }

    pub async fn rewrite_request(
        &self,
        pipe: &mut Pipe,
        extra: Option<&serde_json::Value>,
    ) -> Result<(), ProxyError> {
        match self.script.rewrite_request() {
            Some(rw) if self.caps.request_wants_extra => rw.rewrite_with_extra(pipe, extra).await,
            Some(rw) => rw.rewrite(pipe).await,
            None => Ok(()),
        }
    }

    pub async fn rewrite_response(
        &self,
        pipe: &mut Pipe,
        extra: Option<&serde_json::Value>,
    ) -> Result<(), ProxyError> {
        match self.script.rewrite_response() {
            Some(rw) if self.caps.response_wants_extra => rw.rewrite_with_extra(pipe, extra).await,
            Some(rw) => rw.rewrite(pipe).await,
            None => Ok(()),
        }
    }

    pub fn report_error(&self, conn: &ClientInfo, err: &ProxyError) {
        if let Some(hook) = self.script.error_hook() {
            hook.proxy_error(conn, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_means_need_more() {
        assert!(matches!(
            Decision::from_directive(None).unwrap(),
            Decision::NeedMore
        ));
    }

    #[test]
    fn remote_selects_forward() {
        let d = Directive::forward("127.0.0.1:8080");
        let Decision::Forward(fwd) = Decision::from_directive(Some(d)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(fwd.remote, Address::from(("127.0.0.1", 8080)));
        assert!(!fwd.ssl);
        assert!(fwd.connect_timeout.is_none());
    }

    #[test]
    fn remote_without_port_uses_default() {
        let d = Directive::forward("backend.internal");
        let Decision::Forward(fwd) = Decision::from_directive(Some(d)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(
            fwd.remote,
            Address::from(("backend.internal", DEFAULT_REMOTE_PORT))
        );
    }

    #[test]
    fn close_with_reply_carries_bytes() {
        let d = Directive::close_with(&b"\x00\x5b\x00\x00\x00\x00\x00\x00"[..]);
        let Decision::Close { reply } = Decision::from_directive(Some(d)).unwrap() else {
            panic!("expected close");
        };
        assert_eq!(reply.unwrap(), b"\x00\x5b\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn close_true_is_silent() {
        let Decision::Close { reply } = Decision::from_directive(Some(Directive::close())).unwrap()
        else {
            panic!("expected close");
        };
        assert!(reply.is_none());
    }

    #[test]
    fn empty_mapping_closes_silently() {
        let Decision::Close { reply } =
            Decision::from_directive(Some(Directive::default())).unwrap()
        else {
            panic!("expected close");
        };
        assert!(reply.is_none());
    }

    #[test]
    fn close_takes_precedence_over_remote() {
        let d = Directive {
            close: Some(CloseDirective::Silent(true)),
            ..Directive::forward("127.0.0.1:8080")
        };
        assert!(matches!(
            Decision::from_directive(Some(d)).unwrap(),
            Decision::Close { .. }
        ));
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let d = Directive {
            connect_timeout: Some(2.5),
            inactivity_timeout: Some(1.0),
            ..Directive::forward("127.0.0.1:8080")
        };
        let Decision::Forward(fwd) = Decision::from_directive(Some(d)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(fwd.connect_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(fwd.inactivity_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let d = Directive {
            connect_timeout: Some(-1.0),
            ..Directive::forward("127.0.0.1:8080")
        };
        assert!(matches!(
            Decision::from_directive(Some(d)),
            Err(DecisionError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn bad_remote_is_rejected_at_the_seam() {
        let d = Directive::forward("backend:http");
        assert!(matches!(
            Decision::from_directive(Some(d)),
            Err(DecisionError::Remote(_))
        ));
    }

    #[test]
    fn directive_deserializes_from_mapping() {
        let d: Directive = serde_json::from_value(serde_json::json!({
            "remote": "127.0.0.1:6000",
            "reply": [0, 90],
            "inactivity_timeout": 3.0,
            "extra": {"tenant": "alice"},
        }))
        .unwrap();
        let Decision::Forward(fwd) = Decision::from_directive(Some(d)).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(fwd.reply.unwrap(), vec![0u8, 90]);
        assert_eq!(fwd.extra.unwrap()["tenant"], "alice");
    }

    struct Plain;
    impl RouteScript for Plain {
        fn name(&self) -> &str {
            "plain"
        }
        fn proxy(&self, _data: &[u8]) -> Option<Directive> {
            Some(Directive::forward("127.0.0.1:9"))
        }
    }

    struct WithHooks;
    struct Upper;

    #[async_trait]
    impl Rewriter for Upper {
        fn wants_extra(&self) -> bool {
            true
        }
        async fn rewrite(&self, _pipe: &mut Pipe) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    impl RouteScript for WithHooks {
        fn name(&self) -> &str {
            "with-hooks"
        }
        fn proxy(&self, _data: &[u8]) -> Option<Directive> {
            None
        }
        fn rewrite_request(&self) -> Option<&dyn Rewriter> {
            Some(&Upper)
        }
    }

    #[test]
    fn capabilities_are_probed_once_at_load() {
        let plain = RouteAdapter::new(Arc::new(Plain));
        assert!(!plain.caps().rewrite_request);
        assert!(!plain.caps().rewrite_response);
        assert!(!plain.caps().proxy_error);

        let hooks = RouteAdapter::new(Arc::new(WithHooks));
        assert!(hooks.caps().rewrite_request);
        assert!(hooks.caps().request_wants_extra);
        assert!(!hooks.caps().rewrite_response);
    }
}
