//! WebSocket exec upgrade against a cluster API server.
//!
//! Requests `GET /api/v1/namespaces/{ns}/pods/{pod}/exec` with the
//! `v4.channel.k8s.io` subprotocol. Each binary WebSocket message carries
//! exactly one channel frame.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use podsh_core::error::{PodshError, PodshResult};
use podsh_core::transport::{BoxFuture, ExecChannel, FrameSink, FrameSource};

use super::Upgrader;
use crate::config::SessionConfig;

/// Exec subprotocol requested from the API server.
pub const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upgrades to an exec WebSocket on the configured API server.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketUpgrader;

impl WebSocketUpgrader {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, config: &SessionConfig) -> PodshResult<ExecChannel> {
        let url = exec_url(config)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PodshError::ProtocolUpgradeFailed(format!("invalid exec request: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(EXEC_SUBPROTOCOL),
        );
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| PodshError::Config("token is not a valid header value".into()))?;
            headers.insert("Authorization", value);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| PodshError::ProtocolUpgradeFailed(format!("WebSocket connect error: {e}")))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok());
        if negotiated != Some(EXEC_SUBPROTOCOL) {
            return Err(PodshError::ProtocolUpgradeFailed(format!(
                "server did not confirm {EXEC_SUBPROTOCOL} (got {negotiated:?})"
            )));
        }

        info!("exec WebSocket connected to {}", url);

        let (sink, stream) = ws_stream.split();
        Ok(ExecChannel::new(
            WsSink { sink, closed: false },
            WsSource { stream },
        ))
    }
}

impl Upgrader for WebSocketUpgrader {
    fn upgrade<'a>(&'a self, config: &'a SessionConfig) -> BoxFuture<'a, PodshResult<ExecChannel>> {
        Box::pin(self.connect(config))
    }
}

/// Build the exec WebSocket URL for `config.target`.
pub fn exec_url(config: &SessionConfig) -> PodshResult<String> {
    let server = config.api_server.trim_end_matches('/');
    let lower = server.to_lowercase();
    let base = if lower.starts_with("https://") {
        format!("wss://{}", &server[8..])
    } else if lower.starts_with("http://") {
        format!("ws://{}", &server[7..])
    } else if lower.starts_with("wss://") || lower.starts_with("ws://") {
        server.to_string()
    } else {
        return Err(PodshError::Config(format!(
            "unsupported API server URL: {server} (expected https://, http://, wss://, or ws://)"
        )));
    };

    let target = &config.target;
    let mut url = format!(
        "{base}/api/v1/namespaces/{}/pods/{}/exec?",
        urlencoding::encode(&target.namespace),
        urlencoding::encode(&target.pod)
    );
    for arg in &target.shell {
        url.push_str("command=");
        url.push_str(&urlencoding::encode(arg));
        url.push('&');
    }
    url.push_str("stdin=true&stdout=true&stderr=true&tty=false");
    if let Some(container) = &target.container {
        url.push_str("&container=");
        url.push_str(&urlencoding::encode(container));
    }
    Ok(url)
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, PodshResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Binary(frame))
                .await
                .map_err(|e| PodshError::Transport(format!("WS write error: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, PodshResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            match self.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(PodshError::Transport(format!("WS close error: {e}"))),
            }
        })
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

impl FrameSource for WsSource {
    fn recv(&mut self) -> BoxFuture<'_, PodshResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            while let Some(msg) = self.stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => return Ok(Some(data)),
                    Ok(Message::Close(frame)) => {
                        debug!("WebSocket close frame received: {:?}", frame);
                        return Ok(None);
                    }
                    Ok(Message::Text(text)) => {
                        debug!("ignoring text message ({} bytes)", text.len());
                    }
                    Ok(_) => continue, // pings are answered by tungstenite
                    Err(WsError::ConnectionClosed) => return Ok(None),
                    Err(e) => {
                        return Err(PodshError::Transport(format!("WS read error: {e}")));
                    }
                }
            }
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecTarget;
    use crate::session::Session;
    use crate::testing::FakeShell;
    use podsh_core::channel;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn config(api_server: &str) -> SessionConfig {
        SessionConfig {
            api_server: api_server.to_string(),
            target: ExecTarget::new("default", "sys-report-daily"),
            ..Default::default()
        }
    }

    #[test]
    fn exec_url_for_https_server() {
        let url = exec_url(&config("https://10.0.0.1:6443/")).unwrap();
        assert_eq!(
            url,
            "wss://10.0.0.1:6443/api/v1/namespaces/default/pods/sys-report-daily/exec?\
             command=%2Fbin%2Fsh&stdin=true&stdout=true&stderr=true&tty=false"
        );
    }

    #[test]
    fn exec_url_with_container_and_args() {
        let mut cfg = config("http://localhost:8001");
        cfg.target.container = Some("main".into());
        cfg.target.shell = vec!["/bin/bash".into(), "--norc".into()];
        let url = exec_url(&cfg).unwrap();
        assert!(url.starts_with("ws://localhost:8001/api/v1/"));
        assert!(url.contains("command=%2Fbin%2Fbash&command=--norc&"));
        assert!(url.ends_with("&container=main"));
    }

    #[test]
    fn exec_url_rejects_unknown_scheme() {
        let err = exec_url(&config("ftp://example.com")).unwrap_err();
        assert!(matches!(err, PodshError::Config(_)));
    }

    #[tokio::test]
    async fn runs_commands_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                assert!(req.uri().path().ends_with("/pods/sys-report-daily/exec"));
                assert_eq!(
                    req.headers().get("Authorization").unwrap(),
                    "Bearer secret"
                );
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(EXEC_SUBPROTOCOL),
                );
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            let mut shell = FakeShell::new();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Binary(data) = msg else { continue };
                let (_, payload) = channel::decode(&data).unwrap();
                for frame in shell.feed(payload) {
                    ws.send(Message::Binary(frame)).await.unwrap();
                }
            }
        });

        let mut cfg = config(&format!("http://{addr}"));
        cfg.token = Some("secret".into());
        let session = Session::open(&WebSocketUpgrader::new(), &cfg).await.unwrap();

        let out = session.run("echo hello").await.unwrap();
        assert_eq!(out.stdout, b"hello\n");
        assert!(out.stderr.is_empty());

        let out = session.run("echo err 1>&2").await.unwrap();
        assert!(out.stdout.is_empty());
        assert_eq!(out.stderr, b"err\n");

        session.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_subprotocol_fails_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await;
        });

        let err = match Session::open(&WebSocketUpgrader::new(), &config(&format!("http://{addr}"))).await {
            Ok(_) => panic!("upgrade should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, PodshError::ProtocolUpgradeFailed(_)));
    }
}
