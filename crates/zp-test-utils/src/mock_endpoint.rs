// mock_endpoint: A mock monitoring endpoint for testing the poller.
//
// Speaks the CRLF-JSON line protocol over plain TCP.  Binds to port 0
// (random) so each test can spin up its own isolated instance.
//
// # Protocol behavior
// - `handshake.hello` is answered with the configured heartbeat interval.
// - `heartbeat.post` is answered after the configured response delay with a
//   server timestamp shifted by the configured clock offset.
// - Every inbound frame is forwarded to the test through `recv()`.
// - Tests inject server->poller frames (prepare sequences, host-info or
//   check-test requests) with `inject()`.

use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use zp_protocol::{codec, methods, now_timestamp_millis, Frame, HandshakeResult, HeartbeatResult};

/// Tunable behavior of a [`MockEndpoint`].
#[derive(Debug, Clone)]
pub struct EndpointBehavior {
    /// Heartbeat interval returned in the handshake result, milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Added to the server timestamp in heartbeat responses.
    pub clock_offset_ms: i64,
    /// Artificial delay before answering a heartbeat; the poller measures
    /// roughly half of it as latency.
    pub response_delay_ms: u64,
    /// Answer `handshake.hello` automatically.
    pub auto_handshake: bool,
    /// Answer `heartbeat.post` automatically.
    pub auto_heartbeat: bool,
}

impl Default for EndpointBehavior {
    fn default() -> Self {
        EndpointBehavior {
            heartbeat_interval_ms: 100,
            clock_offset_ms: 0,
            response_delay_ms: 0,
            auto_handshake: true,
            auto_heartbeat: true,
        }
    }
}

/// A scripted monitoring endpoint listening on a random local port.
pub struct MockEndpoint {
    addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<Frame>,
    outbound_tx: broadcast::Sender<Frame>,
    cancel: CancellationToken,
}

impl MockEndpoint {
    /// Start the endpoint; connections are handled in background tasks.
    pub async fn start(behavior: EndpointBehavior) -> std::io::Result<MockEndpoint> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        let accept_outbound = outbound_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { break };
                        tokio::spawn(handle_connection(
                            stream,
                            behavior.clone(),
                            inbound_tx.clone(),
                            accept_outbound.subscribe(),
                            accept_cancel.clone(),
                        ));
                    }
                }
            }
        });

        Ok(MockEndpoint {
            addr,
            inbound_rx,
            outbound_tx,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` string for the poller's endpoint list.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a server->poller frame on the current connection.
    pub fn inject(&self, mut frame: Frame) {
        if frame.source.is_empty() {
            frame.source = "endpoint".to_owned();
        }
        let _ = self.outbound_tx.send(frame);
    }

    /// Next frame received from the poller, any method.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound_rx.recv().await
    }

    /// Receive frames until one carries the given method.
    pub async fn recv_method(&mut self, method: &str) -> Option<Frame> {
        while let Some(frame) = self.recv().await {
            if frame.method.as_deref() == Some(method) {
                return Some(frame);
            }
        }
        None
    }

    /// Receive frames until a response (no method) with a `status` result
    /// field arrives, e.g. a prepare/commit result.
    pub async fn recv_status_response(&mut self) -> Option<Frame> {
        while let Some(frame) = self.recv().await {
            let has_status = frame
                .result
                .as_ref()
                .map(|r| r.get("status").is_some())
                .unwrap_or(false);
            if frame.method.is_none() && has_status {
                return Some(frame);
            }
        }
        None
    }

    /// Tear down the listener and every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: EndpointBehavior,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    mut outbound_rx: broadcast::Receiver<Frame>,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = codec::read_frame(&mut reader) => {
                let frame = match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) | Err(_) => return,
                };
                let _ = inbound_tx.send(frame.clone());

                match frame.method.as_deref() {
                    Some(methods::HANDSHAKE_HELLO) if behavior.auto_handshake => {
                        let resp = match Frame::response_to(
                            &frame,
                            &HandshakeResult {
                                heartbeat_interval: behavior.heartbeat_interval_ms,
                            },
                        ) {
                            Ok(resp) => resp,
                            Err(_) => return,
                        };
                        if codec::write_frame(&mut write_half, &resp).await.is_err() {
                            return;
                        }
                    }
                    Some(methods::HEARTBEAT_POST) if behavior.auto_heartbeat => {
                        if behavior.response_delay_ms > 0 {
                            tokio::time::sleep(std::time::Duration::from_millis(
                                behavior.response_delay_ms,
                            ))
                            .await;
                        }
                        let resp = match Frame::response_to(
                            &frame,
                            &HeartbeatResult {
                                timestamp: now_timestamp_millis() + behavior.clock_offset_ms,
                            },
                        ) {
                            Ok(resp) => resp,
                            Err(_) => return,
                        };
                        if codec::write_frame(&mut write_half, &resp).await.is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
            queued = outbound_rx.recv() => {
                let Ok(frame) = queued else { continue };
                if codec::write_frame(&mut write_half, &frame).await.is_err() {
                    return;
                }
            }
        }
    }
}
