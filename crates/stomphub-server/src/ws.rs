use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use stomphub_broker::{Transport, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::app::AppState;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

enum WriterCommand {
    Payload(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Binds the listener and runs the accept loop until shutdown.
pub async fn run_ws_server(state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&state.config.listen)
        .await
        .with_context(|| {
            format!("failed to bind listener on {}", state.config.listen)
        })?;
    serve(listener, state).await
}

pub(crate) async fn serve(
    listener: TcpListener,
    state: AppState,
) -> Result<()> {
    info!(
        "websocket server listening: listen={}, path={}",
        state.config.listen, state.config.path
    );

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("websocket server stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("tcp accept failed")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, state).await {
                        debug!("connection ended: peer={peer}, error={err}");
                    }
                });
            }
        }
    }

    state.broker.shutdown();
    Ok(())
}

/// Upgrades one TCP connection and pumps it: the read loop feeds the
/// broker serially (which is what keeps per-session handlers from
/// interleaving), a writer task drains the outbound queue into the
/// sink.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> Result<()> {
    let expected_path = state.config.path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut reject =
                ErrorResponse::new(Some("unknown upgrade path".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .context("websocket handshake failed")?;
    let (mut sink, mut source) = ws.split();

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<WriterCommand>(OUTBOUND_QUEUE_CAPACITY);
    let transport = Arc::new(WsTransport {
        outbound: outbound_tx.clone(),
        open: AtomicBool::new(true),
    });
    let session_id = state
        .broker
        .session_opened(transport.clone(), Some(peer.to_string()));

    let writer = tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            let result = match command {
                WriterCommand::Payload(payload) => {
                    sink.send(to_ws_message(payload)).await
                }
                WriterCommand::Pong(data) => {
                    sink.send(Message::Pong(data.into())).await
                }
                WriterCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = source.next() => {
                let Some(message) = incoming else {
                    break;
                };
                match message {
                    Ok(Message::Text(text)) => {
                        state.broker.session_message(&session_id, text.as_bytes());
                    }
                    Ok(Message::Binary(payload)) => {
                        state.broker.session_message(&session_id, &payload);
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = outbound_tx
                            .try_send(WriterCommand::Pong(data.to_vec()));
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(err) => {
                        warn!(
                            "websocket read failed: session={session_id}, error={err}"
                        );
                        state.broker.session_error(&session_id, &err.to_string());
                        break;
                    }
                }
            }
        }
    }

    state.broker.session_closed(&session_id);

    // let the writer observe the channel closing
    drop(transport);
    drop(outbound_tx);
    let _ = writer.await;
    Ok(())
}

fn to_ws_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text.into()),
        Err(raw) => Message::Binary(raw.into_bytes().into()),
    }
}

/// Outbound half of one WebSocket connection, handed to the broker.
/// `send` enqueues without blocking; the writer task owns the sink.
struct WsTransport {
    outbound: mpsc::Sender<WriterCommand>,
    open: AtomicBool,
}

impl Transport for WsTransport {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.outbound.try_send(WriterCommand::Payload(payload)).map_err(
            |err| match err {
                TrySendError::Full(_) => TransportError::QueueFull,
                TrySendError::Closed(_) => TransportError::Closed,
            },
        )
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.try_send(WriterCommand::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, Stream, StreamExt};
    use stomphub_broker::Broker;
    use stomphub_proto::{Frame, WirePayload};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    use super::serve;
    use crate::app::AppState;
    use crate::config::Config;

    async fn start_server() -> (SocketAddr, AppState) {
        let config = Config::default();
        let broker = Broker::new(stomphub_broker::BrokerConfig {
            heartbeat: (0, 0),
            ..Default::default()
        });
        let state = AppState {
            broker,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, server_state).await;
        });
        (addr, state)
    }

    async fn expect_frame(
        ws: &mut (impl Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
    ) -> Frame {
        loop {
            let message = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("reply in time")
                .expect("stream open")
                .expect("read ok");
            let payload = match message {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(payload) => payload.to_vec(),
                _ => continue,
            };
            match stomphub_proto::parse(&payload).expect("valid frame") {
                WirePayload::Frame(frame) => return frame,
                WirePayload::Heartbeat => continue,
            }
        }
    }

    #[tokio::test]
    async fn upgrade_and_stomp_handshake() {
        let (addr, state) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/stomp"))
            .await
            .expect("upgrade on the configured path");

        ws.send(Message::text("CONNECT\naccept-version:1.1\nhost:t\n\n\0"))
            .await
            .expect("send CONNECT");

        let connected = expect_frame(&mut ws).await;
        assert_eq!(connected.command, "CONNECTED");
        assert_eq!(connected.headers.get("version"), Some("1.1"));

        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_upgrade_path_is_rejected() {
        let (addr, state) = start_server().await;
        assert!(connect_async(format!("ws://{addr}/nope")).await.is_err());
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn pub_sub_between_two_websocket_clients() {
        let (addr, state) = start_server().await;
        let url = format!("ws://{addr}/stomp");

        let (mut subscriber, _) =
            connect_async(&url).await.expect("subscriber upgrade");
        subscriber
            .send(Message::text("CONNECT\naccept-version:1.1\nhost:t\n\n\0"))
            .await
            .expect("subscriber CONNECT");
        assert_eq!(expect_frame(&mut subscriber).await.command, "CONNECTED");
        subscriber
            .send(Message::text(
                "SUBSCRIBE\nid:1\ndestination:/foo\n\n\0",
            ))
            .await
            .expect("SUBSCRIBE");
        sleep(Duration::from_millis(100)).await;

        let (mut publisher, _) =
            connect_async(&url).await.expect("publisher upgrade");
        publisher
            .send(Message::text("CONNECT\naccept-version:1.1\nhost:t\n\n\0"))
            .await
            .expect("publisher CONNECT");
        assert_eq!(expect_frame(&mut publisher).await.command, "CONNECTED");
        publisher
            .send(Message::text(
                "SEND\ndestination:/foo\ncontent-type:text/plain\n\nhello\0",
            ))
            .await
            .expect("SEND");

        let message = expect_frame(&mut subscriber).await;
        assert_eq!(message.command, "MESSAGE");
        assert_eq!(message.headers.get("destination"), Some("/foo"));
        assert_eq!(message.headers.get("subscription"), Some("1"));
        assert_eq!(message.body_as_text(), Some("hello"));

        state.shutdown.cancel();
    }
}
