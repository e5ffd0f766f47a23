use std::fmt;
use std::process::ExitCode;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use stomphub_proto::{Frame, WirePayload};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const EX_TEMPFAIL: u8 = 75;
const EX_USAGE: u8 = 64;
/// A SEND frame travels as one WebSocket payload, so the body cannot be
/// streamed in pieces; anything bigger than this is refused up front.
const MAX_FRAME_BODY: usize = 1024 * 1024;
const STDIN_CHUNK: usize = 16 * 1024;
const SUBSCRIPTION_ID: &str = "0";

type Result<T> = std::result::Result<T, ClientError>;
type WsError = tokio_tungstenite::tungstenite::Error;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("stomphub-client error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse(std::env::args().skip(1))?;
    let io_timeout = Duration::from_secs(cli.timeout_secs);

    let connect = timeout(io_timeout, connect_async(&cli.url));
    let (ws, _) = connect
        .await
        .map_err(|_| {
            ClientError::Runtime(format!("connect timeout to {}", cli.url))
        })?
        .map_err(|err| {
            runtime_err(format!("failed to connect to {}", cli.url), err)
        })?;
    let (mut sink, mut source) = ws.split();

    send_frame(&mut sink, &connect_frame(&cli.url), io_timeout).await?;
    let connected = read_frame(&mut source, io_timeout).await?;
    match connected.command.as_str() {
        "CONNECTED" => {}
        "ERROR" => {
            return Err(ClientError::Runtime(format!(
                "broker refused connection: {}",
                connected.headers.get("message").unwrap_or("-")
            )));
        }
        other => {
            return Err(ClientError::Runtime(format!(
                "unexpected reply to CONNECT: {other}"
            )));
        }
    }

    match &cli.mode {
        Mode::Publish(destination) => {
            let body = read_publish_body(&mut tokio::io::stdin()).await?;
            let mut frame = publish_frame(
                destination,
                cli.content_type.as_deref(),
            );
            frame.body = Some(body);
            send_frame(&mut sink, &frame, io_timeout).await?;
            send_frame(&mut sink, &Frame::new("DISCONNECT"), io_timeout)
                .await?;
            let _ = sink.close().await;
            Ok(())
        }
        Mode::Subscribe(destination) => {
            let subscribe = Frame::new("SUBSCRIBE")
                .header("id", SUBSCRIPTION_ID)
                .header("destination", destination.as_str());
            send_frame(&mut sink, &subscribe, io_timeout).await?;
            eprintln!(
                "subscribed to {destination}, printing messages (ctrl-c to stop)"
            );

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        let _ = send_frame(
                            &mut sink,
                            &Frame::new("DISCONNECT"),
                            io_timeout,
                        )
                        .await;
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    incoming = source.next() => {
                        let Some(message) = incoming else {
                            return Err(ClientError::Runtime(
                                "connection closed by broker".to_string(),
                            ));
                        };
                        let message = message.map_err(|err| {
                            runtime_err("websocket read failed", err)
                        })?;
                        if let Some(frame) = decode_frame(message)? {
                            print_message(&frame)?;
                        }
                    }
                }
            }
        }
    }
}

fn connect_frame(url: &str) -> Frame {
    Frame::new("CONNECT")
        .header("accept-version", "1.1")
        .header("host", host_from_url(url))
        .header("heart-beat", "0,0")
}

fn publish_frame(
    destination: &str,
    content_type: Option<&str>,
) -> Frame {
    let mut frame =
        Frame::new("SEND").header("destination", destination);
    if let Some(content_type) = content_type {
        frame = frame.header("content-type", content_type);
    }
    frame
}

/// The authority part of a `ws://` / `wss://` URL, for the CONNECT
/// `host` header.
fn host_from_url(url: &str) -> String {
    url.trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .split('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

fn print_message(frame: &Frame) -> Result<()> {
    match frame.command.as_str() {
        "MESSAGE" => {
            println!("{}", frame.body_as_text().unwrap_or("<binary body>"));
            Ok(())
        }
        "ERROR" => Err(ClientError::Runtime(format!(
            "broker error: {}",
            frame.headers.get("message").unwrap_or("-")
        ))),
        _ => Ok(()),
    }
}

async fn send_frame<S>(
    sink: &mut S,
    frame: &Frame,
    io_timeout: Duration,
) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let payload = stomphub_proto::serialize(frame);
    let message = match String::from_utf8(payload) {
        Ok(text) => Message::text(text),
        Err(raw) => Message::binary(raw.into_bytes()),
    };
    timeout(io_timeout, sink.send(message))
        .await
        .map_err(|_| {
            ClientError::Runtime(format!(
                "write timeout for {} frame",
                frame.command
            ))
        })?
        .map_err(|err| {
            runtime_err(format!("failed to send {} frame", frame.command), err)
        })
}

/// Waits for the next STOMP frame, skipping heartbeats and transport
/// control messages.
async fn read_frame<S>(
    source: &mut S,
    io_timeout: Duration,
) -> Result<Frame>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        let message = timeout(io_timeout, source.next())
            .await
            .map_err(|_| {
                ClientError::Runtime("timed out waiting for reply".to_string())
            })?
            .ok_or_else(|| {
                ClientError::Runtime(
                    "connection closed by broker".to_string(),
                )
            })?
            .map_err(|err| runtime_err("websocket read failed", err))?;
        if let Some(frame) = decode_frame(message)? {
            return Ok(frame);
        }
    }
}

fn decode_frame(message: Message) -> Result<Option<Frame>> {
    let payload = match message {
        Message::Text(text) => text.as_bytes().to_vec(),
        Message::Binary(payload) => payload.to_vec(),
        _ => return Ok(None),
    };
    match stomphub_proto::parse(&payload) {
        Ok(WirePayload::Frame(frame)) => Ok(Some(frame)),
        Ok(WirePayload::Heartbeat) => Ok(None),
        Err(err) => Err(runtime_err("broker sent a malformed frame", err)),
    }
}

/// Buffers stdin into the SEND body, chunk by chunk, refusing input
/// that would not fit into a single frame payload.
async fn read_publish_body<R: AsyncRead + Unpin>(
    reader: &mut R
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; STDIN_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await.map_err(|err| {
            runtime_err("failed to read publish body from stdin", err)
        })?;
        if n == 0 {
            return Ok(body);
        }
        if body.len() + n > MAX_FRAME_BODY {
            return Err(ClientError::Runtime(format!(
                "publish body exceeds the single-frame limit of {MAX_FRAME_BODY} bytes"
            )));
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

#[derive(Debug)]
struct Cli {
    url: String,
    mode: Mode,
    content_type: Option<String>,
    timeout_secs: u64,
}

#[derive(Debug, PartialEq)]
enum Mode {
    Subscribe(String),
    Publish(String),
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut url = None;
        let mut subscribe = None;
        let mut publish = None;
        let mut content_type = None;
        let mut timeout_secs = 10_u64;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--url" => url = args.next(),
                "--subscribe" => subscribe = args.next(),
                "--publish" => publish = args.next(),
                "--content-type" => content_type = args.next(),
                "--timeout-secs" => {
                    let raw = args.next().ok_or_else(|| {
                        ClientError::Usage(
                            "missing value for --timeout-secs".to_string(),
                        )
                    })?;
                    timeout_secs = raw.parse::<u64>().map_err(|_| {
                        ClientError::Usage(
                            "--timeout-secs must be a positive integer"
                                .to_string(),
                        )
                    })?;
                }
                "-h" | "--help" => {
                    return Err(ClientError::Usage(USAGE.to_string()));
                }
                _ => {
                    return Err(ClientError::Usage(format!(
                        "unknown argument: {arg}"
                    )));
                }
            }
        }

        let mode = match (subscribe, publish) {
            (Some(destination), None) => Mode::Subscribe(destination),
            (None, Some(destination)) => Mode::Publish(destination),
            (None, None) => {
                return Err(ClientError::Usage(
                    "one of --subscribe or --publish is required".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(ClientError::Usage(
                    "--subscribe and --publish are mutually exclusive"
                        .to_string(),
                ));
            }
        };

        Ok(Self {
            url: url.ok_or_else(|| {
                ClientError::Usage(
                    "missing required argument --url".to_string(),
                )
            })?,
            mode,
            content_type,
            timeout_secs,
        })
    }
}

const USAGE: &str = "usage: stomphub-client --url ws://host:port/stomp \
                     (--subscribe DEST | --publish DEST) \
                     [--content-type TYPE] [--timeout-secs 10]";

#[derive(Debug)]
enum ClientError {
    Usage(String),
    Runtime(String),
}

impl ClientError {
    fn exit_code(&self) -> u8 {
        match self {
            ClientError::Usage(_) => EX_USAGE,
            ClientError::Runtime(_) => EX_TEMPFAIL,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ClientError::Usage(msg) => write!(f, "{msg}"),
            ClientError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display,
) -> ClientError {
    ClientError::Runtime(format!("{}: {err}", context.into()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{
        Cli, ClientError, MAX_FRAME_BODY, Mode, connect_frame, host_from_url,
        publish_frame, read_publish_body,
    };

    fn parse(args: &[&str]) -> Result<Cli, ClientError> {
        Cli::parse(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn cli_parse_subscribe_mode() {
        let cli = parse(&[
            "--url",
            "ws://127.0.0.1:61614/stomp",
            "--subscribe",
            "/foo",
            "--timeout-secs",
            "3",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.url, "ws://127.0.0.1:61614/stomp");
        assert_eq!(cli.mode, Mode::Subscribe("/foo".to_string()));
        assert_eq!(cli.timeout_secs, 3);
        assert!(cli.content_type.is_none());
    }

    #[test]
    fn cli_parse_publish_mode_with_content_type() {
        let cli = parse(&[
            "--url",
            "ws://localhost/stomp",
            "--publish",
            "/t",
            "--content-type",
            "application/json",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.mode, Mode::Publish("/t".to_string()));
        assert_eq!(cli.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn cli_parse_requires_url_and_exactly_one_mode() {
        assert!(matches!(
            parse(&["--subscribe", "/foo"]),
            Err(ClientError::Usage(_))
        ));
        assert!(matches!(
            parse(&["--url", "ws://x/stomp"]),
            Err(ClientError::Usage(_))
        ));
        assert!(matches!(
            parse(&[
                "--url",
                "ws://x/stomp",
                "--subscribe",
                "/a",
                "--publish",
                "/b"
            ]),
            Err(ClientError::Usage(_))
        ));
    }

    #[test]
    fn cli_parse_rejects_unknown_argument() {
        let err = parse(&["--frobnicate"]).expect_err("must fail");
        match err {
            ClientError::Usage(msg) => {
                assert!(msg.contains("unknown argument"));
            }
            _ => panic!("expected usage error"),
        }
    }

    #[test]
    fn host_from_url_strips_scheme_and_path() {
        assert_eq!(host_from_url("ws://broker:61614/stomp"), "broker:61614");
        assert_eq!(host_from_url("wss://broker/stomp"), "broker");
        assert_eq!(host_from_url("broker:61614"), "broker:61614");
    }

    #[test]
    fn connect_frame_carries_handshake_headers() {
        let frame = connect_frame("ws://broker:61614/stomp");
        assert_eq!(frame.command, "CONNECT");
        assert_eq!(frame.headers.get("accept-version"), Some("1.1"));
        assert_eq!(frame.headers.get("host"), Some("broker:61614"));
        assert_eq!(frame.headers.get("heart-beat"), Some("0,0"));
    }

    #[test]
    fn publish_frame_sets_content_type_only_when_given() {
        let plain = publish_frame("/t", None);
        assert!(plain.headers.get("content-type").is_none());

        let json = publish_frame("/t", Some("application/json"));
        assert_eq!(
            json.headers.get("content-type"),
            Some("application/json")
        );
        assert_eq!(json.headers.get("destination"), Some("/t"));
    }

    #[tokio::test]
    async fn publish_body_reads_all_of_stdin() {
        let mut input = Cursor::new(b"hello broker".to_vec());
        let body =
            read_publish_body(&mut input).await.expect("within limit");
        assert_eq!(body, b"hello broker");
    }

    #[tokio::test]
    async fn publish_body_refuses_oversized_input() {
        let mut input = Cursor::new(vec![b'x'; MAX_FRAME_BODY + 1]);
        let err = read_publish_body(&mut input)
            .await
            .expect_err("must refuse bodies over the frame limit");
        match err {
            ClientError::Runtime(msg) => {
                assert!(msg.contains("single-frame limit"));
            }
            _ => panic!("expected runtime error"),
        }
    }
}
