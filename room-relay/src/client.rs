use anyhow::{Context, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{decode_server_event, encode, ClientEvent, Envelope, ServerEvent},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;
type StdinLines = Lines<BufReader<Stdin>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut sink, mut stream) = establish_connection(&args).await?;

    let mut current_room = None;
    if let Some(room) = args.room {
        send_event(&mut sink, &ClientEvent::JoinRoom(room.clone())).await?;
        current_room = Some(room);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut stream, &mut sink, &mut stdin, &mut current_room).await?;
    shutdown_connection(&mut sink).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketSink, SocketStream)> {
    let (socket, _response) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(socket.split())
}

async fn run_client_loop(
    stream: &mut SocketStream,
    sink: &mut SocketSink,
    stdin: &mut StdinLines,
    current_room: &mut Option<String>,
) -> Result<()> {
    loop {
        // `next_line` keeps partially read input across cancellation.
        select! {
            frame = stream.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, sink, current_room).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    let message = match frame {
        Some(message) => message.context("failed to read from relay")?,
        None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    match message {
        Message::Text(text) => match decode_server_event(&text) {
            Ok(event) => render_server_event(&event).await?,
            Err(error) => warn!(?error, "ignoring undecodable event"),
        },
        Message::Close(_) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        _ => {}
    }
    Ok(true)
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Join(&'a str),
    Leave(&'a str),
    Global,
    Say(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return Input::Empty;
    }

    if text.eq_ignore_ascii_case("/quit") {
        return Input::Quit;
    }
    if text.eq_ignore_ascii_case("/global") {
        return Input::Global;
    }
    if let Some(room) = command_argument(text, "/join") {
        return if room.is_empty() { Input::Empty } else { Input::Join(room) };
    }
    if let Some(room) = command_argument(text, "/leave") {
        return if room.is_empty() { Input::Empty } else { Input::Leave(room) };
    }
    Input::Say(text)
}

/// Returns the trimmed argument when `text` is `command`, alone or followed by whitespace.
fn command_argument<'a>(text: &'a str, command: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(command)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    sink: &mut SocketSink,
    current_room: &mut Option<String>,
) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    match parse_input(&line) {
        Input::Empty => {}
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::Global => {
            *current_room = None;
            write_stdout("*** sending to everyone").await?;
        }
        Input::Join(room) => {
            send_event(sink, &ClientEvent::JoinRoom(room.to_string())).await?;
            *current_room = Some(room.to_string());
        }
        Input::Leave(room) => {
            send_event(sink, &ClientEvent::LeaveRoom(room.to_string())).await?;
            if current_room.as_deref() == Some(room) {
                *current_room = None;
            }
        }
        Input::Say(text) => {
            let mut envelope = Envelope::text(text);
            if let Some(room) = current_room.as_deref() {
                envelope = envelope.with_room(room);
            }
            send_event(sink, &ClientEvent::Message(envelope)).await?;
        }
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn send_event(sink: &mut SocketSink, event: &ClientEvent) -> Result<()> {
    let text = encode(event).context("failed to encode event")?;
    sink.send(Message::Text(text))
        .await
        .context("failed to send to relay")?;
    Ok(())
}

async fn shutdown_connection(sink: &mut SocketSink) {
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close relay connection cleanly");
    }
}

enum Line {
    Out(String),
    Err(String),
}

fn format_server_event(event: &ServerEvent) -> Line {
    match event {
        ServerEvent::Connected { id } => Line::Out(format!("*** connected as {id}")),
        ServerEvent::RoomJoined(room) => Line::Out(format!("*** joined room {room}")),
        ServerEvent::RoomLeft(room) => Line::Out(format!("*** left room {room}")),
        ServerEvent::Message(envelope) => {
            let from = envelope
                .sender()
                .map_or_else(|| "server".to_string(), |id| id.to_string());
            let text = match envelope.message() {
                Some(text) => text.to_string(),
                None => serde_json::to_string(envelope).unwrap_or_default(),
            };
            match envelope.room().filter(|room| !room.is_empty()) {
                Some(room) => Line::Out(format!("[{room}] <{from}> {text}")),
                None => Line::Out(format!("<{from}> {text}")),
            }
        }
        ServerEvent::Error { message } => Line::Err(format!("!!! {message}")),
    }
}

async fn render_server_event(event: &ServerEvent) -> io::Result<()> {
    match format_server_event(event) {
        Line::Out(line) => write_stdout(&line).await,
        Line::Err(line) => write_stderr(&line).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
