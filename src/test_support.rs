use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeBehavior {
    pub reject: Vec<String>,
    /// Never answered.
    pub silent: Vec<String>,
    pub greeting: Option<String>,
    pub pings_before_welcome: usize,
    pub msgpack: bool,
}

enum Control {
    Frame(Value),
    Raw(String),
    Close,
}

pub(crate) struct FakeCable {
    control: mpsc::UnboundedSender<Control>,
    commands: Arc<Mutex<Vec<Value>>>,
    finished: Arc<AtomicBool>,
}

impl FakeCable {
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().expect("commands lock").clone()
    }

    pub fn broadcast(&self, identifier: &str, message: Value) {
        let frame = json!({"identifier": identifier, "message": message});
        let _ = self.control.send(Control::Frame(frame));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.control.send(Control::Raw(text.to_owned()));
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }
}

/// `message` commands are echoed back to the sender's channel.
pub(crate) async fn fake_cable(
    behavior: FakeBehavior,
) -> (WebSocketStream<DuplexStream>, FakeCable) {
    let (client_io, server_io) = duplex(256 * 1024);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let commands_seen = commands.clone();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_flag = finished.clone();
    tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        serve(ws, behavior, control_rx, commands_seen).await;
        finished_flag.store(true, Ordering::SeqCst);
    });

    let ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let handle = FakeCable {
        control: control_tx,
        commands,
        finished,
    };
    (ws, handle)
}

pub(crate) async fn fake_cable_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake cable listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (_control_tx, control_rx) = mpsc::unbounded_channel();
                serve(
                    ws,
                    FakeBehavior::default(),
                    control_rx,
                    Arc::new(Mutex::new(Vec::new())),
                )
                .await;
            });
        }
    });
    format!("ws://{addr}/cable")
}

pub(crate) async fn fake_cable_server(behavior: FakeBehavior) -> (String, FakeCable) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake cable listener");
    let addr = listener.local_addr().expect("listener addr");
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let commands_seen = commands.clone();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_flag = finished.clone();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                serve(ws, behavior, control_rx, commands_seen).await;
            }
        }
        finished_flag.store(true, Ordering::SeqCst);
    });
    let handle = FakeCable {
        control: control_tx,
        commands,
        finished,
    };
    (format!("ws://{addr}/cable"), handle)
}

async fn serve<S>(
    mut ws: WebSocketStream<S>,
    behavior: FakeBehavior,
    mut control: mpsc::UnboundedReceiver<Control>,
    commands: Arc<Mutex<Vec<Value>>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..behavior.pings_before_welcome {
        let ping = json!({"type": "ping", "message": 1_700_000_000});
        if ws.send(encode(&behavior, &ping)).await.is_err() {
            return;
        }
    }
    let greeting = match behavior.greeting.clone() {
        Some(raw) => WsMessage::Text(raw),
        None => encode(&behavior, &json!({"type": "welcome"})),
    };
    if ws.send(greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = ws.next() => {
                let command = match frame {
                    Some(Ok(WsMessage::Text(text))) => serde_json::from_str::<Value>(&text).ok(),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        rmp_serde::from_slice::<Value>(&bytes).ok()
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Some(command) = command else {
                    continue;
                };
                commands.lock().expect("commands lock").push(command.clone());
                if let Some(reply) = answer(&behavior, &command) {
                    if ws.send(encode(&behavior, &reply)).await.is_err() {
                        break;
                    }
                }
            }
            control = control.recv() => match control {
                Some(Control::Frame(frame)) => {
                    if ws.send(encode(&behavior, &frame)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Raw(text)) => {
                    if ws.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }
}

fn encode(behavior: &FakeBehavior, frame: &Value) -> WsMessage {
    if behavior.msgpack {
        WsMessage::Binary(rmp_serde::to_vec_named(frame).expect("msgpack frame"))
    } else {
        WsMessage::Text(frame.to_string())
    }
}

fn answer(behavior: &FakeBehavior, command: &Value) -> Option<Value> {
    let identifier = command["identifier"].as_str()?;
    match command["command"].as_str()? {
        "subscribe" => {
            let parsed: Value = serde_json::from_str(identifier).ok()?;
            let name = parsed["channel"].as_str().unwrap_or_default();
            if behavior.silent.iter().any(|n| n == name) {
                None
            } else if behavior.reject.iter().any(|n| n == name) {
                Some(json!({"type": "reject_subscription", "identifier": identifier}))
            } else {
                Some(json!({"type": "confirm_subscription", "identifier": identifier}))
            }
        }
        "message" => {
            let data: Value = serde_json::from_str(command["data"].as_str()?).ok()?;
            Some(json!({"identifier": identifier, "message": data}))
        }
        _ => None,
    }
}

pub(crate) async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
