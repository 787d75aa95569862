//! In-process stand-in for the server module.
//!
//! [`SimServer::connector`] hands the client one end of an in-memory duplex
//! stream; the other end is served by a task that decodes frames the way the
//! real server does and answers with canned behavior. Tests inspect what was
//! received and push value updates, log records, heartbeats or a quit.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use wasim_client::codec::{Command, DataRequest, KeyEvent, LogRecord};
use wasim_client::protocol::{build_frame, flags, Channel, CommandId, FrameBuffer, Header};
use wasim_client::transport::{BoxFuture, Connector, TransportStream};
use wasim_client::{LogLevel, RequestType, Result};

pub const SERVER_VERSION: u32 = 0x0102_0003;

#[derive(Default)]
struct State {
    client_id: AtomicUsize,
    connects: AtomicUsize,
    silent: AtomicBool,
    stalled: AtomicBool,
    finish_lists: AtomicBool,
    pipe_buffer: AtomicUsize,
    connect_delay_ms: AtomicUsize,
    streams_closed: AtomicUsize,
    commands: Mutex<Vec<Command>>,
    requests: Mutex<Vec<DataRequest>>,
    key_events: Mutex<Vec<KeyEvent>>,
    opened: Mutex<Vec<(u8, u32)>>,
    closed: Mutex<Vec<(u8, u32)>>,
    quit_received: AtomicBool,
    variables: Mutex<HashMap<String, f64>>,
    list_items: Mutex<Vec<(u32, String)>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// Handle to the simulated server. Cheap to clone.
#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<State>,
}

impl SimServer {
    pub fn new() -> Self {
        let server = Self::default();
        server.state.finish_lists.store(true, Ordering::SeqCst);
        server.state.pipe_buffer.store(256 * 1024, Ordering::SeqCst);
        server
    }

    /// Shrink the in-memory pipe so the client's writes back up quickly.
    pub fn with_pipe_buffer(self, bytes: usize) -> Self {
        self.state.pipe_buffer.store(bytes, Ordering::SeqCst);
        self
    }

    /// Delay every link open by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Stop reading from the pipe; writes towards the client still flow.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of client streams that reached end of file.
    pub fn streams_closed(&self) -> usize {
        self.state.streams_closed.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            state: self.state.clone(),
        }
    }

    /// Stop answering anything (the stream stays open).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// When false, list items are sent but the closing `Ack` is not.
    pub fn set_finish_lists(&self, finish: bool) {
        self.state.finish_lists.store(finish, Ordering::SeqCst);
    }

    pub fn set_list_items(&self, items: &[(u32, &str)]) {
        *self.state.list_items.lock() = items
            .iter()
            .map(|(id, name)| (*id, name.to_string()))
            .collect();
    }

    pub fn set_variable(&self, name: &str, value: f64) {
        self.state.variables.lock().insert(name.to_string(), value);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.commands.lock().clone()
    }

    pub fn commands_of(&self, id: CommandId) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|c| c.command_id == id)
            .collect()
    }

    pub fn requests(&self) -> Vec<DataRequest> {
        self.state.requests.lock().clone()
    }

    pub fn key_events(&self) -> Vec<KeyEvent> {
        self.state.key_events.lock().clone()
    }

    pub fn opened(&self, channel: Channel, key: u32) -> bool {
        self.state.opened.lock().contains(&(channel as u8, key))
    }

    pub fn closed(&self, channel: Channel, key: u32) -> bool {
        self.state.closed.lock().contains(&(channel as u8, key))
    }

    pub fn quit_received(&self) -> bool {
        self.state.quit_received.load(Ordering::SeqCst)
    }

    fn client_id(&self) -> u32 {
        self.state.client_id.load(Ordering::SeqCst) as u32
    }

    fn send(&self, header: Header, payload: &[u8]) {
        if let Some(tx) = self.state.outbound.lock().as_ref() {
            let _ = tx.send(build_frame(&header, payload));
        }
    }

    /// Push a raw value update for `request_id`.
    pub fn push_value(&self, request_id: u32, raw: &[u8]) {
        let header = Header::record(Channel::Value, self.client_id(), request_id, raw.len() as u32);
        self.send(header, raw);
    }

    /// Send an unsolicited command on the response channel.
    pub fn send_response(&self, command: &Command) {
        respond(&self.state, self.client_id(), command);
    }

    pub fn send_log(&self, level: LogLevel, message: &str) {
        let record = LogRecord::new(level, message, 0).encode();
        let header = Header::record(Channel::Log, self.client_id(), 0, record.len() as u32);
        self.send(header, &record);
    }

    /// Server heartbeat; the client must answer with `Ack(Ping)`.
    pub fn heartbeat(&self) {
        self.send_response(&Command::new(CommandId::Ping, 0));
    }

    /// Tell the client the server is going away.
    pub fn quit(&self) {
        let header = Header::new(Channel::Link, flags::QUIT, self.client_id(), 0, 0);
        self.send(header, &[]);
    }

    /// Poll `check` until it holds or two seconds pass.
    pub async fn until(&self, check: impl Fn(&SimServer) -> bool) -> bool {
        for _ in 0..400 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check(self)
    }
}

pub struct SimConnector {
    state: Arc<State>,
}

impl Connector for SimConnector {
    fn connect(&self) -> BoxFuture<'_, Result<TransportStream>> {
        Box::pin(async move {
            let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            let buffer = self.state.pipe_buffer.load(Ordering::SeqCst);
            let (client_end, server_end) = tokio::io::duplex(buffer);
            let (tx, rx) = mpsc::unbounded_channel();
            *self.state.outbound.lock() = Some(tx.clone());
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(self.state.clone(), server_end, tx, rx));

            let (reader, writer) = tokio::io::split(client_end);
            Ok(TransportStream::new(reader, writer))
        })
    }

    fn describe(&self) -> String {
        "simulated server".to_string()
    }
}

async fn serve(
    state: Arc<State>,
    stream: tokio::io::DuplexStream,
    own: mpsc::UnboundedSender<Vec<u8>>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        while state.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Ok(batch) = frames.push(&buf[..n]) else {
            break;
        };
        for frame in batch {
            state
                .client_id
                .store(frame.client_id() as usize, Ordering::SeqCst);
            let header = frame.header;
            if header.is_quit() {
                state.quit_received.store(true, Ordering::SeqCst);
                continue;
            }
            if header.is_open() {
                state.opened.lock().push((header.channel, header.key));
                continue;
            }
            if header.is_close() {
                state.closed.lock().push((header.channel, header.key));
                continue;
            }
            match frame.channel() {
                Some(Channel::Command) => {
                    if let Ok(command) = Command::decode(frame.payload()) {
                        state.commands.lock().push(command.clone());
                        if !state.silent.load(Ordering::SeqCst) {
                            answer(&state, frame.client_id(), &command);
                        }
                    }
                }
                Some(Channel::Request) => {
                    if let Ok(request) = DataRequest::decode(frame.payload()) {
                        state.requests.lock().push(request.clone());
                        if !state.silent.load(Ordering::SeqCst)
                            && request.request_type != RequestType::None
                        {
                            let kind = CommandId::Subscribe.into();
                            let reply = if request.name_or_code.starts_with("BAD") {
                                Command::with_text(CommandId::Nak, kind, "Unknown variable")
                            } else {
                                Command::new(CommandId::Ack, kind)
                            };
                            respond(&state, frame.client_id(), &reply.token(request.request_id));
                        }
                    }
                }
                Some(Channel::KeyEvent) => {
                    if let Ok(event) = KeyEvent::decode(frame.payload()) {
                        state.key_events.lock().push(event);
                    }
                }
                _ => {}
            }
        }
    }
    state.streams_closed.fetch_add(1, Ordering::SeqCst);
    let mut current = state.outbound.lock();
    if current.as_ref().is_some_and(|tx| tx.same_channel(&own)) {
        current.take();
    }
}

fn respond(state: &State, client_id: u32, command: &Command) {
    let payload = command.encode();
    let header = Header::record(Channel::Response, client_id, 0, payload.len() as u32);
    if let Some(tx) = state.outbound.lock().as_ref() {
        let _ = tx.send(build_frame(&header, &payload));
    }
}

fn variable_key(text: &str) -> String {
    text.split(',').next().unwrap_or_default().to_string()
}

fn answer(state: &State, client_id: u32, command: &Command) {
    let reply = match command.command_id {
        CommandId::Connect | CommandId::Ping => {
            Command::ack_for(command).f_data(f64::from(SERVER_VERSION))
        }
        CommandId::Get | CommandId::GetCreate => {
            let key = variable_key(&command.s_data);
            let mut variables = state.variables.lock();
            let value = match variables.get(&key) {
                Some(value) => *value,
                None if command.command_id == CommandId::GetCreate => {
                    variables.insert(key, command.f_data);
                    command.f_data
                }
                None => {
                    drop(variables);
                    respond(state, client_id, &Command::nak_for(command, "Unknown variable"));
                    return;
                }
            };
            Command::ack_for(command).f_data(value)
        }
        CommandId::Set | CommandId::SetCreate => {
            state
                .variables
                .lock()
                .insert(variable_key(&command.s_data), command.f_data);
            return;
        }
        CommandId::Exec => {
            let mut ack = Command::ack_for(command).f_data(1.0);
            ack.s_data = "1".to_string();
            ack
        }
        CommandId::Lookup => {
            if command.s_data == "NO_SUCH_EVENT" {
                Command::nak_for(command, "Lookup failed")
            } else {
                Command::ack_for(command).f_data(65_580.0)
            }
        }
        CommandId::List => {
            let items = state.list_items.lock().clone();
            for (id, name) in items {
                let item = Command::with_text(CommandId::List, id, name).token(command.token);
                respond(state, client_id, &item);
            }
            if !state.finish_lists.load(Ordering::SeqCst) {
                return;
            }
            Command::ack_for(command)
        }
        _ => return,
    };
    respond(state, client_id, &reply);
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
