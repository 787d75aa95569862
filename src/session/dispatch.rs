//! Inbound frame dispatch.
//!
//! One task per link reads the stream, splits it into frames and routes each
//! frame by channel. Nothing here waits on a caller or on the writer:
//! responses are handed to the correlator, values to the request registry,
//! and observers run inline behind a panic guard.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use super::ClientInner;
use crate::codec::{Command, LogRecord};
use crate::error::WasimError;
use crate::protocol::{Channel, CommandId, Frame, FrameBuffer, LogLevel};
use crate::transport::BoxedReader;

const TARGET: &str = "wasim_client::dispatch";

/// Read loop. Ends when stopped, when the client is dropped, or when the
/// link fails (in which case teardown is scheduled).
pub(super) async fn run(
    inner: Weak<ClientInner>,
    mut reader: BoxedReader,
    mut stop: watch::Receiver<bool>,
    wait: Duration,
    max_payload_size: u32,
) {
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if *stop.borrow() {
            return;
        }
        let read = tokio::select! {
            _ = stop.changed() => return,
            read = tokio::time::timeout(wait, reader.read(&mut buf)) => read,
        };
        let n = match read {
            Err(_) => continue,
            Ok(Ok(0)) => {
                lost(&inner, "server closed the stream");
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                lost(&inner, &e.to_string());
                return;
            }
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!(target: TARGET, "Framing error: {}", e);
                lost(&inner, "corrupt stream");
                return;
            }
        };

        let Some(client) = inner.upgrade() else {
            return;
        };
        for frame in frames {
            if frame.is_quit() {
                client.link_lost("server quit");
                return;
            }
            client.handle_frame(frame);
        }
    }
}

fn lost(inner: &Weak<ClientInner>, reason: &str) {
    if let Some(client) = inner.upgrade() {
        client.link_lost(reason);
    }
}

impl ClientInner {
    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if frame.header.is_open() || frame.header.is_close() {
            tracing::trace!(target: TARGET, header = ?frame.header, "Channel control frame");
            return;
        }
        match frame.channel() {
            Some(Channel::Response) => match Command::decode(frame.payload()) {
                Ok(command) => self.handle_response(command),
                Err(e) => tracing::warn!(target: TARGET, "Malformed response: {}", e),
            },
            Some(Channel::Value) => self.handle_value(frame.key(), frame.payload()),
            Some(Channel::Log) => match LogRecord::decode(frame.payload()) {
                Ok(record) => self.handle_log(&record),
                Err(e) => tracing::warn!(target: TARGET, "Malformed log record: {}", e),
            },
            Some(other) => {
                tracing::debug!(target: TARGET, "Ignoring frame on {} channel", other)
            }
            None => tracing::warn!(
                target: TARGET,
                "Ignoring frame on unknown channel {}",
                frame.header.channel
            ),
        }
    }

    fn handle_response(self: &Arc<Self>, command: Command) {
        tracing::trace!(target: TARGET, ?command, "Response");
        self.mark_server_seen();

        match command.command_id {
            CommandId::Ping => {
                self.answer_heartbeat();
                return;
            }
            CommandId::List => {
                if !self.list.push_chunk(&command) {
                    tracing::warn!(
                        target: TARGET,
                        "List item with unexpected token {}",
                        command.token
                    );
                }
                return;
            }
            CommandId::Disconnect => {
                self.session_ended_by_server();
                return;
            }
            CommandId::Ack | CommandId::Nak => {
                if command.responds_to() == Some(CommandId::Subscribe) {
                    let result = if command.is_ack() {
                        Ok(())
                    } else {
                        Err(command.s_data.clone())
                    };
                    self.requests.acknowledge(command.token, result);
                }
                if command.is_nak() {
                    tracing::warn!(
                        target: TARGET,
                        "{:?} command (token {}) rejected: {}",
                        command.responds_to().unwrap_or_default(),
                        command.token,
                        command.s_data
                    );
                }
                if command.token != 0 {
                    self.correlator.fulfill(&command);
                }
                self.callbacks.command_result(&command);
            }
            _ => {}
        }
        self.callbacks.response(&command);
    }

    /// The read loop must not park on the writer, so a full queue hands the
    /// reply to its own task.
    fn answer_heartbeat(self: &Arc<Self>) {
        let ack = Command::new(CommandId::Ack, CommandId::Ping.into());
        match self.try_write_command(&ack) {
            Ok(()) => {}
            Err(WasimError::BackpressureTimeout) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.write_command(&ack).await {
                        tracing::warn!(target: TARGET, "Could not answer heartbeat: {}", e);
                    }
                });
            }
            Err(e) => tracing::warn!(target: TARGET, "Could not answer heartbeat: {}", e),
        }
    }

    fn handle_value(&self, request_id: u32, payload: &[u8]) {
        match self.requests.apply_value(request_id, payload) {
            Ok(Some(record)) => self.callbacks.data(&record),
            Ok(None) => {}
            Err(e) => tracing::warn!(target: TARGET, "Dropping value update: {}", e),
        }
    }

    fn handle_log(&self, record: &LogRecord) {
        const SERVER: &str = "wasim_client::server";
        let message = record.message.as_str();
        match record.level {
            LogLevel::Critical | LogLevel::Error => tracing::error!(target: SERVER, "{}", message),
            LogLevel::Warning => tracing::warn!(target: SERVER, "{}", message),
            LogLevel::Info => tracing::info!(target: SERVER, "{}", message),
            LogLevel::Debug => tracing::debug!(target: SERVER, "{}", message),
            LogLevel::Trace | LogLevel::None => tracing::trace!(target: SERVER, "{}", message),
        }
        self.callbacks.log(record);
    }
}
