//! Session engine.
//!
//! [`ClientInner`] owns the link (writer task plus dispatch task), the
//! connection state machine, and every registry. The public [`Client`]
//! is a thin handle around it.
//!
//! Lifecycle:
//! 1. `connect_link` opens the transport, spawns the writer and dispatch
//!    tasks, and opens the fixed record channels.
//! 2. `connect_session` runs the `Connect` handshake, then replays log
//!    settings, the pause flag, data requests and registered events.
//! 3. `disconnect_session` / `disconnect_link` unwind the two layers; a lost
//!    link unwinds both.
//!
//! [`Client`]: crate::Client

mod dispatch;
mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::callbacks::Callbacks;
use crate::codec::{
    Command, DataRequest, KeyEvent, COMMAND_SIZE, DATA_REQUEST_SIZE, KEY_EVENT_SIZE,
    LOG_RECORD_SIZE, STRSZ_CMD,
};
use crate::config::ClientConfig;
use crate::error::{Result, WasimError};
use crate::protocol::{Channel, CommandId, LogFacility, LogLevel, LookupItemType, RequestType};
use crate::tracking::{
    CommandCorrelator, EventRegistry, ListAggregator, ListOutcome, ListResult, RegisteredEvent,
    Removal, RequestRegistry, SyncStatus, Upsert, WaitLimit,
};
use crate::transport::Connector;
use crate::variables::{is_settable_variable_type, CommandValue, VariableRequest};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

pub(crate) use state::StateMachine;
pub use state::{ClientEvent, ClientEventType, ClientStatus, ConnectionState};

/// Version reported by this client. The top byte is the major version.
pub const CLIENT_VERSION: u32 = 0x0102_0000;

const TARGET: &str = "wasim_client::session";

struct LinkHandle {
    /// Distinguishes successive links.
    serial: u64,
    writer: WriterHandle,
    writer_task: Option<JoinHandle<Result<()>>>,
    dispatch_task: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }
}

pub(crate) struct ClientInner {
    client_id: u32,
    config: ClientConfig,
    default_timeout_ms: AtomicU64,
    connector: Arc<dyn Connector>,
    state: StateMachine,
    link: Mutex<Option<LinkHandle>>,
    link_serial: AtomicU64,
    link_alive: watch::Sender<bool>,
    session_alive: watch::Sender<bool>,
    server_version: AtomicU32,
    server_last_seen: Mutex<Option<SystemTime>>,
    correlator: CommandCorrelator,
    requests: RequestRegistry,
    events: EventRegistry,
    list: ListAggregator,
    pub(crate) callbacks: Callbacks,
    requests_paused: AtomicBool,
    server_log: Mutex<(LogLevel, LogFacility)>,
    log_channel_open: AtomicBool,
    key_event_ids: RwLock<HashMap<String, u32>>,
}

impl ClientInner {
    pub(crate) fn new(client_id: u32, config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            client_id,
            default_timeout_ms: AtomicU64::new(config.default_timeout.as_millis() as u64),
            connector,
            state: StateMachine::new(),
            link: Mutex::new(None),
            link_serial: AtomicU64::new(0),
            link_alive: watch::channel(false).0,
            session_alive: watch::channel(false).0,
            server_version: AtomicU32::new(0),
            server_last_seen: Mutex::new(None),
            correlator: CommandCorrelator::new(),
            requests: RequestRegistry::new(config.max_value_size, config.max_total_data),
            events: EventRegistry::new(),
            list: ListAggregator::new(),
            callbacks: Callbacks::default(),
            requests_paused: AtomicBool::new(false),
            server_log: Mutex::new((config.server_log_level, config.server_log_facility)),
            log_channel_open: AtomicBool::new(false),
            key_event_ids: RwLock::new(HashMap::new()),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub(crate) fn client_id(&self) -> u32 {
        self.client_id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub(crate) fn status(&self) -> ClientStatus {
        self.state.status()
    }

    /// Link up (with or without a session).
    pub(crate) fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::LinkEstablished
                | ConnectionState::Negotiating
                | ConnectionState::SessionActive
        )
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::SessionActive
    }

    pub(crate) fn server_version(&self) -> u32 {
        self.server_version.load(Ordering::Acquire)
    }

    pub(crate) fn server_last_seen(&self) -> Option<SystemTime> {
        *self.server_last_seen.lock()
    }

    fn mark_server_seen(&self) {
        *self.server_last_seen.lock() = Some(SystemTime::now());
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_default_timeout(&self, timeout: Duration) {
        self.default_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.default_timeout())
    }

    fn require_session(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(WasimError::NotConnected)
        }
    }

    fn transition(&self, to: ConnectionState) -> Result<()> {
        if let Some(event) = self.state.transition(to)? {
            self.announce(&event);
        }
        Ok(())
    }

    /// Transition only if still in `from`. Returns whether the client ended
    /// up in `to`.
    fn transition_from(&self, from: ConnectionState, to: ConnectionState) -> bool {
        match self.state.transition_from(from, to) {
            Ok(Some(event)) => self.announce(&event),
            Ok(None) => {}
            Err(e) => tracing::warn!(target: TARGET, "{}", e),
        }
        self.state() == to
    }

    fn announce(&self, event: &ClientEvent) {
        tracing::info!(
            target: TARGET,
            client_id = %format_args!("{:08X}", self.client_id),
            event = ?event.event_type,
            status = ?event.status,
            "{}",
            event.message
        );
        self.callbacks.client_event(event);
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    fn writer(&self) -> Result<WriterHandle> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(WasimError::NotConnected)
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<()> {
        self.writer()?.send(frame).await.map_err(|e| match e {
            WasimError::ConnectionClosed => WasimError::NotConnected,
            other => other,
        })
    }

    async fn open_channel(&self, channel: Channel, key: u32, record_size: usize) -> Result<()> {
        self.send_frame(OutboundFrame::open(
            channel,
            self.client_id,
            key,
            record_size as u32,
        ))
        .await
    }

    async fn close_channel(&self, channel: Channel, key: u32) -> Result<()> {
        self.send_frame(OutboundFrame::close(channel, self.client_id, key))
            .await
    }

    pub(crate) async fn write_command(&self, command: &Command) -> Result<()> {
        tracing::trace!(target: TARGET, ?command, "Sending command");
        self.send_frame(OutboundFrame::record(
            Channel::Command,
            self.client_id,
            0,
            command.encode(),
        ))
        .await
    }

    /// Queue a command without waiting on writer backpressure.
    pub(crate) fn try_write_command(&self, command: &Command) -> Result<()> {
        tracing::trace!(target: TARGET, ?command, "Sending command");
        self.writer()?
            .try_send(OutboundFrame::record(
                Channel::Command,
                self.client_id,
                0,
                command.encode(),
            ))
            .map_err(|e| match e {
                WasimError::ConnectionClosed => WasimError::NotConnected,
                other => other,
            })
    }

    async fn write_data_request(&self, request: &DataRequest) -> Result<()> {
        self.send_frame(OutboundFrame::record(
            Channel::Request,
            self.client_id,
            0,
            request.encode(),
        ))
        .await
    }

    /// Send a command and wait for its `Ack`/`Nak`.
    ///
    /// The waiter is registered before the write, so a fast response cannot
    /// be missed; if the write fails the registration is dropped with it.
    async fn request(
        &self,
        command: Command,
        limit: WaitLimit<'_>,
        alive: watch::Receiver<bool>,
    ) -> Result<Command> {
        let pending = self.correlator.register(command.command_id, command.token)?;
        let command = command.token(pending.token());
        self.write_command(&command).await?;
        pending.wait(limit, alive).await
    }

    async fn session_request(&self, command: Command, timeout: Duration) -> Result<Command> {
        self.require_session()?;
        self.request(
            command,
            WaitLimit::Timeout(timeout),
            self.session_alive.subscribe(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Link
    // ------------------------------------------------------------------

    pub(crate) async fn connect_link(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        match self.state() {
            ConnectionState::Idle => {}
            ConnectionState::Initializing => {
                return Err(WasimError::Fail(
                    "link initialization already in progress".into(),
                ))
            }
            ConnectionState::ShuttingDown => {
                return Err(WasimError::Fail("client is shutting down".into()))
            }
            _ => return Ok(()),
        }
        self.transition(ConnectionState::Initializing)?;
        tracing::info!(target: TARGET, "Opening link via {}", self.connector.describe());

        let stream = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!(target: TARGET, "Link failed: {}", e);
                self.transition_from(ConnectionState::Initializing, ConnectionState::Idle);
                return Err(e);
            }
            Err(_) => {
                tracing::error!(target: TARGET, "Link timed out after {:?}", timeout);
                self.transition_from(ConnectionState::Initializing, ConnectionState::Idle);
                return Err(WasimError::Timeout(timeout));
            }
        };

        let (writer, writer_task) = spawn_writer_task(stream.writer, &self.config.writer);
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatch_task = tokio::spawn(dispatch::run(
            Arc::downgrade(self),
            stream.reader,
            stop_rx,
            self.config.dispatch_wait,
            self.config.max_payload_size,
        ));
        let serial = self.link_serial.fetch_add(1, Ordering::Relaxed) + 1;
        *self.link.lock() = Some(LinkHandle {
            serial,
            writer,
            writer_task: Some(writer_task),
            dispatch_task: Some(dispatch_task),
            stop: stop_tx,
        });
        self.link_alive.send_replace(true);

        if let Err(e) = self.open_link_channels().await {
            tracing::error!(target: TARGET, "Opening channels failed: {}", e);
            let _ = self.disconnect_link(false).await;
            return Err(e);
        }
        if !self.transition_from(ConnectionState::Initializing, ConnectionState::LinkEstablished)
        {
            // Torn down while opening; the link built here has no owner.
            tracing::debug!(target: TARGET, "Link closed while opening");
            let orphan = {
                let mut link = self.link.lock();
                match link.as_ref() {
                    Some(handle) if handle.serial == serial => link.take(),
                    _ => None,
                }
            };
            if orphan.is_some() {
                self.link_alive.send_replace(false);
            }
            return Err(WasimError::NotConnected);
        }
        Ok(())
    }

    async fn open_link_channels(&self) -> Result<()> {
        self.open_channel(Channel::Command, 0, COMMAND_SIZE).await?;
        self.open_channel(Channel::Response, 0, COMMAND_SIZE).await?;
        self.open_channel(Channel::Request, 0, DATA_REQUEST_SIZE)
            .await?;
        self.open_channel(Channel::KeyEvent, 0, KEY_EVENT_SIZE)
            .await?;
        if self.wants_remote_log() {
            self.open_log_channel().await?;
        }
        for request in self.requests.definitions() {
            self.open_channel(Channel::Value, request.request_id, request.value_len() as usize)
                .await?;
        }
        Ok(())
    }

    fn wants_remote_log(&self) -> bool {
        let (level, facility) = *self.server_log.lock();
        level != LogLevel::None && facility.contains(LogFacility::REMOTE)
    }

    async fn open_log_channel(&self) -> Result<()> {
        if !self.log_channel_open.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.open_channel(Channel::Log, 0, LOG_RECORD_SIZE).await {
                self.log_channel_open.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down the link, ending any session first.
    ///
    /// With `notify`, the server is told about the session end and the link
    /// close; otherwise (peer quit, read failure) only local state changes.
    pub(crate) async fn disconnect_link(&self, notify: bool) -> Result<()> {
        match self.state() {
            ConnectionState::Idle => return Ok(()),
            ConnectionState::SessionActive => self.disconnect_session(notify).await?,
            _ => {}
        }
        self.transition(ConnectionState::ShuttingDown)?;

        if notify {
            let quit = OutboundFrame::quit(self.client_id);
            if let Err(e) = self.send_frame(quit).await {
                tracing::debug!(target: TARGET, "Could not send link close: {}", e);
            }
        }

        self.session_alive.send_replace(false);
        self.link_alive.send_replace(false);
        let link = self.link.lock().take();
        let dropped = self.correlator.clear();
        if dropped > 0 {
            tracing::debug!(target: TARGET, "Cancelled {} waiting commands", dropped);
        }
        self.log_channel_open.store(false, Ordering::Release);
        self.requests.set_all_status(SyncStatus::Queued);

        if let Some(mut link) = link {
            link.stop.send_replace(true);
            let writer_task = link.writer_task.take();
            let dispatch_task = link.dispatch_task.take();
            drop(link);

            // The writer flushes what is queued and exits once its last
            // handle is gone.
            if let Some(task) = writer_task {
                match tokio::time::timeout(self.config.dispatch_wait * 4, task).await {
                    Ok(Ok(Err(e))) => tracing::debug!(target: TARGET, "Writer ended: {}", e),
                    Err(_) => tracing::debug!(target: TARGET, "Writer did not drain in time"),
                    _ => {}
                }
            }
            if let Some(task) = dispatch_task {
                let abort = task.abort_handle();
                if tokio::time::timeout(self.config.dispatch_wait * 4, task)
                    .await
                    .is_err()
                {
                    abort.abort();
                }
            }
        }

        self.transition(ConnectionState::Idle)
    }

    /// Called from the dispatch task when the link is gone. Runs the
    /// teardown on a separate task so the dispatch loop can exit.
    fn link_lost(self: &Arc<Self>, reason: &str) {
        if matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::ShuttingDown
        ) {
            return;
        }
        tracing::warn!(target: TARGET, "Link lost: {}", reason);
        self.link_alive.send_replace(false);
        self.session_alive.send_replace(false);
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.disconnect_link(false).await {
                tracing::debug!(target: TARGET, "Link teardown: {}", e);
            }
        });
    }

    pub(crate) async fn ping(self: &Arc<Self>, timeout: Option<Duration>) -> Result<u32> {
        let timeout = self.timeout_or_default(timeout);
        if self.state() == ConnectionState::Idle {
            self.connect_link(timeout).await?;
        }
        let response = self
            .request(
                Command::new(CommandId::Ping, self.client_id),
                WaitLimit::Timeout(timeout),
                self.link_alive.subscribe(),
            )
            .await?
            .into_result()?;
        self.mark_server_seen();
        let version = response.f_data as u32;
        tracing::info!(target: TARGET, "Server responded to ping, version {:08X}", version);
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub(crate) async fn connect_session(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.timeout_or_default(timeout);
        match self.state() {
            ConnectionState::SessionActive => return Ok(()),
            ConnectionState::Negotiating => {
                return Err(WasimError::Fail(
                    "session negotiation already in progress".into(),
                ))
            }
            ConnectionState::Idle => self.connect_link(timeout).await?,
            _ => {}
        }
        self.transition(ConnectionState::Negotiating)?;

        let handshake = Command::new(CommandId::Connect, self.client_id).token(self.client_id);
        let response = self
            .request(
                handshake,
                WaitLimit::Timeout(timeout),
                self.link_alive.subscribe(),
            )
            .await
            .and_then(Command::into_result);
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(target: TARGET, "Server connection failed: {}", e);
                self.transition_from(ConnectionState::Negotiating, ConnectionState::LinkEstablished);
                return Err(e);
            }
        };

        let version = response.f_data as u32;
        self.server_version.store(version, Ordering::Release);
        self.mark_server_seen();
        if version >> 24 != CLIENT_VERSION >> 24 {
            tracing::warn!(
                target: TARGET,
                "Server major version {:08X} does not match client version {:08X}",
                version,
                CLIENT_VERSION
            );
        }

        self.session_alive.send_replace(true);
        if !self.transition_from(ConnectionState::Negotiating, ConnectionState::SessionActive) {
            self.session_alive.send_replace(false);
            return Err(WasimError::NotConnected);
        }

        self.replay_session_state().await;
        Ok(())
    }

    /// Bring a new session up to date with local state. Failures are logged;
    /// anything left unsent stays queued for the next session.
    async fn replay_session_state(&self) {
        if let Err(e) = self.send_server_log_level().await {
            tracing::warn!(target: TARGET, "Could not set server log level: {}", e);
        }
        let subscribe = Command::new(
            CommandId::Subscribe,
            u32::from(!self.requests_paused.load(Ordering::Acquire)),
        );
        if let Err(e) = self.write_command(&subscribe).await {
            tracing::warn!(target: TARGET, "Could not send update state: {}", e);
        }
        self.resync_requests().await;
        self.resync_events().await;
    }

    async fn resync_requests(&self) {
        let definitions = self.requests.definitions();
        if !definitions.is_empty() {
            tracing::debug!(target: TARGET, "Submitting {} data requests", definitions.len());
        }
        for request in definitions {
            let id = request.request_id;
            self.requests.set_status(id, SyncStatus::Pending);
            if let Err(e) = self.write_data_request(&request).await {
                tracing::warn!(target: TARGET, "Could not submit data request {}: {}", id, e);
                self.requests.set_status(id, SyncStatus::Queued);
            }
        }
    }

    async fn resync_events(&self) {
        let (registrations, removals) = self.events.resync_commands();
        for command in registrations {
            match self.write_command(&command).await {
                Ok(()) => self.events.mark_confirmed(command.u_data),
                Err(e) => {
                    tracing::warn!(target: TARGET, "Could not register event {}: {}", command.u_data, e)
                }
            }
        }
        for command in removals {
            match self.write_command(&command).await {
                Ok(()) => self.events.finish_remove(command.u_data),
                Err(e) => {
                    tracing::warn!(target: TARGET, "Could not remove event {}: {}", command.u_data, e)
                }
            }
        }
    }

    pub(crate) async fn disconnect_session(&self, notify: bool) -> Result<()> {
        if self.state() != ConnectionState::SessionActive {
            return Ok(());
        }
        if notify {
            if let Err(e) = self
                .write_command(&Command::new(CommandId::Disconnect, self.client_id))
                .await
            {
                tracing::debug!(target: TARGET, "Could not send disconnect: {}", e);
            }
        }
        self.end_session();
        self.transition_from(ConnectionState::SessionActive, ConnectionState::LinkEstablished);
        Ok(())
    }

    /// Local part of a session end. Waiters bound to the session wake with
    /// `NotConnected`; link-level waiters (ping) are unaffected.
    fn end_session(&self) {
        self.session_alive.send_replace(false);
        self.requests.set_all_status(SyncStatus::Queued);
    }

    /// The server ended the session on its own.
    fn session_ended_by_server(&self) {
        if self.state() == ConnectionState::SessionActive {
            tracing::info!(target: TARGET, "Server closed the session");
            self.end_session();
            self.transition_from(ConnectionState::SessionActive, ConnectionState::LinkEstablished);
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.disconnect_link(true).await
    }

    // ------------------------------------------------------------------
    // Low-level commands
    // ------------------------------------------------------------------

    pub(crate) async fn send_command(&self, command: &Command) -> Result<()> {
        self.require_session()?;
        self.write_command(command).await
    }

    pub(crate) async fn send_command_with_response(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Command> {
        self.session_request(command, self.timeout_or_default(timeout))
            .await
    }

    // ------------------------------------------------------------------
    // Variables, calculator code, lookups
    // ------------------------------------------------------------------

    pub(crate) async fn get_variable(
        &self,
        variable: &VariableRequest,
        default_value: f64,
    ) -> Result<CommandValue> {
        let text = variable.command_string(false)?;
        let command_id = if variable.creates() {
            CommandId::GetCreate
        } else {
            CommandId::Get
        };
        let command = Command::with_text(command_id, variable.variable_type as u32, text)
            .f_data(default_value);
        let response = self
            .session_request(command, self.default_timeout())
            .await?
            .into_result()?;
        Ok(CommandValue {
            number: response.f_data,
            text: response.s_data,
        })
    }

    pub(crate) async fn set_variable(&self, variable: &VariableRequest, value: f64) -> Result<()> {
        if !is_settable_variable_type(variable.variable_type) {
            return Err(WasimError::invalid(format!(
                "variables of type '{}' cannot be set",
                variable.variable_type
            )));
        }
        let text = variable.command_string(true)?;
        let command_id = if variable.creates() {
            CommandId::SetCreate
        } else {
            CommandId::Set
        };
        self.send_command(
            &Command::with_text(command_id, variable.variable_type as u32, text).f_data(value),
        )
        .await
    }

    pub(crate) async fn execute_calculator_code(
        &self,
        code: &str,
        result_type: crate::protocol::CalcResultType,
    ) -> Result<Option<CommandValue>> {
        if code.len() >= STRSZ_CMD {
            return Err(WasimError::invalid(format!(
                "calculator code exceeds {} bytes",
                STRSZ_CMD - 1
            )));
        }
        let command = Command::with_text(CommandId::Exec, result_type.into(), code);
        if result_type == crate::protocol::CalcResultType::None {
            self.send_command(&command).await?;
            return Ok(None);
        }
        let response = self
            .session_request(command, self.default_timeout())
            .await?
            .into_result()?;
        Ok(Some(CommandValue {
            number: response.f_data,
            text: response.s_data,
        }))
    }

    pub(crate) async fn lookup(&self, item_type: LookupItemType, name: &str) -> Result<i32> {
        if name.len() >= STRSZ_CMD {
            return Err(WasimError::invalid(format!(
                "lookup name exceeds {} bytes",
                STRSZ_CMD - 1
            )));
        }
        let command = Command::with_text(CommandId::Lookup, item_type.into(), name);
        let response = self
            .session_request(command, self.default_timeout())
            .await?
            .into_result()?;
        tracing::debug!(target: TARGET, "Lookup of {:?} '{}' returned {}", item_type, name, response.f_data);
        Ok(response.f_data as i32)
    }

    // ------------------------------------------------------------------
    // Data requests
    // ------------------------------------------------------------------

    pub(crate) async fn save_data_request(&self, request: DataRequest, wait: bool) -> Result<()> {
        if request.request_type == RequestType::None {
            return self.remove_data_request(request.request_id).await;
        }
        let id = request.request_id;
        if wait && id == 0 {
            return Err(WasimError::invalid(
                "data request 0 cannot wait for an acknowledgement",
            ));
        }
        let change = self.requests.upsert(request.clone())?;

        let result = self.submit_data_request(&request, change, wait).await;
        if let Err(e) = &result {
            tracing::warn!(target: TARGET, "Data request {} failed: {}", id, e);
            if change == Upsert::Created {
                self.requests.remove(id);
                if self.is_initialized() {
                    let _ = self.close_channel(Channel::Value, id).await;
                }
            } else if !matches!(e, WasimError::Rejected { .. }) {
                self.requests.set_status(id, SyncStatus::Queued);
            }
        }
        result
    }

    /// Channel changes need the link; the descriptor needs a session. With
    /// neither, the request simply stays queued.
    async fn submit_data_request(
        &self,
        request: &DataRequest,
        change: Upsert,
        wait: bool,
    ) -> Result<()> {
        let id = request.request_id;
        if self.is_initialized() {
            let size = request.value_len() as usize;
            match change {
                Upsert::Created => self.open_channel(Channel::Value, id, size).await?,
                Upsert::Redefined => {
                    self.close_channel(Channel::Value, id).await?;
                    self.open_channel(Channel::Value, id, size).await?;
                }
                Upsert::Updated => {}
            }
        }
        if !self.is_connected() {
            tracing::debug!(target: TARGET, "Data request {} queued until the next session", id);
            return Ok(());
        }
        self.requests.set_status(id, SyncStatus::Pending);

        if !wait {
            return self.write_data_request(request).await;
        }
        let pending = self.correlator.register(CommandId::Subscribe, id)?;
        self.write_data_request(request).await?;
        pending
            .wait(
                WaitLimit::Timeout(self.default_timeout()),
                self.session_alive.subscribe(),
            )
            .await?
            .into_result()
            .map(|_| ())
    }

    pub(crate) async fn remove_data_request(&self, id: u32) -> Result<()> {
        let Some(request) = self.requests.remove(id) else {
            return Err(WasimError::invalid(format!("data request {id} does not exist")));
        };
        if self.is_initialized() {
            let _ = self.close_channel(Channel::Value, id).await;
        }
        if !self.is_connected() {
            return Ok(());
        }
        let removal = DataRequest {
            request_type: RequestType::None,
            ..request
        };
        self.write_data_request(&removal).await
    }

    pub(crate) async fn update_data_request(&self, id: u32) -> Result<()> {
        if !self.requests.contains(id) {
            return Err(WasimError::invalid(format!("data request {id} does not exist")));
        }
        self.send_command(&Command::new(CommandId::Update, id)).await
    }

    pub(crate) fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    pub(crate) async fn set_data_requests_paused(&self, paused: bool) -> Result<()> {
        if self.is_connected() {
            self.write_command(&Command::new(CommandId::Subscribe, u32::from(!paused)))
                .await?;
        }
        self.requests_paused.store(paused, Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registered events
    // ------------------------------------------------------------------

    pub(crate) async fn register_event(&self, event: RegisteredEvent) -> Result<()> {
        if event.code.is_empty() {
            return self.remove_event(event.event_id).await;
        }
        let id = event.event_id;
        let Some(command) = self.events.upsert(event)? else {
            return Ok(());
        };
        if self.is_connected() {
            self.write_command(&command).await?;
            self.events.mark_confirmed(id);
        }
        Ok(())
    }

    pub(crate) async fn remove_event(&self, id: u32) -> Result<()> {
        match self.events.begin_remove(id)? {
            Removal::Local => Ok(()),
            Removal::Notify(command) => {
                if self.is_connected() {
                    self.write_command(&command).await?;
                    self.events.finish_remove(id);
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn transmit_event(&self, id: u32) -> Result<()> {
        self.send_command(&Command::new(CommandId::Transmit, id)).await
    }

    pub(crate) fn events(&self) -> &EventRegistry {
        &self.events
    }

    // ------------------------------------------------------------------
    // Key events
    // ------------------------------------------------------------------

    pub(crate) async fn send_key_event(&self, event_id: u32, values: [u32; 5]) -> Result<()> {
        self.require_session()?;
        let event = KeyEvent::new(event_id, values, self.correlator.next_token());
        self.send_frame(OutboundFrame::record(
            Channel::KeyEvent,
            self.client_id,
            0,
            event.encode(),
        ))
        .await
    }

    pub(crate) async fn send_key_event_by_name(&self, name: &str, values: [u32; 5]) -> Result<()> {
        self.require_session()?;
        let cached = self.key_event_ids.read().get(name).copied();
        let event_id = match cached {
            Some(id) => id,
            None => {
                let id = match self.lookup(LookupItemType::KeyEventId, name).await {
                    Ok(id) => id as u32,
                    Err(WasimError::Rejected { reason, .. }) => {
                        return Err(WasimError::invalid(format!(
                            "unknown key event '{name}': {reason}"
                        )))
                    }
                    Err(e) => return Err(e),
                };
                self.key_event_ids.write().insert(name.to_string(), id);
                id
            }
        };
        self.send_key_event(event_id, values).await
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    pub(crate) async fn list(&self, item_type: LookupItemType) -> Result<ListResult> {
        self.require_session()?;
        let timeout = self.default_timeout();
        let pending = self.correlator.register(CommandId::List, 0)?;
        let guard = self.list.begin(item_type, pending.token())?;

        let command = Command::new(CommandId::List, item_type.into()).token(pending.token());
        self.write_command(&command).await?;

        let outcome = match pending
            .wait(
                WaitLimit::Predicate(Box::pin(self.list.inactivity(timeout))),
                self.session_alive.subscribe(),
            )
            .await
        {
            Ok(response) if response.is_ack() => ListOutcome::Complete,
            Ok(response) => ListOutcome::Rejected(response.s_data),
            Err(WasimError::Timeout(_)) => ListOutcome::Timeout,
            Err(_) => ListOutcome::Disconnected,
        };
        let result = guard.finish(outcome);
        tracing::debug!(
            target: TARGET,
            "{:?} list ended with {:?}, {} items",
            item_type,
            result.outcome,
            result.items.len()
        );
        self.callbacks.list_results(&result);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Server logging
    // ------------------------------------------------------------------

    pub(crate) async fn set_server_log_level(
        &self,
        level: LogLevel,
        facility: LogFacility,
    ) -> Result<()> {
        *self.server_log.lock() = (level, facility);
        if self.is_connected() {
            self.send_server_log_level().await?;
        }
        Ok(())
    }

    async fn send_server_log_level(&self) -> Result<()> {
        let (level, facility) = *self.server_log.lock();
        if self.wants_remote_log() {
            self.open_log_channel().await?;
        }
        self.write_command(
            &Command::new(CommandId::Log, level.into()).f_data(f64::from(facility.0)),
        )
        .await
    }
}
