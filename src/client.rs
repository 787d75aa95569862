//! Client builder and public handle.
//!
//! [`ClientBuilder`] collects configuration and the transport; [`Client`] is
//! a cheaply cloneable handle to one session engine. Every clone talks to
//! the same link, registries and observers.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wasim_client::{ClientBuilder, DataRequest, ValueSize};
//!
//! #[tokio::main]
//! async fn main() -> wasim_client::Result<()> {
//!     let client = ClientBuilder::new(0xC0DE_0001)
//!         .default_timeout(Duration::from_secs(2))
//!         .build()?;
//!
//!     client.set_data_callback(|record| println!("{:?}", record.value));
//!     client.connect(None).await?;
//!     client
//!         .save_data_request(DataRequest::named(1, 'A', "PLANE ALTITUDE", ValueSize::Float64).unit("feet"), true)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::codec::{Command, DataRequest, LogRecord};
use crate::config::ClientConfig;
use crate::error::{Result, WasimError};
use crate::protocol::{CalcResultType, LogFacility, LogLevel, LookupItemType};
use crate::session::{ClientEvent, ClientInner, ClientStatus, ConnectionState, CLIENT_VERSION};
use crate::tracking::{DataRequestRecord, ListResult, RegisteredEvent};
use crate::transport::{Connector, PipeConnector};
use crate::variables::{CommandValue, VariableRequest};

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    client_id: u32,
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    /// Start a builder for the given client id. The id must be non-zero and
    /// unique among clients of the same server.
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            config: ClientConfig::default(),
            connector: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the local pipe.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Path of the server's pipe. Ignored when a connector is set.
    pub fn pipe_path(mut self, path: impl Into<String>) -> Self {
        self.config.pipe_path = path.into();
        self
    }

    /// Timeout for operations not given one.
    ///
    /// Default: 1000 ms
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Server log level and destinations requested at each session start.
    ///
    /// Default: `Info` to `REMOTE`
    pub fn server_log_level(mut self, level: LogLevel, facility: LogFacility) -> Self {
        self.config.server_log_level = level;
        self.config.server_log_facility = facility;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Build the client. Nothing is connected yet.
    pub fn build(self) -> Result<Client> {
        if self.client_id == 0 {
            return Err(WasimError::invalid("client id must be non-zero"));
        }
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(PipeConnector::new(self.config.pipe_path.clone())));
        Ok(Client {
            inner: Arc::new(ClientInner::new(self.client_id, self.config, connector)),
        })
    }
}

/// Handle to a client session engine.
///
/// Dropping the last handle stops the background tasks without notifying
/// the server; call [`Client::shutdown`] for an orderly exit.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Shorthand for [`ClientBuilder::new`].
    pub fn builder(client_id: u32) -> ClientBuilder {
        ClientBuilder::new(client_id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the link if needed, then the server session. `None` uses the
    /// default timeout for each stage.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.connect_session(timeout).await
    }

    /// Open only the link.
    pub async fn connect_link(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.inner.default_timeout());
        self.inner.connect_link(timeout).await
    }

    /// Open the server session, opening the link first if needed.
    pub async fn connect_session(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.connect_session(timeout).await
    }

    /// End the session and close the link.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect_link(true).await
    }

    /// End the session only; the link stays up.
    pub async fn disconnect_session(&self) -> Result<()> {
        self.inner.disconnect_session(true).await
    }

    /// Orderly shutdown. Same as [`Client::disconnect`].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    /// Ping the server over the link (no session needed) and return its
    /// version.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<u32> {
        self.inner.ping(timeout).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// True while the link is up.
    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    /// True while a server session is active.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn client_id(&self) -> u32 {
        self.inner.client_id()
    }

    /// Version reported by the server at the last handshake, 0 if none.
    pub fn server_version(&self) -> u32 {
        self.inner.server_version()
    }

    pub fn client_version(&self) -> u32 {
        CLIENT_VERSION
    }

    /// Local time the server was last heard from.
    pub fn server_last_seen(&self) -> Option<SystemTime> {
        self.inner.server_last_seen()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout()
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.inner.set_default_timeout(timeout);
    }

    // ------------------------------------------------------------------
    // Low-level commands
    // ------------------------------------------------------------------

    /// Send a command without waiting for a response.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        self.inner.send_command(command).await
    }

    /// Send a command and return the server's raw `Ack` or `Nak`.
    ///
    /// A token of 0 is replaced with a fresh one.
    pub async fn send_command_with_response(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Command> {
        self.inner.send_command_with_response(command, timeout).await
    }

    // ------------------------------------------------------------------
    // Variables and calculator code
    // ------------------------------------------------------------------

    /// Read a variable once.
    pub async fn get_variable(&self, variable: &VariableRequest) -> Result<CommandValue> {
        self.inner.get_variable(variable, 0.0).await
    }

    pub async fn get_local_variable(&self, name: &str, unit: Option<&str>) -> Result<f64> {
        let variable = VariableRequest::local(name).unit(unit.unwrap_or_default());
        Ok(self.inner.get_variable(&variable, 0.0).await?.number)
    }

    /// Read an `L` variable, creating it with `default_value` if missing.
    pub async fn get_or_create_local_variable(
        &self,
        name: &str,
        default_value: f64,
        unit: Option<&str>,
    ) -> Result<f64> {
        let variable = VariableRequest::local(name)
            .unit(unit.unwrap_or_default())
            .create(true);
        Ok(self.inner.get_variable(&variable, default_value).await?.number)
    }

    /// Write a variable, fire-and-forget.
    pub async fn set_variable(&self, variable: &VariableRequest, value: f64) -> Result<()> {
        self.inner.set_variable(variable, value).await
    }

    pub async fn set_local_variable(&self, name: &str, value: f64, unit: Option<&str>) -> Result<()> {
        let variable = VariableRequest::local(name).unit(unit.unwrap_or_default());
        self.inner.set_variable(&variable, value).await
    }

    pub async fn set_or_create_local_variable(
        &self,
        name: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<()> {
        let variable = VariableRequest::local(name)
            .unit(unit.unwrap_or_default())
            .create(true);
        self.inner.set_variable(&variable, value).await
    }

    /// Run calculator code. With [`CalcResultType::None`] nothing is
    /// awaited and `Ok(None)` is returned.
    pub async fn execute_calculator_code(
        &self,
        code: &str,
        result_type: CalcResultType,
    ) -> Result<Option<CommandValue>> {
        self.inner.execute_calculator_code(code, result_type).await
    }

    /// Resolve a name to the server's numeric id.
    pub async fn lookup(&self, item_type: LookupItemType, name: &str) -> Result<i32> {
        self.inner.lookup(item_type, name).await
    }

    // ------------------------------------------------------------------
    // Data requests
    // ------------------------------------------------------------------

    /// Add or replace a data request.
    ///
    /// Without a session the request is stored and submitted at the next
    /// session start. With `wait_for_ack`, the call waits for the server to
    /// accept it and returns [`WasimError::Rejected`] if it does not.
    pub async fn save_data_request(&self, request: DataRequest, wait_for_ack: bool) -> Result<()> {
        self.inner.save_data_request(request, wait_for_ack).await
    }

    pub async fn remove_data_request(&self, request_id: u32) -> Result<()> {
        self.inner.remove_data_request(request_id).await
    }

    /// Ask the server to send the current value now, regardless of period.
    pub async fn update_data_request(&self, request_id: u32) -> Result<()> {
        self.inner.update_data_request(request_id).await
    }

    /// Snapshot of one request, `None` if unknown.
    ///
    /// Use `.unwrap_or_default()` to get the "not found" record instead.
    pub fn data_request(&self, request_id: u32) -> Option<DataRequestRecord> {
        self.inner.requests().record(request_id)
    }

    pub fn data_requests(&self) -> Vec<DataRequestRecord> {
        self.inner.requests().records()
    }

    pub fn data_request_ids(&self) -> Vec<u32> {
        self.inner.requests().ids()
    }

    /// Pause or resume value updates for all requests.
    pub async fn set_data_requests_paused(&self, paused: bool) -> Result<()> {
        self.inner.set_data_requests_paused(paused).await
    }

    // ------------------------------------------------------------------
    // Registered events
    // ------------------------------------------------------------------

    /// Add or replace a registered event. Empty code removes it.
    pub async fn register_event(&self, event: RegisteredEvent) -> Result<()> {
        self.inner.register_event(event).await
    }

    pub async fn remove_event(&self, event_id: u32) -> Result<()> {
        self.inner.remove_event(event_id).await
    }

    pub async fn transmit_event(&self, event_id: u32) -> Result<()> {
        self.inner.transmit_event(event_id).await
    }

    pub fn registered_event(&self, event_id: u32) -> Option<RegisteredEvent> {
        self.inner.events().get(event_id)
    }

    pub fn registered_events(&self) -> Vec<RegisteredEvent> {
        self.inner.events().list()
    }

    // ------------------------------------------------------------------
    // Key events and lists
    // ------------------------------------------------------------------

    pub async fn send_key_event(&self, key_event_id: u32, values: [u32; 5]) -> Result<()> {
        self.inner.send_key_event(key_event_id, values).await
    }

    /// Send a key event by name. The name is resolved once and cached.
    pub async fn send_key_event_by_name(&self, name: &str, values: [u32; 5]) -> Result<()> {
        self.inner.send_key_event_by_name(name, values).await
    }

    /// List items of one kind known to the server.
    ///
    /// The list ends at the server's `Ack`, or after the default timeout
    /// passes with no new item; partial results are returned either way.
    pub async fn list(&self, item_type: LookupItemType) -> Result<ListResult> {
        self.inner.list(item_type).await
    }

    /// Change the server's log level and destinations for this client.
    pub async fn set_server_log_level(&self, level: LogLevel, facility: LogFacility) -> Result<()> {
        self.inner.set_server_log_level(level, facility).await
    }
}

macro_rules! observer_setters {
    ($($(#[$doc:meta])* $set:ident, $clear:ident, $slot:ident: $arg:ty;)*) => {
        /// Observers run on the dispatch task and must return quickly. A
        /// panic inside one is logged and swallowed.
        impl Client {
            $(
                $(#[$doc])*
                pub fn $set<F>(&self, callback: F)
                where
                    F: Fn(&$arg) + Send + Sync + 'static,
                {
                    self.inner.callbacks.$slot(Some(Arc::new(callback)));
                }

                pub fn $clear(&self) {
                    self.inner.callbacks.$slot(None);
                }
            )*
        }
    };
}

observer_setters! {
    /// Lifecycle changes (link and session up/down).
    set_client_event_callback, clear_client_event_callback, set_client_event: ClientEvent;
    /// Results of [`Client::list`].
    set_list_results_callback, clear_list_results_callback, set_list_results: ListResult;
    /// Value updates that passed the request's epsilon.
    set_data_callback, clear_data_callback, set_data: DataRequestRecord;
    /// Log records forwarded by the server.
    set_log_callback, clear_log_callback, set_log: LogRecord;
    /// Every `Ack`/`Nak`.
    set_command_result_callback, clear_command_result_callback, set_command_result: Command;
    /// Every command on the response channel.
    set_response_callback, clear_response_callback, set_response: Command;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_zero_id() {
        let err = ClientBuilder::new(0).build().err().unwrap();
        assert!(matches!(err, WasimError::InvalidArgument(_)));
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder(0xC0DE_0001)
            .default_timeout(Duration::from_millis(250))
            .server_log_level(LogLevel::Debug, LogFacility::REMOTE | LogFacility::FILE)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10))
            .pipe_path("/tmp/custom.sock");

        assert_eq!(builder.config.default_timeout, Duration::from_millis(250));
        assert_eq!(builder.config.server_log_level, LogLevel::Debug);
        assert_eq!(builder.config.writer.max_pending_frames, 2048);
        assert_eq!(builder.config.writer.channel_capacity, 512);
        assert_eq!(builder.config.pipe_path, "/tmp/custom.sock");
    }

    #[tokio::test]
    async fn test_new_client_is_idle() {
        let client = ClientBuilder::new(7).build().unwrap();
        assert_eq!(client.status(), ClientStatus::IDLE);
        assert!(!client.is_initialized());
        assert!(!client.is_connected());
        assert_eq!(client.server_version(), 0);
        assert_eq!(client.client_version() >> 24, 1);
    }

    #[tokio::test]
    async fn test_session_operations_need_connection() {
        let client = ClientBuilder::new(7).build().unwrap();

        let err = client
            .execute_calculator_code("1 (>L:X)", CalcResultType::Double)
            .await
            .unwrap_err();
        assert!(matches!(err, WasimError::NotConnected));
        assert!(matches!(
            client.list(LookupItemType::LocalVariable).await,
            Err(WasimError::NotConnected)
        ));
        assert!(matches!(
            client.transmit_event(1).await,
            Err(WasimError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_offline_changes_are_queued() {
        let client = ClientBuilder::new(7).build().unwrap();
        client
            .save_data_request(
                DataRequest::named(3, 'L', "VAR", crate::codec::ValueSize::Int32),
                false,
            )
            .await
            .unwrap();
        client
            .register_event(RegisteredEvent::new(1, "1 (>K:AP_MASTER)"))
            .await
            .unwrap();

        assert_eq!(client.data_request_ids(), vec![3]);
        assert_eq!(
            client.data_request(3).unwrap().status,
            crate::tracking::SyncStatus::Queued
        );
        assert_eq!(client.registered_events().len(), 1);
        assert_eq!(client.data_request(4).unwrap_or_default().request_id(), u32::MAX);
    }

    #[tokio::test]
    async fn test_set_rejects_read_only_types() {
        let client = ClientBuilder::new(7).build().unwrap();
        let err = client
            .set_variable(&VariableRequest::new('T', "TOKEN"), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, WasimError::InvalidArgument(_)));
    }
}
