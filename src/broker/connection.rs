//! Connection Manager
//!
//! Owns one broker connection's lifecycle.
//!
//! ## State machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> Connecting -> ...
//!   ^__________________ deactivate() from any state _______________|
//! ```
//!
//! `activate()` spawns a driver task that owns the live [`Connection`]. The
//! driver retries forever with a fixed delay until `deactivate()` is called.
//! Subscribe/unsubscribe requests reach the driver through a command channel
//! and are kept in a route table, which is replayed on every reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{Connection, Delivery, Transport, TransportEvent};
use crate::error::{LifecycleError, TransportError};
use crate::tracking::Topic;

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// True between `activate()` and `deactivate()`
    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Reconnect and teardown timing
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed delay between connection attempts
    pub delay: Duration,
    /// Upper bound for a single connection attempt
    pub connect_timeout: Duration,
    /// How long `deactivate()` waits for a graceful close before aborting
    pub shutdown_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Callback invoked with each raw payload of a subscription
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one subscription on a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Subscription id sent to the broker
    pub fn wire_id(self) -> String {
        format!("sub-{}", self.0)
    }

    fn from_wire(id: &str) -> Option<Self> {
        id.strip_prefix("sub-")?.parse().ok().map(Self)
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&TransportError) + Send + Sync>;
type StateHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Lifecycle callbacks
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    on_connected: Option<Hook>,
    on_disconnected: Option<Hook>,
    on_error: Option<ErrorHook>,
    on_state_change: Option<StateHook>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per successful connection
    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    /// Called when an established connection is lost
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }

    /// Called for every transport error; never stops the reconnect loop
    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    fn connected(&self) {
        if let Some(f) = &self.on_connected {
            f();
        }
    }

    fn disconnected(&self) {
        if let Some(f) = &self.on_disconnected {
            f();
        }
    }

    fn error(&self, error: &TransportError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    fn state_changed(&self, state: ConnectionState) {
        if let Some(f) = &self.on_state_change {
            f(state);
        }
    }
}

/// Owns one broker connection and routes its deliveries
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    hooks: ConnectionHooks,
    state: Arc<watch::Sender<ConnectionState>>,
    next_handle: AtomicU64,
    driver: Option<DriverHandle>,
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy, hooks: ConnectionHooks) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            transport,
            policy,
            hooks,
            state: Arc::new(state),
            next_handle: AtomicU64::new(1),
            driver: None,
        }
    }

    /// Start connecting. No effect while already active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&mut self) {
        if self.driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            tracing::debug!(state = %self.state(), "Connection already active");
            return;
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let driver = Driver {
            transport: Arc::clone(&self.transport),
            policy: self.policy.clone(),
            hooks: self.hooks.clone(),
            state: Arc::clone(&self.state),
            commands: receiver,
            routes: HashMap::new(),
            failures: 0,
        };

        transition(&self.state, &self.hooks, ConnectionState::Connecting);
        let task = tokio::spawn(driver.run());
        self.driver = Some(DriverHandle { commands, task });
    }

    /// Tear the connection down. Safe to call when already inactive.
    ///
    /// Returns once the driver has stopped, so no handler of this manager
    /// runs afterwards.
    pub async fn deactivate(&mut self) {
        let Some(driver) = self.driver.take() else {
            tracing::debug!("Connection already inactive");
            return;
        };

        let (done, stopped) = oneshot::channel();
        if driver.commands.send(Command::Shutdown { done }).is_ok()
            && tokio::time::timeout(self.policy.shutdown_timeout, stopped)
                .await
                .is_err()
        {
            tracing::warn!(
                timeout_ms = self.policy.shutdown_timeout.as_millis() as u64,
                "Connection did not close in time, aborting"
            );
        }

        driver.task.abort();
        let _ = driver.task.await;

        transition(&self.state, &self.hooks, ConnectionState::Idle);
        tracing::info!("Connection deactivated");
    }

    /// Register a handler for `topic`
    ///
    /// The subscription is issued as soon as a connection exists and again
    /// after every reconnect. Fails while the manager is idle; debug builds
    /// panic instead.
    pub fn subscribe(
        &self,
        topic: &Topic,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, LifecycleError> {
        debug_assert!(
            self.is_active(),
            "subscribe to {topic} on an inactive connection"
        );
        let not_active = || {
            tracing::error!(topic = %topic, "Subscribe attempted without an active connection");
            LifecycleError::NotActive {
                topic: topic.to_string(),
            }
        };

        let driver = self.driver.as_ref().ok_or_else(not_active)?;
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        driver
            .commands
            .send(Command::Subscribe {
                handle,
                topic: topic.as_str().to_string(),
                handler,
            })
            .map_err(|_| not_active())?;

        tracing::debug!(topic = %topic, subscription = %handle.wire_id(), "Subscription requested");
        Ok(handle)
    }

    /// Drop a subscription. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(driver) = &self.driver {
            let _ = driver.commands.send(Command::Unsubscribe { handle });
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that follows every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.driver.is_some()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.task.abort();
        }
    }
}

fn transition(
    state: &watch::Sender<ConnectionState>,
    hooks: &ConnectionHooks,
    next: ConnectionState,
) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
    if changed {
        tracing::debug!(state = %next, "Connection state changed");
        hooks.state_changed(next);
    }
}

enum Command {
    Subscribe {
        handle: SubscriptionHandle,
        topic: String,
        handler: MessageHandler,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Request to stop the driver, with the waiter to release if any
struct Stop(Option<oneshot::Sender<()>>);

enum Attempt {
    Connected(Box<dyn Connection>),
    Failed,
    Stopped(Stop),
}

struct Route {
    topic: String,
    handler: MessageHandler,
}

struct Driver {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    hooks: ConnectionHooks,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    routes: HashMap<SubscriptionHandle, Route>,
    failures: u32,
}

impl Driver {
    async fn run(mut self) {
        let stop = loop {
            if let Some(stop) = self.cycle().await {
                break stop;
            }
            if let Some(stop) = self.wait_before_retry().await {
                break stop;
            }
        };

        if let Some(done) = stop.0 {
            let _ = done.send(());
        }
    }

    /// One connection attempt, then serve the connection until it is lost
    async fn cycle(&mut self) -> Option<Stop> {
        self.transition(ConnectionState::Connecting);

        let mut conn = match self.establish().await {
            Attempt::Connected(conn) => conn,
            Attempt::Failed => {
                self.transition(ConnectionState::Disconnected);
                return None;
            }
            Attempt::Stopped(stop) => return Some(stop),
        };

        tracing::info!(
            failed_attempts = self.failures,
            subscriptions = self.routes.len(),
            "Connected to broker"
        );
        self.failures = 0;
        self.transition(ConnectionState::Connected);
        self.hooks.connected();

        match self.serve(conn.as_mut()).await {
            Some(stop) => {
                conn.close().await;
                Some(stop)
            }
            None => {
                tracing::warn!("Broker connection lost");
                self.transition(ConnectionState::Disconnected);
                self.hooks.disconnected();
                None
            }
        }
    }

    async fn establish(&mut self) -> Attempt {
        let transport = Arc::clone(&self.transport);
        let limit = self.policy.connect_timeout;
        let attempt = tokio::time::timeout(limit, async move { transport.connect().await });
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    let error = match result {
                        Ok(Ok(conn)) => return Attempt::Connected(conn),
                        Ok(Err(e)) => e,
                        Err(_) => TransportError::Timeout(limit.as_millis() as u64),
                    };
                    self.failures += 1;
                    tracing::warn!(attempt = self.failures, error = %error, "Connection attempt failed");
                    self.hooks.error(&error);
                    return Attempt::Failed;
                }
                command = self.commands.recv() => {
                    if let Some(stop) = self.apply_offline(command) {
                        return Attempt::Stopped(stop);
                    }
                }
            }
        }
    }

    async fn serve(&mut self, conn: &mut dyn Connection) -> Option<Stop> {
        for (handle, route) in &self.routes {
            if let Err(e) = conn.subscribe(&handle.wire_id(), &route.topic).await {
                self.report(&e);
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { handle, topic, handler }) => {
                        if let Err(e) = conn.subscribe(&handle.wire_id(), &topic).await {
                            self.report(&e);
                        }
                        self.routes.insert(handle, Route { topic, handler });
                    }
                    Some(Command::Unsubscribe { handle }) => {
                        if self.routes.remove(&handle).is_some() {
                            if let Err(e) = conn.unsubscribe(&handle.wire_id()).await {
                                self.report(&e);
                            }
                        }
                    }
                    other => return self.apply_offline(other),
                },
                event = conn.next_event() => match event {
                    Some(TransportEvent::Message(delivery)) => self.dispatch(&delivery),
                    Some(TransportEvent::Error(e)) => self.report(&e),
                    None => return None,
                },
            }
        }
    }

    async fn wait_before_retry(&mut self) -> Option<Stop> {
        tracing::debug!(
            delay_ms = self.policy.delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        let sleep = tokio::time::sleep(self.policy.delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => {
                    if let Some(stop) = self.apply_offline(command) {
                        return Some(stop);
                    }
                }
            }
        }
    }

    /// Handle a command while no connection is live
    fn apply_offline(&mut self, command: Option<Command>) -> Option<Stop> {
        match command {
            Some(Command::Subscribe {
                handle,
                topic,
                handler,
            }) => {
                self.routes.insert(handle, Route { topic, handler });
                None
            }
            Some(Command::Unsubscribe { handle }) => {
                self.routes.remove(&handle);
                None
            }
            Some(Command::Shutdown { done }) => Some(Stop(Some(done))),
            // manager dropped
            None => Some(Stop(None)),
        }
    }

    fn dispatch(&self, delivery: &Delivery) {
        let route =
            SubscriptionHandle::from_wire(&delivery.subscription).and_then(|h| self.routes.get(&h));

        match route {
            Some(route) => {
                tracing::trace!(topic = %delivery.topic, "Dispatching delivery");
                (route.handler)(&delivery.payload);
            }
            None => {
                tracing::trace!(
                    subscription = %delivery.subscription,
                    topic = %delivery.topic,
                    "Dropping delivery for unknown subscription"
                );
            }
        }
    }

    fn report(&self, error: &TransportError) {
        tracing::warn!(error = %error, "Broker transport error");
        self.hooks.error(error);
    }

    fn transition(&self, next: ConnectionState) {
        transition(&self.state, &self.hooks, next);
    }
}
