use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use super::message::PushUpdate;
use super::state::CapabilitySet;
use super::state::EntityId;
use crate::error::HubError;

/// Channel types for push notifications FROM the hub TO the engine.
/// Bounded to provide backpressure when the hub pushes faster than the engine reconciles.
pub type PushSender = mpsc::Sender<PushUpdate>;
pub type PushReceiver = mpsc::Receiver<PushUpdate>;

/// Wire payload of a single command against one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum HubCommand {
    TurnOn(TurnOnPayload),
    TurnOff,
}

/// Optional attributes of a `turn_on` command. Only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnOnPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temp_kelvin: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hs_color: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgb_color: Option<[u8; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgbw_color: Option<[u8; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgbww_color: Option<[u8; 5]>,
}

/// Initial channel values reported by bulk discovery. Missing fields are left
/// at whatever the cache already holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotState {
    pub on: Option<bool>,
    pub brightness: Option<u8>,
    pub color_temp_mired: Option<u16>,
    pub hue: Option<f64>,
    pub saturation: Option<f64>,
}

/// One entity as reported by bulk discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    #[serde(default)]
    pub state: SnapshotState,
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

/// The remote device-control service.
///
/// The engine never owns the connection; it only calls into it and must
/// tolerate it being disconnected at any time.
#[async_trait]
pub trait RemoteHub: Send + Sync {
    /// Get the name/identifier of this hub
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Try to (re)establish the connection. Returns whether it is usable.
    async fn ensure_connected(&self) -> bool;

    /// Execute a command against an entity.
    async fn execute_command(
        &self,
        entity_id: &EntityId,
        command: &HubCommand,
    ) -> Result<(), HubError>;

    /// Register the sink for unsolicited state-change pushes.
    async fn subscribe(&self, tx: PushSender) -> Result<(), HubError>;

    /// One-shot bulk fetch of every entity's state and capabilities.
    async fn fetch_states(&self) -> Result<Vec<EntitySnapshot>, HubError>;
}

/// Mock hub for testing
#[cfg(test)]
#[derive(Debug)]
pub struct MockHub {
    pub commands: std::sync::Mutex<Vec<(EntityId, HubCommand)>>,
    pub snapshots: std::sync::Mutex<Vec<EntitySnapshot>>,
    pub failures: std::sync::Mutex<std::collections::VecDeque<HubError>>,
    pub latency: std::sync::Mutex<std::time::Duration>,
    pub subscribers: std::sync::Mutex<Vec<PushSender>>,
    pub connected: std::sync::atomic::AtomicBool,
    pub fetch_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockHub {
    /// Create a connected mock hub
    pub fn new() -> Self {
        Self {
            commands: Default::default(),
            snapshots: Default::default(),
            failures: Default::default(),
            latency: Default::default(),
            subscribers: Default::default(),
            connected: std::sync::atomic::AtomicBool::new(true),
            fetch_calls: Default::default(),
        }
    }

    pub fn with_snapshots(snapshots: Vec<EntitySnapshot>) -> Self {
        let hub = Self::new();
        *hub.snapshots.lock().unwrap() = snapshots;
        hub
    }

    /// Commands executed so far, in order
    pub fn commands(&self) -> Vec<(EntityId, HubCommand)> {
        self.commands.lock().unwrap().clone()
    }

    /// Make the next `execute_command` fail with `err`
    pub fn fail_next(&self, err: HubError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected
            .store(connected, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver a push to every subscriber
    pub async fn push(&self, update: PushUpdate) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            tx.send(update.clone()).await.unwrap();
        }
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteHub for MockHub {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> bool {
        self.is_connected()
    }

    async fn execute_command(
        &self,
        entity_id: &EntityId,
        command: &HubCommand,
    ) -> Result<(), HubError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.commands
            .lock()
            .unwrap()
            .push((entity_id.clone(), command.clone()));
        Ok(())
    }

    async fn subscribe(&self, tx: PushSender) -> Result<(), HubError> {
        self.subscribers.lock().unwrap().push(tx);
        Ok(())
    }

    async fn fetch_states(&self) -> Result<Vec<EntitySnapshot>, HubError> {
        self.fetch_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.snapshots.lock().unwrap().clone())
    }
}
