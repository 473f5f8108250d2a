//! In-process simulated hub.
//!
//! Keeps authoritative state for a fixed set of entities, applies commands to
//! it and, like a real hub, echoes the resulting state back as unsolicited
//! pushes after a delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::SimulatorConfig;
use crate::engine::EntityId;
use crate::engine::EntitySnapshot;
use crate::engine::HubCommand;
use crate::engine::PushChange;
use crate::engine::PushSender;
use crate::engine::PushUpdate;
use crate::engine::RemoteHub;
use crate::engine::TurnOnPayload;
use crate::engine::color;
use crate::engine::color::Rgb;
use crate::error::HubError;

#[derive(Debug)]
pub struct LoopbackHub {
    entities: Mutex<HashMap<EntityId, EntitySnapshot>>,
    subscribers: Mutex<Vec<PushSender>>,
    connected: AtomicBool,
    echo_latency: Duration,
}

impl LoopbackHub {
    pub fn new(entities: Vec<EntitySnapshot>, echo_latency: Duration) -> Self {
        let entities = entities
            .into_iter()
            .map(|e| (e.entity_id.clone(), e))
            .collect();

        Self {
            entities: Mutex::new(entities),
            subscribers: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            echo_latency,
        }
    }

    pub fn from_config(cfg: &SimulatorConfig) -> Self {
        let hub = Self::new(
            cfg.entities.clone(),
            Duration::from_millis(cfg.echo_latency_ms),
        );
        hub.set_connected(cfg.connected);
        hub
    }

    fn entities(&self) -> MutexGuard<'_, HashMap<EntityId, EntitySnapshot>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connected(&self, connected: bool) {
        info!(
            "Loopback hub {}",
            if connected { "connected" } else { "disconnected" }
        );
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Authoritative state of one entity.
    pub fn snapshot(&self, id: &EntityId) -> Option<EntitySnapshot> {
        self.entities().get(id).cloned()
    }

    /// Simulate a change made outside this engine, e.g. at a wall switch.
    ///
    /// The change is applied and pushed to subscribers immediately.
    pub async fn inject(&self, update: PushUpdate) -> Result<(), HubError> {
        {
            let mut entities = self.entities();
            let entity = entities
                .get_mut(&update.entity_id)
                .ok_or_else(|| HubError::UnknownEntity(update.entity_id.to_string()))?;
            apply_change(entity, &update.change);
        }

        broadcast(self.subscribers(), vec![update]).await;
        Ok(())
    }

    fn subscribers(&self) -> Vec<PushSender> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RemoteHub for LoopbackHub {
    fn name(&self) -> &str {
        "loopback"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> bool {
        self.is_connected()
    }

    async fn execute_command(
        &self,
        entity_id: &EntityId,
        command: &HubCommand,
    ) -> Result<(), HubError> {
        if !self.is_connected() {
            return Err(HubError::NotConnected);
        }

        let pushes = {
            let mut entities = self.entities();
            let entity = entities
                .get_mut(entity_id)
                .ok_or_else(|| HubError::UnknownEntity(entity_id.to_string()))?;
            apply_command(entity, command)
        };
        debug!("Loopback executed {:?} on {}", command, entity_id);

        let updates: Vec<_> = pushes
            .into_iter()
            .map(|change| PushUpdate::new(entity_id.clone(), change))
            .collect();
        let subscribers = self.subscribers();
        let latency = self.echo_latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            broadcast(subscribers, updates).await;
        });

        Ok(())
    }

    async fn subscribe(&self, tx: PushSender) -> Result<(), HubError> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(())
    }

    async fn fetch_states(&self) -> Result<Vec<EntitySnapshot>, HubError> {
        if !self.is_connected() {
            return Err(HubError::NotConnected);
        }

        let mut snapshots: Vec<_> = self.entities().values().cloned().collect();
        snapshots.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(snapshots)
    }
}

async fn broadcast(subscribers: Vec<PushSender>, updates: Vec<PushUpdate>) {
    for tx in subscribers {
        for update in &updates {
            if let Err(e) = tx.send(update.clone()).await {
                warn!("Dropping push for {}: {}", update.entity_id, e);
            }
        }
    }
}

/// Apply a command to the authoritative state and return the pushes a hub
/// would report for it.
fn apply_command(entity: &mut EntitySnapshot, command: &HubCommand) -> Vec<PushChange> {
    let state = &mut entity.state;

    let payload = match command {
        HubCommand::TurnOff => {
            state.on = Some(false);
            return vec![PushChange::Power(Some(false))];
        }
        HubCommand::TurnOn(payload) => payload,
    };

    let mut pushes = Vec::new();
    if state.on != Some(true) {
        state.on = Some(true);
        pushes.push(PushChange::Power(Some(true)));
    }

    let TurnOnPayload {
        brightness,
        color_temp_kelvin,
        hs_color,
        rgb_color,
        rgbw_color,
        rgbww_color,
    } = payload;

    if let Some(brightness) = brightness {
        state.brightness = Some(*brightness);
        pushes.push(PushChange::Brightness(Some(*brightness)));
    }

    if let Some(kelvin) = color_temp_kelvin {
        state.color_temp_mired = color::kelvin_to_mired(f64::from(*kelvin));
        pushes.push(PushChange::ColorTemp {
            mired: None,
            kelvin: Some(f64::from(*kelvin)),
        });
    }

    if let Some([hue, saturation]) = hs_color {
        state.hue = Some(*hue);
        state.saturation = Some(*saturation);
        pushes.push(PushChange::Hs {
            hue: Some(*hue),
            saturation: Some(*saturation),
        });
    }

    // Devices in RGB-ish modes report raw RGB back
    let rgb = rgb_color
        .or(rgbw_color.map(|[r, g, b, _]| [r, g, b]))
        .or(rgbww_color.map(|[r, g, b, _, _]| [r, g, b]));
    if let Some([r, g, b]) = rgb {
        let (hue, saturation) = color::rgb_to_hs(Rgb::new(r, g, b));
        state.hue = Some(hue);
        state.saturation = Some(saturation);
        pushes.push(PushChange::Rgb {
            r: Some(r),
            g: Some(g),
            b: Some(b),
        });
    }

    pushes
}

fn apply_change(entity: &mut EntitySnapshot, change: &PushChange) {
    let state = &mut entity.state;
    match change {
        PushChange::Brightness(Some(0)) => state.on = Some(false),
        PushChange::Brightness(Some(brightness)) => {
            state.on = Some(true);
            state.brightness = Some(*brightness);
        }
        PushChange::ColorTemp { mired, kelvin } => {
            let mired = mired
                .map(|m| m.round().clamp(0.0, f64::from(u16::MAX)) as u16)
                .or_else(|| kelvin.and_then(color::kelvin_to_mired));
            if mired.is_some() {
                state.color_temp_mired = mired;
            }
        }
        PushChange::Hs { hue, saturation } => {
            state.hue = hue.or(state.hue);
            state.saturation = saturation.or(state.saturation);
        }
        PushChange::Rgb {
            r: Some(r),
            g: Some(g),
            b: Some(b),
        } => {
            let (hue, saturation) = color::rgb_to_hs(Rgb::new(*r, *g, *b));
            state.hue = Some(hue);
            state.saturation = Some(saturation);
        }
        PushChange::Power(Some(on)) => state.on = Some(*on),
        PushChange::Brightness(None)
        | PushChange::Rgb { .. }
        | PushChange::Xy { .. }
        | PushChange::Power(None) => {}
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::CapabilitySet;
    use crate::engine::SnapshotState;

    fn hub() -> LoopbackHub {
        LoopbackHub::new(
            vec![EntitySnapshot {
                entity_id: EntityId::new("light.desk"),
                state: SnapshotState {
                    on: Some(false),
                    brightness: Some(10),
                    ..Default::default()
                },
                capabilities: CapabilitySet {
                    brightness: true,
                    ..Default::default()
                },
            }],
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_is_echoed_after_latency() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(16);
        hub.subscribe(tx).await.unwrap();

        let id = EntityId::new("light.desk");
        let command = HubCommand::TurnOn(TurnOnPayload {
            brightness: Some(128),
            ..Default::default()
        });
        hub.execute_command(&id, &command).await.unwrap();

        let state = hub.snapshot(&id).unwrap().state;
        assert_eq!(state.on, Some(true));
        assert_eq!(state.brightness, Some(128));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            PushUpdate::new("light.desk", PushChange::Power(Some(true)))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PushUpdate::new("light.desk", PushChange::Brightness(Some(128)))
        );
    }

    #[test]
    fn test_rgb_modes_report_rgb() {
        let mut entity = EntitySnapshot {
            entity_id: EntityId::new("light.strip"),
            state: SnapshotState {
                on: Some(true),
                ..Default::default()
            },
            capabilities: CapabilitySet::default(),
        };
        let pushes = apply_command(
            &mut entity,
            &HubCommand::TurnOn(TurnOnPayload {
                rgbw_color: Some([0, 0, 255, 40]),
                ..Default::default()
            }),
        );
        assert_eq!(
            pushes,
            vec![PushChange::Rgb {
                r: Some(0),
                g: Some(0),
                b: Some(255),
            }]
        );
        assert_eq!(entity.state.hue, Some(240.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_and_unknown() {
        let hub = hub();
        let err = hub
            .execute_command(&EntityId::new("light.nope"), &HubCommand::TurnOff)
            .await
            .unwrap_err();
        assert_eq!(err, HubError::UnknownEntity("light.nope".to_string()));

        hub.set_connected(false);
        assert!(!hub.ensure_connected().await);
        assert_eq!(
            hub.execute_command(&EntityId::new("light.desk"), &HubCommand::TurnOff)
                .await,
            Err(HubError::NotConnected)
        );
        assert_eq!(hub.fetch_states().await, Err(HubError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inject_pushes_immediately() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(16);
        hub.subscribe(tx).await.unwrap();

        let update = PushUpdate::new("light.desk", PushChange::Brightness(Some(77)));
        hub.inject(update.clone()).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), update);
        let state = hub.snapshot(&EntityId::new("light.desk")).unwrap().state;
        assert_eq!(state.brightness, Some(77));
        assert_eq!(state.on, Some(true));
    }
}
