use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tracing::debug;
use tracing::info;

use super::cache::EntityStateCache;
use super::color;
use super::debounce::PendingKey;
use super::echo::EchoSuppressor;
use super::hub::HubCommand;
use super::hub::RemoteHub;
use super::hub::TurnOnPayload;
use super::state::CapabilitySet;
use super::state::Channel;
use super::state::ChannelState;
use super::state::ColorMode;
use super::state::EntityId;
use super::state::WhiteLevels;
use crate::error::DispatchError;
use crate::error::HubError;

/// A resolved absolute value for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelTarget {
    Power(bool),
    Brightness(u8),
    ColorTemp(u16),
    Hue(f64),
    Saturation(f64),
}

impl ChannelTarget {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelTarget::Power(_) => Channel::Power,
            ChannelTarget::Brightness(_) => Channel::Brightness,
            ChannelTarget::ColorTemp(_) => Channel::ColorTemp,
            ChannelTarget::Hue(_) => Channel::Hue,
            ChannelTarget::Saturation(_) => Channel::Saturation,
        }
    }

    /// Write the target into `state` the way the device will end up.
    pub fn apply(self, state: &mut ChannelState) {
        match self {
            ChannelTarget::Power(on) => state.is_on = on,
            ChannelTarget::Brightness(brightness) => {
                state.brightness = brightness;
                state.is_on = brightness > 0;
            }
            ChannelTarget::ColorTemp(mired) => state.color_temp_mired = mired,
            ChannelTarget::Hue(hue) => state.hue = hue,
            ChannelTarget::Saturation(saturation) => state.saturation = saturation,
        }
    }
}

/// Result of a dispatch that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent(HubCommand),
    /// The target equals the last successfully sent value
    Skipped,
}

/// Build the wire command for `target`.
///
/// Hue and saturation are always sent together, taking the other half from
/// the cached `state`.
pub fn compose_command(
    target: ChannelTarget,
    state: &ChannelState,
    caps: &CapabilitySet,
    white: WhiteLevels,
) -> HubCommand {
    match target {
        ChannelTarget::Power(false) | ChannelTarget::Brightness(0) => HubCommand::TurnOff,
        ChannelTarget::Power(true) => HubCommand::TurnOn(TurnOnPayload::default()),
        ChannelTarget::Brightness(brightness) => HubCommand::TurnOn(TurnOnPayload {
            brightness: Some(brightness),
            ..Default::default()
        }),
        ChannelTarget::ColorTemp(mired) => HubCommand::TurnOn(TurnOnPayload {
            color_temp_kelvin: Some(color::mired_to_kelvin(mired)),
            ..Default::default()
        }),
        ChannelTarget::Hue(hue) => HubCommand::TurnOn(compose_color(
            hue,
            state.saturation,
            caps.preferred_color_mode,
            white,
        )),
        ChannelTarget::Saturation(saturation) => HubCommand::TurnOn(compose_color(
            state.hue,
            saturation,
            caps.preferred_color_mode,
            white,
        )),
    }
}

/// Express hue/saturation in the device's preferred color representation.
pub fn compose_color(
    hue: f64,
    saturation: f64,
    mode: Option<ColorMode>,
    white: WhiteLevels,
) -> TurnOnPayload {
    let rgb = || color::hsv_to_rgb(hue, saturation / 100.0, 1.0);

    match mode.unwrap_or(ColorMode::Hs) {
        ColorMode::Hs => TurnOnPayload {
            hs_color: Some([hue, saturation]),
            ..Default::default()
        },
        ColorMode::Rgb => {
            let c = rgb();
            TurnOnPayload {
                rgb_color: Some([c.r, c.g, c.b]),
                ..Default::default()
            }
        }
        ColorMode::Rgbw => {
            let c = rgb();
            let w = white.cold.or(white.warm).unwrap_or(0);
            TurnOnPayload {
                rgbw_color: Some([c.r, c.g, c.b, w]),
                ..Default::default()
            }
        }
        ColorMode::Rgbww => {
            let c = rgb();
            let (cold, warm) = match (white.cold, white.warm) {
                (Some(cold), Some(warm)) => (cold, warm),
                (Some(level), None) | (None, Some(level)) => (level, level),
                (None, None) => (0, 0),
            };
            TurnOnPayload {
                rgbww_color: Some([c.r, c.g, c.b, cold, warm]),
                ..Default::default()
            }
        }
    }
}

/// Sends resolved targets to the hub and remembers what was confirmed.
pub struct CommandDispatcher {
    hub: Arc<dyn RemoteHub>,
    timeout: Duration,
    last_sent: Mutex<HashMap<PendingKey, ChannelTarget>>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("hub", &self.hub.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    pub fn new(hub: Arc<dyn RemoteHub>, timeout: Duration) -> Self {
        Self {
            hub,
            timeout,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<dyn RemoteHub> {
        &self.hub
    }

    pub fn last_sent(&self, id: &EntityId, channel: Channel) -> Option<ChannelTarget> {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(id.clone(), channel))
            .copied()
    }

    /// Forget confirmed values that a remote change has made stale.
    pub fn forget(&self, id: &EntityId, channels: &[Channel]) {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        for channel in channels {
            last_sent.remove(&(id.clone(), *channel));
        }
    }

    // Brightness implies power, and turning off leaves the level unconfirmed.
    fn record_sent(&self, id: &EntityId, target: ChannelTarget) {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        match target {
            ChannelTarget::Brightness(brightness) => {
                last_sent.insert(
                    (id.clone(), Channel::Power),
                    ChannelTarget::Power(brightness > 0),
                );
            }
            ChannelTarget::Power(false) => {
                last_sent.remove(&(id.clone(), Channel::Brightness));
            }
            _ => {}
        }
        last_sent.insert((id.clone(), target.channel()), target);
    }

    /// Forget every confirmed value of `id`.
    pub fn clear_entity(&self, id: &EntityId) {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entity, _), _| entity != id);
    }

    /// Send `target` unless it equals the last confirmed value.
    ///
    /// On success LastSent is updated and the echo window opened. On failure
    /// nothing is recorded, so retrying the same target is not skipped; the
    /// optimistic cache value is left alone either way.
    pub async fn dispatch(
        &self,
        cache: &EntityStateCache,
        echo: &EchoSuppressor,
        id: &EntityId,
        target: ChannelTarget,
    ) -> Result<DispatchOutcome, DispatchError> {
        let channel = target.channel();
        let caps = cache.capabilities(id);
        if !caps.allows(channel) {
            debug!("Not dispatching {} for {}: capability denied", channel, id);
            return Err(DispatchError::CapabilityDenied(channel));
        }

        if self.last_sent(id, channel) == Some(target) {
            debug!("Skipping {} for {}: already sent {:?}", channel, id, target);
            return Ok(DispatchOutcome::Skipped);
        }

        let state = cache.get(id);
        let white = cache.record(id).map(|r| r.white).unwrap_or_default();
        let command = compose_command(target, &state, &caps, white);

        tokio::time::timeout(self.timeout, self.send(id, &command))
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))??;

        self.record_sent(id, target);
        echo.mark_sent(id);

        info!("Sent {} command to {}: {:?}", channel, id, command);
        Ok(DispatchOutcome::Sent(command))
    }

    async fn send(&self, id: &EntityId, command: &HubCommand) -> Result<(), DispatchError> {
        if !self.hub.is_connected() && !self.hub.ensure_connected().await {
            return Err(DispatchError::NotConnected);
        }

        match self.hub.execute_command(id, command).await {
            Ok(()) => Ok(()),
            Err(HubError::NotConnected) => Err(DispatchError::NotConnected),
            Err(e) => Err(e.into()),
        }
    }
}
