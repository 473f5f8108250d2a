//! Messages exchanged with the engine's collaborators
//!
//! Messages are split by direction:
//! - `PushUpdate`: unsolicited state changes from the hub to the engine
//! - `UiEvent`: refresh and failure notifications from the engine to the UI

use super::state::Channel;
use super::state::EntityId;

/// A state-change notification pushed by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub entity_id: EntityId,
    pub change: PushChange,
}

impl PushUpdate {
    pub fn new(entity_id: impl Into<EntityId>, change: PushChange) -> Self {
        Self {
            entity_id: entity_id.into(),
            change,
        }
    }
}

/// The payload of a push, one variant per observable channel kind.
///
/// Every field is optional: a missing field means "unchanged".
#[derive(Debug, Clone, PartialEq)]
pub enum PushChange {
    /// Brightness (0-255). Zero means the entity turned off.
    Brightness(Option<u8>),

    /// Color temperature, in mired or Kelvin. Mired wins when both are present.
    ColorTemp {
        mired: Option<f64>,
        kelvin: Option<f64>,
    },

    /// Hue in degrees, saturation in percent
    Hs {
        hue: Option<f64>,
        saturation: Option<f64>,
    },

    /// Raw RGB color
    Rgb {
        r: Option<u8>,
        g: Option<u8>,
        b: Option<u8>,
    },

    /// CIE xy chromaticity plus brightness used as luminance
    Xy {
        x: Option<f64>,
        y: Option<f64>,
        brightness: Option<u8>,
    },

    /// On/off state
    Power(Option<bool>),
}

impl PushChange {
    /// Channels whose display is affected by this change.
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            PushChange::Brightness(_) => &[Channel::Brightness, Channel::Power],
            PushChange::ColorTemp { .. } => &[Channel::ColorTemp],
            PushChange::Hs { .. } | PushChange::Rgb { .. } | PushChange::Xy { .. } => {
                &[Channel::Hue, Channel::Saturation]
            }
            PushChange::Power(_) => &[Channel::Power],
        }
    }
}

/// Notifications FROM the engine TO the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// The display of a channel of the observed entity should be redrawn
    ChannelRefreshed { entity_id: EntityId, channel: Channel },

    /// A dispatch attempt failed; one per attempt, not per coalesced tick
    DispatchFailed {
        entity_id: EntityId,
        channel: Channel,
        reason: String,
    },
}
