use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumIter;
use strum::EnumString;

/// Warmest/coolest mired bounds assumed until discovery reports the real range.
pub const DEFAULT_MIN_MIRED: u16 = 153;
pub const DEFAULT_MAX_MIRED: u16 = 500;

/// Opaque entity identifier, compared case-insensitively.
///
/// The id is normalized (trimmed, lowercased) on construction so it can be used
/// directly as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An adjustable control channel of an entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[strum(to_string = "power", serialize = "onoff", serialize = "on_off")]
    Power,
    #[strum(to_string = "brightness", serialize = "bri")]
    Brightness,
    #[strum(to_string = "color_temp", serialize = "temp", serialize = "ct")]
    ColorTemp,
    Hue,
    #[strum(to_string = "saturation", serialize = "sat")]
    Saturation,
}

/// Device-native color representation used when dispatching hue/saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Hs,
    Rgb,
    Rgbw,
    Rgbww,
}

/// Which color dimension the user last touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveLook {
    Hs,
    Temp,
}

/// Per-entity color temperature bounds in mired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiredRange {
    pub min: u16,
    pub max: u16,
}

impl MiredRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(a: u16, b: u16) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn clamp(&self, mired: u16) -> u16 {
        mired.clamp(self.min, self.max)
    }
}

impl Default for MiredRange {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_MIRED, DEFAULT_MAX_MIRED)
    }
}

/// Cached channel values of a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelState {
    /// Hue in degrees, always within [0, 360).
    pub hue: f64,

    /// Saturation in percent, [0, 100].
    pub saturation: f64,

    /// Brightness level (0-255).
    pub brightness: u8,

    /// Color temperature in mired, within the entity's [`MiredRange`].
    pub color_temp_mired: u16,

    pub is_on: bool,
}

impl ChannelState {
    /// Bring every field back into its domain.
    pub fn clamped(mut self, range: MiredRange) -> Self {
        self.hue = wrap_hue(self.hue);
        self.saturation = if self.saturation.is_nan() {
            0.0
        } else {
            self.saturation.clamp(0.0, 100.0)
        };
        self.color_temp_mired = range.clamp(self.color_temp_mired);
        self
    }
}

/// Wrap a hue angle into [0, 360).
pub fn wrap_hue(hue: f64) -> f64 {
    if !hue.is_finite() {
        return 0.0;
    }
    let wrapped = hue.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Channels an entity supports, as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySet {
    pub on_off: bool,
    pub brightness: bool,
    pub color_temp: bool,
    pub color_hs: bool,
    /// Unrecognized modes read as `None` and fall back to plain hue/saturation.
    #[serde(deserialize_with = "lenient_color_mode")]
    pub preferred_color_mode: Option<ColorMode>,
    pub mired_range: Option<MiredRange>,
}

fn lenient_color_mode<'de, D>(deserializer: D) -> Result<Option<ColorMode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mode = Option::<String>::deserialize(deserializer)?;
    Ok(mode.and_then(|m| m.trim().parse().ok()))
}

impl CapabilitySet {
    /// Whether a tick or dispatch against `channel` is legal.
    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Power => self.on_off,
            Channel::Brightness => self.brightness,
            Channel::ColorTemp => self.color_temp,
            Channel::Hue | Channel::Saturation => self.color_hs,
        }
    }
}

impl Default for CapabilitySet {
    /// Only claim on/off until discovery confirms more.
    fn default() -> Self {
        Self {
            on_off: true,
            brightness: false,
            color_temp: false,
            color_hs: false,
            preferred_color_mode: None,
            mired_range: None,
        }
    }
}

/// Independently suppliable white channel levels for RGBW/RGBWW devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WhiteLevels {
    pub cold: Option<u8>,
    pub warm: Option<u8>,
}
