//! Preview color for the entity's current appearance.

use super::cache::EntityRecord;
use super::color;
use super::color::Rgb;
use super::state::ActiveLook;

/// Renders an [`EntityRecord`] into the sRGB color a UI swatch should show.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorPreviewRenderer;

impl ColorPreviewRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Black for unknown or off entities, otherwise the selected look dimmed
    /// by brightness in linear light.
    pub fn render(&self, record: Option<&EntityRecord>) -> Rgb {
        let Some(record) = record else {
            return Rgb::BLACK;
        };
        let state = &record.state;
        if !state.is_on || state.brightness == 0 {
            return Rgb::BLACK;
        }

        let look = record.active_look.unwrap_or_else(|| default_look(record));
        let full = match look {
            ActiveLook::Hs => hs_color(record).or_else(|| temp_color(record)),
            ActiveLook::Temp => temp_color(record).or_else(|| hs_color(record)),
        };

        color::dim(full.unwrap_or(Rgb::WHITE), state.brightness)
    }
}

/// Look used before the user has touched either color dimension.
pub fn default_look(record: &EntityRecord) -> ActiveLook {
    let caps = record.capabilities();
    if caps.preferred_color_mode.is_none() && caps.color_temp && !caps.color_hs {
        ActiveLook::Temp
    } else {
        ActiveLook::Hs
    }
}

fn hs_color(record: &EntityRecord) -> Option<Rgb> {
    record.hs_known.then(|| {
        color::hsv_to_rgb(record.state.hue, record.state.saturation / 100.0, 1.0)
    })
}

fn temp_color(record: &EntityRecord) -> Option<Rgb> {
    (record.temp_known && record.state.color_temp_mired > 0).then(|| {
        let kelvin = color::mired_to_kelvin(record.state.color_temp_mired);
        color::blackbody_to_rgb(f64::from(kelvin))
    })
}
