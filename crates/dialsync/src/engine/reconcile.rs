use tracing::debug;
use tracing::trace;

use super::cache::EntityRecord;
use super::cache::EntityStateCache;
use super::color;
use super::echo::EchoSuppressor;
use super::message::PushChange;
use super::message::PushUpdate;
use super::state::CapabilitySet;
use super::state::MiredRange;
use super::state::wrap_hue;

/// Hue/saturation changes smaller than this are floating-point jitter.
pub const HS_EPSILON: f64 = 0.5;

/// What happened to a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The cache changed
    Applied,
    /// Valid push, but nothing (or only jitter) changed
    Unchanged,
    /// Dropped as a likely echo of a local command
    Suppressed,
    /// Entity unknown, or the channel is not among its capabilities
    Filtered,
}

/// Merges unsolicited hub pushes into the cache.
#[derive(Debug, Clone)]
pub struct RemoteSyncReconciler {
    hs_epsilon: f64,
}

impl Default for RemoteSyncReconciler {
    fn default() -> Self {
        Self::new(HS_EPSILON)
    }
}

impl RemoteSyncReconciler {
    pub fn new(hs_epsilon: f64) -> Self {
        Self { hs_epsilon }
    }

    pub fn handle(
        &self,
        cache: &EntityStateCache,
        echo: &EchoSuppressor,
        update: &PushUpdate,
    ) -> ReconcileOutcome {
        let id = &update.entity_id;

        if !cache.is_seeded(id) || !accepts(&cache.capabilities(id), &update.change) {
            trace!("Filtered push for {}: {:?}", id, update.change);
            return ReconcileOutcome::Filtered;
        }

        if echo.should_ignore(id) {
            debug!("Suppressed likely echo for {}: {:?}", id, update.change);
            return ReconcileOutcome::Suppressed;
        }

        let default_range = cache.default_range();
        let (changed, _) = cache.update(id, |record| match &update.change {
            PushChange::Brightness(brightness) => on_brightness(record, *brightness),
            PushChange::ColorTemp { mired, kelvin } => {
                let range = record.mired_range(default_range);
                on_color_temp(record, range, *mired, *kelvin)
            }
            PushChange::Hs { hue, saturation } => self.on_hs(record, *hue, *saturation),
            PushChange::Rgb { r, g, b } => match (r, g, b) {
                (Some(r), Some(g), Some(b)) => self.on_rgb(record, color::Rgb::new(*r, *g, *b)),
                _ => false,
            },
            PushChange::Xy { x, y, brightness } => {
                let luminance = brightness.filter(|b| *b > 0).unwrap_or(u8::MAX);
                match (x, y) {
                    (Some(x), Some(y)) => color::xy_to_rgb(*x, *y, luminance)
                        .is_some_and(|rgb| self.on_rgb(record, rgb)),
                    _ => false,
                }
            }
            PushChange::Power(on) => on_power(record, *on),
        });

        if changed {
            debug!("Applied push for {}: {:?}", id, update.change);
            ReconcileOutcome::Applied
        } else {
            ReconcileOutcome::Unchanged
        }
    }

    fn on_hs(&self, record: &mut EntityRecord, hue: Option<f64>, saturation: Option<f64>) -> bool {
        let mut changed = false;

        if let Some(hue) = hue.filter(|h| h.is_finite()) {
            let hue = wrap_hue(hue);
            if hue_distance(hue, record.state.hue) >= self.hs_epsilon {
                record.state.hue = hue;
                changed = true;
            }
        }

        if let Some(saturation) = saturation.filter(|s| s.is_finite()) {
            let saturation = saturation.clamp(0.0, 100.0);
            if (saturation - record.state.saturation).abs() >= self.hs_epsilon {
                record.state.saturation = saturation;
                changed = true;
            }
        }

        if hue.is_some() || saturation.is_some() {
            record.hs_known = true;
        }
        changed
    }

    fn on_rgb(&self, record: &mut EntityRecord, rgb: color::Rgb) -> bool {
        let (hue, saturation) = color::rgb_to_hs(rgb);
        // Hue is undefined for grays; keep the previous one
        let hue = (saturation > 0.0).then_some(hue);
        self.on_hs(record, hue, Some(saturation))
    }
}

/// Whether the entity's capabilities cover the channel a push describes.
fn accepts(caps: &CapabilitySet, change: &PushChange) -> bool {
    match change {
        PushChange::Brightness(_) => caps.brightness,
        PushChange::ColorTemp { .. } => caps.color_temp,
        PushChange::Hs { .. } | PushChange::Rgb { .. } | PushChange::Xy { .. } => caps.color_hs,
        PushChange::Power(_) => caps.on_off,
    }
}

/// Zero turns the entity off but keeps the last non-zero brightness.
fn on_brightness(record: &mut EntityRecord, brightness: Option<u8>) -> bool {
    let Some(brightness) = brightness else {
        return false;
    };
    let before = record.state;

    if brightness == 0 {
        record.state.is_on = false;
    } else {
        record.state.is_on = true;
        record.state.brightness = brightness;
    }

    record.state != before
}

/// Mired wins when a push carries both units.
fn on_color_temp(
    record: &mut EntityRecord,
    range: MiredRange,
    mired: Option<f64>,
    kelvin: Option<f64>,
) -> bool {
    let mired = mired
        .filter(|m| m.is_finite() && *m > 0.0)
        .map(|m| m.round().min(f64::from(u16::MAX)) as u16)
        .or_else(|| kelvin.and_then(color::kelvin_to_mired));

    let Some(mired) = mired else {
        return false;
    };

    let mired = range.clamp(mired);
    record.temp_known = true;
    if record.state.color_temp_mired == mired {
        return false;
    }
    record.state.color_temp_mired = mired;
    true
}

fn on_power(record: &mut EntityRecord, on: Option<bool>) -> bool {
    match on {
        Some(on) if record.state.is_on != on => {
            record.state.is_on = on;
            true
        }
        _ => false,
    }
}

/// Shortest angular distance between two hues.
fn hue_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}
