//! Color conversions shared by the dispatcher, the reconciler and the preview
//! renderer.
//!
//! All functions are pure. Channel intensities are `f64` in [0, 1] unless the
//! signature says otherwise.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Household range used when approximating blackbody colors.
pub const MIN_PREVIEW_KELVIN: f64 = 1800.0;
pub const MAX_PREVIEW_KELVIN: f64 = 6500.0;

/// An 8-bit sRGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    fn from_unit(r: f64, g: f64, b: f64) -> Self {
        Self::new(unit_to_u8(r), unit_to_u8(g), unit_to_u8(b))
    }

    fn to_unit(self) -> [f64; 3] {
        [
            f64::from(self.r) / 255.0,
            f64::from(self.g) / 255.0,
            f64::from(self.b) / 255.0,
        ]
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn unit_to_u8(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Standard HSV to sRGB. `hue` in degrees, `saturation` and `value` in [0, 1].
pub fn hsv_to_rgb(hue: f64, saturation: f64, value: f64) -> Rgb {
    let h = super::state::wrap_hue(hue) / 60.0;
    let s = saturation.clamp(0.0, 1.0);
    let v = value.clamp(0.0, 1.0);

    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    Rgb::from_unit(r + m, g + m, b + m)
}

/// sRGB to (hue degrees, saturation percent). Value is discarded.
pub fn rgb_to_hs(rgb: Rgb) -> (f64, f64) {
    let [r, g, b] = rgb.to_unit();
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if max <= 0.0 || delta <= 0.0 {
        return (0.0, 0.0);
    }

    let hue = if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    (super::state::wrap_hue(hue), delta / max * 100.0)
}

/// CIE 1931 xy chromaticity plus brightness (0-255 as luminance) to sRGB.
///
/// Returns `None` for a degenerate `y`. Out-of-gamut results are clipped and
/// renormalized so the brightest channel stays at or below full scale.
pub fn xy_to_rgb(x: f64, y: f64, brightness: u8) -> Option<Rgb> {
    if !x.is_finite() || !y.is_finite() || y <= 0.0 {
        return None;
    }

    let lum = f64::from(brightness) / 255.0;
    let big_x = lum / y * x;
    let big_z = lum / y * (1.0 - x - y);

    let r = 3.2406 * big_x - 1.5372 * lum - 0.4986 * big_z;
    let g = -0.9689 * big_x + 1.8758 * lum + 0.0415 * big_z;
    let b = 0.0557 * big_x - 0.2040 * lum + 1.0570 * big_z;

    let (mut r, mut g, mut b) = (r.max(0.0), g.max(0.0), b.max(0.0));
    let max = r.max(g).max(b);
    if max > 1.0 {
        r /= max;
        g /= max;
        b /= max;
    }

    Some(Rgb::from_unit(
        linear_to_srgb(r),
        linear_to_srgb(g),
        linear_to_srgb(b),
    ))
}

/// Mired to Kelvin, rounded to the nearest Kelvin.
pub fn mired_to_kelvin(mired: u16) -> u32 {
    if mired == 0 {
        return 0;
    }
    (1_000_000.0 / f64::from(mired)).round() as u32
}

/// Kelvin to mired, rounded and saturated to the u16 range.
pub fn kelvin_to_mired(kelvin: f64) -> Option<u16> {
    if !kelvin.is_finite() || kelvin <= 0.0 {
        return None;
    }
    Some((1_000_000.0 / kelvin).round().clamp(0.0, f64::from(u16::MAX)) as u16)
}

/// Approximate the sRGB color of a blackbody radiator.
///
/// Uses the Tanner Helland fit (log curves below 6600K, power curves above),
/// with the input clamped to [`MIN_PREVIEW_KELVIN`]..=[`MAX_PREVIEW_KELVIN`].
pub fn blackbody_to_rgb(kelvin: f64) -> Rgb {
    let t = kelvin.clamp(MIN_PREVIEW_KELVIN, MAX_PREVIEW_KELVIN) / 100.0;

    let r = if t <= 66.0 {
        255.0
    } else {
        329.698727446 * (t - 60.0).powf(-0.1332047592)
    };

    let g = if t <= 66.0 {
        99.4708025861 * t.ln() - 161.1195681661
    } else {
        288.1221695283 * (t - 60.0).powf(-0.0755148492)
    };

    let b = if t >= 66.0 {
        255.0
    } else if t <= 19.0 {
        0.0
    } else {
        138.5177312231 * (t - 10.0).ln() - 305.0447927307
    };

    Rgb::from_unit(r / 255.0, g / 255.0, b / 255.0)
}

/// sRGB transfer function, encoded to linear light.
pub fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// sRGB transfer function, linear light to encoded.
pub fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Scale `rgb` by `brightness / 255` in linear light.
pub fn dim(rgb: Rgb, brightness: u8) -> Rgb {
    let factor = f64::from(brightness) / 255.0;
    let [r, g, b] = rgb.to_unit();
    Rgb::from_unit(
        linear_to_srgb(srgb_to_linear(r) * factor),
        linear_to_srgb(srgb_to_linear(g) * factor),
        linear_to_srgb(srgb_to_linear(b) * factor),
    )
}
