//! Color math for the chroma pipeline
//!
//! Hex parsing/formatting plus sRGB ↔ OKLab ↔ OKLCh conversions. OKLab is used so
//! that lightness/chroma adjustments and blends track perceived color rather than
//! raw RGB distance.

use crate::error::{ChromaError, Result};

// ============================================================================
// sRGB (8-bit)
// ============================================================================

/// 8-bit sRGB color as carried in hex strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb`, `rrggbb` or the short `#rgb` form (case insensitive)
    pub fn from_hex(hex: &str) -> Result<Self> {
        let trimmed = hex.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !digits.is_ascii() {
            return Err(ChromaError::InvalidColor(format!("non-ascii hex '{}'", hex)));
        }

        let expanded = match digits.len() {
            6 => digits.to_string(),
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            n => {
                return Err(ChromaError::InvalidColor(format!(
                    "expected 3 or 6 hex digits in '{}', got {}",
                    hex, n
                )))
            }
        };

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&expanded[range], 16)
                .map_err(|e| ChromaError::InvalidColor(format!("'{}': {}", hex, e)))
        };

        Ok(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }

    /// Lower-case `#rrggbb`
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// `"r,g,b"` form consumed by CSS custom properties downstream
    pub fn to_rgb_string(self) -> String {
        format!("{},{},{}", self.r, self.g, self.b)
    }

    pub fn to_oklab(self) -> OkLab {
        linear_to_oklab(self.to_linear())
    }

    pub fn to_oklch(self) -> OkLch {
        self.to_oklab().to_oklch()
    }

    fn to_linear(self) -> [f64; 3] {
        [self.r, self.g, self.b].map(|c| srgb_component_to_linear(c as f64 / 255.0))
    }

    fn from_linear(linear: [f64; 3]) -> Self {
        let [r, g, b] = linear.map(|c| {
            (linear_component_to_srgb(c).clamp(0.0, 1.0) * 255.0).round() as u8
        });
        Self { r, g, b }
    }
}

/// True for strictly `#` followed by six hex digits
pub fn is_valid_hex6(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize any accepted hex form to lower-case `#rrggbb`
pub fn normalize_hex(value: &str) -> Result<String> {
    Rgb::from_hex(value).map(Rgb::to_hex)
}

/// Per-channel rounded average of two strict `#rrggbb` colors
///
/// Returns `None` when either side is not a valid 6-digit hex color.
pub fn average_hex(a: &str, b: &str) -> Option<String> {
    if !is_valid_hex6(a) || !is_valid_hex6(b) {
        return None;
    }
    let a = Rgb::from_hex(a).ok()?;
    let b = Rgb::from_hex(b).ok()?;
    let mix = |x: u8, y: u8| ((x as f64 + y as f64) / 2.0).round() as u8;
    Some(Rgb::new(mix(a.r, b.r), mix(a.g, b.g), mix(a.b, b.b)).to_hex())
}

/// Convert a hex color to its `"r,g,b"` string
pub fn hex_to_rgb_string(hex: &str) -> Result<String> {
    Rgb::from_hex(hex).map(Rgb::to_rgb_string)
}

fn srgb_component_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_component_to_srgb(c: f64) -> f64 {
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.max(0.0).powf(1.0 / 2.4) - 0.055
    }
}

// ============================================================================
// OKLab / OKLCh
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OkLab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

/// Cylindrical OKLab; hue in degrees [0, 360)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OkLch {
    pub l: f64,
    pub c: f64,
    pub h: f64,
}

/// Chroma ceiling used when scaling; roughly the sRGB gamut edge in OKLCh
pub const MAX_CHROMA: f64 = 0.37;

impl OkLab {
    pub fn to_oklch(self) -> OkLch {
        let c = (self.a * self.a + self.b * self.b).sqrt();
        // atan2(0, 0) is meaningless for greys
        let h = if c < 1e-10 {
            0.0
        } else {
            self.b.atan2(self.a).to_degrees().rem_euclid(360.0)
        };
        OkLch { l: self.l, c, h }
    }

    pub fn to_rgb(self) -> Rgb {
        Rgb::from_linear(oklab_to_linear(self))
    }
}

impl OkLch {
    pub fn to_oklab(self) -> OkLab {
        let h = self.h.to_radians();
        OkLab {
            l: self.l,
            a: self.c * h.cos(),
            b: self.c * h.sin(),
        }
    }

    pub fn to_rgb(self) -> Rgb {
        self.to_oklab().to_rgb()
    }

    pub fn to_hex(self) -> String {
        self.to_rgb().to_hex()
    }
}

fn linear_to_oklab([r, g, b]: [f64; 3]) -> OkLab {
    let l_ = 0.4122214708 * r + 0.5363325363 * g + 0.0514459929 * b;
    let m_ = 0.2119034982 * r + 0.6806995451 * g + 0.1073969566 * b;
    let s_ = 0.0883024619 * r + 0.2817188376 * g + 0.6299787005 * b;

    let (l_c, m_c, s_c) = (l_.cbrt(), m_.cbrt(), s_.cbrt());

    OkLab {
        l: 0.2104542553 * l_c + 0.7936177850 * m_c - 0.0040720468 * s_c,
        a: 1.9779984951 * l_c - 2.4285922050 * m_c + 0.4505937099 * s_c,
        b: 0.0259040371 * l_c + 0.7827717662 * m_c - 0.8086757660 * s_c,
    }
}

fn oklab_to_linear(c: OkLab) -> [f64; 3] {
    let l_ = c.l + 0.3963377774 * c.a + 0.2158037573 * c.b;
    let m_ = c.l - 0.1055613458 * c.a - 0.0638541728 * c.b;
    let s_ = c.l - 0.0894841775 * c.a - 1.2914855480 * c.b;

    let (l, m, s) = (l_ * l_ * l_, m_ * m_ * m_, s_ * s_ * s_);

    [
        4.0767416621 * l - 3.3077115913 * m + 0.2309699292 * s,
        -1.2684380046 * l + 2.6097574011 * m - 0.3413193965 * s,
        -0.0041960863 * l - 0.7034186147 * m + 1.7076147010 * s,
    ]
}
