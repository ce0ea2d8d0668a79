//! Local identity generation.
//!
//! Every editor instance announces a [`PresenceState`] on the awareness
//! channel: a display name, an avatar, and a cursor color. The identity is
//! drawn at random once and then kept for the lifetime of the editor, across
//! reconnects and document switches.
//!
//! Colors are drawn in HSL with low lightness so cursors and avatar borders
//! stay legible on a light background. The translucent `alpha_color` used
//! for selection highlights keeps the same RGB channels and only swaps the
//! alpha component.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alpha applied to the highlight variant of a presence color.
pub const HIGHLIGHT_ALPHA: f32 = 0.2;

/// Highest avatar index served by the portrait service.
pub const MAX_PHOTO_INDEX: u32 = 94;

/// Minimum contrast ratio of a presence color against white.
pub const MIN_CONTRAST_ON_WHITE: f32 = 3.0;

const LIGHTNESS_RANGE: std::ops::Range<f32> = 0.25..0.45;
const SATURATION_RANGE: std::ops::Range<f32> = 0.5..0.95;
const DARKEN_STEP: f32 = 0.85;

const FIRST_NAMES_MALE: &[&str] = &[
    "Aaron", "Bruno", "Caleb", "Dmitri", "Elias", "Felix", "Gustavo", "Hiro",
    "Ivan", "Jonas", "Kofi", "Luca", "Mateo", "Nikhil", "Omar", "Pavel",
];

const FIRST_NAMES_FEMALE: &[&str] = &[
    "Amara", "Beatrix", "Chloe", "Daria", "Elena", "Farah", "Greta", "Hana",
    "Ines", "Julia", "Keiko", "Leila", "Maya", "Nora", "Olivia", "Priya",
];

const LAST_NAMES: &[&str] = &[
    "Abbott", "Becker", "Castillo", "Dubois", "Eriksen", "Fischer", "Gallagher",
    "Haddad", "Ivanova", "Jensen", "Kowalski", "Lindqvist", "Moreau", "Nakamura",
    "Okafor", "Petrov", "Quinn", "Rossi", "Schneider", "Tanaka",
];

// ───────────────────────────────────────────────────────────────────
// Color
// ───────────────────────────────────────────────────────────────────

/// RGBA color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Create from RGBA components.
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Opaque color from HSL components, each in `[0, 1]`.
    pub fn from_hsl(h: f32, s: f32, l: f32) -> Self {
        let (r, g, b) = hsl_to_rgb(h, s, l);
        Self { r, g, b, a: 1.0 }
    }

    /// Same channels, different opacity.
    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }

    /// WCAG relative luminance of the RGB channels.
    pub fn relative_luminance(&self) -> f32 {
        fn linear(c: f32) -> f32 {
            if c <= 0.039_28 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        }
        0.2126 * linear(self.r) + 0.7152 * linear(self.g) + 0.0722 * linear(self.b)
    }

    /// WCAG contrast ratio against a white background.
    pub fn contrast_on_white(&self) -> f32 {
        1.05 / (self.relative_luminance() + 0.05)
    }

    /// Channels rounded to what [`CursorColor::to_css`] can represent.
    pub fn quantized(self) -> Self {
        Self {
            r: f32::from(channel_to_u8(self.r)) / 255.0,
            g: f32::from(channel_to_u8(self.g)) / 255.0,
            b: f32::from(channel_to_u8(self.b)) / 255.0,
            a: self.a,
        }
    }

    /// CSS functional notation, e.g. `rgba(12, 80, 140, 1)`.
    pub fn to_css(&self) -> String {
        format!(
            "rgba({}, {}, {}, {})",
            channel_to_u8(self.r),
            channel_to_u8(self.g),
            channel_to_u8(self.b),
            self.a
        )
    }

    /// Parse the notation produced by [`CursorColor::to_css`].
    pub fn parse_css(css: &str) -> Option<Self> {
        let body = css.trim().strip_prefix("rgba(")?.strip_suffix(')')?;
        let mut parts = body.split(',').map(str::trim);

        let r: u8 = parts.next()?.parse().ok()?;
        let g: u8 = parts.next()?.parse().ok()?;
        let b: u8 = parts.next()?.parse().ok()?;
        let a: f32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(0.0..=1.0).contains(&a) {
            return None;
        }

        Some(Self {
            r: f32::from(r) / 255.0,
            g: f32::from(g) / 255.0,
            b: f32::from(b) / 255.0,
            a,
        })
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.13, g: 0.33, b: 0.66, a: 1.0 }
    }
}

fn channel_to_u8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence payload
// ───────────────────────────────────────────────────────────────────

/// Identity announced on the awareness channel.
///
/// Local and remote peers share this shape; which one is "self" is decided
/// by comparing client ids, never by the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceState {
    /// Opaque CSS color for cursors and avatar borders.
    pub color: String,
    /// `color` at [`HIGHLIGHT_ALPHA`] opacity, for selection highlights.
    pub alpha_color: String,
    pub name: String,
    pub photo_url: String,
}

impl PresenceState {
    /// Build a presence payload from an explicit color.
    pub fn new(name: impl Into<String>, photo_url: impl Into<String>, color: CursorColor) -> Self {
        let solid = color.with_alpha(1.0);
        Self {
            color: solid.to_css(),
            alpha_color: solid.with_alpha(HIGHLIGHT_ALPHA).to_css(),
            name: name.into(),
            photo_url: photo_url.into(),
        }
    }

    /// Random identity from the thread-local generator.
    pub fn random() -> Self {
        generate_local_presence(&mut rand::rng())
    }

    /// Parsed solid color, falling back to the default for foreign payloads.
    pub fn cursor_color(&self) -> CursorColor {
        CursorColor::parse_css(&self.color).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gender {
    Male,
    Female,
}

impl Gender {
    fn portrait_folder(self) -> &'static str {
        match self {
            Gender::Male => "men",
            Gender::Female => "women",
        }
    }

    fn first_names(self) -> &'static [&'static str] {
        match self {
            Gender::Male => FIRST_NAMES_MALE,
            Gender::Female => FIRST_NAMES_FEMALE,
        }
    }
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}

/// Avatar URL for a portrait index.
fn photo_url(gender: Gender, index: u32) -> String {
    format!(
        "https://randomuser.me/api/portraits/{}/{}.jpg",
        gender.portrait_folder(),
        index
    )
}

/// Darken `(h, s, l)` until it reaches [`MIN_CONTRAST_ON_WHITE`].
///
/// Bright hues (yellow, cyan, green) need a lower lightness than blue or red
/// for the same contrast, so the hue is kept and only lightness moves.
fn legible_color(h: f32, s: f32, mut l: f32) -> CursorColor {
    loop {
        let color = CursorColor::from_hsl(h, s, l).quantized();
        if color.contrast_on_white() >= MIN_CONTRAST_ON_WHITE || l < 0.01 {
            return color;
        }
        l *= DARKEN_STEP;
    }
}

/// Draw a fresh local identity.
///
/// Name and avatar are independent draws; collisions between peers are
/// possible and harmless.
pub fn generate_local_presence<R: Rng + ?Sized>(rng: &mut R) -> PresenceState {
    let color = legible_color(
        rng.random_range(0.0..1.0),
        rng.random_range(SATURATION_RANGE),
        rng.random_range(LIGHTNESS_RANGE),
    );

    let gender = if rng.random_bool(0.5) {
        Gender::Male
    } else {
        Gender::Female
    };
    let photo_index = rng.random_range(0..=MAX_PHOTO_INDEX);
    let name = format!("{} {}", pick(rng, gender.first_names()), pick(rng, LAST_NAMES));

    log::debug!("Generated local identity {name:?} ({gender:?}, portrait {photo_index})");

    PresenceState::new(name, photo_url(gender, photo_index), color)
}
