//! Local display preferences: background and highlight colour, and a
//! simulated backlight level rendered as a black overlay.

use crate::modules::store::{keys, KeyValueStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_BACKGROUND: &str = "#000000";
pub const DEFAULT_HIGHLIGHT: &str = "#3b82f6";
pub const DEFAULT_BACKLIGHT: u8 = 100;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid colour {0:?}, expected #rrggbb")]
    InvalidColor(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn parse(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Perceived luminance in 0..=1.
    pub fn luminance(self) -> f64 {
        (0.299 * f64::from(self.0) + 0.587 * f64::from(self.1) + 0.114 * f64::from(self.2)) / 255.0
    }
}

fn normalize_color(raw: &str) -> Result<String, SettingsError> {
    let trimmed = raw.trim();
    match Rgb::parse(trimmed) {
        Some(_) => Ok(trimmed.to_ascii_lowercase()),
        None => Err(SettingsError::InvalidColor(raw.to_string())),
    }
}

pub struct Settings {
    store: Arc<dyn KeyValueStore>,
    background: String,
    highlight: String,
    backlight: u8,
}

impl Settings {
    /// Reads stored values, falling back to defaults for anything missing or
    /// malformed. A stored backlight of 0 also reads as full brightness.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let color = |key: &str, default: &str| {
            store
                .get(key)
                .and_then(|v| normalize_color(&v).ok())
                .unwrap_or_else(|| default.to_string())
        };
        let background = color(keys::BACKGROUND_COLOR, DEFAULT_BACKGROUND);
        let highlight = color(keys::HIGHLIGHT_COLOR, DEFAULT_HIGHLIGHT);
        let backlight = store
            .get(keys::BACKLIGHT_LEVEL)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|&v| v != 0)
            .map(|v| v.clamp(0, 100) as u8)
            .unwrap_or(DEFAULT_BACKLIGHT);

        Self {
            store,
            background,
            highlight,
            backlight,
        }
    }

    pub fn background_color(&self) -> &str {
        &self.background
    }

    pub fn highlight_color(&self) -> &str {
        &self.highlight
    }

    pub fn backlight_level(&self) -> u8 {
        self.backlight
    }

    pub fn set_background_color(&mut self, hex: &str) -> Result<(), SettingsError> {
        let v = normalize_color(hex)?;
        self.store.set(keys::BACKGROUND_COLOR, &v)?;
        self.background = v;
        Ok(())
    }

    pub fn set_highlight_color(&mut self, hex: &str) -> Result<(), SettingsError> {
        let v = normalize_color(hex)?;
        self.store.set(keys::HIGHLIGHT_COLOR, &v)?;
        self.highlight = v;
        Ok(())
    }

    /// Clamped to 0..=100.
    pub fn set_backlight_level(&mut self, level: i64) -> Result<u8, SettingsError> {
        let v = level.clamp(0, 100) as u8;
        if i64::from(v) != level {
            warn!(requested = level, applied = v, "backlight level clamped");
        }
        self.store.set(keys::BACKLIGHT_LEVEL, &v.to_string())?;
        self.backlight = v;
        Ok(v)
    }

    pub fn is_dark(&self) -> bool {
        Rgb::parse(&self.background)
            .map(|c| c.luminance() < 0.5)
            .unwrap_or(true)
    }

    pub fn theme_class(&self) -> &'static str {
        if self.is_dark() {
            "dark"
        } else {
            "light"
        }
    }

    pub fn css_variables(&self) -> Vec<(&'static str, String)> {
        vec![
            ("--app-bg", self.background.clone()),
            ("--app-highlight", self.highlight.clone()),
        ]
    }

    /// Opacity of the black dimming overlay.
    pub fn overlay_opacity(&self) -> f64 {
        1.0 - f64::from(self.backlight) / 100.0
    }
}
