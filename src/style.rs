//! Server-issued styles and color resolution.
//!
//! The style table is connection-scoped: the server numbers styles per
//! connection, so the table is cleared whenever the transport is replaced.

use std::collections::HashMap;

use bitflags::bitflags;
use rmpv::Value;

use crate::types::Rgb;

pub const DEFAULT_FG: Rgb = Rgb(255, 255, 255);
pub const DEFAULT_BG: Rgb = Rgb(0, 0, 0);

/// Standard xterm-256color ANSI palette.
const ANSI_COLORS: [Rgb; 16] = [
    Rgb(0, 0, 0),       // Black
    Rgb(205, 0, 0),     // Red
    Rgb(0, 205, 0),     // Green
    Rgb(205, 205, 0),   // Yellow
    Rgb(0, 0, 238),     // Blue
    Rgb(205, 0, 205),   // Magenta
    Rgb(0, 205, 205),   // Cyan
    Rgb(229, 229, 229), // White
    Rgb(127, 127, 127), // Bright Black
    Rgb(255, 0, 0),     // Bright Red
    Rgb(0, 255, 0),     // Bright Green
    Rgb(255, 255, 0),   // Bright Yellow
    Rgb(92, 92, 255),   // Bright Blue
    Rgb(255, 0, 255),   // Bright Magenta
    Rgb(0, 255, 255),   // Bright Cyan
    Rgb(255, 255, 255), // Bright White
];

const CUBE_STEPS: [u8; 6] = [0, 95, 135, 175, 215, 255];

bitflags! {
    /// Cell attribute bits handed to the paint surface.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u8 {
        const BOLD          = 0b0000_0001;
        const DIM           = 0b0000_0010;
        const ITALIC        = 0b0000_0100;
        const UNDERLINE     = 0b0000_1000;
        const BLINK         = 0b0001_0000;
        const REVERSE       = 0b0010_0000;
        const HIDDEN        = 0b0100_0000;
        const STRIKETHROUGH = 0b1000_0000;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    /// Packed 0xRRGGBB.
    Rgb(u32),
    Indexed(u8),
}

/// Map a 256-color palette index to RGB.
pub fn indexed_to_rgb(idx: u8) -> Rgb {
    match idx {
        0..=15 => ANSI_COLORS[idx as usize],
        16..=231 => {
            let n = (idx - 16) as usize;
            Rgb(CUBE_STEPS[n / 36], CUBE_STEPS[(n / 6) % 6], CUBE_STEPS[n % 6])
        }
        _ => {
            let v = 8 + (idx - 232) * 10;
            Rgb(v, v, v)
        }
    }
}

impl Color {
    pub fn resolve(self, default: Rgb) -> Rgb {
        match self {
            Color::Default => default,
            Color::Rgb(v) => Rgb::from_u32(v),
            Color::Indexed(i) => indexed_to_rgb(i),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

const FLAG_KEYS: [(&str, AttrFlags); 8] = [
    ("bold", AttrFlags::BOLD),
    ("dim", AttrFlags::DIM),
    ("italic", AttrFlags::ITALIC),
    ("underline", AttrFlags::UNDERLINE),
    ("blink", AttrFlags::BLINK),
    ("reverse", AttrFlags::REVERSE),
    ("hidden", AttrFlags::HIDDEN),
    ("strikethrough", AttrFlags::STRIKETHROUGH),
];

impl Attrs {
    /// Read an attribute map from the wire. Unknown keys and values of the
    /// wrong type are skipped; a non-map yields plain attributes.
    pub fn from_value(v: &Value) -> Attrs {
        let mut attrs = Attrs::default();
        let Value::Map(entries) = v else {
            if !v.is_nil() { log::debug!("style attrs not a map: {v}"); }
            return attrs;
        };
        for (k, val) in entries {
            let Some(key) = k.as_str() else { continue };
            match key {
                "fg" => if let Some(c) = val.as_u64() { attrs.fg = Color::Rgb(c as u32) },
                "bg" => if let Some(c) = val.as_u64() { attrs.bg = Color::Rgb(c as u32) },
                "fg_index" => if let Some(i) = val.as_u64().and_then(|i| u8::try_from(i).ok()) { attrs.fg = Color::Indexed(i) },
                "bg_index" => if let Some(i) = val.as_u64().and_then(|i| u8::try_from(i).ok()) { attrs.bg = Color::Indexed(i) },
                _ => {
                    if let Some((_, flag)) = FLAG_KEYS.iter().find(|(name, _)| *name == key) {
                        attrs.flags.set(*flag, val.as_bool().unwrap_or(false));
                    }
                }
            }
        }
        attrs
    }

    /// Concrete colors for painting. `reverse` swaps them last and is then
    /// consumed, so it never reaches the surface as a flag.
    pub fn resolve(&self) -> ResolvedStyle {
        let mut fg = self.fg.resolve(DEFAULT_FG);
        let mut bg = self.bg.resolve(DEFAULT_BG);
        let mut flags = self.flags;
        if flags.contains(AttrFlags::REVERSE) {
            std::mem::swap(&mut fg, &mut bg);
            flags.remove(AttrFlags::REVERSE);
        }
        ResolvedStyle { fg, bg, flags }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedStyle {
    pub fg: Rgb,
    pub bg: Rgb,
    pub flags: AttrFlags,
}

impl Default for ResolvedStyle {
    fn default() -> Self {
        ResolvedStyle { fg: DEFAULT_FG, bg: DEFAULT_BG, flags: AttrFlags::empty() }
    }
}

impl ResolvedStyle {
    pub fn inverted(self) -> Self {
        ResolvedStyle { fg: self.bg, bg: self.fg, flags: self.flags }
    }
}

#[derive(Debug, Default)]
pub struct StyleTable {
    styles: HashMap<u64, Attrs>,
}

impl StyleTable {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, id: u64, attrs: Attrs) {
        self.styles.insert(id, attrs);
    }

    pub fn get(&self, id: u64) -> Option<&Attrs> { self.styles.get(&id) }

    /// Unknown or absent ids paint with the default colors and no attributes.
    pub fn resolve(&self, id: Option<u64>) -> ResolvedStyle {
        match id.and_then(|i| self.styles.get(&i)) {
            Some(a) => a.resolve(),
            None => ResolvedStyle::default(),
        }
    }

    pub fn clear(&mut self) { self.styles.clear(); }
    pub fn len(&self) -> usize { self.styles.len() }
    pub fn is_empty(&self) -> bool { self.styles.is_empty() }
}
