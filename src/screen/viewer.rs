//! Terminal presentation: the latest-frame slot the receive loop writes into,
//! and the choice of graphics protocol used to draw it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use image::{DynamicImage, GrayImage, RgbImage};
use ratatui_image::picker::{Picker, ProtocolType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::DisplaySink;
use crate::codec::{Frame, PixelFormat};

/// Holds the most recent frame until the UI thread picks it up.
///
/// Frames that arrive faster than the terminal redraws simply overwrite each other.
#[derive(Default)]
pub struct TerminalDisplay {
    latest: Mutex<Option<Frame>>,
    presented: AtomicU64,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the newest frame, if one arrived since the last call.
    pub fn take_latest(&self) -> Option<Frame> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Number of frames handed to this display so far.
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }
}

impl DisplaySink for TerminalDisplay {
    fn present(&self, frame: Frame) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        self.presented.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn to_dynamic_image(frame: Frame) -> Option<DynamicImage> {
    match frame.format {
        PixelFormat::Rgb => {
            RgbImage::from_raw(frame.width, frame.height, frame.pixels).map(DynamicImage::ImageRgb8)
        }
        PixelFormat::Gray => {
            GrayImage::from_raw(frame.width, frame.height, frame.pixels).map(DynamicImage::ImageLuma8)
        }
    }
}

/// How frames are drawn in the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsProtocol {
    /// Ask the terminal, then fall back to environment hints.
    #[default]
    Auto,
    Sixel,
    Kitty,
    Iterm2,
    /// Unicode half blocks; works anywhere with 24-bit colour.
    Halfblocks,
}

/// `(variable, lowercase substring, protocol)`. An empty substring matches any
/// non-empty value. First hit wins.
const ENV_HINTS: &[(&str, &str, GraphicsProtocol)] = &[
    ("TERM_PROGRAM", "wezterm", GraphicsProtocol::Sixel),
    ("TERM_PROGRAM", "iterm", GraphicsProtocol::Iterm2),
    ("TERM", "kitty", GraphicsProtocol::Kitty),
    ("TERM_PROGRAM", "kitty", GraphicsProtocol::Kitty),
    ("TERM_PROGRAM", "ghostty", GraphicsProtocol::Kitty),
    ("WT_SESSION", "", GraphicsProtocol::Sixel),
];

impl GraphicsProtocol {
    fn protocol_type(self) -> Option<ProtocolType> {
        match self {
            GraphicsProtocol::Auto => None,
            GraphicsProtocol::Sixel => Some(ProtocolType::Sixel),
            GraphicsProtocol::Kitty => Some(ProtocolType::Kitty),
            GraphicsProtocol::Iterm2 => Some(ProtocolType::Iterm2),
            GraphicsProtocol::Halfblocks => Some(ProtocolType::Halfblocks),
        }
    }

    /// Guess from the variables terminals export, given a lookup such as `std::env::var`.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        ENV_HINTS
            .iter()
            .find(|(var, needle, _)| {
                lookup(var).is_some_and(|value| {
                    let value = value.to_lowercase();
                    !value.is_empty() && value.contains(needle)
                })
            })
            .map_or(GraphicsProtocol::Halfblocks, |&(_, _, protocol)| protocol)
    }

    /// Build the image picker for this choice.
    ///
    /// `Auto` queries the terminal over stdio, so call this before raw mode
    /// and the alternate screen are entered.
    pub fn picker(self) -> Picker {
        let chosen = match self {
            GraphicsProtocol::Auto => match Picker::from_query_stdio() {
                Ok(picker) => {
                    info!("graphics: terminal reports {:?}", picker.protocol_type());
                    return picker;
                }
                Err(e) => {
                    debug!("terminal query failed ({e}); guessing from environment");
                    Self::from_env(|var| std::env::var(var).ok())
                }
            },
            forced => forced,
        };

        let mut picker = Picker::halfblocks();
        if let Some(protocol) = chosen.protocol_type() {
            picker.set_protocol_type(protocol);
        }
        info!("graphics: {chosen}");
        picker
    }
}

impl fmt::Display for GraphicsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GraphicsProtocol::Auto => "auto",
            GraphicsProtocol::Sixel => "sixel",
            GraphicsProtocol::Kitty => "kitty",
            GraphicsProtocol::Iterm2 => "iterm2",
            GraphicsProtocol::Halfblocks => "halfblocks",
        })
    }
}

impl FromStr for GraphicsProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(GraphicsProtocol::Auto),
            "sixel" => Ok(GraphicsProtocol::Sixel),
            "kitty" => Ok(GraphicsProtocol::Kitty),
            "iterm2" | "iterm" => Ok(GraphicsProtocol::Iterm2),
            "halfblocks" | "half" | "text" => Ok(GraphicsProtocol::Halfblocks),
            other => Err(format!(
                "unknown graphics protocol '{other}' (expected auto, sixel, kitty, iterm2 or halfblocks)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_frame_replaces_older_one() {
        let display = TerminalDisplay::new();
        display.present(Frame::filled(2, 2, [1, 2, 3]));
        display.present(Frame::filled(4, 4, [9, 9, 9]));

        let frame = display.take_latest().unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert!(display.take_latest().is_none());
        assert_eq!(display.presented(), 2);
    }

    #[test]
    fn frames_convert_to_images() {
        let image = to_dynamic_image(Frame::filled(3, 2, [5, 6, 7])).unwrap();
        assert_eq!((image.width(), image.height()), (3, 2));
    }

    fn env(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string())
    }

    #[test]
    fn environment_hints_pick_a_protocol() {
        assert_eq!(GraphicsProtocol::from_env(env(&[("TERM_PROGRAM", "WezTerm")])), GraphicsProtocol::Sixel);
        assert_eq!(GraphicsProtocol::from_env(env(&[("TERM", "xterm-kitty")])), GraphicsProtocol::Kitty);
        assert_eq!(GraphicsProtocol::from_env(env(&[("TERM_PROGRAM", "ghostty")])), GraphicsProtocol::Kitty);
        assert_eq!(GraphicsProtocol::from_env(env(&[("WT_SESSION", "abc")])), GraphicsProtocol::Sixel);
        assert_eq!(GraphicsProtocol::from_env(env(&[("WT_SESSION", "")])), GraphicsProtocol::Halfblocks);
        assert_eq!(GraphicsProtocol::from_env(env(&[])), GraphicsProtocol::Halfblocks);
    }

    #[test]
    fn protocol_names_parse_and_print() {
        assert_eq!("ITerm".parse::<GraphicsProtocol>(), Ok(GraphicsProtocol::Iterm2));
        assert_eq!("half".parse::<GraphicsProtocol>(), Ok(GraphicsProtocol::Halfblocks));
        assert!("vga".parse::<GraphicsProtocol>().is_err());
        assert_eq!(GraphicsProtocol::Kitty.to_string(), "kitty");
        assert_eq!(GraphicsProtocol::Auto.protocol_type(), None);
    }
}
