use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host the keyboard believes it is paired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerState {
    Unknown,
    Windows,
    Mac,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerState::Unknown => "Unknown",
            LayerState::Windows => "Windows",
            LayerState::Mac => "Mac",
        })
    }
}

/// Layer a host can ask the keyboard to switch to.
///
/// Kept apart from [`LayerState`] so that requesting `Unknown` cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLayer {
    Windows,
    Mac,
}

impl From<TargetLayer> for LayerState {
    fn from(layer: TargetLayer) -> Self {
        match layer {
            TargetLayer::Windows => LayerState::Windows,
            TargetLayer::Mac => LayerState::Mac,
        }
    }
}

impl fmt::Display for TargetLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LayerState::from(*self).fmt(f)
    }
}

impl FromStr for TargetLayer {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" | "win" => Ok(TargetLayer::Windows),
            "mac" | "macos" => Ok(TargetLayer::Mac),
            _ => Err(ParseStateError::Layer(s.to_string())),
        }
    }
}

/// Whether the keyboard's physical layer-switch key is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroKeyState {
    Enabled,
    Disabled,
}

impl MacroKeyState {
    pub fn is_disabled(self) -> bool {
        matches!(self, MacroKeyState::Disabled)
    }
}

impl fmt::Display for MacroKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MacroKeyState::Enabled => "enabled",
            MacroKeyState::Disabled => "disabled",
        })
    }
}

impl FromStr for MacroKeyState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enable" | "enabled" | "on" => Ok(MacroKeyState::Enabled),
            "disable" | "disabled" | "off" => Ok(MacroKeyState::Disabled),
            _ => Err(ParseStateError::MacroKey(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseStateError {
    #[error("unknown layer `{0}` (expected `windows` or `mac`)")]
    Layer(String),
    #[error("unknown macro key state `{0}` (expected `enable` or `disable`)")]
    MacroKey(String),
}
