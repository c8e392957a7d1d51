//! Numeric display mode for dashboard values.

use serde::{Deserialize, Serialize};

/// How register and memory values are rendered on opcode and failure pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Dec,
    Bin,
    Hex,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 3] = [DisplayMode::Dec, DisplayMode::Bin, DisplayMode::Hex];

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Dec => "dec",
            DisplayMode::Bin => "bin",
            DisplayMode::Hex => "hex",
        }
    }
}

impl std::str::FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DisplayMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("unknown display mode: {}", s))
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
