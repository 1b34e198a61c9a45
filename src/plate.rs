use anyhow::{anyhow, Result};
use regex::Regex;

/// Two to sixteen letters or digits, with single inner spaces or dashes.
pub const DEFAULT_PLATE_PATTERN: &str = r"^[\p{L}\p{N}](?:[ -]?[\p{L}\p{N}]){1,15}$";

/// Values cameras report when no plate was read.
const PLACEHOLDER_PLATES: &[&str] = &["unknown", "noplate", "no plate", "none", "null", "无车牌"];

/// Format policy deciding which plate strings are eligible for dedup and delivery.
#[derive(Clone, Debug)]
pub struct PlatePolicy {
    pattern: Regex,
}

impl PlatePolicy {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern =
            Regex::new(pattern).map_err(|e| anyhow!("invalid plate pattern {:?}: {}", pattern, e))?;
        Ok(Self { pattern })
    }

    pub fn is_valid(&self, plate: &str) -> bool {
        if plate != plate.trim() {
            return false;
        }
        let lowered = plate.to_lowercase();
        if PLACEHOLDER_PLATES.contains(&lowered.as_str()) {
            return false;
        }
        self.pattern.is_match(plate)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl Default for PlatePolicy {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_PLATE_PATTERN).unwrap(),
        }
    }
}
