//! Controller settings, loaded from a toml file

use crate::command::{CommandEncoder, FrameFormat, Scaling, DEFAULT_DEADZONE};
use crate::types::{MotorCommand, PeerAddress};
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Car to connect to
    pub peer: Option<PeerAddress>,
    /// Binary frames for the car, text frames for a serial terminal
    pub format: FrameFormat,
    /// Fraction of the surface height treated as finger shake
    pub deadzone: f32,
    pub scaling: Scaling,
    pub surface: SurfaceConfig,
}

/// Size of the touch surface in pixels
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            peer: None,
            format: FrameFormat::default(),
            deadzone: DEFAULT_DEADZONE,
            scaling: Scaling::default(),
            surface: SurfaceConfig::default(),
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Read config {}", path.display()))?;

        Self::parse(&text).with_context(|| format!("Load config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("Parse config")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (0.0..1.0).contains(&self.deadzone),
            "Deadzone must be within 0..1, got {}",
            self.deadzone
        );
        ensure!(
            self.surface.width > 0 && self.surface.height > 0,
            "Touch surface must not be empty, got {}x{}",
            self.surface.width,
            self.surface.height
        );
        if let Scaling::Floored { min } = self.scaling {
            ensure!(
                i16::from(min) < i16::from(MotorCommand::MAX_SPEED),
                "Minimum speed must be below {}, got {min}",
                MotorCommand::MAX_SPEED
            );
        }

        Ok(())
    }

    pub fn encoder(&self) -> CommandEncoder {
        CommandEncoder::new(self.scaling)
            .with_deadzone(self.deadzone)
            .with_format(self.format)
    }
}
