use std::path::PathBuf;
use tracing::{debug, info};

use tuner_proto::error::{RadioError, Result};

/// Where the master volume lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mixer {
    /// ALSA simple mixer control driven through `amixer`; mpv runs at 100%.
    Alsa { amixer: PathBuf, control: String },
    /// No device mixer; volume is mpv's own software volume.
    Software,
}

impl Mixer {
    pub fn detect(amixer: Option<PathBuf>, control: &str) -> Self {
        match amixer {
            Some(amixer) if !control.trim().is_empty() => {
                info!("mixer: using ALSA control {:?} via {}", control, amixer.display());
                Mixer::Alsa {
                    amixer,
                    control: control.to_string(),
                }
            }
            _ => {
                info!("mixer: no device mixer, using mpv software volume");
                Mixer::Software
            }
        }
    }

    /// Volume mpv itself should run at for a given main volume.
    pub fn stream_volume(&self, main: u8) -> u8 {
        match self {
            Mixer::Alsa { .. } => 100,
            Mixer::Software => main,
        }
    }

    /// Volume for the tuning static: `static_percent`% of the main volume.
    pub fn effect_volume(&self, main: u8, static_percent: u8) -> u8 {
        let pct = static_percent.min(100) as u32;
        match self {
            Mixer::Alsa { .. } => pct as u8,
            Mixer::Software => (main as u32 * pct / 100) as u8,
        }
    }

    /// Push the main volume to the device.  A no-op in software mode; the
    /// engine forwards it to the running mpv processes instead.
    pub async fn apply(&self, level: u8) -> Result<()> {
        let Mixer::Alsa { amixer, control } = self else {
            return Ok(());
        };
        let output = tokio::process::Command::new(amixer)
            .args(amixer_args(control, level))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| RadioError::Device(format!("amixer: {}", e)))?;
        if !output.status.success() {
            return Err(RadioError::Device(format!(
                "amixer sset {} failed: {}",
                control,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("mixer: {} -> {}%", control, level);
        Ok(())
    }
}

fn amixer_args(control: &str, level: u8) -> Vec<String> {
    vec![
        "-q".to_string(),
        "sset".to_string(),
        control.to_string(),
        format!("{}%", level.min(100)),
    ]
}
