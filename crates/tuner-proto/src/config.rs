use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

/// Daemon configuration (`config.toml`).  User-editable radio settings live
/// in the separate settings JSON owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_packs_file")]
    pub packs_file: PathBuf,
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    /// Capacity of the intent queue; producers wait when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for resolve + spawn of one station.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// How long a resolved stream URL is reused.
    #[serde(default = "default_resolve_ttl_secs")]
    pub resolve_ttl_secs: u64,
    /// Background re-resolution period for the active pack.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Buffering longer than this is reported as an error.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_sounds_dir")]
    pub sounds_dir: PathBuf,
    #[serde(default = "default_effect_max_secs")]
    pub effect_max_secs: f32,
    /// Fade-out of the tuning static once the new stream is audible.
    #[serde(default = "default_effect_fade_ms")]
    pub effect_fade_ms: u64,
    /// ALSA simple-mixer control driven by `amixer`.
    #[serde(default = "default_mixer_control")]
    pub mixer_control: String,
    #[serde(default = "default_loudnorm_filter")]
    pub loudnorm_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_input_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Valid quadrature transitions that make up one detent.
    #[serde(default = "default_steps_per_detent")]
    pub steps_per_detent: u8,
    #[serde(default = "default_button_debounce_ms")]
    pub button_debounce_ms: u64,
    /// Minimum gap between two station detents; 0 disables it.
    #[serde(default = "default_station_cooldown_ms")]
    pub station_cooldown_ms: u64,
    #[serde(default = "default_volume_step")]
    pub volume_step: i64,
    #[serde(default)]
    pub station: EncoderPins,
    #[serde(default = "default_volume_pins")]
    pub volume: EncoderPins,
}

/// BCM pin numbers for one rotary encoder with push button.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderPins {
    pub clk: u32,
    pub dt: u32,
    pub sw: u32,
}

impl Default for EncoderPins {
    fn default() -> Self {
        Self {
            clk: 17,
            dt: 27,
            sw: 22,
        }
    }
}

fn default_volume_pins() -> EncoderPins {
    EncoderPins {
        clk: 16,
        dt: 26,
        sw: 20,
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            packs_file: default_packs_file(),
            settings_file: default_settings_file(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: default_launch_timeout_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            resolve_ttl_secs: default_resolve_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            sounds_dir: default_sounds_dir(),
            effect_max_secs: default_effect_max_secs(),
            effect_fade_ms: default_effect_fade_ms(),
            mixer_control: default_mixer_control(),
            loudnorm_filter: default_loudnorm_filter(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: default_input_enabled(),
            poll_interval_us: default_poll_interval_us(),
            steps_per_detent: default_steps_per_detent(),
            button_debounce_ms: default_button_debounce_ms(),
            station_cooldown_ms: default_station_cooldown_ms(),
            volume_step: default_volume_step(),
            station: EncoderPins::default(),
            volume: default_volume_pins(),
        }
    }
}

impl EngineConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn resolve_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Non-finite or negative values fall back to the default.
    pub fn effect_max(&self) -> Duration {
        Duration::try_from_secs_f32(self.effect_max_secs)
            .unwrap_or_else(|_| Duration::from_secs_f32(default_effect_max_secs()))
    }

    pub fn effect_fade(&self) -> Duration {
        Duration::from_millis(self.effect_fade_ms)
    }
}

fn default_packs_file() -> PathBuf {
    platform::data_dir().join("packs.json")
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_queue_capacity() -> usize {
    256
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_launch_timeout_secs() -> u64 {
    20
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_resolve_timeout_secs() -> u64 {
    15
}

fn default_resolve_ttl_secs() -> u64 {
    30 * 60
}

fn default_refresh_interval_secs() -> u64 {
    20 * 60
}

fn default_stall_timeout_secs() -> u64 {
    15
}

fn default_sounds_dir() -> PathBuf {
    platform::data_dir().join("sounds")
}

fn default_effect_max_secs() -> f32 {
    1.5
}

fn default_effect_fade_ms() -> u64 {
    800
}

fn default_mixer_control() -> String {
    "Master".to_string()
}

fn default_loudnorm_filter() -> String {
    "loudnorm=I=-16:TP=-1.5:LRA=11".to_string()
}

fn default_input_enabled() -> bool {
    true
}

fn default_poll_interval_us() -> u64 {
    1000
}

fn default_steps_per_detent() -> u8 {
    4
}

fn default_button_debounce_ms() -> u64 {
    50
}

fn default_station_cooldown_ms() -> u64 {
    750
}

fn default_volume_step() -> i64 {
    1
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
