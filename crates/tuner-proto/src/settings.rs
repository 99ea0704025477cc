use serde::{Deserialize, Serialize};

/// User-facing radio settings, persisted as JSON next to the packs file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    /// Hard ceiling for volume, for speaker protection (1..=100).
    #[serde(default = "default_max_volume")]
    pub max_volume: u8,
    /// Tuning-static loudness as a percentage of the main volume.
    #[serde(default = "default_static_volume")]
    pub static_volume: u8,
    #[serde(default = "default_true")]
    pub wrap_stations: bool,
    #[serde(default)]
    pub loudness_normalization: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            max_volume: default_max_volume(),
            static_volume: default_static_volume(),
            wrap_stations: true,
            loudness_normalization: false,
            auto_start: true,
        }
    }
}

fn default_volume() -> u8 {
    40
}

fn default_max_volume() -> u8 {
    100
}

fn default_static_volume() -> u8 {
    60
}

fn default_true() -> bool {
    true
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub default_volume: Option<i64>,
    #[serde(default)]
    pub max_volume: Option<i64>,
    #[serde(default)]
    pub static_volume: Option<i64>,
    #[serde(default)]
    pub wrap_stations: Option<bool>,
    #[serde(default)]
    pub loudness_normalization: Option<bool>,
    #[serde(default)]
    pub auto_start: Option<bool>,
}

impl Settings {
    /// Bring every field back inside its range.  Used after loading a
    /// hand-edited file and after every patch.
    pub fn normalized(mut self) -> Self {
        self.max_volume = self.max_volume.clamp(1, 100);
        self.static_volume = self.static_volume.min(100);
        self.default_volume = self.default_volume.min(self.max_volume);
        self
    }

    /// Apply a patch, clamping out-of-range values instead of failing.
    pub fn patched(&self, patch: &SettingsPatch) -> Self {
        let mut next = self.clone();
        if let Some(v) = patch.max_volume {
            next.max_volume = v.clamp(1, 100) as u8;
        }
        if let Some(v) = patch.default_volume {
            next.default_volume = v.clamp(0, 100) as u8;
        }
        if let Some(v) = patch.static_volume {
            next.static_volume = v.clamp(0, 100) as u8;
        }
        if let Some(v) = patch.wrap_stations {
            next.wrap_stations = v;
        }
        if let Some(v) = patch.loudness_normalization {
            next.loudness_normalization = v;
        }
        if let Some(v) = patch.auto_start {
            next.auto_start = v;
        }
        next.normalized()
    }

    /// Clamp a requested volume into `0..=max_volume`.
    pub fn clamp_volume(&self, requested: i64) -> u8 {
        requested.clamp(0, self.max_volume as i64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.default_volume, 40);
        assert_eq!(s.max_volume, 100);
        assert_eq!(s.static_volume, 60);
        assert!(s.wrap_stations);
        assert!(!s.loudness_normalization);
        assert!(s.auto_start);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let s: Settings = serde_json::from_str(r#"{"max_volume": 70}"#).unwrap();
        assert_eq!(s.max_volume, 70);
        assert_eq!(s.default_volume, 40);
        assert!(s.auto_start);
    }

    #[test]
    fn test_patch_clamps() {
        let s = Settings::default().patched(&SettingsPatch {
            max_volume: Some(250),
            static_volume: Some(-5),
            ..Default::default()
        });
        assert_eq!(s.max_volume, 100);
        assert_eq!(s.static_volume, 0);

        let s = Settings::default().patched(&SettingsPatch {
            max_volume: Some(0),
            ..Default::default()
        });
        assert_eq!(s.max_volume, 1);
        assert_eq!(s.default_volume, 1);
    }

    #[test]
    fn test_clamp_volume() {
        let s = Settings {
            max_volume: 80,
            ..Default::default()
        };
        assert_eq!(s.clamp_volume(120), 80);
        assert_eq!(s.clamp_volume(-3), 0);
        assert_eq!(s.clamp_volume(55), 55);
    }
}
