//! Tuning static between stations.
//!
//! One mpv loops the static sound for the whole daemon lifetime, muted.
//! Tuning raises it to the effect volume; it fades back to silence once the
//! new stream is audible or after a fixed maximum.  Every trigger/fade bumps
//! an epoch so a stale fade never mutes a newer trigger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mpv::{MpvHandle, MpvProcess};

const FADE_STEPS: u32 = 10;
const SOUND_STEMS: &[&str] = &["tuning", "static"];
const SOUND_EXTS: &[&str] = &["mp3", "ogg", "wav", "flac", "opus"];

#[derive(Clone)]
pub struct TuningEffect {
    inner: Arc<Inner>,
}

struct Inner {
    binary: Option<PathBuf>,
    sound: Option<PathBuf>,
    socket_path: PathBuf,
    max_audible: Duration,
    fade: Duration,
    epoch: AtomicU64,
    level: AtomicU8,
    process: Mutex<Option<(Child, MpvHandle)>>,
}

impl TuningEffect {
    pub fn new(
        binary: Option<PathBuf>,
        sounds_dir: &Path,
        socket_path: PathBuf,
        max_audible: Duration,
        fade: Duration,
    ) -> Self {
        let sound = find_tuning_sound(sounds_dir);
        match &sound {
            Some(p) => info!("effect: tuning sound {}", p.display()),
            None => warn!("effect: no tuning sound in {}", sounds_dir.display()),
        }
        Self {
            inner: Arc::new(Inner {
                binary,
                sound,
                socket_path,
                max_audible,
                fade,
                epoch: AtomicU64::new(0),
                level: AtomicU8::new(0),
                process: Mutex::new(None),
            }),
        }
    }

    /// Start the muted static loop ahead of the first tune.
    pub async fn prepare(&self) {
        let _ = self.inner.running_handle().await;
    }

    /// Make the static audible at `volume`; returns immediately.
    pub fn trigger(&self, volume: u8) {
        if self.inner.sound.is_none() {
            return;
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.set_level(volume).await;
            tokio::time::sleep(inner.max_audible).await;
            inner.fade_out(epoch).await;
        });
    }

    /// Fade the static to silence (the new stream started playing).
    pub fn fade_out(&self) {
        if self.inner.level.load(Ordering::SeqCst) == 0 {
            return;
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.fade_out(epoch).await });
    }

    pub async fn shutdown(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some((mut child, handle)) = self.inner.process.lock().await.take() {
            let quit = async {
                handle.quit().await;
                child.wait().await
            };
            if tokio::time::timeout(Duration::from_secs(1), quit).await.is_err() {
                let _ = child.kill().await;
            }
        }
        let _ = tokio::fs::remove_file(&self.inner.socket_path).await;
    }
}

impl Inner {
    async fn running_handle(&self) -> Option<MpvHandle> {
        let sound = self.sound.as_ref()?;
        let binary = self.binary.as_ref()?;
        let mut process = self.process.lock().await;

        if let Some((child, handle)) = process.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Some(handle.clone());
            }
            warn!("effect: static process exited, restarting");
        }

        let args = vec![
            "--no-video".to_string(),
            "--no-terminal".to_string(),
            "--volume=0".to_string(),
            "--loop=inf".to_string(),
            sound.display().to_string(),
        ];
        match MpvProcess::spawn(binary, self.socket_path.clone(), &args).await {
            Ok(proc) => {
                // Events are not needed; dropping the receiver lets the reader
                // task discard them.
                let MpvProcess { child, handle, .. } = proc;
                *process = Some((child, handle.clone()));
                self.level.store(0, Ordering::SeqCst);
                debug!("effect: static loop running (muted)");
                Some(handle)
            }
            Err(e) => {
                warn!("effect: could not start static loop: {}", e);
                *process = None;
                None
            }
        }
    }

    async fn set_level(&self, volume: u8) {
        let Some(handle) = self.running_handle().await else {
            return;
        };
        match handle.set_volume(volume).await {
            Ok(()) => self.level.store(volume, Ordering::SeqCst),
            Err(e) => debug!("effect: set volume failed: {}", e),
        }
    }

    async fn fade_out(&self, epoch: u64) {
        let start = self.level.load(Ordering::SeqCst) as u32;
        if start == 0 {
            return;
        }
        let step = self.fade / FADE_STEPS;
        for i in 1..=FADE_STEPS {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let level = (start * (FADE_STEPS - i) / FADE_STEPS) as u8;
            self.set_level(level).await;
            if i < FADE_STEPS {
                tokio::time::sleep(step).await;
            }
        }
    }
}

fn find_tuning_sound(dir: &Path) -> Option<PathBuf> {
    SOUND_STEMS.iter().find_map(|stem| {
        SOUND_EXTS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", stem, ext)))
            .find(|p| p.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_tuning_sound_prefers_tuning_stem() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_tuning_sound(dir.path()).is_none());

        std::fs::write(dir.path().join("static.wav"), b"").unwrap();
        assert_eq!(
            find_tuning_sound(dir.path()).unwrap().file_name().unwrap(),
            "static.wav"
        );

        std::fs::write(dir.path().join("tuning.ogg"), b"").unwrap();
        assert_eq!(
            find_tuning_sound(dir.path()).unwrap().file_name().unwrap(),
            "tuning.ogg"
        );
    }

    #[tokio::test]
    async fn test_trigger_without_sound_is_silent_noop() {
        let dir = tempfile::tempdir().unwrap();
        let effect = TuningEffect::new(
            None,
            dir.path(),
            dir.path().join("static.sock"),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        effect.trigger(50);
        effect.fade_out();
        effect.prepare().await;
        assert_eq!(effect.inner.epoch.load(Ordering::SeqCst), 0);
        effect.shutdown().await;
    }
}
