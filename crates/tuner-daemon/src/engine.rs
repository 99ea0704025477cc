//! StreamEngine: at most one station stream at a time, plus the tuning
//! static on its own channel.
//!
//! `play` returns once mpv is launched and its IPC socket is up; whether the
//! stream is actually audible arrives later as a `HealthReport` tagged with
//! the request's generation.  A monitor task per stream owns the mpv child
//! and is the only thing that reports health for it.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tuner_proto::catalog::{SourceKind, Station};
use tuner_proto::config::EngineConfig;
use tuner_proto::error::{RadioError, Result};
use tuner_proto::platform;
use tuner_proto::protocol::{HealthReport, StreamStatus};

use crate::effect::TuningEffect;
use crate::mixer::Mixer;
use crate::mpv::{self, MpvHandle, MpvProcess, OBS_CORE_IDLE, OBS_EOF_REACHED, OBS_PAUSED_FOR_CACHE};
use crate::resolver::{ResolveCache, SourceResolver};

/// Virtual timelines start somewhere in the last 24 hours.
const MAX_VIRTUAL_OFFSET_SECS: f64 = 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone)]
pub struct PlayRequest {
    /// Identifies this attempt in later health reports.
    pub generation: u64,
    pub station: Station,
    pub normalize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    pub generation: u64,
    pub stream_url: String,
    pub start_secs: Option<u64>,
}

#[async_trait]
pub trait StreamEngine: Send + Sync + 'static {
    async fn play(&self, request: PlayRequest) -> Result<StreamHandle>;

    /// Stop the current stream, if any.  Returns only after the output
    /// process is gone.
    async fn stop(&self);

    /// Fire-and-forget tuning static at `static_percent`% of main volume.
    async fn play_effect(&self, static_percent: u8);

    async fn set_volume(&self, level: u8) -> Result<()>;

    fn health(&self) -> StreamStatus;
}

/// Per-URL random "broadcast start" so on-demand media behaves like a
/// station that has been playing all along.
#[derive(Default)]
pub struct VirtualTimeline {
    starts: std::sync::Mutex<HashMap<String, SystemTime>>,
}

impl VirtualTimeline {
    /// Seconds into a `duration`-long item at which playback should start.
    pub fn position(&self, url: &str, duration: f64) -> f64 {
        if duration <= 0.0 {
            return 0.0;
        }
        let start = {
            let mut starts = match self.starts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *starts.entry(url.to_string()).or_insert_with(|| {
                let offset = rand::thread_rng().gen_range(0.0..MAX_VIRTUAL_OFFSET_SECS);
                SystemTime::now()
                    .checked_sub(Duration::from_secs_f64(offset))
                    .unwrap_or_else(SystemTime::now)
            })
        };
        let elapsed = SystemTime::now()
            .duration_since(start)
            .unwrap_or_default()
            .as_secs_f64();
        elapsed % duration
    }
}

struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    handle: MpvHandle,
}

pub struct MpvEngine<R> {
    config: EngineConfig,
    mpv_binary: Option<PathBuf>,
    cache: Arc<ResolveCache<R>>,
    timeline: VirtualTimeline,
    mixer: Mixer,
    effect: TuningEffect,
    health_tx: mpsc::Sender<HealthReport>,
    status: watch::Sender<StreamStatus>,
    volume: AtomicU8,
    current: Mutex<Option<ActiveStream>>,
}

impl<R: SourceResolver> MpvEngine<R> {
    pub fn new(
        config: EngineConfig,
        cache: Arc<ResolveCache<R>>,
        mixer: Mixer,
        health_tx: mpsc::Sender<HealthReport>,
    ) -> Self {
        let mpv_binary = platform::find_mpv_binary();
        match &mpv_binary {
            Some(p) => info!("engine: using mpv at {}", p.display()),
            None => warn!("engine: mpv binary not found, playback will fail"),
        }
        let effect = TuningEffect::new(
            mpv_binary.clone(),
            &config.sounds_dir,
            platform::mpv_socket_path("static"),
            config.effect_max(),
            config.effect_fade(),
        );
        let (status, _) = watch::channel(StreamStatus::Stopped);
        Self {
            config,
            mpv_binary,
            cache,
            timeline: VirtualTimeline::default(),
            mixer,
            effect,
            health_tx,
            status,
            volume: AtomicU8::new(0),
            current: Mutex::new(None),
        }
    }

    /// Clear sockets left by an earlier run and start the static loop.
    pub async fn start(&self) {
        let socket_dir = platform::mpv_socket_dir();
        if let Err(e) = tokio::fs::create_dir_all(&socket_dir).await {
            warn!("engine: cannot create {}: {}", socket_dir.display(), e);
        }
        mpv::cleanup_orphans(platform::stale_mpv_sockets()).await;
        self.effect.prepare().await;
    }

    pub async fn shutdown(&self) {
        self.stop().await;
        self.effect.shutdown().await;
    }

    fn start_offset(&self, station: &Station, duration: Option<f64>) -> Option<u64> {
        if station.source_kind != SourceKind::Video {
            return None;
        }
        let duration = duration?;
        Some(self.timeline.position(&station.url, duration) as u64)
    }
}

/// mpv command line for one station stream (IPC socket argument excluded).
pub fn stream_args(
    stream_url: &str,
    kind: SourceKind,
    start_secs: Option<u64>,
    volume: u8,
    loudnorm: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "--no-video".to_string(),
        "--no-terminal".to_string(),
        format!("--volume={}", volume.min(100)),
    ];
    if kind == SourceKind::Video {
        args.push("--loop-file=inf".to_string());
    }
    if let Some(start) = start_secs.filter(|s| *s > 0) {
        args.push(format!("--start={}", start));
    }
    if let Some(filter) = loudnorm {
        args.push(format!("--af=lavfi=[{}]", filter));
    }
    args.push(stream_url.to_string());
    args
}

#[async_trait]
impl<R: SourceResolver> StreamEngine for MpvEngine<R> {
    async fn play(&self, request: PlayRequest) -> Result<StreamHandle> {
        self.stop().await;

        let station = &request.station;
        let source = self
            .cache
            .get_or_resolve(&station.url, station.source_kind)
            .await?;
        let start_secs = self.start_offset(station, source.duration);

        let binary = self
            .mpv_binary
            .as_ref()
            .ok_or_else(|| RadioError::Launch("mpv binary not found".into()))?;
        let volume = self.mixer.stream_volume(self.volume.load(Ordering::SeqCst));
        let loudnorm = request
            .normalize
            .then_some(self.config.loudnorm_filter.as_str());
        let args = stream_args(
            &source.stream_url,
            station.source_kind,
            start_secs,
            volume,
            loudnorm,
        );

        let socket = platform::mpv_socket_path(&format!("stream-{}", request.generation));
        let process = MpvProcess::spawn(binary, socket, &args).await?;
        process.handle.observe_playback().await;

        info!(
            "engine: playing {:?} (gen {}) start={:?}",
            station.name, request.generation, start_secs
        );

        let cancel = CancellationToken::new();
        let handle = process.handle.clone();
        let monitor = tokio::spawn(monitor_stream(
            process,
            MonitorContext {
                generation: request.generation,
                cancel: cancel.clone(),
                health_tx: self.health_tx.clone(),
                status: self.status.clone(),
                effect: self.effect.clone(),
                stall_timeout: self.config.stall_timeout(),
                stop_grace: self.config.stop_timeout(),
            },
        ));

        self.status.send_replace(StreamStatus::Buffering);
        *self.current.lock().await = Some(ActiveStream {
            generation: request.generation,
            cancel,
            monitor,
            handle,
        });

        Ok(StreamHandle {
            generation: request.generation,
            stream_url: source.stream_url,
            start_secs,
        })
    }

    async fn stop(&self) {
        let active = self.current.lock().await.take();
        if let Some(active) = active {
            debug!("engine: stopping gen {}", active.generation);
            active.cancel.cancel();
            // The monitor quits mpv, waits `stop_timeout`, then kills it.
            let bound = self.config.stop_timeout() + Duration::from_secs(1);
            let mut monitor = active.monitor;
            if tokio::time::timeout(bound, &mut monitor).await.is_err() {
                warn!("engine: stream monitor did not finish, aborting");
                monitor.abort();
                // Dropping the aborted task drops the child, which kills it.
                let _ = monitor.await;
            }
        }
        self.status.send_replace(StreamStatus::Stopped);
    }

    async fn play_effect(&self, static_percent: u8) {
        let main = self.volume.load(Ordering::SeqCst);
        self.effect
            .trigger(self.mixer.effect_volume(main, static_percent));
    }

    async fn set_volume(&self, level: u8) -> Result<()> {
        self.volume.store(level, Ordering::SeqCst);
        self.mixer.apply(level).await?;
        if self.mixer == Mixer::Software {
            let handle = self.current.lock().await.as_ref().map(|a| a.handle.clone());
            if let Some(handle) = handle {
                if let Err(e) = handle.set_volume(level).await {
                    debug!("engine: could not push volume to mpv: {}", e);
                }
            }
        }
        Ok(())
    }

    fn health(&self) -> StreamStatus {
        *self.status.borrow()
    }
}

struct MonitorContext {
    generation: u64,
    cancel: CancellationToken,
    health_tx: mpsc::Sender<HealthReport>,
    status: watch::Sender<StreamStatus>,
    effect: TuningEffect,
    stall_timeout: Duration,
    stop_grace: Duration,
}

impl MonitorContext {
    async fn report(&self, status: StreamStatus) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.status.send_replace(status);
        let report = HealthReport {
            generation: self.generation,
            status,
        };
        if self.health_tx.send(report).await.is_err() {
            debug!("engine: health receiver gone");
        }
    }
}

enum Wake {
    Cancelled,
    Exited(Option<std::process::ExitStatus>),
    Event(Option<mpv::MpvEvent>),
    Stalled,
}

/// Derive playing/buffering from mpv's observed properties.
#[derive(Debug, Default)]
struct PlaybackFlags {
    idle: bool,
    caching: bool,
}

impl PlaybackFlags {
    fn status(&self) -> StreamStatus {
        if self.idle || self.caching {
            StreamStatus::Buffering
        } else {
            StreamStatus::Playing
        }
    }
}

async fn monitor_stream(mut process: MpvProcess, ctx: MonitorContext) {
    let mut flags = PlaybackFlags {
        idle: true,
        caching: false,
    };
    let mut current = StreamStatus::Buffering;
    let mut stall_at = Some(Instant::now() + ctx.stall_timeout);
    let mut events_open = true;

    loop {
        let wake = tokio::select! {
            _ = ctx.cancel.cancelled() => Wake::Cancelled,
            exit = process.child.wait() => Wake::Exited(exit.ok()),
            ev = process.events.recv(), if events_open => Wake::Event(ev),
            _ = tokio::time::sleep_until(stall_at.unwrap_or_else(Instant::now)), if stall_at.is_some() => Wake::Stalled,
        };

        match wake {
            Wake::Cancelled => {
                process.shutdown(ctx.stop_grace).await;
                return;
            }
            Wake::Exited(status) => {
                warn!(
                    "engine: mpv exited unexpectedly (gen {}, {:?})",
                    ctx.generation, status
                );
                let _ = tokio::fs::remove_file(&process.socket_path).await;
                ctx.report(StreamStatus::Error).await;
                return;
            }
            Wake::Event(None) => {
                // IPC closed; the child exit arrives next.
                events_open = false;
            }
            Wake::Event(Some(ev)) => {
                if ev.is_end_file_error() {
                    warn!("engine: stream failed to load (gen {})", ctx.generation);
                    process.shutdown(ctx.stop_grace).await;
                    ctx.report(StreamStatus::Error).await;
                    return;
                }
                if let Some((id, data)) = ev.as_property_change() {
                    match id {
                        OBS_CORE_IDLE => flags.idle = data.as_bool().unwrap_or(true),
                        OBS_PAUSED_FOR_CACHE => flags.caching = data.as_bool().unwrap_or(false),
                        OBS_EOF_REACHED if data.as_bool() == Some(true) => {
                            debug!("engine: eof reached (gen {})", ctx.generation)
                        }
                        _ => {}
                    }
                }
                let next = flags.status();
                if next != current {
                    current = next;
                    match next {
                        StreamStatus::Playing => {
                            stall_at = None;
                            ctx.effect.fade_out();
                        }
                        _ => stall_at = Some(Instant::now() + ctx.stall_timeout),
                    }
                    debug!("engine: gen {} -> {:?}", ctx.generation, next);
                    ctx.report(next).await;
                }
            }
            Wake::Stalled => {
                warn!(
                    "engine: no audio for {:?} (gen {}), giving up",
                    ctx.stall_timeout, ctx.generation
                );
                process.shutdown(ctx.stop_grace).await;
                ctx.report(StreamStatus::Error).await;
                return;
            }
        }
    }
}
