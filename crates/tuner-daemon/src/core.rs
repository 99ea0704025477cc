//! PlaybackController: the single consumer of the intent queue.
//!
//! Every producer (encoders, HTTP handlers, the stream monitor, warm-up)
//! talks to the controller through a `ControllerHandle`, which only ever
//! enqueues.  `run` applies one command at a time, so radio state, the
//! catalog and the engine's stream handle have exactly one writer.  Readers
//! get immutable snapshots from the broadcaster or a read lock on the
//! `Library`.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tuner_proto::catalog::{Catalog, PackListing, SourceKind, Station, StationDraft, StationPatch};
use tuner_proto::error::{RadioError, Result};
use tuner_proto::protocol::{
    CacheProgress, HealthReport, Intent, PackSummary, Snapshot, StationSummary, StreamStatus,
};
use tuner_proto::settings::{Settings, SettingsPatch};
use tuner_proto::store::Persistence;

use crate::broadcast::StateBroadcaster;
use crate::engine::{PlayRequest, StreamEngine};
use crate::warmup::WarmupRequest;

/// Catalog and settings.  Read by anyone, written only by the controller.
#[derive(Debug, Clone, Default)]
pub struct Library {
    pub catalog: Catalog,
    pub settings: Settings,
}

pub type SharedLibrary = Arc<RwLock<Library>>;

/// Catalog/settings mutations, applied in queue order with the intents.
#[derive(Debug, Clone)]
pub enum CatalogOp {
    CreatePack {
        name: String,
    },
    UpdatePack {
        pack_id: String,
        name: Option<String>,
        stations: Option<Vec<StationDraft>>,
    },
    DeletePack {
        pack_id: String,
    },
    AddStation {
        pack_id: String,
        name: String,
        url: String,
        source_kind: Option<SourceKind>,
    },
    UpdateStation {
        pack_id: String,
        station_id: String,
        patch: StationPatch,
    },
    DeleteStation {
        pack_id: String,
        station_id: String,
    },
    ReorderStations {
        pack_id: String,
        station_ids: Vec<String>,
    },
    UpdateSettings(SettingsPatch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogOutcome {
    Pack(PackListing),
    Station(Station),
    Settings(Settings),
    Deleted,
}

enum Command {
    Submit {
        intent: Intent,
        reply: Option<oneshot::Sender<Result<Snapshot>>>,
    },
    Mutate {
        op: CatalogOp,
        reply: oneshot::Sender<Result<CatalogOutcome>>,
    },
    CacheProgress(Option<CacheProgress>),
    WarmupFinished {
        startup: bool,
    },
}

/// Cloneable producer side of the queue.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    /// Validate, enqueue and wait for the intent to be applied.
    pub async fn submit(&self, intent: Intent) -> Result<Snapshot> {
        intent.validate()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit {
                intent,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RadioError::Unavailable)?;
        rx.await.map_err(|_| RadioError::Unavailable)?
    }

    /// Validate and enqueue without waiting for the result.
    pub async fn enqueue(&self, intent: Intent) -> Result<()> {
        intent.validate()?;
        self.tx
            .send(Command::Submit {
                intent,
                reply: None,
            })
            .await
            .map_err(|_| RadioError::Unavailable)
    }

    /// `enqueue` for producers running on a blocking thread.
    pub fn blocking_enqueue(&self, intent: Intent) -> Result<()> {
        intent.validate()?;
        self.tx
            .blocking_send(Command::Submit {
                intent,
                reply: None,
            })
            .map_err(|_| RadioError::Unavailable)
    }

    pub async fn mutate(&self, op: CatalogOp) -> Result<CatalogOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Mutate { op, reply })
            .await
            .map_err(|_| RadioError::Unavailable)?;
        rx.await.map_err(|_| RadioError::Unavailable)?
    }

    pub async fn report_cache_progress(&self, progress: Option<CacheProgress>) {
        let _ = self.tx.send(Command::CacheProgress(progress)).await;
    }

    pub async fn warmup_finished(&self, startup: bool) {
        let _ = self.tx.send(Command::WarmupFinished { startup }).await;
    }
}

/// Forward engine health reports into the intent queue.
pub async fn forward_health(mut reports: mpsc::Receiver<HealthReport>, handle: ControllerHandle) {
    while let Some(report) = reports.recv().await {
        if handle
            .enqueue(Intent::StreamHealthChanged(report))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Mutable radio state.  Owned by the controller loop and nothing else.
#[derive(Debug, Clone)]
struct RadioState {
    station_index: usize,
    power: bool,
    volume: u8,
    status: StreamStatus,
    cache_progress: Option<CacheProgress>,
    /// Dial position to restore on power-on.
    last_station: usize,
    /// Bumped on every play and stop; health reports must match it.
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub queue_capacity: usize,
    pub launch_timeout: Duration,
}

pub struct PlaybackController<E, P> {
    engine: Arc<E>,
    store: Arc<P>,
    library: SharedLibrary,
    broadcaster: StateBroadcaster,
    warmup: Option<mpsc::Sender<WarmupRequest>>,
    launch_timeout: Duration,
    commands: mpsc::Receiver<Command>,
    state: RadioState,
    published: Snapshot,
}

impl<E: StreamEngine, P: Persistence> PlaybackController<E, P> {
    /// Build the controller and its handle.  Nothing runs until `run`.
    pub fn new(
        config: ControllerConfig,
        engine: Arc<E>,
        store: Arc<P>,
        library: SharedLibrary,
        broadcaster: StateBroadcaster,
        warmup: Option<mpsc::Sender<WarmupRequest>>,
    ) -> (Self, ControllerHandle) {
        let (tx, commands) = mpsc::channel(config.queue_capacity.max(1));
        let published = broadcaster.latest().as_ref().clone();
        let state = RadioState {
            station_index: 0,
            power: false,
            volume: published.volume,
            status: StreamStatus::Stopped,
            cache_progress: None,
            last_station: 0,
            generation: 0,
        };
        let controller = Self {
            engine,
            store,
            library,
            broadcaster,
            warmup,
            launch_timeout: config.launch_timeout,
            commands,
            state,
            published,
        };
        (controller, ControllerHandle { tx })
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        if let Err(e) = self.engine.set_volume(self.state.volume).await {
            warn!("controller: initial volume: {}", e);
        }
        self.publish(true).await;
        self.request_warmup(true).await;
        info!("controller: running (volume {})", self.state.volume);

        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        info!("controller: shutting down (stream {:?})", self.engine.health());
        self.engine.stop().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { intent, reply } => {
                debug!("controller: {:?}", intent);
                let result = self.apply(intent).await;
                if let Err(e) = &result {
                    warn!("controller: intent failed: {}", e);
                }
                let snapshot = self.publish(false).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(|_| snapshot));
                }
            }
            Command::Mutate { op, reply } => {
                let result = self.mutate(op).await;
                if let Err(e) = &result {
                    warn!("controller: catalog update failed: {}", e);
                }
                self.publish(false).await;
                let _ = reply.send(result);
            }
            Command::CacheProgress(progress) => {
                self.state.cache_progress = progress;
                self.publish(false).await;
            }
            Command::WarmupFinished { startup } => {
                if startup {
                    self.auto_start().await;
                    self.publish(false).await;
                }
            }
        }
    }

    // ── intents ───────────────────────────────────────────────────────────────

    async fn apply(&mut self, intent: Intent) -> Result<()> {
        match intent {
            Intent::RotateStation { direction } => {
                let (count, wrap) = {
                    let lib = self.library.read().await;
                    (lib.catalog.active_station_count(), lib.settings.wrap_stations)
                };
                let target = rotate(self.state.station_index, direction, count, wrap);
                self.tune_to(target).await
            }
            Intent::SetStationIndex { index } => {
                let count = self.library.read().await.catalog.active_station_count();
                self.tune_to(index.clamp(0, count as i64) as usize).await
            }
            Intent::SetPower { on: true } => self.power_on().await,
            Intent::SetPower { on: false } => {
                self.power_off().await;
                Ok(())
            }
            Intent::SetVolume { level } => self.set_volume(level).await,
            Intent::NudgeVolume { delta } => {
                self.set_volume(self.state.volume as i64 + delta).await
            }
            Intent::ActivatePack { pack_id } => self.activate_pack(&pack_id).await,
            Intent::NextPack => {
                let next = self.library.read().await.catalog.next_pack_id();
                match next {
                    Some(id) => self.activate_pack(&id).await,
                    None => Ok(()),
                }
            }
            Intent::StreamHealthChanged(report) => {
                if report.generation == self.state.generation
                    && self.state.status != StreamStatus::Stopped
                {
                    self.state.status = report.status;
                } else {
                    debug!(
                        "controller: ignoring {:?} for gen {} (current {})",
                        report.status, report.generation, self.state.generation
                    );
                }
                Ok(())
            }
        }
    }

    async fn tune_to(&mut self, target: usize) -> Result<()> {
        if target == self.state.station_index {
            return Ok(());
        }
        self.state.station_index = target;
        if target > 0 {
            self.state.last_station = target;
        }
        if !self.state.power {
            // Off: the dial moves, nothing sounds.
            return Ok(());
        }
        self.play_effect().await;
        self.restart_stream().await
    }

    async fn power_on(&mut self) -> Result<()> {
        if self.state.power && self.state.station_index > 0 {
            return Ok(());
        }
        let count = self.library.read().await.catalog.active_station_count();
        let target = if (1..=count).contains(&self.state.last_station) {
            self.state.last_station
        } else if count > 0 {
            1
        } else {
            0
        };
        info!("controller: power on -> station {}", target);
        self.state.power = true;
        self.state.station_index = target;
        if target == 0 {
            return Ok(());
        }
        self.state.last_station = target;
        self.play_effect().await;
        self.restart_stream().await
    }

    async fn power_off(&mut self) {
        if !self.state.power {
            return;
        }
        info!("controller: power off at station {}", self.state.station_index);
        self.state.last_station = self.state.station_index;
        self.state.power = false;
        self.stop_stream().await;
    }

    async fn set_volume(&mut self, requested: i64) -> Result<()> {
        let level = self.library.read().await.settings.clamp_volume(requested);
        let previous = self.state.volume;
        self.state.volume = level;

        let applied = self.engine.set_volume(level).await;
        if let Err(e) = &applied {
            error!("controller: volume {} not applied: {}", level, e);
            self.state.status = StreamStatus::Error;
        }

        if level == 0 && self.state.power {
            self.power_off().await;
        } else if previous == 0 && level > 0 && !self.state.power {
            self.power_on().await?;
        }
        applied
    }

    async fn activate_pack(&mut self, pack_id: &str) -> Result<()> {
        let mut catalog = self.library.read().await.catalog.clone();
        if catalog.active_pack_id.as_deref() == Some(pack_id) && catalog.pack(pack_id).is_some() {
            return Ok(());
        }
        catalog.set_active(pack_id)?;
        self.store.save_catalog(&catalog).await?;
        self.library.write().await.catalog = catalog;

        info!("controller: activated pack {}", pack_id);
        self.reset_to_off().await;
        self.request_warmup(false).await;
        Ok(())
    }

    async fn auto_start(&mut self) {
        let enabled = self.library.read().await.settings.auto_start;
        if !enabled {
            info!("controller: auto-start disabled");
            return;
        }
        if self.state.power && self.state.station_index > 0 {
            return;
        }
        if self.library.read().await.catalog.active_station_count() == 0 {
            info!("controller: no stations, skipping auto-start");
            return;
        }
        info!("controller: auto-starting playback");
        if let Err(e) = self.power_on().await {
            warn!("controller: auto-start failed: {}", e);
        }
    }

    // ── stream control ────────────────────────────────────────────────────────

    async fn play_effect(&self) {
        let static_volume = self.library.read().await.settings.static_volume;
        self.engine.play_effect(static_volume).await;
    }

    async fn stop_stream(&mut self) {
        self.state.generation += 1;
        self.engine.stop().await;
        self.state.status = StreamStatus::Stopped;
    }

    async fn reset_to_off(&mut self) {
        self.stop_stream().await;
        self.state.station_index = 0;
        self.state.last_station = 0;
        self.state.cache_progress = None;
    }

    /// Stop whatever is playing, then start the tuned station if the radio
    /// is on and the dial is on a station.
    async fn restart_stream(&mut self) -> Result<()> {
        self.stop_stream().await;
        if !self.state.power || self.state.station_index == 0 {
            return Ok(());
        }
        let (station, normalize) = {
            let lib = self.library.read().await;
            let station = lib
                .catalog
                .active_pack()
                .and_then(|p| p.station_at(self.state.station_index))
                .cloned();
            (station, lib.settings.loudness_normalization)
        };
        let Some(station) = station else {
            return Ok(());
        };

        self.state.generation += 1;
        let generation = self.state.generation;
        self.state.status = StreamStatus::Buffering;
        self.publish(false).await;

        let request = PlayRequest {
            generation,
            station: station.clone(),
            normalize,
        };
        match tokio::time::timeout(self.launch_timeout, self.engine.play(request)).await {
            Ok(Ok(handle)) => {
                debug!("controller: {} -> {}", station.name, handle.stream_url);
                self.state.status = StreamStatus::Playing;
                Ok(())
            }
            Ok(Err(e)) => {
                error!("controller: could not play {:?}: {}", station.name, e);
                self.state.status = StreamStatus::Error;
                Err(e)
            }
            Err(_) => {
                error!(
                    "controller: {:?} did not start within {:?}",
                    station.name, self.launch_timeout
                );
                self.engine.stop().await;
                self.state.status = StreamStatus::Error;
                Err(RadioError::Launch(format!(
                    "{} did not start within {}s",
                    station.name,
                    self.launch_timeout.as_secs()
                )))
            }
        }
    }

    async fn request_warmup(&self, startup: bool) {
        let Some(tx) = &self.warmup else {
            return;
        };
        let stations = self
            .library
            .read()
            .await
            .catalog
            .active_pack()
            .map(|p| p.stations.clone())
            .unwrap_or_default();
        let request = WarmupRequest {
            stations,
            startup,
            track_progress: true,
        };
        offer_warmup(tx, request);
    }

    async fn warm_stations(&self, stations: Vec<Station>) {
        let Some(tx) = &self.warmup else {
            return;
        };
        if stations.is_empty() {
            return;
        }
        let request = WarmupRequest {
            stations,
            startup: false,
            track_progress: false,
        };
        offer_warmup(tx, request);
    }

    // ── catalog mutations ─────────────────────────────────────────────────────

    async fn mutate(&mut self, op: CatalogOp) -> Result<CatalogOutcome> {
        let (mut catalog, mut settings) = {
            let lib = self.library.read().await;
            (lib.catalog.clone(), lib.settings.clone())
        };
        let before = catalog.clone();

        let outcome = match op {
            CatalogOp::CreatePack { name } => {
                let pack = catalog.create_pack(&name)?;
                listing(&catalog, &pack.id)?
            }
            CatalogOp::UpdatePack {
                pack_id,
                name,
                stations,
            } => {
                if let Some(name) = name {
                    catalog.rename_pack(&pack_id, &name)?;
                }
                if let Some(stations) = stations {
                    catalog.replace_stations(&pack_id, stations)?;
                }
                listing(&catalog, &pack_id)?
            }
            CatalogOp::DeletePack { pack_id } => {
                catalog.delete_pack(&pack_id)?;
                CatalogOutcome::Deleted
            }
            CatalogOp::AddStation {
                pack_id,
                name,
                url,
                source_kind,
            } => CatalogOutcome::Station(catalog.add_station(&pack_id, &name, &url, source_kind)?),
            CatalogOp::UpdateStation {
                pack_id,
                station_id,
                patch,
            } => CatalogOutcome::Station(catalog.update_station(&pack_id, &station_id, patch)?),
            CatalogOp::DeleteStation {
                pack_id,
                station_id,
            } => {
                catalog.delete_station(&pack_id, &station_id)?;
                CatalogOutcome::Deleted
            }
            CatalogOp::ReorderStations {
                pack_id,
                station_ids,
            } => {
                catalog.reorder_stations(&pack_id, &station_ids)?;
                listing(&catalog, &pack_id)?
            }
            CatalogOp::UpdateSettings(patch) => {
                settings = settings.patched(&patch);
                CatalogOutcome::Settings(settings.clone())
            }
        };

        // Persist first; memory changes only once the write succeeded.
        let catalog_changed = catalog != before;
        let settings_changed = settings != self.library.read().await.settings;
        if catalog_changed {
            self.store.save_catalog(&catalog).await?;
        }
        if settings_changed {
            self.store.save_settings(&settings).await?;
        }
        {
            let mut lib = self.library.write().await;
            lib.catalog = catalog;
            lib.settings = settings;
        }

        if catalog_changed {
            self.reconcile_catalog(&before).await;
        }
        if settings_changed {
            self.reconcile_settings().await;
        }
        Ok(outcome)
    }

    /// Bring radio state back in line after the catalog changed under it.
    async fn reconcile_catalog(&mut self, before: &Catalog) {
        let catalog = self.library.read().await.catalog.clone();

        if catalog.active_pack_id != before.active_pack_id {
            info!("controller: active pack is now {:?}", catalog.active_pack_id);
            self.reset_to_off().await;
            self.request_warmup(false).await;
            return;
        }
        let Some(pack) = catalog.active_pack() else {
            return;
        };

        let known: HashSet<&str> = before
            .active_pack()
            .map(|p| p.stations.iter().map(|s| s.id.as_str()).collect())
            .unwrap_or_default();
        let added: Vec<Station> = pack
            .stations
            .iter()
            .filter(|s| !known.contains(s.id.as_str()))
            .cloned()
            .collect();
        self.warm_stations(added).await;

        let Some(tuned) = before
            .active_pack()
            .and_then(|p| p.station_at(self.state.station_index))
        else {
            return;
        };
        match pack.position_of(&tuned.id) {
            None => {
                info!("controller: tuned station {:?} was deleted", tuned.name);
                self.stop_stream().await;
                self.state.station_index = 0;
                self.state.last_station = 0;
            }
            Some(pos) => {
                self.state.station_index = pos;
                self.state.last_station = pos;
                let Some(now) = pack.station_at(pos) else {
                    return;
                };
                if self.state.power && (now.url != tuned.url || now.source_kind != tuned.source_kind)
                {
                    info!("controller: re-tuning {:?} after source change", now.name);
                    if let Err(e) = self.restart_stream().await {
                        warn!("controller: re-tune failed: {}", e);
                    }
                }
            }
        }
    }

    async fn reconcile_settings(&mut self) {
        let max = self.library.read().await.settings.max_volume;
        if self.state.volume <= max {
            return;
        }
        info!("controller: volume {} above new max {}", self.state.volume, max);
        self.state.volume = max;
        if let Err(e) = self.engine.set_volume(max).await {
            error!("controller: volume {} not applied: {}", max, e);
            self.state.status = StreamStatus::Error;
        }
    }

    // ── snapshots ─────────────────────────────────────────────────────────────

    async fn current_snapshot(&self) -> Snapshot {
        let lib = self.library.read().await;
        let pack = lib.catalog.active_pack();
        Snapshot {
            rev: self.published.rev,
            pack: pack.map(|p| PackSummary {
                id: p.id.clone(),
                name: p.name.clone(),
                station_count: p.station_count(),
            }),
            station: pack
                .and_then(|p| p.station_at(self.state.station_index))
                .map(|s| StationSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                }),
            station_index: self.state.station_index,
            volume: self.state.volume,
            status: self.state.status,
            power: self.state.power,
            cache_progress: self.state.cache_progress.clone(),
            updated_at: self.published.updated_at,
        }
    }

    /// Publish the current state if it differs from the last published one.
    async fn publish(&mut self, force: bool) -> Snapshot {
        let current = self.current_snapshot().await;
        if !force && current == self.published {
            return current;
        }
        let snapshot = Snapshot {
            rev: self.published.rev + 1,
            updated_at: Utc::now(),
            ..current
        };
        self.published = snapshot.clone();
        self.broadcaster.publish(snapshot.clone());
        snapshot
    }
}

/// Hands a request to the warm-up task without ever waiting on it. When the
/// task is saturated the request is dropped; the periodic refresh covers the
/// active pack later.
fn offer_warmup(tx: &mpsc::Sender<WarmupRequest>, request: WarmupRequest) {
    match tx.try_send(request) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(req)) => {
            warn!(
                "controller: warm-up busy, skipping {} station(s)",
                req.stations.len()
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => debug!("controller: warm-up task gone"),
    }
}

fn listing(catalog: &Catalog, pack_id: &str) -> Result<CatalogOutcome> {
    catalog
        .listing(pack_id)
        .map(CatalogOutcome::Pack)
        .ok_or_else(|| RadioError::pack_not_found(pack_id))
}

/// Dial arithmetic.  Position 0 is OFF; with `wrap` OFF is one stop of the
/// cycle `0..=count`, without it the dial sticks at either end.
pub fn rotate(current: usize, direction: i8, count: usize, wrap: bool) -> usize {
    let current = current.min(count) as i64;
    let next = current + direction as i64;
    if wrap {
        next.rem_euclid(count as i64 + 1) as usize
    } else {
        next.clamp(0, count as i64) as usize
    }
}

/// Snapshot served before the controller's first publish.
pub fn initial_snapshot(library: &Library) -> Snapshot {
    let pack = library.catalog.active_pack();
    Snapshot {
        rev: 0,
        pack: pack.map(|p| PackSummary {
            id: p.id.clone(),
            name: p.name.clone(),
            station_count: p.station_count(),
        }),
        station: None,
        station_index: 0,
        volume: library
            .settings
            .clamp_volume(library.settings.default_volume as i64),
        status: StreamStatus::Stopped,
        power: false,
        cache_progress: None,
        updated_at: Utc::now(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    fn up() -> Intent {
        Intent::RotateStation { direction: 1 }
    }

    async fn power_on(rig: &Rig) -> Snapshot {
        rig.handle.submit(Intent::SetPower { on: true }).await.unwrap()
    }

    #[test]
    fn test_rotate() {
        assert_eq!(rotate(0, -1, 2, false), 0);
        assert_eq!(rotate(2, 1, 2, false), 2);
        assert_eq!(rotate(2, 1, 2, true), 0);
        assert_eq!(rotate(0, -1, 2, true), 2);
        assert_eq!(rotate(0, 1, 0, true), 0);
        assert_eq!(rotate(5, -1, 2, false), 1);
    }

    #[tokio::test]
    async fn test_rotate_through_pack_without_wrap() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        let s = rig.handle.submit(Intent::SetStationIndex { index: 0 }).await.unwrap();
        assert_eq!(s.station_index, 0);
        assert_eq!(s.status, StreamStatus::Stopped);

        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.station_index, 1);
        assert_eq!(s.station.unwrap().id, "gnr");
        assert_eq!(s.status, StreamStatus::Playing);

        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.station_index, 2);
        assert_eq!(s.station.unwrap().id, "mojave");

        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.station_index, 2);

        assert_eq!(
            rig.engine.plays(),
            vec!["play Galaxy News", "play Galaxy News", "play Mojave"]
        );
        assert_eq!(rig.engine.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotate_wraps_to_off() {
        let mut library = fallout_library();
        library.settings.wrap_stations = true;
        let rig = start(library);
        power_on(&rig).await;
        rig.handle.submit(up()).await.unwrap();
        let plays_before = rig.engine.plays().len();

        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.station_index, 0);
        assert_eq!(s.status, StreamStatus::Stopped);
        assert!(s.station.is_none());
        assert_eq!(rig.engine.plays().len(), plays_before);
        assert_eq!(rig.engine.calls().last().unwrap(), "stop");
    }

    #[tokio::test]
    async fn test_switch_stops_before_play_and_plays_effect() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.engine.calls.lock().unwrap().clear();

        rig.handle.submit(up()).await.unwrap();
        assert_eq!(rig.engine.calls(), vec!["effect 60", "stop", "play Mojave"]);
        assert_eq!(rig.engine.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tuning_while_off_is_silent() {
        let rig = start(fallout_library());
        let s = rig.handle.submit(Intent::SetStationIndex { index: 2 }).await.unwrap();
        assert_eq!(s.station_index, 2);
        assert!(!s.power);
        assert!(rig.engine.plays().is_empty());

        let s = power_on(&rig).await;
        assert_eq!(s.station_index, 2);
        assert_eq!(rig.engine.plays(), vec!["play Mojave"]);
    }

    #[tokio::test]
    async fn test_station_index_is_clamped() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        let s = rig.handle.submit(Intent::SetStationIndex { index: 99 }).await.unwrap();
        assert_eq!(s.station_index, 2);
        let s = rig.handle.submit(Intent::SetStationIndex { index: -3 }).await.unwrap();
        assert_eq!(s.station_index, 0);
    }

    #[tokio::test]
    async fn test_invalid_intent_is_rejected_before_queue() {
        let rig = start(fallout_library());
        let err = rig
            .handle
            .submit(Intent::RotateStation { direction: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, RadioError::Validation(_)));
        let err = rig.handle.submit(Intent::SetVolume { level: 101 }).await.unwrap_err();
        assert!(matches!(err, RadioError::Validation(_)));
        assert_eq!(rig.broadcaster.latest().station_index, 0);
    }

    #[tokio::test]
    async fn test_volume_clamped_to_max() {
        let mut library = fallout_library();
        library.settings.max_volume = 70;
        let rig = start(library);
        let s = rig.handle.submit(Intent::SetVolume { level: 95 }).await.unwrap();
        assert_eq!(s.volume, 70);
        let s = rig.handle.submit(Intent::NudgeVolume { delta: 5 }).await.unwrap();
        assert_eq!(s.volume, 70);
        assert_eq!(rig.engine.volume.load(Ordering::SeqCst), 70);
    }

    #[tokio::test]
    async fn test_volume_zero_powers_off_and_back_on() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle.submit(up()).await.unwrap();

        let s = rig.handle.submit(Intent::SetVolume { level: 0 }).await.unwrap();
        assert!(!s.power);
        assert_eq!(s.status, StreamStatus::Stopped);
        assert_eq!(s.station_index, 2);
        assert_eq!(rig.engine.live.load(Ordering::SeqCst), 0);
        assert_eq!(rig.engine.calls().last().unwrap(), "stop");

        let s = rig.handle.submit(Intent::NudgeVolume { delta: 1 }).await.unwrap();
        assert!(s.power);
        assert_eq!(s.volume, 1);
        assert_eq!(s.station_index, 2);
        assert_eq!(rig.engine.plays().last().unwrap(), "play Mojave");
    }

    #[tokio::test]
    async fn test_explicit_power_off_wins_over_volume() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle.submit(Intent::SetPower { on: false }).await.unwrap();
        let s = rig.handle.submit(Intent::SetVolume { level: 80 }).await.unwrap();
        assert!(!s.power);
        assert_eq!(s.volume, 80);
    }

    #[tokio::test]
    async fn test_device_error_surfaces() {
        let rig = start(fallout_library());
        rig.engine.fail_volume.store(true, Ordering::SeqCst);
        let err = rig.handle.submit(Intent::SetVolume { level: 30 }).await.unwrap_err();
        assert!(matches!(err, RadioError::Device(_)));
        let s = rig.broadcaster.latest();
        assert_eq!(s.status, StreamStatus::Error);
        assert_eq!(s.volume, 30);
    }

    #[tokio::test]
    async fn test_activate_empty_pack() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        let s = rig
            .handle
            .submit(Intent::ActivatePack {
                pack_id: "lofi".into(),
            })
            .await
            .unwrap();
        assert_eq!(s.station_index, 0);
        assert_eq!(s.status, StreamStatus::Stopped);
        assert_eq!(s.pack.unwrap().id, "lofi");
        assert_eq!(rig.engine.live.load(Ordering::SeqCst), 0);
        assert_eq!(rig.store.catalog_saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activate_unknown_pack() {
        let rig = start(fallout_library());
        let err = rig
            .handle
            .submit(Intent::ActivatePack {
                pack_id: "nope".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RadioError::NotFound { kind: "pack", .. }));
        assert_eq!(
            rig.library.read().await.catalog.active_pack_id.as_deref(),
            Some("fallout")
        );
    }

    #[tokio::test]
    async fn test_stalled_warmup_never_blocks_intents() {
        // Receiver is held but never read.
        let (tx, _rx) = mpsc::channel(1);
        let rig = start_with(fallout_library(), Some(tx));

        for _ in 0..12 {
            tokio::time::timeout(Duration::from_secs(2), rig.handle.submit(Intent::NextPack))
                .await
                .expect("next pack stalled")
                .unwrap();
        }
        let s = tokio::time::timeout(
            Duration::from_secs(2),
            rig.handle.submit(Intent::SetVolume { level: 40 }),
        )
        .await
        .expect("set volume stalled")
        .unwrap();
        assert_eq!(s.volume, 40);
    }

    #[tokio::test]
    async fn test_next_pack_cycles() {
        let rig = start(fallout_library());
        let s = rig.handle.submit(Intent::NextPack).await.unwrap();
        assert_eq!(s.pack.unwrap().id, "lofi");
        let s = rig.handle.submit(Intent::NextPack).await.unwrap();
        assert_eq!(s.pack.unwrap().id, "fallout");
    }

    #[tokio::test]
    async fn test_play_failure_sets_error_without_retry() {
        let rig = start(fallout_library());
        rig.engine.fail_play.store(true, Ordering::SeqCst);
        let err = rig.handle.submit(Intent::SetPower { on: true }).await.unwrap_err();
        assert!(matches!(err, RadioError::Resolution(_)));
        let s = rig.broadcaster.latest();
        assert_eq!(s.status, StreamStatus::Error);
        assert_eq!(s.station_index, 1);
        assert_eq!(rig.engine.plays().len(), 1);

        rig.engine.fail_play.store(false, Ordering::SeqCst);
        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.status, StreamStatus::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_timeout() {
        let rig = start(fallout_library());
        rig.engine.hang_play.store(true, Ordering::SeqCst);
        let err = rig.handle.submit(Intent::SetPower { on: true }).await.unwrap_err();
        assert!(matches!(err, RadioError::Launch(_)));
        assert_eq!(rig.broadcaster.latest().status, StreamStatus::Error);
        assert_eq!(rig.engine.calls().last().unwrap(), "stop");

        // The loop keeps serving intents.
        let s = rig.handle.submit(Intent::SetVolume { level: 10 }).await.unwrap();
        assert_eq!(s.volume, 10);
    }

    #[tokio::test]
    async fn test_stale_health_report_ignored() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        let s = rig.handle.submit(up()).await.unwrap();
        assert_eq!(s.status, StreamStatus::Playing);

        rig.handle
            .enqueue(Intent::StreamHealthChanged(HealthReport {
                generation: 1,
                status: StreamStatus::Error,
            }))
            .await
            .unwrap();
        let s = rig.handle.submit(Intent::SetVolume { level: 41 }).await.unwrap();
        assert_eq!(s.status, StreamStatus::Playing);
    }

    #[tokio::test]
    async fn test_forwarded_health_error_surfaces() {
        let rig = start(fallout_library());
        let s = power_on(&rig).await;
        assert_eq!(s.status, StreamStatus::Playing);
        let mut sub = rig.broadcaster.subscribe();

        // Power-on stops (generation 1) then plays (generation 2).
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(forward_health(rx, rig.handle.clone()));
        tx.send(HealthReport {
            generation: 2,
            status: StreamStatus::Error,
        })
        .await
        .unwrap();

        let s = sub.next().await.unwrap();
        assert_eq!(s.status, StreamStatus::Error);
        assert_eq!(s.station_index, 1);
        assert!(s.power);
    }

    #[tokio::test]
    async fn test_snapshots_carry_increasing_rev() {
        let rig = start(fallout_library());
        let a = power_on(&rig).await;
        let b = rig.handle.submit(up()).await.unwrap();
        assert!(b.rev > a.rev);
        // No change, no new revision.
        let c = rig.handle.submit(up()).await.unwrap();
        assert_eq!(c.rev, b.rev);
    }

    #[tokio::test]
    async fn test_delete_tuned_station_resets_to_off() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle
            .mutate(CatalogOp::DeleteStation {
                pack_id: "fallout".into(),
                station_id: "gnr".into(),
            })
            .await
            .unwrap();
        let s = rig.broadcaster.latest();
        assert_eq!(s.station_index, 0);
        assert_eq!(s.status, StreamStatus::Stopped);
        assert_eq!(rig.engine.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_other_station_renumbers() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle.submit(up()).await.unwrap();
        let plays = rig.engine.plays().len();

        rig.handle
            .mutate(CatalogOp::DeleteStation {
                pack_id: "fallout".into(),
                station_id: "gnr".into(),
            })
            .await
            .unwrap();
        let s = rig.broadcaster.latest();
        assert_eq!(s.station_index, 1);
        assert_eq!(s.station.as_ref().unwrap().id, "mojave");
        assert_eq!(s.status, StreamStatus::Playing);
        assert_eq!(rig.engine.plays().len(), plays);
    }

    #[tokio::test]
    async fn test_url_edit_retunes_live_station() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle
            .mutate(CatalogOp::UpdateStation {
                pack_id: "fallout".into(),
                station_id: "gnr".into(),
                patch: StationPatch {
                    url: Some("http://radio.test/gnr2".into()),
                    ..StationPatch::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(rig.engine.plays(), vec!["play Galaxy News", "play Galaxy News"]);
        assert_eq!(rig.engine.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_catalog_untouched() {
        let rig = start(fallout_library());
        rig.store.fail.store(true, Ordering::SeqCst);
        let err = rig
            .handle
            .mutate(CatalogOp::CreatePack { name: "Jazz".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RadioError::Persistence(_)));
        assert_eq!(rig.library.read().await.catalog.packs.len(), 2);

        let err = rig
            .handle
            .mutate(CatalogOp::UpdateSettings(SettingsPatch {
                max_volume: Some(10),
                ..SettingsPatch::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, RadioError::Persistence(_)));
        assert_eq!(rig.library.read().await.settings.max_volume, 100);
    }

    #[tokio::test]
    async fn test_lowering_max_volume_lowers_volume() {
        let rig = start(fallout_library());
        rig.handle.submit(Intent::SetVolume { level: 80 }).await.unwrap();
        let outcome = rig
            .handle
            .mutate(CatalogOp::UpdateSettings(SettingsPatch {
                max_volume: Some(50),
                ..SettingsPatch::default()
            }))
            .await
            .unwrap();
        assert!(matches!(outcome, CatalogOutcome::Settings(s) if s.max_volume == 50));
        assert_eq!(rig.broadcaster.latest().volume, 50);
        assert_eq!(rig.engine.volume.load(Ordering::SeqCst), 50);
        assert_eq!(rig.store.settings_saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deleting_active_pack_switches_and_stops() {
        let rig = start(fallout_library());
        power_on(&rig).await;
        rig.handle
            .mutate(CatalogOp::DeletePack {
                pack_id: "fallout".into(),
            })
            .await
            .unwrap();
        let s = rig.broadcaster.latest();
        assert_eq!(s.pack.as_ref().unwrap().id, "lofi");
        assert_eq!(s.station_index, 0);
        assert_eq!(s.status, StreamStatus::Stopped);
    }

    #[tokio::test]
    async fn test_added_station_is_warmed() {
        let (tx, mut rx) = mpsc::channel(8);
        let rig = start_with(fallout_library(), Some(tx));
        let startup = rx.recv().await.unwrap();
        assert!(startup.startup);
        assert_eq!(startup.stations.len(), 2);

        rig.handle
            .mutate(CatalogOp::AddStation {
                pack_id: "fallout".into(),
                name: "Diamond City".into(),
                url: "http://radio.test/dc".into(),
                source_kind: None,
            })
            .await
            .unwrap();
        let req = rx.recv().await.unwrap();
        assert!(!req.track_progress);
        assert_eq!(req.stations.len(), 1);
        assert_eq!(req.stations[0].name, "Diamond City");
    }

    #[tokio::test]
    async fn test_auto_start_after_startup_warmup() {
        let rig = start(fallout_library());
        rig.handle
            .report_cache_progress(Some(CacheProgress {
                complete: 1,
                total: 2,
                current_station: Some("Galaxy News".into()),
            }))
            .await;
        rig.handle.report_cache_progress(None).await;
        rig.handle.warmup_finished(true).await;

        let s = rig.handle.submit(Intent::NudgeVolume { delta: 0 }).await.unwrap();
        assert!(s.power);
        assert_eq!(s.station_index, 1);
        assert!(s.cache_progress.is_none());
    }

    #[tokio::test]
    async fn test_auto_start_disabled() {
        let mut library = fallout_library();
        library.settings.auto_start = false;
        let rig = start(library);
        rig.handle.warmup_finished(true).await;
        let s = rig.handle.submit(Intent::NudgeVolume { delta: 0 }).await.unwrap();
        assert!(!s.power);
        assert!(rig.engine.plays().is_empty());
    }

    #[tokio::test]
    async fn test_handle_reports_unavailable_after_shutdown() {
        let rig = start(fallout_library());
        rig.shutdown.cancel();
        let err = rig.handle.submit(Intent::NextPack).await.unwrap_err();
        assert!(matches!(err, RadioError::Unavailable));
    }
}
