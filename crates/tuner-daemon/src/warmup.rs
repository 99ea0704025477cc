//! Background cache warm-up and periodic refresh.
//!
//! Runs beside the controller, never on its queue: resolving a slow
//! station here cannot delay tuning to one that is already cached.

use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tuner_proto::catalog::Station;
use tuner_proto::protocol::CacheProgress;

use crate::core::{ControllerHandle, SharedLibrary};
use crate::resolver::{ResolveCache, SourceResolver};

const CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct WarmupRequest {
    pub stations: Vec<Station>,
    /// First warm-up after boot; completion may auto-start playback.
    pub startup: bool,
    /// Report progress through the snapshot's `cache_progress`.
    pub track_progress: bool,
}

/// Folds everything already queued behind `first` into at most two requests.
/// Only the newest tracked (pack) request survives, since an older pack is no
/// longer the one being tuned. Untracked station batches are merged.
fn coalesce(
    first: WarmupRequest,
    requests: &mut mpsc::Receiver<WarmupRequest>,
) -> Vec<WarmupRequest> {
    let mut tracked: Option<WarmupRequest> = None;
    let mut extra = Vec::new();
    let mut startup = false;
    let mut next = Some(first);
    while let Some(req) = next.take().or_else(|| requests.try_recv().ok()) {
        startup |= req.startup;
        if req.track_progress {
            if let Some(old) = tracked.replace(req) {
                debug!("warmup: skipping superseded pack ({} station(s))", old.stations.len());
            }
        } else {
            extra.extend(req.stations);
        }
    }

    let mut out = Vec::new();
    if !extra.is_empty() || tracked.is_none() {
        out.push(WarmupRequest {
            stations: extra,
            startup: false,
            track_progress: false,
        });
    }
    out.extend(tracked);
    if let Some(last) = out.last_mut() {
        last.startup = startup;
    }
    out
}

pub struct Warmup<R> {
    cache: Arc<ResolveCache<R>>,
    handle: ControllerHandle,
    library: SharedLibrary,
    refresh_interval: Duration,
}

impl<R: SourceResolver> Warmup<R> {
    pub fn new(
        cache: Arc<ResolveCache<R>>,
        handle: ControllerHandle,
        library: SharedLibrary,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            cache,
            handle,
            library,
            refresh_interval,
        }
    }

    pub async fn run(self, mut requests: mpsc::Receiver<WarmupRequest>, shutdown: CancellationToken) {
        let mut refresh = tokio::time::interval(self.refresh_interval.max(Duration::from_secs(1)));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;

        'run: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                req = requests.recv() => {
                    let Some(req) = req else { break };
                    for req in coalesce(req, &mut requests) {
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'run,
                            _ = self.warm(req) => {}
                        }
                    }
                }
                _ = refresh.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.refresh_active() => {}
                    }
                }
            }
        }
        debug!("warmup: stopped");
    }

    async fn warm(&self, req: WarmupRequest) {
        let total = req.stations.len();
        if total > 0 {
            info!("warmup: resolving {} station(s)", total);
        }
        if req.track_progress && total > 0 {
            self.handle
                .report_cache_progress(Some(CacheProgress {
                    complete: 0,
                    total,
                    current_station: None,
                }))
                .await;
        }

        let mut results = stream::iter(req.stations)
            .map(|station| {
                let cache = self.cache.clone();
                async move {
                    let result = cache.get_or_resolve(&station.url, station.source_kind).await;
                    (station, result)
                }
            })
            .buffer_unordered(CONCURRENCY);

        let mut complete = 0;
        while let Some((station, result)) = results.next().await {
            complete += 1;
            match result {
                Ok(_) => debug!("warmup: {} ready ({}/{})", station.name, complete, total),
                Err(e) => warn!("warmup: {} failed: {}", station.name, e),
            }
            if req.track_progress {
                self.handle
                    .report_cache_progress(Some(CacheProgress {
                        complete,
                        total,
                        current_station: Some(station.name.clone()),
                    }))
                    .await;
            }
        }

        if req.track_progress && total > 0 {
            self.handle.report_cache_progress(None).await;
            info!("warmup: complete");
        }
        if req.startup {
            self.handle.warmup_finished(true).await;
        }
    }

    /// Re-resolve every station of the active pack so expiring upstream
    /// links are replaced before anyone tunes to them.
    async fn refresh_active(&self) {
        let stations = self
            .library
            .read()
            .await
            .catalog
            .active_pack()
            .map(|p| p.stations.clone())
            .unwrap_or_default();
        if stations.is_empty() {
            return;
        }
        debug!("warmup: refreshing {} station(s)", stations.len());
        let failures = stream::iter(stations)
            .map(|station| {
                let cache = self.cache.clone();
                async move { cache.refresh(&station.url, station.source_kind).await.is_err() }
            })
            .buffer_unordered(CONCURRENCY)
            .filter(|failed| std::future::ready(*failed))
            .count()
            .await;
        if failures > 0 {
            warn!("warmup: {} station(s) failed to refresh", failures);
        }
    }
}
