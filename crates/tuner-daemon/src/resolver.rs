//! Station URL → playable stream URL, plus the TTL cache in front of it.
//!
//! Resolution is the slow part of tuning (a yt-dlp round trip can take
//! seconds), so every successful result is kept for `ttl` and reused.  A
//! failed resolution evicts the entry so the next attempt starts fresh.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tuner_proto::catalog::SourceKind;
use tuner_proto::error::{RadioError, Result};
use tuner_proto::playlist::{self, PlaylistKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub stream_url: String,
    /// Length in seconds of finite on-demand media; `None` for live sources.
    pub duration: Option<f64>,
}

impl ResolvedSource {
    fn passthrough(url: &str) -> Self {
        Self {
            stream_url: url.to_string(),
            duration: None,
        }
    }
}

#[async_trait]
pub trait SourceResolver: Send + Sync + 'static {
    async fn resolve(&self, url: &str, kind: SourceKind) -> Result<ResolvedSource>;
}

pub fn is_youtube(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("youtube.com/") || lower.contains("youtu.be/")
}

/// Production resolver: yt-dlp for YouTube pages, an HTTP fetch for
/// `.m3u`/`.pls` playlists, passthrough for everything else.
pub struct StationResolver {
    http: reqwest::Client,
    yt_dlp: Option<PathBuf>,
    timeout: Duration,
}

impl StationResolver {
    pub fn new(yt_dlp: Option<PathBuf>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunerd/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        if yt_dlp.is_none() {
            warn!("resolver: yt-dlp not found, YouTube stations will fail to resolve");
        }
        Self {
            http,
            yt_dlp,
            timeout,
        }
    }

    async fn resolve_with_yt_dlp(&self, url: &str) -> Result<ResolvedSource> {
        let binary = self
            .yt_dlp
            .as_ref()
            .ok_or_else(|| RadioError::Resolution("yt-dlp binary not found".into()))?;

        let output = tokio::process::Command::new(binary)
            .args(["-j", "--no-playlist", "--no-warnings", url])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| RadioError::Resolution(format!("yt-dlp timed out for {}", url)))?
            .map_err(|e| RadioError::Resolution(format!("yt-dlp failed to start: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RadioError::Resolution(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or_default()
            )));
        }

        let info: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| RadioError::Resolution(format!("yt-dlp output: {}", e)))?;
        source_from_info(&info)
            .ok_or_else(|| RadioError::Resolution(format!("no playable audio for {}", url)))
    }

    async fn resolve_playlist(&self, url: &str, kind: PlaylistKind) -> Result<ResolvedSource> {
        let body = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RadioError::Resolution(format!("fetch {}: {}", url, e)))?
            .text()
            .await
            .map_err(|e| RadioError::Resolution(format!("read {}: {}", url, e)))?;

        let entries = playlist::parse(kind, &body);
        let stream = playlist::first_stream_url(&entries).ok_or_else(|| {
            RadioError::Resolution(format!("playlist {} has no stream entries", url))
        })?;
        debug!("resolver: playlist {} -> {}", url, stream);
        Ok(ResolvedSource::passthrough(stream))
    }
}

#[async_trait]
impl SourceResolver for StationResolver {
    async fn resolve(&self, url: &str, _kind: SourceKind) -> Result<ResolvedSource> {
        if is_youtube(url) {
            return self.resolve_with_yt_dlp(url).await;
        }
        if let Some(kind) = PlaylistKind::from_url(url) {
            return self.resolve_playlist(url, kind).await;
        }
        Ok(ResolvedSource::passthrough(url))
    }
}

/// Pick the best audio-only format from a yt-dlp info document: opus over
/// vorbis over everything else, then by bitrate.  Falls back to the
/// top-level `url` (live streams often only have muxed formats).
pub fn source_from_info(info: &Value) -> Option<ResolvedSource> {
    let is_live = info["is_live"].as_bool().unwrap_or(false);
    let duration = if is_live {
        None
    } else {
        info["duration"].as_f64().filter(|d| *d > 0.0)
    };

    let best = info["formats"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|f| {
            let acodec = f["acodec"].as_str().unwrap_or("none");
            let vcodec = f["vcodec"].as_str().unwrap_or("none");
            acodec != "none" && vcodec == "none" && f["url"].is_string()
        })
        .max_by(|a, b| audio_score(a).total_cmp(&audio_score(b)));

    let stream_url = best
        .and_then(|f| f["url"].as_str())
        .or_else(|| info["url"].as_str())?;

    Some(ResolvedSource {
        stream_url: stream_url.to_string(),
        duration,
    })
}

fn audio_score(format: &Value) -> f64 {
    let codec = format["acodec"].as_str().unwrap_or_default().to_ascii_lowercase();
    let codec_score = if codec.contains("opus") {
        3.0
    } else if codec.contains("vorbis") {
        2.0
    } else {
        1.0
    };
    let bitrate = format["abr"]
        .as_f64()
        .or_else(|| format["tbr"].as_f64())
        .unwrap_or(0.0);
    codec_score * 1000.0 + bitrate
}

struct CacheEntry {
    source: ResolvedSource,
    resolved_at: Instant,
}

/// Resolved-source cache keyed by the station's own URL.
pub struct ResolveCache<R> {
    resolver: R,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl<R: SourceResolver> ResolveCache<R> {
    pub fn new(resolver: R, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_resolve(&self, url: &str, kind: SourceKind) -> Result<ResolvedSource> {
        if let Some(hit) = self.fresh(url).await {
            debug!("resolver: cache hit for {}", url);
            return Ok(hit);
        }
        self.refresh(url, kind).await
    }

    /// Resolve unconditionally and replace the entry.
    pub async fn refresh(&self, url: &str, kind: SourceKind) -> Result<ResolvedSource> {
        // The lock is not held across resolution; concurrent misses for the
        // same URL may both resolve, the later result wins.
        match self.resolver.resolve(url, kind).await {
            Ok(source) => {
                self.entries.lock().await.insert(
                    url.to_string(),
                    CacheEntry {
                        source: source.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Ok(source)
            }
            Err(e) => {
                self.invalidate(url).await;
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self, url: &str) {
        if self.entries.lock().await.remove(url).is_some() {
            info!("resolver: invalidated {}", url);
        }
    }

    async fn fresh(&self, url: &str) -> Option<ResolvedSource> {
        let entries = self.entries.lock().await;
        entries
            .get(url)
            .filter(|e| e.resolved_at.elapsed() < self.ttl)
            .map(|e| e.source.clone())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Resolver double that counts calls and can be switched to failing.
    #[derive(Clone, Default)]
    pub struct CountingResolver {
        pub calls: Arc<AtomicUsize>,
        pub fail: Arc<AtomicBool>,
    }

    impl CountingResolver {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceResolver for CountingResolver {
        async fn resolve(&self, url: &str, kind: SourceKind) -> Result<ResolvedSource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RadioError::Resolution(format!("cannot resolve {}", url)));
            }
            Ok(ResolvedSource {
                stream_url: format!("{}#resolved", url),
                duration: (kind == SourceKind::Video).then_some(600.0),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingResolver;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const GNR: &str = "https://ice.example/gnr";

    #[tokio::test]
    async fn test_cache_hit_within_ttl_resolves_once() {
        let resolver = CountingResolver::default();
        let cache = ResolveCache::new(resolver.clone(), Duration::from_secs(1800));

        let a = cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        let b = cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let resolver = CountingResolver::default();
        let cache = ResolveCache::new(resolver.clone(), Duration::from_secs(60));

        cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        assert_eq!(resolver.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_evicts_entry() {
        let resolver = CountingResolver::default();
        let cache = ResolveCache::new(resolver.clone(), Duration::from_secs(1800));

        cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        resolver.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.refresh(GNR, SourceKind::Live).await,
            Err(RadioError::Resolution(_))
        ));

        resolver.fail.store(false, Ordering::SeqCst);
        cache.get_or_resolve(GNR, SourceKind::Live).await.unwrap();
        assert_eq!(resolver.calls(), 3);
    }

    #[test]
    fn test_best_audio_format_prefers_opus_then_bitrate() {
        let info = json!({
            "duration": 3600.0,
            "url": "https://fallback.example/muxed",
            "formats": [
                {"acodec": "mp4a.40.2", "vcodec": "none", "abr": 256.0, "url": "https://a.example/aac"},
                {"acodec": "opus", "vcodec": "none", "abr": 70.0, "url": "https://a.example/opus70"},
                {"acodec": "opus", "vcodec": "none", "abr": 160.0, "url": "https://a.example/opus160"},
                {"acodec": "opus", "vcodec": "vp9", "abr": 320.0, "url": "https://a.example/muxed"}
            ]
        });
        let src = source_from_info(&info).unwrap();
        assert_eq!(src.stream_url, "https://a.example/opus160");
        assert_eq!(src.duration, Some(3600.0));
    }

    #[test]
    fn test_live_info_falls_back_to_top_level_url() {
        let info = json!({
            "is_live": true,
            "duration": 12.0,
            "url": "https://live.example/hls.m3u8",
            "formats": [{"acodec": "mp4a", "vcodec": "avc1", "url": "https://live.example/v"}]
        });
        let src = source_from_info(&info).unwrap();
        assert_eq!(src.stream_url, "https://live.example/hls.m3u8");
        assert_eq!(src.duration, None);
        assert!(source_from_info(&json!({"formats": []})).is_none());
    }

    #[tokio::test]
    async fn test_plain_url_passes_through() {
        let resolver = StationResolver::new(None, Duration::from_secs(1));
        let src = resolver
            .resolve("https://ice.example/stream.mp3", SourceKind::Live)
            .await
            .unwrap();
        assert_eq!(src.stream_url, "https://ice.example/stream.mp3");
        assert!(matches!(
            resolver
                .resolve("https://www.youtube.com/watch?v=x", SourceKind::Video)
                .await,
            Err(RadioError::Resolution(_))
        ));
    }
}
