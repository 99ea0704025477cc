//! Playlist wrappers some stations publish instead of a direct stream URL.

/// Playlist formats recognised by URL suffix or body sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    M3u,
    Pls,
}

impl PlaylistKind {
    /// Detect from the URL path (query strings ignored).  HLS `.m3u8` is a
    /// stream manifest mpv plays directly, so it is not a playlist here.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if path.ends_with(".m3u") {
            Some(PlaylistKind::M3u)
        } else if path.ends_with(".pls") {
            Some(PlaylistKind::Pls)
        } else {
            None
        }
    }
}

/// One `#EXTINF` or `TitleN` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub title: Option<String>,
    pub url: String,
}

pub fn parse(kind: PlaylistKind, content: &str) -> Vec<PlaylistEntry> {
    match kind {
        PlaylistKind::M3u => parse_m3u(content),
        PlaylistKind::Pls => parse_pls(content),
    }
}

pub fn parse_m3u(content: &str) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut pending_title: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_title = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        entries.push(PlaylistEntry {
            title: pending_title.take().filter(|t| !t.is_empty()),
            url: line.to_string(),
        });
    }

    entries
}

/// `[playlist]` INI format: `FileN=` / `TitleN=` keys, ordered by N.
pub fn parse_pls(content: &str) -> Vec<PlaylistEntry> {
    let mut files: Vec<(u32, String)> = Vec::new();
    let mut titles: Vec<(u32, String)> = Vec::new();

    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if let Some(n) = key.strip_prefix("file").and_then(|n| n.parse().ok()) {
            files.push((n, value));
        } else if let Some(n) = key.strip_prefix("title").and_then(|n| n.parse().ok()) {
            titles.push((n, value));
        }
    }

    files.sort_by_key(|(n, _)| *n);
    files
        .into_iter()
        .filter(|(_, url)| !url.is_empty())
        .map(|(n, url)| PlaylistEntry {
            title: titles
                .iter()
                .find(|(t, _)| *t == n)
                .map(|(_, title)| title.clone())
                .filter(|t| !t.is_empty()),
            url,
        })
        .collect()
}

/// First entry that looks like a network stream.
pub fn first_stream_url(entries: &[PlaylistEntry]) -> Option<&str> {
    entries
        .iter()
        .map(|e| e.url.as_str())
        .find(|u| u.starts_with("http://") || u.starts_with("https://"))
}
