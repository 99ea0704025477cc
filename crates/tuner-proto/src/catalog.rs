//! Station catalog: packs of stations plus the active pack pointer.
//!
//! Pure data and validation.  Every constructor validates (non-empty name,
//! well-formed http(s) URL) so the rest of the daemon never re-checks fields
//! at use sites.  Mutation methods are all-or-nothing: on `Err` the catalog is
//! unchanged.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RadioError, Result};

/// How a station's source behaves once resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Continuous stream (Icecast, HLS live, live video).
    #[default]
    Live,
    /// Finite on-demand media, played on a looping virtual timeline.
    Video,
}

impl SourceKind {
    /// Guess the kind from the URL alone.  YouTube watch links are treated as
    /// on-demand videos, everything else as live radio.
    pub fn infer(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("youtube.com/watch")
            || lower.contains("youtu.be/")
            || lower.contains("youtube.com/shorts/")
        {
            SourceKind::Video
        } else {
            SourceKind::Live
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub source_kind: SourceKind,
}

impl Station {
    pub fn new(name: &str, url: &str, kind: Option<SourceKind>) -> Result<Self> {
        let name = validate_name(name)?;
        let url = validate_url(url)?;
        let source_kind = kind.unwrap_or_else(|| SourceKind::infer(&url));
        Ok(Self {
            id: new_id(),
            name,
            url,
            source_kind,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stations: Vec<Station>,
}

impl Pack {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            id: new_id(),
            name: validate_name(name)?,
            stations: Vec::new(),
        })
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    /// 1-based lookup matching the dial positions (0 is OFF).
    pub fn station_at(&self, index: usize) -> Option<&Station> {
        index.checked_sub(1).and_then(|i| self.stations.get(i))
    }

    /// 1-based position of a station id.
    pub fn position_of(&self, station_id: &str) -> Option<usize> {
        self.stations
            .iter()
            .position(|s| s.id == station_id)
            .map(|i| i + 1)
    }
}

/// Pack summary as listed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackListing {
    #[serde(flatten)]
    pub pack: Pack,
    pub is_active: bool,
}

/// Partial station edit; `None` leaves the field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub packs: Vec<Pack>,
    pub active_pack_id: Option<String>,
}

impl Catalog {
    /// Build from a persisted record, repairing what can be repaired: missing
    /// ids are generated, blank names defaulted, entries with unusable URLs
    /// dropped, and a dangling active id pointed at the first pack.
    pub fn from_record(record: CatalogRecord) -> Self {
        let packs = record
            .packs
            .into_iter()
            .map(|p| Pack {
                id: p.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(new_id),
                name: non_blank(p.name).unwrap_or_else(|| "Unnamed Pack".to_string()),
                stations: p
                    .stations
                    .into_iter()
                    .filter_map(|s| {
                        let url = match validate_url(s.url.as_deref().unwrap_or_default()) {
                            Ok(u) => u,
                            Err(e) => {
                                tracing::warn!("catalog: dropping station {:?}: {}", s.name, e);
                                return None;
                            }
                        };
                        Some(Station {
                            id: s.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(new_id),
                            name: non_blank(s.name)
                                .unwrap_or_else(|| "Unnamed Station".to_string()),
                            source_kind: s.source_kind.unwrap_or_else(|| SourceKind::infer(&url)),
                            url,
                        })
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        let active_pack_id = match record.active_pack_id {
            Some(id) if packs.iter().any(|p| p.id == id) => Some(id),
            _ => packs.first().map(|p| p.id.clone()),
        };

        Self {
            packs,
            active_pack_id,
        }
    }

    pub fn to_record(&self) -> CatalogRecord {
        CatalogRecord {
            packs: self
                .packs
                .iter()
                .map(|p| PackRecord {
                    id: Some(p.id.clone()),
                    name: Some(p.name.clone()),
                    stations: p
                        .stations
                        .iter()
                        .map(|s| StationRecord {
                            id: Some(s.id.clone()),
                            name: Some(s.name.clone()),
                            url: Some(s.url.clone()),
                            source_kind: Some(s.source_kind),
                        })
                        .collect(),
                })
                .collect(),
            active_pack_id: self.active_pack_id.clone(),
        }
    }

    pub fn pack(&self, id: &str) -> Option<&Pack> {
        self.packs.iter().find(|p| p.id == id)
    }

    fn pack_mut(&mut self, id: &str) -> Result<&mut Pack> {
        self.packs
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| RadioError::pack_not_found(id))
    }

    pub fn active_pack(&self) -> Option<&Pack> {
        self.active_pack_id.as_deref().and_then(|id| self.pack(id))
    }

    /// Number of stations in the active pack (0 when there is none).
    pub fn active_station_count(&self) -> usize {
        self.active_pack().map(Pack::station_count).unwrap_or(0)
    }

    /// Id of the pack after the active one, wrapping around.
    pub fn next_pack_id(&self) -> Option<String> {
        if self.packs.is_empty() {
            return None;
        }
        let current = self
            .active_pack_id
            .as_deref()
            .and_then(|id| self.packs.iter().position(|p| p.id == id))
            .unwrap_or(0);
        let next = (current + 1) % self.packs.len();
        Some(self.packs[next].id.clone())
    }

    pub fn listings(&self) -> Vec<PackListing> {
        self.packs
            .iter()
            .map(|p| PackListing {
                pack: p.clone(),
                is_active: self.active_pack_id.as_deref() == Some(p.id.as_str()),
            })
            .collect()
    }

    pub fn listing(&self, id: &str) -> Option<PackListing> {
        self.pack(id).map(|p| PackListing {
            pack: p.clone(),
            is_active: self.active_pack_id.as_deref() == Some(id),
        })
    }

    pub fn set_active(&mut self, id: &str) -> Result<()> {
        if self.pack(id).is_none() {
            return Err(RadioError::pack_not_found(id));
        }
        self.active_pack_id = Some(id.to_string());
        Ok(())
    }

    /// Create a pack; the very first pack becomes active.
    pub fn create_pack(&mut self, name: &str) -> Result<Pack> {
        let pack = Pack::new(name)?;
        self.packs.push(pack.clone());
        if self.active_pack_id.is_none() {
            self.active_pack_id = Some(pack.id.clone());
        }
        Ok(pack)
    }

    pub fn rename_pack(&mut self, id: &str, name: &str) -> Result<Pack> {
        let name = validate_name(name)?;
        let pack = self.pack_mut(id)?;
        pack.name = name;
        Ok(pack.clone())
    }

    /// Replace the whole station list of a pack (ids are kept when given).
    pub fn replace_stations(&mut self, id: &str, stations: Vec<StationDraft>) -> Result<Pack> {
        let mut built = Vec::with_capacity(stations.len());
        for draft in stations {
            let mut station = Station::new(&draft.name, &draft.url, draft.source_kind)?;
            if let Some(sid) = draft.id.filter(|s| !s.trim().is_empty()) {
                station.id = sid;
            }
            if built.iter().any(|s: &Station| s.id == station.id) {
                return Err(RadioError::Validation(format!(
                    "duplicate station id {}",
                    station.id
                )));
            }
            built.push(station);
        }
        let pack = self.pack_mut(id)?;
        pack.stations = built;
        Ok(pack.clone())
    }

    /// Remove a pack.  Deleting the active pack moves the pointer to the first
    /// remaining pack (or clears it).
    pub fn delete_pack(&mut self, id: &str) -> Result<Pack> {
        let idx = self
            .packs
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| RadioError::pack_not_found(id))?;
        let removed = self.packs.remove(idx);
        if self.active_pack_id.as_deref() == Some(id) {
            self.active_pack_id = self.packs.first().map(|p| p.id.clone());
        }
        Ok(removed)
    }

    pub fn add_station(
        &mut self,
        pack_id: &str,
        name: &str,
        url: &str,
        kind: Option<SourceKind>,
    ) -> Result<Station> {
        let station = Station::new(name, url, kind)?;
        self.pack_mut(pack_id)?.stations.push(station.clone());
        Ok(station)
    }

    pub fn update_station(
        &mut self,
        pack_id: &str,
        station_id: &str,
        patch: StationPatch,
    ) -> Result<Station> {
        let name = patch.name.as_deref().map(validate_name).transpose()?;
        let url = patch.url.as_deref().map(validate_url).transpose()?;
        let pack = self.pack_mut(pack_id)?;
        let station = pack
            .stations
            .iter_mut()
            .find(|s| s.id == station_id)
            .ok_or_else(|| RadioError::station_not_found(station_id))?;
        if let Some(name) = name {
            station.name = name;
        }
        if let Some(url) = url {
            station.url = url;
        }
        if let Some(kind) = patch.source_kind {
            station.source_kind = kind;
        }
        Ok(station.clone())
    }

    /// Remove a station, returning it with its former 1-based position.
    pub fn delete_station(&mut self, pack_id: &str, station_id: &str) -> Result<(usize, Station)> {
        let pack = self.pack_mut(pack_id)?;
        let pos = pack
            .stations
            .iter()
            .position(|s| s.id == station_id)
            .ok_or_else(|| RadioError::station_not_found(station_id))?;
        Ok((pos + 1, pack.stations.remove(pos)))
    }

    /// Reorder by id.  Unknown ids are ignored; stations not mentioned keep
    /// their relative order after the listed ones.
    pub fn reorder_stations(&mut self, pack_id: &str, station_ids: &[String]) -> Result<Pack> {
        let pack = self.pack_mut(pack_id)?;
        let mut remaining = std::mem::take(&mut pack.stations);
        let mut ordered = Vec::with_capacity(remaining.len());
        for sid in station_ids {
            if let Some(pos) = remaining.iter().position(|s| &s.id == sid) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        pack.stations = ordered;
        Ok(pack.clone())
    }
}

/// Station as submitted in a bulk pack update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
}

// ── persisted record shapes ───────────────────────────────────────────────────

/// On-disk shape of the packs file.  Every field is optional so hand-edited
/// files load instead of failing wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(default)]
    pub packs: Vec<PackRecord>,
    #[serde(default)]
    pub active_pack_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stations: Vec<StationRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
}

// ── validation ────────────────────────────────────────────────────────────────

pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RadioError::Validation("name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

pub fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed)
        .map_err(|e| RadioError::Validation(format!("malformed url {:?}: {}", trimmed, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RadioError::Validation(format!(
            "url must be http(s) with a host: {}",
            trimmed
        )));
    }
    Ok(trimmed.to_string())
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
