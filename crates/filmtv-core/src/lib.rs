//! Core domain model for the film-on-TV guide pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "filmtv-core";

/// Catalog entry mirrored from the external title dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub id: String,
    pub primary_title: String,
    pub year: Option<i32>,
    /// Tenths of a point, 87 = 8.7.
    pub rating: Option<i32>,
    pub votes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateTitle {
    pub title_id: String,
    pub alternate_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub code: String,
    pub name: String,
    pub logo_small: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Movie,
    Short,
    Series,
}

impl ContentKind {
    pub fn as_i64(self) -> i64 {
        match self {
            ContentKind::Movie => 1,
            ContentKind::Short => 2,
            ContentKind::Series => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ContentKind::Movie),
            2 => Some(ContentKind::Short),
            3 => Some(ContentKind::Series),
            _ => None,
        }
    }
}

/// Outcome of the content certification lookup for one event.
///
/// `Unchecked` events are eligible for a lookup; `Absent` and `Present` are
/// terminal and never queried again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum Certification {
    #[default]
    Unchecked,
    Absent,
    Present(String),
}

impl Certification {
    pub fn status(&self) -> &'static str {
        match self {
            Certification::Unchecked => "unchecked",
            Certification::Absent => "absent",
            Certification::Present(_) => "present",
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Certification::Present(code) => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_unchecked(&self) -> bool {
        matches!(self, Certification::Unchecked)
    }

    /// Rebuild from the persisted `(status, code)` column pair. Unknown
    /// statuses and a `present` row without a code fall back to `Unchecked`.
    pub fn from_columns(status: &str, code: Option<String>) -> Self {
        match (status, code) {
            ("absent", _) => Certification::Absent,
            ("present", Some(code)) if !code.is_empty() => Certification::Present(code),
            _ => Certification::Unchecked,
        }
    }

    /// Classify a provider answer: an empty code counts as not found.
    pub fn from_lookup(code: Option<String>) -> Self {
        match code {
            Some(code) if !code.trim().is_empty() => Certification::Present(code.trim().to_string()),
            _ => Certification::Absent,
        }
    }
}

/// Resolution of an event against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogLink {
    pub catalog_id: String,
    pub rating: Option<i32>,
    pub votes: Option<i64>,
}

impl From<&Title> for CatalogLink {
    fn from(title: &Title) -> Self {
        Self {
            catalog_id: title.id.clone(),
            rating: title.rating,
            votes: title.votes,
        }
    }
}

/// Schedule fields of one broadcast as produced by a guide adapter.
///
/// Holds the channel code only; the owning batch carries the channel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEventDraft {
    pub id: i64,
    pub channel_code: String,
    pub title: String,
    pub year: Option<i32>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub kind: ContentKind,
    /// Seconds, as reported by the provider.
    pub duration: Option<i64>,
    pub genre: Option<String>,
    pub content: Option<String>,
    pub opinion: Option<String>,
    pub poster_small: Option<String>,
    pub poster_medium: Option<String>,
    pub provider_url: Option<String>,
}

impl BroadcastEventDraft {
    pub fn has_valid_timing(&self) -> bool {
        self.end_time > self.start_time
    }
}

/// Persisted broadcast: schedule plus resolution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub schedule: BroadcastEventDraft,
    pub catalog: Option<CatalogLink>,
    pub certification: Certification,
}

impl BroadcastEvent {
    pub fn new(schedule: BroadcastEventDraft) -> Self {
        Self {
            schedule,
            catalog: None,
            certification: Certification::Unchecked,
        }
    }

    pub fn id(&self) -> i64 {
        self.schedule.id
    }

    pub fn catalog_id(&self) -> Option<&str> {
        self.catalog.as_ref().map(|link| link.catalog_id.as_str())
    }
}
