//! Guide provider and certification provider adapters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, Utc};
use filmtv_core::{BroadcastEventDraft, Channel, ContentKind};
use filmtv_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "filmtv-adapters";

pub const HUMO_DEFAULT_BASE_URL: &str = "http://www.humo.be/api/epg/humosite/schedule/main";
pub const TMDB_DEFAULT_BASE_URL: &str = "https://api.themoviedb.org";

/// Entries shorter than this are classified as shorts.
const SHORT_MAX_SECONDS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedGuide {
    pub date: NaiveDate,
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// One date of guide data: the channel table plus the in-scope events,
/// each referring to its channel by code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuideBatch {
    pub date: Option<NaiveDate>,
    pub channels: BTreeMap<String, Channel>,
    pub events: Vec<BroadcastEventDraft>,
    /// Entries dropped because required fields were missing or invalid.
    pub dropped_entries: usize,
}

#[derive(Debug, Error)]
pub enum GuideError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable guide document for {date}: {reason}")]
    Document { date: NaiveDate, reason: String },
    #[error("certification lookup for {catalog_id} failed: {reason}")]
    Certification { catalog_id: String, reason: String },
}

#[async_trait]
pub trait GuideSource: Send + Sync {
    fn provider_id(&self) -> &'static str;

    fn document_url(&self, date: NaiveDate) -> String;

    async fn fetch_document(
        &self,
        http: &HttpFetcher,
        ctx: &GuideContext,
        date: NaiveDate,
    ) -> Result<FetchedGuide, GuideError> {
        let url = self.document_url(date);
        let response = http.fetch_bytes(ctx.run_id, self.provider_id(), &url).await?;
        Ok(FetchedGuide {
            date,
            url: response.final_url,
            body: response.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_document(&self, document: &FetchedGuide) -> Result<GuideBatch, GuideError>;
}

/// Adapter for the Humo EPG schedule API.
#[derive(Debug, Clone)]
pub struct HumoGuideAdapter {
    base_url: String,
    utc_offset: Option<FixedOffset>,
}

impl HumoGuideAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            utc_offset: None,
        }
    }

    /// Convert timestamps with a fixed offset instead of the host time zone.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = Some(offset);
        self
    }

    fn to_local(&self, epoch_seconds: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::<Utc>::from_timestamp(epoch_seconds, 0)?;
        Some(match self.utc_offset {
            Some(offset) => utc.with_timezone(&offset).naive_local(),
            None => utc.with_timezone(&Local).naive_local(),
        })
    }

    fn parse_entry(
        &self,
        channel_code: &str,
        entry: &JsonValue,
    ) -> Result<Option<BroadcastEventDraft>, String> {
        let labels = json_string_vec(entry, &["labels"]);
        let genres = json_string_vec(entry, &["program", "genres"]);
        let episode = json_i64(entry, &["program", "episodenumber"]).unwrap_or(0);
        let is_film = labels.iter().any(|label| label == "film");
        let is_season_opener = episode == 1 && genres.iter().any(|g| g.starts_with("serie-"));
        if !is_film && !is_season_opener {
            return Ok(None);
        }

        let id = json_i64(entry, &["id"]).ok_or("missing id")?;
        let title = json_str(entry, &["program", "title"])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| format!("entry {id} has no title"))?;
        let start_epoch = json_i64(entry, &["starttime"])
            .ok_or_else(|| format!("entry {id} has no start time"))?;
        let end_epoch =
            json_i64(entry, &["endtime"]).ok_or_else(|| format!("entry {id} has no end time"))?;
        let start_time = self
            .to_local(start_epoch)
            .ok_or_else(|| format!("entry {id} has out of range start time"))?;
        let end_time = self
            .to_local(end_epoch)
            .ok_or_else(|| format!("entry {id} has out of range end time"))?;

        let kind = if end_epoch - start_epoch < SHORT_MAX_SECONDS {
            ContentKind::Short
        } else if is_film {
            ContentKind::Movie
        } else {
            ContentKind::Series
        };

        let year = json_i64(entry, &["program", "year"])
            .filter(|y| *y > 0)
            .and_then(|y| i32::try_from(y).ok());
        let season = json_i64(entry, &["program", "episodeseason"]).unwrap_or(0);
        let genre = describe(
            json_str(entry, &["program", "description"]),
            year,
            (is_season_opener && season != 0).then_some(season),
        );
        let opinion = render_opinion(
            json_i64(entry, &["program", "appreciation"]),
            json_str(entry, &["program", "opinion"]),
        );
        let program_media = json_array(entry, &["program", "media"]);

        let draft = BroadcastEventDraft {
            id,
            channel_code: channel_code.to_string(),
            title: title.to_string(),
            year,
            start_time,
            end_time,
            kind,
            duration: json_i64(entry, &["properties", "eventduration"]),
            genre,
            content: non_empty(json_str(entry, &["program", "content_long"])),
            opinion,
            poster_small: media_url(program_media, "epg_program", "small"),
            poster_medium: media_url(program_media, "epg_program", "medium"),
            provider_url: non_empty(json_str(entry, &["url"])),
        };
        if !draft.has_valid_timing() {
            return Err(format!("entry {id} does not end after it starts"));
        }
        Ok(Some(draft))
    }
}

impl Default for HumoGuideAdapter {
    fn default() -> Self {
        Self::new(HUMO_DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl GuideSource for HumoGuideAdapter {
    fn provider_id(&self) -> &'static str {
        "humo"
    }

    fn document_url(&self, date: NaiveDate) -> String {
        format!("{}/{}/full", self.base_url, date.format("%Y-%m-%d"))
    }

    fn parse_document(&self, document: &FetchedGuide) -> Result<GuideBatch, GuideError> {
        let root: JsonValue =
            serde_json::from_slice(&document.body).map_err(|err| GuideError::Document {
                date: document.date,
                reason: err.to_string(),
            })?;
        let broadcasters = root
            .get("broadcasters")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| GuideError::Document {
                date: document.date,
                reason: "missing broadcasters array".to_string(),
            })?;

        let mut batch = GuideBatch {
            date: Some(document.date),
            ..GuideBatch::default()
        };

        for broadcaster in broadcasters {
            let Some(code) = non_empty(json_str(broadcaster, &["code"])) else {
                warn!(date = %document.date, "skipping broadcaster without code");
                continue;
            };

            let mut kept = Vec::new();
            for entry in json_array(broadcaster, &["events"]) {
                match self.parse_entry(&code, entry) {
                    Ok(Some(draft)) => kept.push(draft),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(date = %document.date, channel = %code, %reason, "dropping guide entry");
                        batch.dropped_entries += 1;
                    }
                }
            }
            if kept.is_empty() {
                continue;
            }

            let channel = Channel {
                name: non_empty(json_str(broadcaster, &["display_name"]))
                    .unwrap_or_else(|| code.clone()),
                logo_small: media_url(json_array(broadcaster, &["media"]), "epg_logo", "small"),
                code: code.clone(),
            };
            debug!(channel = %code, events = kept.len(), "parsed broadcaster");
            batch.channels.insert(code, channel);
            batch.events.extend(kept);
        }

        Ok(batch)
    }
}

/// Star rendering for a 1..=50 appreciation score: one star per ten points
/// plus a half star for any remainder.
pub fn render_stars(appreciation: i64) -> Option<String> {
    if !(1..=50).contains(&appreciation) {
        return None;
    }
    let mut stars = "★".repeat((appreciation / 10) as usize);
    if appreciation % 10 > 0 {
        stars.push('½');
    }
    Some(stars)
}

fn render_opinion(appreciation: Option<i64>, opinion: Option<&str>) -> Option<String> {
    let opinion = non_empty(opinion);
    match (appreciation.and_then(render_stars), opinion) {
        (Some(stars), Some(text)) => Some(format!("{stars} {text}")),
        (Some(stars), None) => Some(stars),
        (None, text) => text,
    }
}

fn describe(description: Option<&str>, year: Option<i32>, season: Option<i64>) -> Option<String> {
    let mut text = description.unwrap_or_default().to_string();
    if let Some(year) = year {
        text = text.replace(&format!(" ({year})"), "");
    }
    if let Some(season) = season {
        text.push_str(&format!(" (SERIE: begin van seizoen {season})"));
    }
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Integers arrive as numbers or numeric strings; anything else is absent.
fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_array(value, path)
        .iter()
        .filter_map(|v| v.as_str().map(ToString::to_string))
        .collect()
}

fn media_url(media: &[JsonValue], link_type: &str, size: &str) -> Option<String> {
    media
        .iter()
        .find(|m| json_str(m, &["link_type"]) == Some(link_type))
        .and_then(|m| non_empty(json_str(m, &["resized_urls", size])))
}

/// Content certification lookup keyed by catalog identifier.
#[async_trait]
pub trait CertificationSource: Send + Sync {
    /// `Ok(None)` when the provider has no certification for the title.
    async fn lookup(
        &self,
        http: &HttpFetcher,
        ctx: &GuideContext,
        catalog_id: &str,
    ) -> Result<Option<String>, GuideError>;
}

/// The Movie Database release-date certifications, restricted to one country.
/// Codes are stored as `{country}:{certification}`, e.g. `US:PG-13`.
#[derive(Debug, Clone)]
pub struct TmdbCertificationSource {
    base_url: String,
    api_key: String,
    country: String,
}

impl TmdbCertificationSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            country: country.into().to_ascii_uppercase(),
        }
    }

    fn release_dates_url(&self, catalog_id: &str) -> String {
        format!(
            "{}/3/movie/{}/release_dates?api_key={}",
            self.base_url, catalog_id, self.api_key
        )
    }

    fn certification_from(&self, body: &JsonValue) -> Option<String> {
        json_array(body, &["results"])
            .iter()
            .filter(|r| json_str(r, &["iso_3166_1"]) == Some(self.country.as_str()))
            .flat_map(|r| json_array(r, &["release_dates"]))
            .find_map(|d| non_empty(json_str(d, &["certification"])))
            .map(|code| format!("{}:{}", self.country, code))
    }
}

#[async_trait]
impl CertificationSource for TmdbCertificationSource {
    async fn lookup(
        &self,
        http: &HttpFetcher,
        ctx: &GuideContext,
        catalog_id: &str,
    ) -> Result<Option<String>, GuideError> {
        let url = self.release_dates_url(catalog_id);
        let response = match http.fetch_bytes(ctx.run_id, "tmdb", &url).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let body: JsonValue =
            serde_json::from_slice(&response.body).map_err(|err| GuideError::Certification {
                catalog_id: catalog_id.to_string(),
                reason: err.to_string(),
            })?;
        Ok(self.certification_from(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use filmtv_storage::HttpClientConfig;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn utc_adapter() -> HumoGuideAdapter {
        HumoGuideAdapter::default().with_utc_offset(FixedOffset::east_opt(0).unwrap())
    }

    fn guide(date: NaiveDate, body: &str) -> FetchedGuide {
        FetchedGuide {
            date,
            url: "fixture".into(),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        }
    }

    fn fixture_batch() -> GuideBatch {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let body = std::fs::read_to_string(workspace_root().join("fixtures/humo/2026-10-16.json"))
            .expect("read fixture");
        utc_adapter().parse_document(&guide(date, &body)).expect("parse fixture")
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
    }

    fn ctx() -> GuideContext {
        GuideContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn document_url_uses_iso_date() {
        let adapter = HumoGuideAdapter::new("http://guide.example/schedule/");
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert_eq!(
            adapter.document_url(date),
            "http://guide.example/schedule/2026-01-05/full"
        );
    }

    #[test]
    fn fixture_keeps_films_and_season_openers_only() {
        let batch = fixture_batch();
        let ids: Vec<i64> = batch.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1001, 2001, 2002]);
        assert_eq!(batch.channels.keys().cloned().collect::<Vec<_>>(), vec!["canvas", "een"]);
        assert_eq!(batch.dropped_entries, 1);
    }

    #[test]
    fn film_entry_is_fully_adapted() {
        let batch = fixture_batch();
        let matrix = &batch.events[0];
        assert_eq!(matrix.channel_code, "een");
        assert_eq!(matrix.title, "The Matrix");
        assert_eq!(matrix.year, Some(1999));
        assert_eq!(matrix.start_time, at(20, 30));
        assert_eq!(matrix.end_time, at(22, 25));
        assert_eq!(matrix.kind, ContentKind::Movie);
        assert_eq!(matrix.duration, Some(6900));
        assert_eq!(
            matrix.genre.as_deref(),
            Some("Sciencefictionfilm van Lana en Lilly Wachowski")
        );
        assert_eq!(
            matrix.opinion.as_deref(),
            Some("★★★½ Baanbrekende sciencefiction.")
        );
        assert_eq!(
            matrix.poster_medium.as_deref(),
            Some("https://images.example/matrix-m.jpg")
        );
        assert_eq!(
            matrix.provider_url.as_deref(),
            Some("https://www.humo.be/tv-gids/een/1001")
        );

        let een = &batch.channels["een"];
        assert_eq!(een.name, "Eén");
        assert_eq!(
            een.logo_small.as_deref(),
            Some("https://images.example/een-small.png")
        );
        assert_eq!(batch.channels["canvas"].logo_small, None);
    }

    #[test]
    fn season_opener_gets_marker_and_series_kind() {
        let batch = fixture_batch();
        let crown = batch.events.iter().find(|e| e.id == 2001).unwrap();
        assert_eq!(crown.kind, ContentKind::Series);
        assert_eq!(
            crown.genre.as_deref(),
            Some("Britse dramaserie (SERIE: begin van seizoen 3)")
        );
        assert_eq!(crown.opinion, None);
    }

    #[test]
    fn short_entry_tolerates_stringly_typed_numbers() {
        let batch = fixture_batch();
        let short = batch.events.iter().find(|e| e.id == 2002).unwrap();
        assert_eq!(short.kind, ContentKind::Short);
        assert_eq!(short.year, Some(2019));
        assert_eq!(short.duration, Some(2400));
        assert_eq!(short.opinion.as_deref(), Some("½"));
    }

    #[test]
    fn wrong_typed_fields_are_left_empty() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let body = r#"{"broadcasters":[{"code":"x","display_name":42,"media":"nope","events":[
            {"id":"7","starttime":1792182600,"endtime":1792189500,"labels":["film"],
             "program":{"title":"Odd","year":{"v":1},"appreciation":"abc","opinion":["x"],"media":7}}]}]}"#;
        let batch = utc_adapter().parse_document(&guide(date, body)).unwrap();
        let event = &batch.events[0];
        assert_eq!(event.id, 7);
        assert_eq!(event.year, None);
        assert_eq!(event.opinion, None);
        assert_eq!(event.poster_small, None);
        assert_eq!(batch.channels["x"].name, "x");
    }

    #[test]
    fn entries_ending_before_they_start_are_dropped() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let body = r#"{"broadcasters":[{"code":"x","events":[
            {"id":1,"starttime":1792189500,"endtime":1792182600,"labels":["film"],"program":{"title":"Backwards"}}]}]}"#;
        let batch = utc_adapter().parse_document(&guide(date, body)).unwrap();
        assert!(batch.events.is_empty());
        assert!(batch.channels.is_empty());
        assert_eq!(batch.dropped_entries, 1);
    }

    #[test]
    fn zero_length_entries_are_dropped() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let body = r#"{"broadcasters":[{"code":"x","events":[
            {"id":1,"starttime":1792182600,"endtime":1792182600,"labels":["film"],"program":{"title":"Instant"}},
            {"id":2,"starttime":1792182600,"endtime":1792189500,"labels":["film"],"program":{"title":"Kept"}}]}]}"#;
        let batch = utc_adapter().parse_document(&guide(date, body)).unwrap();
        let ids: Vec<i64> = batch.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(batch.dropped_entries, 1);
    }

    #[test]
    fn undecodable_documents_fail() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        for body in ["<html>", "{\"platform\":\"x\"}", "[]"] {
            let err = utc_adapter().parse_document(&guide(date, body)).unwrap_err();
            assert!(matches!(err, GuideError::Document { .. }), "{body}");
        }
    }

    #[test]
    fn stars_cover_whole_and_half_points() {
        assert_eq!(render_stars(0), None);
        assert_eq!(render_stars(8).as_deref(), Some("½"));
        assert_eq!(render_stars(30).as_deref(), Some("★★★"));
        assert_eq!(render_stars(45).as_deref(), Some("★★★★½"));
        assert_eq!(render_stars(50).as_deref(), Some("★★★★★"));
        assert_eq!(render_stars(51), None);
    }

    #[tokio::test]
    async fn fetch_document_reads_body_for_date() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/schedule/2026-10-16/full")
            .with_status(200)
            .with_body(r#"{"broadcasters":[]}"#)
            .create_async()
            .await;
        let adapter = HumoGuideAdapter::new(format!("{}/schedule", server.url()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();

        let fetched = adapter.fetch_document(&http, &ctx(), date).await.unwrap();
        let batch = adapter.parse_document(&fetched).unwrap();

        assert!(batch.events.is_empty());
        assert_eq!(batch.date, Some(date));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn tmdb_returns_country_certification() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/3/movie/tt0133093/release_dates")
            .match_query(mockito::Matcher::UrlEncoded("api_key".into(), "secret".into()))
            .with_status(200)
            .with_body(
                r#"{"id":603,"results":[
                    {"iso_3166_1":"BE","release_dates":[{"certification":"KT"}]},
                    {"iso_3166_1":"US","release_dates":[{"certification":""},{"certification":"R"}]}
                ]}"#,
            )
            .create_async()
            .await;
        let source = TmdbCertificationSource::new(server.url(), "secret", "us");
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let code = source.lookup(&http, &ctx(), "tt0133093").await.unwrap();

        assert_eq!(code.as_deref(), Some("US:R"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn tmdb_not_found_is_no_certification() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let source = TmdbCertificationSource::new(server.url(), "secret", "US");
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        assert_eq!(source.lookup(&http, &ctx(), "tt404").await.unwrap(), None);
    }
}
