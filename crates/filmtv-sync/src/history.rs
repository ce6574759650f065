use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use filmtv_storage::BroadcastRepository;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub channels: usize,
    pub pruned: u64,
    pub archived: usize,
    /// Start time of the earliest archived event; history from here on was replaced.
    pub boundary: Option<NaiveDateTime>,
}

/// Forks upcoming broadcasts of the current store into the append-only
/// history store. History rows get their own ids.
pub struct HistoryArchiver<'p> {
    current: &'p SqlitePool,
    history: &'p SqlitePool,
}

impl<'p> HistoryArchiver<'p> {
    pub fn new(current: &'p SqlitePool, history: &'p SqlitePool) -> Self {
        Self { current, history }
    }

    pub async fn archive(&self, now: NaiveDateTime) -> Result<ArchiveSummary> {
        let (channels, upcoming) = {
            let mut conn = self
                .current
                .acquire()
                .await
                .context("acquiring current store connection")?;
            let mut current = BroadcastRepository::new(&mut conn);
            (current.list_channels().await?, current.events_starting_from(now).await?)
        };

        let mut tx = self.history.begin().await.context("starting history archive")?;
        let mut history = BroadcastRepository::new(&mut tx);
        for channel in &channels {
            history.upsert_channel(channel).await?;
        }

        let mut summary = ArchiveSummary {
            channels: channels.len(),
            ..ArchiveSummary::default()
        };

        if let Some(boundary) = upcoming.first().map(|event| event.schedule.start_time) {
            let mut last_id = history.max_event_id().await?.unwrap_or(0);
            summary.pruned = history.delete_started_from(boundary).await?;
            for event in &upcoming {
                last_id += 1;
                let mut copy = event.clone();
                copy.schedule.id = last_id;
                copy.schedule.provider_url = None;
                history.insert_event(&copy).await?;
            }
            summary.archived = upcoming.len();
            summary.boundary = Some(boundary);
        }

        tx.commit().await.context("committing history archive")?;
        info!(
            channels = summary.channels,
            pruned = summary.pruned,
            archived = summary.archived,
            boundary = ?summary.boundary,
            "history archived"
        );
        Ok(summary)
    }
}
