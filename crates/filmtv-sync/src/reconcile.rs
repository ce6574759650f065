use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use filmtv_adapters::GuideBatch;
use filmtv_core::BroadcastEvent;
use filmtv_storage::BroadcastRepository;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub date: NaiveDate,
    pub trimmed: u64,
    pub channels: usize,
    pub removed: usize,
    pub updated: usize,
    pub inserted: usize,
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// Converges the current store to one freshly fetched day of guide data.
pub struct GuideReconciler<'p> {
    pool: &'p SqlitePool,
}

impl<'p> GuideReconciler<'p> {
    pub fn new(pool: &'p SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply `batch` for `date` in one transaction: drop events that started
    /// before `today`, upsert channels, delete events of `date` missing from
    /// the batch and upsert the batch events. Catalog links and
    /// certifications of surviving events are kept.
    pub async fn reconcile_day(
        &self,
        date: NaiveDate,
        today: NaiveDate,
        batch: &GuideBatch,
    ) -> Result<ReconcileSummary> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("starting reconciliation for {date}"))?;
        let mut store = BroadcastRepository::new(&mut tx);

        let trimmed = store.delete_started_before(day_start(today)).await?;

        for channel in batch.channels.values() {
            store.upsert_channel(channel).await?;
        }

        let incoming: BTreeSet<i64> = batch.events.iter().map(|e| e.id).collect();
        let next_day = date.succ_opt().unwrap_or(date);
        let existing = store
            .event_ids_between(day_start(date), day_start(next_day))
            .await?;
        let mut removed = 0;
        for id in existing.into_iter().filter(|id| !incoming.contains(id)) {
            if store.delete_event(id).await? {
                debug!(id, %date, "removed event no longer in guide");
                removed += 1;
            }
        }

        let mut updated = 0;
        let mut inserted = 0;
        for draft in &batch.events {
            if store.event_exists(draft.id).await? {
                store.update_schedule(draft).await?;
                updated += 1;
            } else {
                store.insert_event(&BroadcastEvent::new(draft.clone())).await?;
                inserted += 1;
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("committing reconciliation for {date}"))?;

        let summary = ReconcileSummary {
            date,
            trimmed,
            channels: batch.channels.len(),
            removed,
            updated,
            inserted,
        };
        info!(
            %date,
            trimmed,
            removed,
            updated,
            inserted,
            "reconciled guide day"
        );
        Ok(summary)
    }
}
