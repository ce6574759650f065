use anyhow::{bail, Context, Result};
use filmtv_adapters::{CertificationSource, GuideContext};
use filmtv_core::{BroadcastEvent, BroadcastEventDraft, CatalogLink, Certification, Title};
use filmtv_storage::{BroadcastRepository, CatalogRepository, HttpFetcher};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// One step of the title hunt. Stages are tried in [`MatchStage::ordered`]
/// order and the first hit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum MatchStage {
    ExactPrimary,
    ExactAlternate,
    TolerantPrimary { years: u32 },
    TolerantAlternate { years: u32 },
}

impl MatchStage {
    pub fn ordered(year_tolerance: u32) -> [MatchStage; 4] {
        [
            MatchStage::ExactPrimary,
            MatchStage::ExactAlternate,
            MatchStage::TolerantPrimary { years: year_tolerance },
            MatchStage::TolerantAlternate { years: year_tolerance },
        ]
    }

    pub fn index(self) -> usize {
        match self {
            MatchStage::ExactPrimary => 0,
            MatchStage::ExactAlternate => 1,
            MatchStage::TolerantPrimary { .. } => 2,
            MatchStage::TolerantAlternate { .. } => 3,
        }
    }

    pub async fn try_match(
        self,
        event: &BroadcastEventDraft,
        catalog: &mut CatalogRepository<'_>,
    ) -> Result<Option<Title>> {
        match self {
            MatchStage::ExactPrimary => catalog.find_by_primary(&event.title, event.year, 0).await,
            MatchStage::ExactAlternate => {
                catalog.find_by_alternate(&event.title, event.year, 0).await
            }
            MatchStage::TolerantPrimary { years } => {
                catalog.find_by_primary(&event.title, event.year, years).await
            }
            MatchStage::TolerantAlternate { years } => {
                catalog.find_by_alternate(&event.title, event.year, years).await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    /// Already linked events whose rating and votes were re-read.
    pub refreshed: usize,
    pub matched_by_stage: [usize; 4],
    pub unmatched: usize,
    pub certifications_checked: usize,
}

impl MatchSummary {
    pub fn matched(&self) -> usize {
        self.matched_by_stage.iter().sum()
    }
}

/// Certification provider plus the client and run context used to query it.
#[derive(Clone, Copy)]
pub struct CertificationLookup<'a> {
    pub source: &'a dyn CertificationSource,
    pub http: &'a HttpFetcher,
    pub ctx: &'a GuideContext,
}

impl CertificationLookup<'_> {
    /// A failed lookup is recorded as absent so it is not retried.
    pub async fn check(&self, catalog_id: &str) -> Certification {
        match self.source.lookup(self.http, self.ctx, catalog_id).await {
            Ok(code) => Certification::from_lookup(code),
            Err(err) => {
                warn!(catalog_id, error = %err, "certification lookup failed");
                Certification::Absent
            }
        }
    }
}

/// Links stored broadcast events to catalog titles.
pub struct IdentityMatcher<'a> {
    current: &'a SqlitePool,
    catalog: &'a SqlitePool,
    year_tolerance: u32,
    certification: Option<CertificationLookup<'a>>,
}

impl<'a> IdentityMatcher<'a> {
    pub fn new(current: &'a SqlitePool, catalog: &'a SqlitePool, year_tolerance: u32) -> Self {
        Self {
            current,
            catalog,
            year_tolerance,
            certification: None,
        }
    }

    pub fn with_certification(mut self, lookup: Option<CertificationLookup<'a>>) -> Self {
        self.certification = lookup;
        self
    }

    pub async fn run(&self) -> Result<MatchSummary> {
        let mut catalog_conn = self
            .catalog
            .acquire()
            .await
            .context("acquiring catalog connection")?;
        let mut catalog = CatalogRepository::new(&mut catalog_conn);
        let mut tx = self.current.begin().await.context("starting match transaction")?;
        let mut store = BroadcastRepository::new(&mut tx);

        let stages = MatchStage::ordered(self.year_tolerance);
        let mut summary = MatchSummary::default();

        for event in store.list_events().await? {
            let id = event.id();
            let catalog_id = match event.catalog_id() {
                Some(catalog_id) => {
                    match catalog.get_title(catalog_id).await? {
                        Some(title) => {
                            store.set_catalog_link(id, &CatalogLink::from(&title)).await?;
                            summary.refreshed += 1;
                        }
                        None => warn!(id, catalog_id, "linked title missing from catalog"),
                    }
                    catalog_id.to_string()
                }
                None => {
                    let Some((stage, title)) =
                        first_match(&stages, &event.schedule, &mut catalog).await?
                    else {
                        info!(id, title = %event.schedule.title, year = ?event.schedule.year, "no catalog match");
                        summary.unmatched += 1;
                        continue;
                    };
                    debug!(id, catalog_id = %title.id, ?stage, "matched");
                    store.set_catalog_link(id, &CatalogLink::from(&title)).await?;
                    summary.matched_by_stage[stage.index()] += 1;
                    title.id
                }
            };

            if let Some(lookup) = &self.certification {
                if event.certification.is_unchecked() {
                    let certification = lookup.check(&catalog_id).await;
                    store.set_certification(id, &certification).await?;
                    summary.certifications_checked += 1;
                }
            }
        }

        tx.commit().await.context("committing match results")?;
        info!(
            refreshed = summary.refreshed,
            matched = summary.matched(),
            unmatched = summary.unmatched,
            certifications = summary.certifications_checked,
            "identity matching finished"
        );
        Ok(summary)
    }

    /// Link `event_id` to `catalog_id` regardless of what the stages would
    /// pick. The certification is re-checked even when already known.
    pub async fn assign_manual(&self, event_id: i64, catalog_id: &str) -> Result<BroadcastEvent> {
        let title = {
            let mut conn = self
                .catalog
                .acquire()
                .await
                .context("acquiring catalog connection")?;
            CatalogRepository::new(&mut conn).get_title(catalog_id).await?
        };
        let Some(title) = title else {
            bail!("catalog has no title {catalog_id}");
        };

        let mut tx = self.current.begin().await.context("starting manual match")?;
        let mut store = BroadcastRepository::new(&mut tx);
        if !store.event_exists(event_id).await? {
            bail!("no broadcast event with id {event_id}");
        }
        store.set_catalog_link(event_id, &CatalogLink::from(&title)).await?;
        if let Some(lookup) = &self.certification {
            let certification = lookup.check(&title.id).await;
            store.set_certification(event_id, &certification).await?;
        }
        let event = store
            .get_event(event_id)
            .await?
            .with_context(|| format!("reloading event {event_id}"))?;
        tx.commit().await.context("committing manual match")?;

        info!(event_id, catalog_id, "manually linked event");
        Ok(event)
    }
}

async fn first_match(
    stages: &[MatchStage],
    event: &BroadcastEventDraft,
    catalog: &mut CatalogRepository<'_>,
) -> Result<Option<(MatchStage, Title)>> {
    for &stage in stages {
        if let Some(title) = stage.try_match(event, catalog).await? {
            return Ok(Some((stage, title)));
        }
    }
    Ok(None)
}
