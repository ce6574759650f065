//! Guide sync pipeline: catalog import, per-day guide reconciliation,
//! identity matching and history archiving.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Utc};
use filmtv_adapters::{
    CertificationSource, GuideContext, GuideSource, HumoGuideAdapter, TmdbCertificationSource,
};
use filmtv_core::BroadcastEvent;
use filmtv_storage::{
    connect, migrate_broadcast, migrate_catalog, ArtifactStore, HttpFetcher,
};
use sqlx::SqlitePool;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod history;
pub mod import;
pub mod matcher;
pub mod reconcile;
pub mod report;
pub mod rules;

pub use config::{CertificationConfig, ConfigError, SyncConfig};
pub use history::{ArchiveSummary, HistoryArchiver};
pub use import::{CatalogImportSummary, CatalogImporter};
pub use matcher::{CertificationLookup, IdentityMatcher, MatchStage, MatchSummary};
pub use reconcile::{GuideReconciler, ReconcileSummary};
pub use report::{DayReport, RunReport, RunStatus};
pub use rules::{RulesError, RulesOutcome, TitleRules};

pub const CRATE_NAME: &str = "filmtv-sync";

/// The three databases, opened and migrated.
pub struct Stores {
    pub current: SqlitePool,
    pub catalog: SqlitePool,
    pub history: SqlitePool,
}

impl Stores {
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        let stores = Self {
            current: connect(&config.current_db_url).await?,
            catalog: connect(&config.catalog_db_url).await?,
            history: connect(&config.history_db_url).await?,
        };
        stores.migrate().await?;
        Ok(stores)
    }

    pub async fn migrate(&self) -> Result<()> {
        migrate_broadcast(&self.current).await?;
        migrate_catalog(&self.catalog).await?;
        migrate_broadcast(&self.history).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub report: RunReport,
    pub reports_dir: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    guide: Box<dyn GuideSource>,
    certification: Option<Box<dyn CertificationSource>>,
    rules: TitleRules,
    artifact_store: Option<ArtifactStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let guide: Box<dyn GuideSource> = Box::new(HumoGuideAdapter::new(&config.guide_base_url));
        let certification = config.certification.as_ref().map(|c| {
            Box::new(TmdbCertificationSource::new(&c.base_url, &c.api_key, &c.country))
                as Box<dyn CertificationSource>
        });
        let rules = if config.rules_path.exists() {
            TitleRules::from_path(&config.rules_path)?
        } else {
            warn!(path = %config.rules_path.display(), "title rules file not found, no rules applied");
            TitleRules::default()
        };
        let artifact_store = config.archive_dir.clone().map(ArtifactStore::new);
        Ok(Self {
            config,
            http,
            guide,
            certification,
            rules,
            artifact_store,
        })
    }

    pub fn with_guide_source(mut self, guide: Box<dyn GuideSource>) -> Self {
        self.guide = guide;
        self
    }

    pub fn with_certification_source(mut self, source: Option<Box<dyn CertificationSource>>) -> Self {
        self.certification = source;
        self
    }

    pub fn with_rules(mut self, rules: TitleRules) -> Self {
        self.rules = rules;
        self
    }

    fn certification_lookup<'a>(&'a self, ctx: &'a GuideContext) -> Option<CertificationLookup<'a>> {
        self.certification.as_deref().map(|source| CertificationLookup {
            source,
            http: &self.http,
            ctx,
        })
    }

    /// One full run for local time `now`. The report is written whether or
    /// not a stage fails; the first failure is returned after that.
    pub async fn run_once(&self, stores: &Stores, now: NaiveDateTime) -> Result<SyncRunSummary> {
        let ctx = GuideContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        };
        let mut report = RunReport::started(ctx.run_id, ctx.fetched_at);

        let outcome = self
            .run_stages(stores, now, &ctx, &mut report)
            .instrument(info_span!("sync_run", run_id = %ctx.run_id))
            .await;
        report.finish(Utc::now(), outcome.as_ref().err());
        let reports_dir = report.write(&self.config.reports_dir).await?;
        outcome?;

        info!(run_id = %ctx.run_id, reports = %reports_dir.display(), "sync run completed");
        Ok(SyncRunSummary { report, reports_dir })
    }

    async fn run_stages(
        &self,
        stores: &Stores,
        now: NaiveDateTime,
        ctx: &GuideContext,
        report: &mut RunReport,
    ) -> Result<()> {
        let today = now.date();
        for offset in 0..=self.config.lookahead_days {
            let date = today + Duration::days(i64::from(offset));
            let day = self
                .sync_day(stores, ctx, date, today)
                .await
                .with_context(|| format!("syncing guide for {date}"))?;
            report.days.push(day);
        }

        let matcher = IdentityMatcher::new(&stores.current, &stores.catalog, self.config.year_tolerance)
            .with_certification(self.certification_lookup(ctx));
        report.matching = Some(matcher.run().await.context("matching broadcast events")?);

        let archiver = HistoryArchiver::new(&stores.current, &stores.history);
        report.archive = Some(archiver.archive(now).await.context("archiving history")?);
        Ok(())
    }

    async fn sync_day(
        &self,
        stores: &Stores,
        ctx: &GuideContext,
        date: NaiveDate,
        today: NaiveDate,
    ) -> Result<DayReport> {
        let document = self.guide.fetch_document(&self.http, ctx, date).await?;

        let archived_document = match &self.artifact_store {
            Some(store) => {
                let stored = store
                    .store_document(self.guide.provider_id(), date, "json", &document.body)
                    .await?;
                Some(stored.relative_path.display().to_string())
            }
            None => None,
        };

        let mut batch = self.guide.parse_document(&document)?;
        let (events, rules) = self.rules.apply(std::mem::take(&mut batch.events));
        batch.events = events;

        let reconcile = GuideReconciler::new(&stores.current)
            .reconcile_day(date, today, &batch)
            .await?;

        Ok(DayReport {
            date,
            url: document.url,
            dropped_entries: batch.dropped_entries,
            rules,
            reconcile,
            archived_document,
        })
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let stores = Stores::open(&config).await?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(&stores, Local::now().naive_local()).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}

pub async fn import_catalog(config: &SyncConfig) -> Result<CatalogImportSummary> {
    let catalog = connect(&config.catalog_db_url).await?;
    migrate_catalog(&catalog).await?;
    CatalogImporter::new(&catalog)
        .import_files(&config.catalog_titles_path, &config.catalog_ratings_path)
        .await
}

/// Manually link one stored event to a catalog title.
pub async fn assign_manual(config: &SyncConfig, event_id: i64, catalog_id: &str) -> Result<BroadcastEvent> {
    let stores = Stores::open(config).await?;
    let pipeline = SyncPipeline::new(config.clone())?;
    let ctx = GuideContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    };
    IdentityMatcher::new(&stores.current, &stores.catalog, config.year_tolerance)
        .with_certification(pipeline.certification_lookup(&ctx))
        .assign_manual(event_id, catalog_id)
        .await
}
