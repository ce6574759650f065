use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use filmtv_core::{
    AlternateTitle, BroadcastEvent, BroadcastEventDraft, CatalogLink, Certification, Channel,
    ContentKind, Title,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};

/// Open a SQLite pool, creating the database file when missing.
///
/// The pipeline is a single writer, so one connection is enough.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing sqlite url {database_url}"))?
        .create_if_missing(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

/// Private in-memory database that lives as long as the returned pool.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("opening in-memory sqlite")
}

/// Schema shared by the current and the history broadcast stores.
pub async fn migrate_broadcast(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations/broadcast")
        .run(pool)
        .await
        .context("running broadcast store migrations")
}

pub async fn migrate_catalog(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations/catalog")
        .run(pool)
        .await
        .context("running catalog store migrations")
}

const EVENT_COLUMNS: &str = "id, channel_code, title, year, start_time, end_time, kind, duration, \
     genre, content, opinion, poster_small, poster_medium, provider_url, catalog_id, \
     catalog_rating, catalog_votes, certification_status, certification";

fn event_from_row(row: &SqliteRow) -> Result<BroadcastEvent> {
    let id: i64 = row.try_get("id")?;
    let kind_code: i64 = row.try_get("kind")?;
    let kind = ContentKind::from_i64(kind_code)
        .with_context(|| format!("event {id} has unknown kind {kind_code}"))?;
    let catalog_id: Option<String> = row.try_get("catalog_id")?;
    let catalog = match catalog_id {
        Some(catalog_id) => Some(CatalogLink {
            catalog_id,
            rating: row.try_get("catalog_rating")?,
            votes: row.try_get("catalog_votes")?,
        }),
        None => None,
    };
    let status: String = row.try_get("certification_status")?;

    Ok(BroadcastEvent {
        schedule: BroadcastEventDraft {
            id,
            channel_code: row.try_get("channel_code")?,
            title: row.try_get("title")?,
            year: row.try_get("year")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            kind,
            duration: row.try_get("duration")?,
            genre: row.try_get("genre")?,
            content: row.try_get("content")?,
            opinion: row.try_get("opinion")?,
            poster_small: row.try_get("poster_small")?,
            poster_medium: row.try_get("poster_medium")?,
            provider_url: row.try_get("provider_url")?,
        },
        catalog,
        certification: Certification::from_columns(&status, row.try_get("certification")?),
    })
}

/// Channels and broadcast events of one broadcast store (current or history).
pub struct BroadcastRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> BroadcastRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn upsert_channel(&mut self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (code, name, logo_small)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (code) DO UPDATE
               SET name = excluded.name,
                   logo_small = excluded.logo_small
            "#,
        )
        .bind(&channel.code)
        .bind(&channel.name)
        .bind(&channel.logo_small)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("upserting channel {}", channel.code))?;
        Ok(())
    }

    pub async fn list_channels(&mut self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT code, name, logo_small FROM channels ORDER BY code")
            .fetch_all(&mut *self.conn)
            .await
            .context("listing channels")?;
        rows.iter()
            .map(|row| {
                Ok(Channel {
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                    logo_small: row.try_get("logo_small")?,
                })
            })
            .collect()
    }

    pub async fn delete_started_before(&mut self, cutoff: NaiveDateTime) -> Result<u64> {
        let done = sqlx::query("DELETE FROM broadcast_events WHERE start_time < ?1")
            .bind(cutoff)
            .execute(&mut *self.conn)
            .await
            .context("trimming past events")?;
        Ok(done.rows_affected())
    }

    pub async fn delete_started_from(&mut self, boundary: NaiveDateTime) -> Result<u64> {
        let done = sqlx::query("DELETE FROM broadcast_events WHERE start_time >= ?1")
            .bind(boundary)
            .execute(&mut *self.conn)
            .await
            .context("pruning events from boundary")?;
        Ok(done.rows_affected())
    }

    /// Ids of events starting in `[from, to)`.
    pub async fn event_ids_between(
        &mut self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM broadcast_events WHERE start_time >= ?1 AND start_time < ?2 ORDER BY id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.conn)
        .await
        .context("listing event ids for date")?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    pub async fn delete_event(&mut self, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM broadcast_events WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("deleting event {id}"))?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn event_exists(&mut self, id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM broadcast_events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("checking event {id}"))?;
        Ok(row.is_some())
    }

    /// Overwrite the schedule fields of an existing event. Catalog link and
    /// certification are left untouched.
    pub async fn update_schedule(&mut self, draft: &BroadcastEventDraft) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE broadcast_events
               SET channel_code = ?2,
                   title = ?3,
                   year = ?4,
                   start_time = ?5,
                   end_time = ?6,
                   kind = ?7,
                   duration = ?8,
                   genre = ?9,
                   content = ?10,
                   opinion = ?11,
                   poster_small = ?12,
                   poster_medium = ?13,
                   provider_url = ?14
             WHERE id = ?1
            "#,
        )
        .bind(draft.id)
        .bind(&draft.channel_code)
        .bind(&draft.title)
        .bind(draft.year)
        .bind(draft.start_time)
        .bind(draft.end_time)
        .bind(draft.kind.as_i64())
        .bind(draft.duration)
        .bind(&draft.genre)
        .bind(&draft.content)
        .bind(&draft.opinion)
        .bind(&draft.poster_small)
        .bind(&draft.poster_medium)
        .bind(&draft.provider_url)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("updating event {}", draft.id))?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn insert_event(&mut self, event: &BroadcastEvent) -> Result<()> {
        let draft = &event.schedule;
        let catalog = event.catalog.as_ref();
        sqlx::query(
            r#"
            INSERT INTO broadcast_events (
                id, channel_code, title, year, start_time, end_time, kind, duration,
                genre, content, opinion, poster_small, poster_medium, provider_url,
                catalog_id, catalog_rating, catalog_votes, certification_status, certification
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
        )
        .bind(draft.id)
        .bind(&draft.channel_code)
        .bind(&draft.title)
        .bind(draft.year)
        .bind(draft.start_time)
        .bind(draft.end_time)
        .bind(draft.kind.as_i64())
        .bind(draft.duration)
        .bind(&draft.genre)
        .bind(&draft.content)
        .bind(&draft.opinion)
        .bind(&draft.poster_small)
        .bind(&draft.poster_medium)
        .bind(&draft.provider_url)
        .bind(catalog.map(|link| link.catalog_id.as_str()))
        .bind(catalog.and_then(|link| link.rating))
        .bind(catalog.and_then(|link| link.votes))
        .bind(event.certification.status())
        .bind(event.certification.code())
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting event {}", draft.id))?;
        Ok(())
    }

    pub async fn get_event(&mut self, id: i64) -> Result<Option<BroadcastEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM broadcast_events WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("loading event {id}"))?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn list_events(&mut self) -> Result<Vec<BroadcastEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM broadcast_events ORDER BY start_time, id");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.conn)
            .await
            .context("listing events")?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn events_starting_from(
        &mut self,
        boundary: NaiveDateTime,
    ) -> Result<Vec<BroadcastEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM broadcast_events WHERE start_time >= ?1 ORDER BY start_time, id"
        );
        let rows = sqlx::query(&sql)
            .bind(boundary)
            .fetch_all(&mut *self.conn)
            .await
            .context("listing upcoming events")?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn set_catalog_link(&mut self, id: i64, link: &CatalogLink) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE broadcast_events
               SET catalog_id = ?2,
                   catalog_rating = ?3,
                   catalog_votes = ?4
             WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&link.catalog_id)
        .bind(link.rating)
        .bind(link.votes)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("linking event {id} to {}", link.catalog_id))?;
        Ok(())
    }

    pub async fn set_certification(&mut self, id: i64, certification: &Certification) -> Result<()> {
        sqlx::query(
            "UPDATE broadcast_events SET certification_status = ?2, certification = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(certification.status())
        .bind(certification.code())
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("storing certification for event {id}"))?;
        Ok(())
    }

    pub async fn max_event_id(&mut self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(id) AS max_id FROM broadcast_events")
            .fetch_one(&mut *self.conn)
            .await
            .context("reading max event id")?;
        Ok(row.try_get("max_id")?)
    }
}

fn title_from_row(row: &SqliteRow) -> Result<Title> {
    Ok(Title {
        id: row.try_get("id")?,
        primary_title: row.try_get("primary_title")?,
        year: row.try_get("year")?,
        rating: row.try_get("rating")?,
        votes: row.try_get("votes")?,
    })
}

/// Lookup key used for case-insensitive title comparison.
pub fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Titles and alternate titles of the catalog mirror.
pub struct CatalogRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> CatalogRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn clear(&mut self) -> Result<()> {
        sqlx::query("DELETE FROM title_alternates")
            .execute(&mut *self.conn)
            .await
            .context("clearing alternate titles")?;
        sqlx::query("DELETE FROM titles")
            .execute(&mut *self.conn)
            .await
            .context("clearing titles")?;
        Ok(())
    }

    pub async fn insert_title(&mut self, title: &Title) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO titles (id, primary_title, primary_title_key, year, rating, votes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE
               SET primary_title = excluded.primary_title,
                   primary_title_key = excluded.primary_title_key,
                   year = excluded.year
            "#,
        )
        .bind(&title.id)
        .bind(&title.primary_title)
        .bind(title_key(&title.primary_title))
        .bind(title.year)
        .bind(title.rating)
        .bind(title.votes)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting title {}", title.id))?;
        Ok(())
    }

    pub async fn insert_alternate(&mut self, alternate: &AlternateTitle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO title_alternates (title_id, alternate_title, alternate_title_key)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (title_id, alternate_title) DO NOTHING
            "#,
        )
        .bind(&alternate.title_id)
        .bind(&alternate.alternate_title)
        .bind(title_key(&alternate.alternate_title))
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting alternate title for {}", alternate.title_id))?;
        Ok(())
    }

    /// Returns false when no title carries `id`.
    pub async fn update_rating(
        &mut self,
        id: &str,
        rating: Option<i32>,
        votes: Option<i64>,
    ) -> Result<bool> {
        let done = sqlx::query("UPDATE titles SET rating = ?2, votes = ?3 WHERE id = ?1")
            .bind(id)
            .bind(rating)
            .bind(votes)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("updating rating for {id}"))?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_title(&mut self, id: &str) -> Result<Option<Title>> {
        let row = sqlx::query(
            "SELECT id, primary_title, year, rating, votes FROM titles WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("loading title {id}"))?;
        row.as_ref().map(title_from_row).transpose()
    }

    /// First title (store order) whose primary title equals `title` ignoring
    /// case and whose year is unknown or within `tolerance` of `year`. An
    /// unknown `year` only matches titles without a year.
    pub async fn find_by_primary(
        &mut self,
        title: &str,
        year: Option<i32>,
        tolerance: u32,
    ) -> Result<Option<Title>> {
        let base = "SELECT id, primary_title, year, rating, votes FROM titles \
                    WHERE primary_title_key = ?1";
        self.find_one(base, "year", "rowid", title, year, tolerance)
            .await
            .with_context(|| format!("searching primary title {title:?}"))
    }

    /// Same rule as [`Self::find_by_primary`] against alternate titles.
    pub async fn find_by_alternate(
        &mut self,
        title: &str,
        year: Option<i32>,
        tolerance: u32,
    ) -> Result<Option<Title>> {
        let base = "SELECT t.id, t.primary_title, t.year, t.rating, t.votes \
                    FROM title_alternates a JOIN titles t ON t.id = a.title_id \
                    WHERE a.alternate_title_key = ?1";
        self.find_one(base, "t.year", "a.rowid", title, year, tolerance)
            .await
            .with_context(|| format!("searching alternate title {title:?}"))
    }

    async fn find_one(
        &mut self,
        base: &str,
        year_column: &str,
        order_column: &str,
        title: &str,
        year: Option<i32>,
        tolerance: u32,
    ) -> Result<Option<Title>> {
        let key = title_key(title);
        let row = match year {
            Some(year) => {
                let sql = format!(
                    "{base} AND ({year_column} IS NULL OR {year_column} BETWEEN ?2 AND ?3) \
                     ORDER BY {order_column} LIMIT 1"
                );
                let window = i32::try_from(tolerance).unwrap_or(i32::MAX);
                sqlx::query(&sql)
                    .bind(key)
                    .bind(year.saturating_sub(window))
                    .bind(year.saturating_add(window))
                    .fetch_optional(&mut *self.conn)
                    .await?
            }
            None => {
                let sql =
                    format!("{base} AND {year_column} IS NULL ORDER BY {order_column} LIMIT 1");
                sqlx::query(&sql)
                    .bind(key)
                    .fetch_optional(&mut *self.conn)
                    .await?
            }
        };
        row.as_ref().map(title_from_row).transpose()
    }

    pub async fn list_titles(&mut self) -> Result<Vec<Title>> {
        let rows = sqlx::query("SELECT id, primary_title, year, rating, votes FROM titles ORDER BY id")
            .fetch_all(&mut *self.conn)
            .await
            .context("listing titles")?;
        rows.iter().map(title_from_row).collect()
    }

    pub async fn list_alternates(&mut self) -> Result<Vec<AlternateTitle>> {
        let rows = sqlx::query(
            "SELECT title_id, alternate_title FROM title_alternates ORDER BY title_id, alternate_title",
        )
        .fetch_all(&mut *self.conn)
        .await
        .context("listing alternate titles")?;
        rows.iter()
            .map(|row| {
                Ok(AlternateTitle {
                    title_id: row.try_get("title_id")?,
                    alternate_title: row.try_get("alternate_title")?,
                })
            })
            .collect()
    }
}
