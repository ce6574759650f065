use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use filmtv_core::{AlternateTitle, Title};
use filmtv_storage::CatalogRepository;
use flate2::read::GzDecoder;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Title types mirrored from the dataset; everything else is skipped.
pub const KEPT_TITLE_TYPES: [&str; 5] = ["movie", "video", "short", "tvMovie", "tvMiniSeries"];

/// Lines per committed transaction.
pub const DEFAULT_BATCH_LINES: usize = 10_000;

const TITLE_COLUMNS: usize = 9;
const RATING_COLUMNS: usize = 3;
const NULL_FIELD: &str = "\\N";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TitlesImportSummary {
    pub lines: usize,
    pub titles: usize,
    pub alternates: usize,
    pub skipped: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RatingsImportSummary {
    pub lines: usize,
    pub updated: usize,
    pub skipped: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogImportSummary {
    pub titles: TitlesImportSummary,
    pub ratings: RatingsImportSummary,
}

struct TitleRow {
    title: Title,
    alternate: Option<AlternateTitle>,
}

struct RatingRow {
    id: String,
    rating: i32,
    votes: Option<i64>,
}

/// Open a gzip stream and check its header, without reading any line.
pub fn open_gzip(path: impl AsRef<Path>) -> Result<BufReader<GzDecoder<File>>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let decoder = GzDecoder::new(file);
    if decoder.header().is_none() {
        bail!("{} is not a gzip stream", path.display());
    }
    Ok(BufReader::new(decoder))
}

/// Streams the title and rating dumps into the catalog mirror.
pub struct CatalogImporter<'p> {
    pool: &'p SqlitePool,
    batch_lines: usize,
}

impl<'p> CatalogImporter<'p> {
    pub fn new(pool: &'p SqlitePool) -> Self {
        Self {
            pool,
            batch_lines: DEFAULT_BATCH_LINES,
        }
    }

    pub fn with_batch_lines(mut self, batch_lines: usize) -> Self {
        self.batch_lines = batch_lines.max(1);
        self
    }

    /// Full replace from both dump files. Both files are opened before the
    /// catalog is touched.
    pub async fn import_files(
        &self,
        titles_path: impl AsRef<Path>,
        ratings_path: impl AsRef<Path>,
    ) -> Result<CatalogImportSummary> {
        let titles = open_gzip(titles_path)?;
        let ratings = open_gzip(ratings_path)?;
        Ok(CatalogImportSummary {
            titles: self.import_titles(titles).await?,
            ratings: self.import_ratings(ratings).await?,
        })
    }

    /// Clears the catalog and loads the titles dump.
    pub async fn import_titles(&self, mut reader: impl BufRead) -> Result<TitlesImportSummary> {
        {
            let mut tx = self.pool.begin().await.context("starting catalog clear")?;
            CatalogRepository::new(&mut tx).clear().await?;
            tx.commit().await.context("committing catalog clear")?;
        }

        let mut summary = TitlesImportSummary::default();
        let mut batch = Vec::with_capacity(self.batch_lines);
        let mut line_no = 0usize;

        while let Some(line) = next_line(&mut reader, line_no + 1)? {
            line_no += 1;
            if line_no == 1 {
                continue;
            }
            summary.lines += 1;

            match parse_title_line(&line) {
                Some(Some(row)) => batch.push(row),
                Some(None) => summary.skipped += 1,
                None => {
                    warn!(line = line_no, "malformed title line");
                    summary.malformed += 1;
                }
            }

            if summary.lines % self.batch_lines == 0 {
                self.flush_titles(&mut batch, &mut summary).await?;
                info!(lines = summary.lines, titles = summary.titles, "title import progress");
            }
        }
        self.flush_titles(&mut batch, &mut summary).await?;

        info!(
            lines = summary.lines,
            titles = summary.titles,
            alternates = summary.alternates,
            skipped = summary.skipped,
            malformed = summary.malformed,
            "title import finished"
        );
        Ok(summary)
    }

    /// Applies the ratings dump to titles already in the catalog.
    pub async fn import_ratings(&self, mut reader: impl BufRead) -> Result<RatingsImportSummary> {
        let mut summary = RatingsImportSummary::default();
        let mut batch = Vec::with_capacity(self.batch_lines);
        let mut line_no = 0usize;

        while let Some(line) = next_line(&mut reader, line_no + 1)? {
            line_no += 1;
            if line_no == 1 {
                continue;
            }
            summary.lines += 1;

            match parse_rating_line(&line) {
                Some(row) => batch.push(row),
                None => {
                    warn!(line = line_no, "malformed rating line");
                    summary.malformed += 1;
                }
            }

            if summary.lines % self.batch_lines == 0 {
                self.flush_ratings(&mut batch, &mut summary).await?;
                info!(lines = summary.lines, updated = summary.updated, "rating import progress");
            }
        }
        self.flush_ratings(&mut batch, &mut summary).await?;

        info!(
            lines = summary.lines,
            updated = summary.updated,
            skipped = summary.skipped,
            malformed = summary.malformed,
            "rating import finished"
        );
        Ok(summary)
    }

    async fn flush_titles(
        &self,
        batch: &mut Vec<TitleRow>,
        summary: &mut TitlesImportSummary,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("starting title batch")?;
        let mut repo = CatalogRepository::new(&mut tx);
        for row in batch.drain(..) {
            repo.insert_title(&row.title).await?;
            summary.titles += 1;
            if let Some(alternate) = &row.alternate {
                repo.insert_alternate(alternate).await?;
                summary.alternates += 1;
            }
        }
        tx.commit().await.context("committing title batch")?;
        Ok(())
    }

    async fn flush_ratings(
        &self,
        batch: &mut Vec<RatingRow>,
        summary: &mut RatingsImportSummary,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("starting rating batch")?;
        let mut repo = CatalogRepository::new(&mut tx);
        for row in batch.drain(..) {
            if repo.update_rating(&row.id, Some(row.rating), row.votes).await? {
                summary.updated += 1;
            } else {
                summary.skipped += 1;
            }
        }
        tx.commit().await.context("committing rating batch")?;
        Ok(())
    }
}

/// Next line without its terminator. Invalid UTF-8 is replaced, not fatal.
fn next_line(reader: &mut impl BufRead, line_no: usize) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let read = reader
        .read_until(b'\n', &mut buf)
        .with_context(|| format!("reading line {line_no}"))?;
    if read == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn nullable(field: &str) -> Option<&str> {
    (field != NULL_FIELD && !field.is_empty()).then_some(field)
}

/// `None` for a malformed line, `Some(None)` for a title type that is not mirrored.
fn parse_title_line(line: &str) -> Option<Option<TitleRow>> {
    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() != TITLE_COLUMNS {
        return None;
    }
    let [id, title_type, primary, original, _adult, start_year, ..] = columns[..] else {
        return None;
    };
    if id.is_empty() || primary.is_empty() {
        return None;
    }
    if !KEPT_TITLE_TYPES.contains(&title_type) {
        return Some(None);
    }

    let alternate = (nullable(original).is_some()
        && original.to_lowercase() != primary.to_lowercase())
    .then(|| AlternateTitle {
        title_id: id.to_string(),
        alternate_title: original.to_string(),
    });

    Some(Some(TitleRow {
        title: Title {
            id: id.to_string(),
            primary_title: primary.to_string(),
            year: nullable(start_year).and_then(|y| y.parse().ok()),
            rating: None,
            votes: None,
        },
        alternate,
    }))
}

fn parse_rating_line(line: &str) -> Option<RatingRow> {
    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() != RATING_COLUMNS {
        return None;
    }
    let [id, rating, votes] = columns[..] else {
        return None;
    };
    if id.is_empty() || !rating.contains('.') {
        return None;
    }
    let rating: f64 = rating.parse().ok().filter(|r: &f64| r.is_finite() && *r >= 0.0)?;
    Some(RatingRow {
        id: id.to_string(),
        rating: (rating * 10.0).round() as i32,
        votes: nullable(votes).and_then(|v| v.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    use filmtv_storage::{connect_in_memory, migrate_catalog};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    const TITLES_HEADER: &str =
        "tconst\ttitleType\tprimaryTitle\toriginalTitle\tisAdult\tstartYear\tendYear\truntimeMinutes\tgenres\n";
    const RATINGS_HEADER: &str = "tconst\taverageRating\tnumVotes\n";

    async fn catalog() -> SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        migrate_catalog(&pool).await.unwrap();
        pool
    }

    async fn snapshot(pool: &SqlitePool) -> (Vec<Title>, Vec<AlternateTitle>) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = CatalogRepository::new(&mut conn);
        (repo.list_titles().await.unwrap(), repo.list_alternates().await.unwrap())
    }

    fn titles(body: &str) -> Cursor<Vec<u8>> {
        Cursor::new(format!("{TITLES_HEADER}{body}").into_bytes())
    }

    fn ratings(body: &str) -> Cursor<Vec<u8>> {
        Cursor::new(format!("{RATINGS_HEADER}{body}").into_bytes())
    }

    fn write_gz(path: &Path, text: &str) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[tokio::test]
    async fn identical_titles_yield_no_alternate() {
        let pool = catalog().await;
        let summary = CatalogImporter::new(&pool)
            .import_titles(titles(
                "tt0000009\tmovie\tMiss Jerry\tMiss Jerry\t0\t1894\t\\N\t45\tRomance\n",
            ))
            .await
            .unwrap();

        let (titles, alternates) = snapshot(&pool).await;
        assert_eq!(
            titles,
            vec![Title {
                id: "tt0000009".into(),
                primary_title: "Miss Jerry".into(),
                year: Some(1894),
                rating: None,
                votes: None,
            }]
        );
        assert!(alternates.is_empty());
        assert_eq!(summary.titles, 1);
        assert_eq!(summary.alternates, 0);
    }

    #[tokio::test]
    async fn differing_original_title_becomes_alternate() {
        let pool = catalog().await;
        CatalogImporter::new(&pool)
            .import_titles(titles(
                "tt0000009\tmovie\tMiss Jerry\tMlle Jerry\t0\t1894\t\\N\t45\tRomance\n",
            ))
            .await
            .unwrap();

        let (titles, alternates) = snapshot(&pool).await;
        assert_eq!(titles.len(), 1);
        assert_eq!(
            alternates,
            vec![AlternateTitle {
                title_id: "tt0000009".into(),
                alternate_title: "Mlle Jerry".into(),
            }]
        );
    }

    #[tokio::test]
    async fn case_only_difference_is_not_an_alternate() {
        let pool = catalog().await;
        CatalogImporter::new(&pool)
            .import_titles(titles("tt1\tmovie\tLéon\tLÉON\t0\t1994\t\\N\t110\tCrime\n"))
            .await
            .unwrap();
        assert!(snapshot(&pool).await.1.is_empty());
    }

    #[tokio::test]
    async fn types_outside_allow_list_and_malformed_lines_are_counted() {
        let pool = catalog().await;
        let summary = CatalogImporter::new(&pool)
            .import_titles(titles(
                "tt1\ttvEpisode\tPilot\tPilot\t0\t2001\t\\N\t45\tDrama\n\
                 tt2\tshort\tShorty\tShorty\t0\t\\N\t\\N\t5\tComedy\n\
                 broken line without tabs\n\
                 tt3\tmovie\tToo\tFew\n",
            ))
            .await
            .unwrap();

        assert_eq!(
            summary,
            TitlesImportSummary { lines: 4, titles: 1, alternates: 0, skipped: 1, malformed: 2 }
        );
        let (titles, _) = snapshot(&pool).await;
        assert_eq!(titles[0].id, "tt2");
        assert_eq!(titles[0].year, None);
    }

    #[tokio::test]
    async fn ratings_apply_to_known_titles_only() {
        let pool = catalog().await;
        let importer = CatalogImporter::new(&pool);
        importer
            .import_titles(titles("tt0000009\tmovie\tMiss Jerry\tMiss Jerry\t0\t1894\t\\N\t45\tRomance\n"))
            .await
            .unwrap();
        let summary = importer
            .import_ratings(ratings(
                "tt0000009\t9.2\t1852213\n\
                 tt7777777\t9.2\t1852213\n\
                 tt0000009\tgood\t12\n",
            ))
            .await
            .unwrap();

        assert_eq!(
            summary,
            RatingsImportSummary { lines: 3, updated: 1, skipped: 1, malformed: 1 }
        );
        let (titles, _) = snapshot(&pool).await;
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].rating, Some(92));
        assert_eq!(titles[0].votes, Some(1852213));
    }

    #[tokio::test]
    async fn rerunning_the_import_is_idempotent() {
        let pool = catalog().await;
        let body = "tt1\tmovie\tAmélie\tLe Fabuleux Destin d'Amélie Poulain\t0\t2001\t\\N\t122\tComedy\n\
                    tt2\ttvMovie\tDuel\tDuel\t0\t1971\t\\N\t90\tThriller\n\
                    tt3\tvideo\tClip\tKlip\t0\t\\N\t\\N\t3\tMusic\n";
        // Small batches exercise the intermediate commits.
        let importer = CatalogImporter::new(&pool).with_batch_lines(2);

        importer.import_titles(titles(body)).await.unwrap();
        importer.import_ratings(ratings("tt1\t8.3\t700000\n")).await.unwrap();
        let first = snapshot(&pool).await;

        importer.import_titles(titles(body)).await.unwrap();
        importer.import_ratings(ratings("tt1\t8.3\t700000\n")).await.unwrap();
        let second = snapshot(&pool).await;

        assert_eq!(first, second);
        assert_eq!(first.0.len(), 3);
        assert_eq!(first.1.len(), 2);
    }

    #[tokio::test]
    async fn import_files_reads_gzip_dumps() {
        let dir = tempdir().unwrap();
        let titles_path = dir.path().join("title.basics.tsv.gz");
        let ratings_path = dir.path().join("title.ratings.tsv.gz");
        write_gz(
            &titles_path,
            &format!("{TITLES_HEADER}tt0000009\tmovie\tMiss Jerry\tMlle Jerry\t0\t1894\t\\N\t45\tRomance\n"),
        );
        write_gz(&ratings_path, &format!("{RATINGS_HEADER}tt0000009\t5.4\t215\n"));
        let pool = catalog().await;

        let summary = CatalogImporter::new(&pool)
            .import_files(&titles_path, &ratings_path)
            .await
            .unwrap();

        assert_eq!(summary.titles.titles, 1);
        assert_eq!(summary.titles.alternates, 1);
        assert_eq!(summary.ratings.updated, 1);
        assert_eq!(snapshot(&pool).await.0[0].rating, Some(54));
    }

    #[tokio::test]
    async fn missing_file_aborts_before_clearing() {
        let dir = tempdir().unwrap();
        let titles_path = dir.path().join("title.basics.tsv.gz");
        write_gz(&titles_path, TITLES_HEADER);
        let pool = catalog().await;
        let importer = CatalogImporter::new(&pool);
        importer
            .import_titles(titles("tt1\tmovie\tKeep Me\tKeep Me\t0\t2000\t\\N\t90\tDrama\n"))
            .await
            .unwrap();

        let err = importer
            .import_files(&titles_path, dir.path().join("missing.tsv.gz"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("missing.tsv.gz"));
        assert_eq!(snapshot(&pool).await.0.len(), 1);
    }

    #[test]
    fn plain_text_is_rejected_as_gzip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tsv");
        std::fs::write(&path, TITLES_HEADER).unwrap();
        assert!(open_gzip(&path).is_err());
    }
}
