//! Persistence for CAST: store traits plus in-memory and Postgres backends.

use async_trait::async_trait;
use cast_core::{AdvisoryDocument, AdvisoryMatch, DocumentStatus, MatchKey, MatchStatus};
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "cast-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Insert payload for a document; id and audit timestamps are store-assigned.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub docurl: String,
    pub title: String,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub publisher: Option<String>,
    pub status: DocumentStatus,
}

/// Insert payload for a match.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub document_id: i64,
    pub device_id: Option<i64>,
    pub software_id: Option<i64>,
    pub product_name_id: Option<String>,
    pub score: f64,
    pub time: chrono::DateTime<Utc>,
    pub status: MatchStatus,
    pub description: String,
}

impl NewMatch {
    pub fn key(&self) -> MatchKey {
        MatchKey {
            document_id: self.document_id,
            device_id: self.device_id,
            software_id: self.software_id,
            product_name_id: self.product_name_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    pub document_id: Option<i64>,
    pub device_id: Option<i64>,
    pub software_id: Option<i64>,
    pub status: Option<MatchStatus>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document. A docurl collision yields [`StoreError::Duplicate`].
    async fn insert_document(&self, new: NewDocument) -> Result<AdvisoryDocument, StoreError>;
    async fn find_document_by_url(&self, docurl: &str)
        -> Result<Option<AdvisoryDocument>, StoreError>;
    async fn get_document(&self, id: i64) -> Result<Option<AdvisoryDocument>, StoreError>;
    async fn list_documents(&self) -> Result<Vec<AdvisoryDocument>, StoreError>;
    async fn list_documents_by_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> Result<Vec<AdvisoryDocument>, StoreError>;
    /// Overwrite the stored row for `doc.id`.
    async fn update_document(&self, doc: &AdvisoryDocument) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Insert a new match. A composite-key collision yields [`StoreError::Duplicate`].
    async fn insert_match(&self, new: NewMatch) -> Result<AdvisoryMatch, StoreError>;
    async fn find_match_by_key(&self, key: &MatchKey)
        -> Result<Option<AdvisoryMatch>, StoreError>;
    async fn get_match(&self, id: i64) -> Result<Option<AdvisoryMatch>, StoreError>;
    async fn list_matches(&self, filter: &MatchFilter) -> Result<Vec<AdvisoryMatch>, StoreError>;
    /// Overwrite the stored row for `m.id`.
    async fn update_match(&self, m: &AdvisoryMatch) -> Result<(), StoreError>;
    async fn set_match_status(
        &self,
        id: i64,
        status: MatchStatus,
    ) -> Result<AdvisoryMatch, StoreError>;
}

/// Create-or-get for documents: attempt the insert, and on a duplicate-key
/// loss re-read under the same URL and return the winner. Returns the row and
/// whether this call created it.
pub async fn create_or_get_document<S: DocumentStore + ?Sized>(
    store: &S,
    new: NewDocument,
) -> Result<(AdvisoryDocument, bool), StoreError> {
    if let Some(existing) = store.find_document_by_url(&new.docurl).await? {
        return Ok((existing, false));
    }
    let docurl = new.docurl.clone();
    match store.insert_document(new).await {
        Ok(doc) => Ok((doc, true)),
        Err(StoreError::Duplicate(_)) => {
            debug!(docurl = %docurl, "lost document create race, returning winner");
            let winner = store.find_document_by_url(&docurl).await?.ok_or_else(|| {
                StoreError::NotFound(format!("document {docurl} vanished after duplicate insert"))
            })?;
            Ok((winner, false))
        }
        Err(err) => Err(err),
    }
}

/// Create-or-get for matches, same contract as [`create_or_get_document`].
/// The losing payload is dropped for this attempt; the winner is authoritative.
pub async fn create_or_get_match<S: MatchStore + ?Sized>(
    store: &S,
    new: NewMatch,
) -> Result<(AdvisoryMatch, bool), StoreError> {
    let key = new.key();
    if let Some(existing) = store.find_match_by_key(&key).await? {
        return Ok((existing, false));
    }
    match store.insert_match(new).await {
        Ok(m) => Ok((m, true)),
        Err(StoreError::Duplicate(_)) => {
            debug!(document_id = key.document_id, "lost match create race, returning winner");
            let winner = store.find_match_by_key(&key).await?.ok_or_else(|| {
                StoreError::NotFound(format!(
                    "match for document {} vanished after duplicate insert",
                    key.document_id
                ))
            })?;
            Ok((winner, false))
        }
        Err(err) => Err(err),
    }
}

#[derive(Default)]
struct MemoryState {
    documents: Vec<AdvisoryDocument>,
    matches: Vec<AdvisoryMatch>,
    last_document_id: i64,
    last_match_id: i64,
}

/// In-memory store for tests and standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, new: NewDocument) -> Result<AdvisoryDocument, StoreError> {
        let mut state = self.state.lock().await;
        if state.documents.iter().any(|d| d.docurl == new.docurl) {
            return Err(StoreError::Duplicate(format!("docurl {}", new.docurl)));
        }
        state.last_document_id += 1;
        let now = Utc::now();
        let doc = AdvisoryDocument {
            id: state.last_document_id,
            docurl: new.docurl,
            title: new.title,
            version: new.version,
            lang: new.lang,
            publisher: new.publisher,
            status: new.status,
            created: now,
            last_updated: now,
        };
        state.documents.push(doc.clone());
        Ok(doc)
    }

    async fn find_document_by_url(
        &self,
        docurl: &str,
    ) -> Result<Option<AdvisoryDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.documents.iter().find(|d| d.docurl == docurl).cloned())
    }

    async fn get_document(&self, id: i64) -> Result<Option<AdvisoryDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<AdvisoryDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.documents.clone())
    }

    async fn list_documents_by_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> Result<Vec<AdvisoryDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .filter(|d| statuses.contains(&d.status))
            .cloned()
            .collect())
    }

    async fn update_document(&self, doc: &AdvisoryDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .documents
            .iter_mut()
            .find(|d| d.id == doc.id)
            .ok_or_else(|| StoreError::NotFound(format!("document {}", doc.id)))?;
        *slot = AdvisoryDocument {
            last_updated: Utc::now(),
            ..doc.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn insert_match(&self, new: NewMatch) -> Result<AdvisoryMatch, StoreError> {
        let mut state = self.state.lock().await;
        let key = new.key();
        if state.matches.iter().any(|m| m.key() == key) {
            return Err(StoreError::Duplicate(format!(
                "match for document {}",
                key.document_id
            )));
        }
        state.last_match_id += 1;
        let now = Utc::now();
        let m = AdvisoryMatch {
            id: state.last_match_id,
            document_id: new.document_id,
            device_id: new.device_id,
            software_id: new.software_id,
            product_name_id: new.product_name_id,
            score: new.score,
            time: new.time,
            status: new.status,
            description: new.description,
            created: now,
            last_updated: now,
        };
        state.matches.push(m.clone());
        Ok(m)
    }

    async fn find_match_by_key(
        &self,
        key: &MatchKey,
    ) -> Result<Option<AdvisoryMatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.matches.iter().find(|m| m.key() == *key).cloned())
    }

    async fn get_match(&self, id: i64) -> Result<Option<AdvisoryMatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.matches.iter().find(|m| m.id == id).cloned())
    }

    async fn list_matches(&self, filter: &MatchFilter) -> Result<Vec<AdvisoryMatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .matches
            .iter()
            .filter(|m| filter.document_id.is_none_or(|id| m.document_id == id))
            .filter(|m| filter.device_id.is_none_or(|id| m.device_id == Some(id)))
            .filter(|m| filter.software_id.is_none_or(|id| m.software_id == Some(id)))
            .filter(|m| filter.status.is_none_or(|s| m.status == s))
            .cloned()
            .collect())
    }

    async fn update_match(&self, m: &AdvisoryMatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .matches
            .iter_mut()
            .find(|row| row.id == m.id)
            .ok_or_else(|| StoreError::NotFound(format!("match {}", m.id)))?;
        *slot = AdvisoryMatch {
            last_updated: Utc::now(),
            ..m.clone()
        };
        Ok(())
    }

    async fn set_match_status(
        &self,
        id: i64,
        status: MatchStatus,
    ) -> Result<AdvisoryMatch, StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .matches
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("match {id}")))?;
        slot.status = status;
        slot.last_updated = Utc::now();
        Ok(slot.clone())
    }
}

/// Postgres-backed store. All persistence operations are single-row
/// statements; duplicate-key violations map to [`StoreError::Duplicate`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_unique_violation(err: sqlx::Error, key: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate(key);
        }
    }
    StoreError::Database(err)
}

fn document_from_row(row: &PgRow) -> Result<AdvisoryDocument, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = DocumentStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown document status {status_text:?}")))?;
    Ok(AdvisoryDocument {
        id: row.try_get("id")?,
        docurl: row.try_get("docurl")?,
        title: row.try_get("title")?,
        version: row.try_get("version")?,
        lang: row.try_get("lang")?,
        publisher: row.try_get("publisher")?,
        status,
        created: row.try_get("created")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn match_from_row(row: &PgRow) -> Result<AdvisoryMatch, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = MatchStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown match status {status_text:?}")))?;
    Ok(AdvisoryMatch {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        device_id: row.try_get("device_id")?,
        software_id: row.try_get("software_id")?,
        product_name_id: row.try_get("product_name_id")?,
        score: row.try_get("score")?,
        time: row.try_get("time")?,
        status,
        description: row.try_get("description")?,
        created: row.try_get("created")?,
        last_updated: row.try_get("last_updated")?,
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, docurl, title, version, lang, publisher, status, created, last_updated";
const MATCH_COLUMNS: &str = "id, document_id, device_id, software_id, product_name_id, score, \
                             \"time\", status, description, created, last_updated";

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_document(&self, new: NewDocument) -> Result<AdvisoryDocument, StoreError> {
        let sql = format!(
            "INSERT INTO csaf_documents (docurl, title, version, lang, publisher, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {DOCUMENT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&new.docurl)
            .bind(&new.title)
            .bind(&new.version)
            .bind(&new.lang)
            .bind(&new.publisher)
            .bind(new.status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_unique_violation(err, format!("docurl {}", new.docurl)))?;
        document_from_row(&row)
    }

    async fn find_document_by_url(
        &self,
        docurl: &str,
    ) -> Result<Option<AdvisoryDocument>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM csaf_documents WHERE docurl = $1");
        let row = sqlx::query(&sql)
            .bind(docurl)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_document(&self, id: i64) -> Result<Option<AdvisoryDocument>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM csaf_documents WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<AdvisoryDocument>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM csaf_documents ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn list_documents_by_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> Result<Vec<AdvisoryDocument>, StoreError> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM csaf_documents WHERE status = ANY($1) ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(&wanted).fetch_all(&self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn update_document(&self, doc: &AdvisoryDocument) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE csaf_documents
                SET title = $2, version = $3, lang = $4, publisher = $5, status = $6,
                    last_updated = NOW()
              WHERE id = $1",
        )
        .bind(doc.id)
        .bind(&doc.title)
        .bind(&doc.version)
        .bind(&doc.lang)
        .bind(&doc.publisher)
        .bind(doc.status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("document {}", doc.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn insert_match(&self, new: NewMatch) -> Result<AdvisoryMatch, StoreError> {
        let sql = format!(
            "INSERT INTO csaf_matches
                 (document_id, device_id, software_id, product_name_id, score, \"time\",
                  status, description)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {MATCH_COLUMNS}"
        );
        let key = format!("match for document {}", new.document_id);
        let row = sqlx::query(&sql)
            .bind(new.document_id)
            .bind(new.device_id)
            .bind(new.software_id)
            .bind(&new.product_name_id)
            .bind(new.score)
            .bind(new.time)
            .bind(new.status.as_str())
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_unique_violation(err, key))?;
        match_from_row(&row)
    }

    async fn find_match_by_key(
        &self,
        key: &MatchKey,
    ) -> Result<Option<AdvisoryMatch>, StoreError> {
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM csaf_matches
              WHERE document_id = $1
                AND device_id IS NOT DISTINCT FROM $2
                AND software_id IS NOT DISTINCT FROM $3
                AND product_name_id IS NOT DISTINCT FROM $4"
        );
        let row = sqlx::query(&sql)
            .bind(key.document_id)
            .bind(key.device_id)
            .bind(key.software_id)
            .bind(&key.product_name_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(match_from_row).transpose()
    }

    async fn get_match(&self, id: i64) -> Result<Option<AdvisoryMatch>, StoreError> {
        let sql = format!("SELECT {MATCH_COLUMNS} FROM csaf_matches WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(match_from_row).transpose()
    }

    async fn list_matches(&self, filter: &MatchFilter) -> Result<Vec<AdvisoryMatch>, StoreError> {
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM csaf_matches
              WHERE ($1::bigint IS NULL OR document_id = $1)
                AND ($2::bigint IS NULL OR device_id = $2)
                AND ($3::bigint IS NULL OR software_id = $3)
                AND ($4::text IS NULL OR status = $4)
              ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.document_id)
            .bind(filter.device_id)
            .bind(filter.software_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn update_match(&self, m: &AdvisoryMatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE csaf_matches
                SET score = $2, \"time\" = $3, status = $4, description = $5,
                    last_updated = NOW()
              WHERE id = $1",
        )
        .bind(m.id)
        .bind(m.score)
        .bind(m.time)
        .bind(m.status.as_str())
        .bind(&m.description)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("match {}", m.id)));
        }
        Ok(())
    }

    async fn set_match_status(
        &self,
        id: i64,
        status: MatchStatus,
    ) -> Result<AdvisoryMatch, StoreError> {
        let sql = format!(
            "UPDATE csaf_matches SET status = $2, last_updated = NOW()
              WHERE id = $1
             RETURNING {MATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("match {id}")))?;
        match_from_row(&row)
    }
}
