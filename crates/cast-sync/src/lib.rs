//! Service layer of CAST: document registry, pending-document refresher,
//! match reconciliation, synchroniser polling and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cast_core::{
    truncate_chars, AdvisoryDocument, AdvisoryMatch, DocumentStatus, MatchKey, MatchStatus,
    DOCURL_MAX_LEN, LANG_MAX_LEN, PUBLISHER_MAX_LEN, TITLE_FAILED, TITLE_LOADING, TITLE_MAX_LEN,
    TITLE_NOT_FOUND, TITLE_UNTITLED, VERSION_MAX_LEN,
};
use cast_fetch::{
    bump_fetch_attempt, extract_document_fields, path_f64, path_str, ActionError, DocumentFetcher,
    DocumentPayload, FetchError, HttpSettings, SubsystemClient, TokenClient, TokenError,
};
use cast_storage::{
    create_or_get_document, create_or_get_match, DocumentStore, MatchStore, NewDocument, NewMatch,
    StoreError,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cast-sync";

/// Hourly, on the hour (seconds-resolution cron).
pub const DEFAULT_REFRESH_CRON: &str = "0 0 * * * *";
/// Grace period before the post-creation refresh, so the creating
/// transaction is committed by the time the fetch runs.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing settings: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

/// One external synchroniser subsystem. Credentials and TLS verification fall
/// back to the shared defaults when unset.
#[derive(Debug, Clone, Deserialize)]
pub struct SynchroniserConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify_ssl: Option<bool>,
    #[serde(default)]
    pub matcher: bool,
    #[serde(default)]
    pub netbox_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SynchroniserDefaults {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify_ssl: Option<bool>,
}

/// Validated settings file. Passed by reference into the refresher and the
/// poller; nothing reads ambient process-wide state.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub identity_provider: IdentityProviderConfig,
    #[serde(default)]
    pub synchronisers: Vec<SynchroniserConfig>,
    #[serde(default)]
    pub synchroniser_defaults: SynchroniserDefaults,
    #[serde(default)]
    pub netbox_base_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings = serde_yaml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_provider.url.trim().is_empty() {
            return Err(ConfigError::Invalid("identity_provider.url is empty".into()));
        }
        if self.identity_provider.username.trim().is_empty()
            || self.identity_provider.password.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "identity_provider credentials are incomplete".into(),
            ));
        }
        for system in &self.synchronisers {
            if system.name.trim().is_empty() {
                return Err(ConfigError::Invalid("synchroniser with empty name".into()));
            }
            if system.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "synchroniser {} has an empty url",
                    system.name
                )));
            }
            self.subsystem_credentials(system)?;
        }
        Ok(())
    }

    pub fn subsystem_credentials(
        &self,
        system: &SynchroniserConfig,
    ) -> Result<(String, String), ConfigError> {
        let username = system
            .username
            .clone()
            .or_else(|| self.synchroniser_defaults.username.clone())
            .ok_or_else(|| {
                ConfigError::Invalid(format!("no username for synchroniser {}", system.name))
            })?;
        let password = system
            .password
            .clone()
            .or_else(|| self.synchroniser_defaults.password.clone())
            .ok_or_else(|| {
                ConfigError::Invalid(format!("no password for synchroniser {}", system.name))
            })?;
        Ok((username, password))
    }

    pub fn subsystem_verify_ssl(&self, system: &SynchroniserConfig) -> bool {
        system
            .verify_ssl
            .or(self.synchroniser_defaults.verify_ssl)
            .unwrap_or(true)
    }

    pub fn subsystem_netbox_base<'a>(&'a self, system: &'a SynchroniserConfig) -> Option<&'a str> {
        system
            .netbox_base_url
            .as_deref()
            .or(self.netbox_base_url.as_deref())
    }
}

/// Runtime knobs from the environment, in the usual fallback style.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings_path: PathBuf,
    pub database_url: Option<String>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub refresh_delay_secs: u64,
    pub http_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            settings_path: std::env::var("CAST_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cast.yaml")),
            database_url: std::env::var("DATABASE_URL").ok(),
            web_port: std::env::var("CAST_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scheduler_enabled: std::env::var("CAST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("CAST_REFRESH_CRON")
                .unwrap_or_else(|_| DEFAULT_REFRESH_CRON.to_string()),
            refresh_delay_secs: std::env::var("CAST_REFRESH_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_DELAY.as_secs()),
            http_timeout_secs: std::env::var("CAST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_delay_secs)
    }
}

fn clip(field: &'static str, value: &str, max: usize) -> String {
    let (kept, cut) = truncate_chars(value, max);
    if cut {
        warn!(field, max, "truncating overlong value");
    }
    kept
}

// ---------------------------------------------------------------------------
// Document registry
// ---------------------------------------------------------------------------

/// Optional metadata supplied with a document submission. Only consulted when
/// the submission creates the document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentHints {
    pub title: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub publisher: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing docurl")]
    MissingUrl,
    #[error("docurl exceeds {DOCURL_MAX_LEN} characters")]
    UrlTooLong,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Idempotent create-by-URL for advisory documents.
#[derive(Clone)]
pub struct DocumentRegistry {
    store: Arc<dyn DocumentStore>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Return the document registered under `docurl`, creating it first if
    /// needed. A created document starts `Pending` with the loading sentinel
    /// title unless a title hint is given; hints never mutate an existing
    /// document.
    pub async fn create_or_get(
        &self,
        docurl: &str,
        hints: DocumentHints,
    ) -> Result<(AdvisoryDocument, bool), RegistryError> {
        let docurl = docurl.trim();
        if docurl.is_empty() {
            return Err(RegistryError::MissingUrl);
        }
        if docurl.chars().count() > DOCURL_MAX_LEN {
            return Err(RegistryError::UrlTooLong);
        }

        let title = hints
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| clip("title", t, TITLE_MAX_LEN))
            .unwrap_or_else(|| TITLE_LOADING.to_string());
        let new = NewDocument {
            docurl: docurl.to_string(),
            title,
            version: hints.version.as_deref().map(|v| clip("version", v, VERSION_MAX_LEN)),
            lang: hints.lang.as_deref().map(|v| clip("lang", v, LANG_MAX_LEN)),
            publisher: hints
                .publisher
                .as_deref()
                .map(|v| clip("publisher", v, PUBLISHER_MAX_LEN)),
            status: DocumentStatus::Pending,
        };

        let (doc, created) = create_or_get_document(self.store.as_ref(), new).await?;
        if created {
            info!(id = doc.id, docurl = %doc.docurl, "registered advisory document");
        }
        Ok((doc, created))
    }
}

// ---------------------------------------------------------------------------
// Pending-document refresher
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub loaded: usize,
    pub not_found: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded,
    NotFound,
    Failed,
}

/// Fold one fetch result into the document: populate and mark `Loaded`, mark
/// the in-band 404 as `NotFound`, or mark `Failed` and bump the
/// fetch-attempt counter kept in the version field.
pub fn apply_fetch_result(
    doc: &mut AdvisoryDocument,
    result: Result<Value, FetchError>,
) -> FetchOutcome {
    match result {
        Ok(payload) => match extract_document_fields(&payload) {
            DocumentPayload::NotFound => {
                doc.title = TITLE_NOT_FOUND.to_string();
                doc.status = DocumentStatus::NotFound;
                FetchOutcome::NotFound
            }
            DocumentPayload::Loaded(fields) => {
                doc.title = clip(
                    "title",
                    fields.title.as_deref().unwrap_or(TITLE_UNTITLED),
                    TITLE_MAX_LEN,
                );
                doc.lang = fields.lang.as_deref().map(|v| clip("lang", v, LANG_MAX_LEN));
                doc.version = fields
                    .version
                    .as_deref()
                    .map(|v| clip("version", v, VERSION_MAX_LEN));
                doc.publisher = fields
                    .publisher
                    .as_deref()
                    .map(|v| clip("publisher", v, PUBLISHER_MAX_LEN));
                doc.status = DocumentStatus::Loaded;
                info!(title = %doc.title, "loaded document");
                FetchOutcome::Loaded
            }
        },
        Err(err) => {
            warn!(docurl = %doc.docurl, error = %err, "document fetch failed");
            doc.title = TITLE_FAILED.to_string();
            doc.version = Some(bump_fetch_attempt(doc.version.as_deref()));
            doc.status = DocumentStatus::Failed;
            FetchOutcome::Failed
        }
    }
}

/// Fetches metadata for every document still awaiting it. Runs hourly and
/// shortly after each document creation.
pub struct Refresher {
    store: Arc<dyn DocumentStore>,
    tokens: TokenClient,
    fetcher: DocumentFetcher,
    identity: IdentityProviderConfig,
}

impl Refresher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: IdentityProviderConfig,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = HttpSettings {
            timeout,
            verify_ssl: identity.verify_ssl,
        };
        Ok(Self {
            tokens: TokenClient::new(&http)?,
            fetcher: DocumentFetcher::new(&http)?,
            store,
            identity,
        })
    }

    /// Refresh every `Pending` or `Failed` document. One bearer token is
    /// acquired lazily and reused for the whole batch; per-document failures
    /// are recorded on the row and never abort the run.
    pub async fn refresh_pending_documents(&self) -> Result<RefreshRunSummary, RefreshError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let docs = self
            .store
            .list_documents_by_status(&[DocumentStatus::Pending, DocumentStatus::Failed])
            .await?;
        let selected = docs.len();

        let mut token: Option<String> = None;
        let mut loaded = 0usize;
        let mut not_found = 0usize;
        let mut failed = 0usize;

        for mut doc in docs {
            let bearer = match &token {
                Some(t) => t.clone(),
                None => {
                    let t = self
                        .tokens
                        .keycloak_token(
                            &self.identity.url,
                            &self.identity.username,
                            &self.identity.password,
                        )
                        .await?;
                    token = Some(t.clone());
                    t
                }
            };

            let result = self.fetcher.fetch_document(&doc.docurl, &bearer).await;
            match apply_fetch_result(&mut doc, result) {
                FetchOutcome::Loaded => loaded += 1,
                FetchOutcome::NotFound => not_found += 1,
                FetchOutcome::Failed => failed += 1,
            }
            if let Err(err) = self.store.update_document(&doc).await {
                warn!(id = doc.id, error = %err, "persisting refreshed document failed");
            }
        }

        let summary = RefreshRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            selected,
            loaded,
            not_found,
            failed,
        };
        info!(
            run_id = %summary.run_id,
            selected, loaded, not_found, failed,
            "document refresh finished"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Match reconciliation
// ---------------------------------------------------------------------------

/// One incoming detection linking an advisory document to an asset.
#[derive(Debug, Clone)]
pub struct Detection {
    pub document_id: i64,
    pub device_id: Option<i64>,
    pub software_id: Option<i64>,
    pub product_name_id: Option<String>,
    pub score: f64,
    pub description: String,
}

/// Create-or-merge for advisory matches keyed by the composite identity.
#[derive(Clone)]
pub struct MatchReconciler {
    store: Arc<dyn MatchStore>,
}

impl MatchReconciler {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    /// Insert a `New` match, or merge into the existing one. A lower-or-equal
    /// score leaves the stored match untouched; a higher score appends to the
    /// description log, raises the score, and reopens a dismissed match.
    pub async fn upsert_match(&self, detection: Detection) -> Result<AdvisoryMatch, StoreError> {
        let key = MatchKey {
            document_id: detection.document_id,
            device_id: detection.device_id,
            software_id: detection.software_id,
            product_name_id: detection.product_name_id.clone(),
        };
        if let Some(existing) = self.store.find_match_by_key(&key).await? {
            return self.merge(existing, detection).await;
        }

        let new = NewMatch {
            document_id: detection.document_id,
            device_id: detection.device_id,
            software_id: detection.software_id,
            product_name_id: detection.product_name_id,
            score: detection.score,
            time: Utc::now(),
            status: MatchStatus::New,
            description: detection.description,
        };
        let (m, created) = create_or_get_match(self.store.as_ref(), new).await?;
        if created {
            info!(id = m.id, document_id = m.document_id, score = m.score, "created match");
        }
        Ok(m)
    }

    async fn merge(
        &self,
        mut existing: AdvisoryMatch,
        detection: Detection,
    ) -> Result<AdvisoryMatch, StoreError> {
        if detection.score <= existing.score {
            debug!(id = existing.id, "dropping lower-score re-detection");
            return Ok(existing);
        }

        let mut log = std::mem::take(&mut existing.description);
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(detection.description.trim());
        log.push('\n');
        log.push_str(&format!(
            "Score raised from {} to {}",
            existing.score, detection.score
        ));
        if existing.status == MatchStatus::FalsePositive {
            log.push('\n');
            log.push_str("Reopened by new detection");
            existing.status = MatchStatus::Reopened;
            info!(id = existing.id, "reopened dismissed match");
        }
        existing.score = detection.score;
        existing.time = Utc::now();
        existing.description = log;

        self.store.update_match(&existing).await?;
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// Match submission (single or bulk)
// ---------------------------------------------------------------------------

/// The document reference of a submission: a local id, or a docurl that is
/// registered first.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DocumentRef {
    Id(i64),
    Url(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchSubmission {
    pub csaf_document: DocumentRef,
    #[serde(default)]
    pub device: Option<i64>,
    #[serde(default)]
    pub software: Option<i64>,
    #[serde(default)]
    pub product_name_id: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SubmittedMatch {
    pub record: AdvisoryMatch,
    /// Whether this submission registered a new document (and a refresh
    /// should be scheduled).
    pub document_created: bool,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown document id {0}")]
    UnknownDocument(i64),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct SubmissionService {
    registry: DocumentRegistry,
    reconciler: MatchReconciler,
    documents: Arc<dyn DocumentStore>,
}

impl SubmissionService {
    pub fn new(
        registry: DocumentRegistry,
        reconciler: MatchReconciler,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            registry,
            reconciler,
            documents,
        }
    }

    pub async fn submit_one(
        &self,
        submission: MatchSubmission,
    ) -> Result<SubmittedMatch, SubmitError> {
        let (document_id, document_created) = match &submission.csaf_document {
            DocumentRef::Id(id) => {
                self.documents
                    .get_document(*id)
                    .await?
                    .ok_or(SubmitError::UnknownDocument(*id))?;
                (*id, false)
            }
            DocumentRef::Url(url) => {
                let (doc, created) = self
                    .registry
                    .create_or_get(url, DocumentHints::default())
                    .await?;
                (doc.id, created)
            }
        };

        let record = self
            .reconciler
            .upsert_match(Detection {
                document_id,
                device_id: submission.device,
                software_id: submission.software,
                product_name_id: submission.product_name_id,
                score: submission.score,
                description: submission.description,
            })
            .await?;
        Ok(SubmittedMatch {
            record,
            document_created,
        })
    }

    /// Process each element independently; a failing element occupies its
    /// result slot without aborting the rest.
    pub async fn submit_matches(
        &self,
        submissions: Vec<MatchSubmission>,
    ) -> Vec<Result<SubmittedMatch, SubmitError>> {
        let mut out = Vec::with_capacity(submissions.len());
        for submission in submissions {
            out.push(self.submit_one(submission).await);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Synchroniser status poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Start,
    Stop,
    Trigger,
}

impl SyncAction {
    pub fn path(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Trigger => "trigger",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "trigger" => Some(Self::Trigger),
            _ => None,
        }
    }
}

/// Display row of a synchroniser listing. Timestamps and states are
/// preformatted; a failed login degrades to a state string instead of an
/// error.
#[derive(Debug, Clone, Serialize)]
pub struct SynchroniserRow {
    pub index: usize,
    pub name: String,
    pub state: String,
    pub last_sync: String,
    pub started: String,
}

/// Optional filters for a `trigger` action, resolved to absolute URLs before
/// the POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub device: Option<i64>,
    #[serde(default)]
    pub software: Option<i64>,
    #[serde(default)]
    pub document: Option<i64>,
}

impl TriggerRequest {
    pub fn is_empty(&self) -> bool {
        self.device.is_none() && self.software.is_none() && self.document.is_none()
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("no synchroniser at index {0}")]
    UnknownSynchroniser(usize),
    #[error("no netbox base url configured to resolve {0} links")]
    MissingBaseUrl(&'static str),
    #[error("unknown document id {0}")]
    UnknownDocument(i64),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Client(#[from] FetchError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SyncStatusPoller {
    settings: Arc<Settings>,
    documents: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl SyncStatusPoller {
    pub fn new(
        settings: Arc<Settings>,
        documents: Arc<dyn DocumentStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            settings,
            documents,
            timeout,
        }
    }

    /// One row per configured subsystem. Login and status failures become
    /// state strings; the listing itself never fails.
    pub async fn status_rows(&self) -> Vec<SynchroniserRow> {
        let mut rows = Vec::with_capacity(self.settings.synchronisers.len());
        for (index, system) in self.settings.synchronisers.iter().enumerate() {
            rows.push(self.status_row(index, system).await);
        }
        rows
    }

    async fn status_row(&self, index: usize, system: &SynchroniserConfig) -> SynchroniserRow {
        let placeholder = |state: String| SynchroniserRow {
            index,
            name: system.name.clone(),
            state,
            last_sync: "-".to_string(),
            started: "-".to_string(),
        };

        let token = match self.login(system).await {
            Ok(token) => token,
            Err(PollerError::Token(err)) => {
                warn!(name = %system.name, error = %err, "synchroniser login failed");
                return placeholder(err.state_label().to_string());
            }
            Err(err) => {
                warn!(name = %system.name, error = %err, "synchroniser unusable");
                return placeholder("Misconfigured".to_string());
            }
        };

        let client = match self.client(system) {
            Ok(client) => client,
            Err(err) => {
                warn!(name = %system.name, error = %err, "building subsystem client failed");
                return placeholder("Offline".to_string());
            }
        };
        match client.task_status(&system.url, &token).await {
            Ok(status) => parse_status_row(index, &system.name, system.matcher, &status),
            Err(err) => {
                warn!(name = %system.name, error = %err, "synchroniser status fetch failed");
                placeholder("Offline".to_string())
            }
        }
    }

    /// Run an operator action against one subsystem. Failures carry the
    /// subsystem's own response text; nothing is retried.
    pub async fn run_action(
        &self,
        index: usize,
        action: SyncAction,
        trigger: Option<TriggerRequest>,
    ) -> Result<String, PollerError> {
        let system = self
            .settings
            .synchronisers
            .get(index)
            .ok_or(PollerError::UnknownSynchroniser(index))?;

        let token = self.login(system).await?;
        let body = match (action, trigger) {
            (SyncAction::Trigger, Some(request)) if !request.is_empty() => {
                Some(self.trigger_body(system, request).await?)
            }
            _ => None,
        };

        let client = self.client(system)?;
        client
            .task_action(&system.url, &token, action.path(), body.as_ref())
            .await?;
        info!(name = %system.name, action = action.path(), "synchroniser action sent");
        Ok(format!("{} sent to {}", action.path(), system.name))
    }

    async fn login(&self, system: &SynchroniserConfig) -> Result<String, PollerError> {
        let (username, password) = self.settings.subsystem_credentials(system)?;
        let tokens = TokenClient::new(&HttpSettings {
            timeout: self.timeout,
            verify_ssl: self.settings.subsystem_verify_ssl(system),
        })?;
        Ok(tokens
            .subsystem_token(&system.url, &username, &password)
            .await?)
    }

    fn client(&self, system: &SynchroniserConfig) -> Result<SubsystemClient, FetchError> {
        SubsystemClient::new(&HttpSettings {
            timeout: self.timeout,
            verify_ssl: self.settings.subsystem_verify_ssl(system),
        })
    }

    /// Resolve trigger filters to absolute URLs: devices and software through
    /// the configured base-URL template, documents through their own docurl.
    async fn trigger_body(
        &self,
        system: &SynchroniserConfig,
        request: TriggerRequest,
    ) -> Result<Value, PollerError> {
        let mut body = serde_json::Map::new();
        if let Some(id) = request.device {
            let base = self
                .settings
                .subsystem_netbox_base(system)
                .ok_or(PollerError::MissingBaseUrl("device"))?;
            body.insert(
                "device".to_string(),
                Value::String(format!(
                    "{}/api/dcim/devices/{}/",
                    base.trim_end_matches('/'),
                    id
                )),
            );
        }
        if let Some(id) = request.software {
            let base = self
                .settings
                .subsystem_netbox_base(system)
                .ok_or(PollerError::MissingBaseUrl("software"))?;
            body.insert(
                "software".to_string(),
                Value::String(format!(
                    "{}/api/plugins/d3c/software/{}/",
                    base.trim_end_matches('/'),
                    id
                )),
            );
        }
        if let Some(id) = request.document {
            let doc = self
                .documents
                .get_document(id)
                .await?
                .ok_or(PollerError::UnknownDocument(id))?;
            body.insert("document".to_string(), Value::String(doc.docurl));
        }
        Ok(Value::Object(body))
    }
}

pub fn parse_status_row(
    index: usize,
    name: &str,
    matcher: bool,
    status: &Value,
) -> SynchroniserRow {
    let state = path_str(status, &["state"]).unwrap_or("Unknown").to_string();
    let last_run = if matcher {
        path_f64(status, &["last_matching"]).or_else(|| path_f64(status, &["last_synchronization"]))
    } else {
        path_f64(status, &["last_synchronization"]).or_else(|| path_f64(status, &["last_matching"]))
    };
    let last_sync = last_run
        .map(format_epoch)
        .unwrap_or_else(|| "Never or currently running".to_string());
    let started = path_f64(status, &["start"])
        .map(format_epoch)
        .unwrap_or_else(|| "-".to_string());
    SynchroniserRow {
        index,
        name: name.to_string(),
        state,
        last_sync,
        started,
    }
}

fn format_epoch(secs: f64) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Build (but do not start) the hourly refresh scheduler.
pub async fn build_scheduler(
    refresher: Arc<Refresher>,
    cron: &str,
    enabled: bool,
) -> anyhow::Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let refresher = refresher.clone();
        Box::pin(async move {
            match refresher.refresh_pending_documents().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    loaded = summary.loaded,
                    failed = summary.failed,
                    "scheduled document refresh finished"
                ),
                Err(err) => warn!(error = %err, "scheduled document refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}

/// One-shot refresh after `delay`, used right after a document creation.
pub fn spawn_delayed_refresh(refresher: Arc<Refresher>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(err) = refresher.refresh_pending_documents().await {
            warn!(error = %err, "delayed document refresh failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_storage::{MatchFilter, MemoryStore};
    use serde_json::json;
    use std::io::Write;

    fn stores() -> (Arc<MemoryStore>, DocumentRegistry, MatchReconciler) {
        let store = Arc::new(MemoryStore::new());
        let documents: Arc<dyn DocumentStore> = store.clone();
        let matches: Arc<dyn MatchStore> = store.clone();
        (
            store,
            DocumentRegistry::new(documents),
            MatchReconciler::new(matches),
        )
    }

    fn detection(document_id: i64, score: f64, description: &str) -> Detection {
        Detection {
            document_id,
            device_id: Some(7),
            software_id: None,
            product_name_id: Some("vendor/product".into()),
            score,
            description: description.to_string(),
        }
    }

    fn settings_fixture() -> Settings {
        Settings {
            identity_provider: IdentityProviderConfig {
                url: "https://keycloak.example".into(),
                username: "csaf".into(),
                password: "secret".into(),
                verify_ssl: true,
            },
            synchronisers: vec![
                SynchroniserConfig {
                    name: "isduba".into(),
                    url: "https://isduba.example".into(),
                    username: Some("sync".into()),
                    password: Some("secret".into()),
                    verify_ssl: Some(false),
                    matcher: false,
                    netbox_base_url: None,
                },
                SynchroniserConfig {
                    name: "matcher".into(),
                    url: "https://matcher.example".into(),
                    username: None,
                    password: None,
                    verify_ssl: None,
                    matcher: true,
                    netbox_base_url: Some("https://netbox.example".into()),
                },
            ],
            synchroniser_defaults: SynchroniserDefaults {
                username: Some("fallback".into()),
                password: Some("fallback-secret".into()),
                verify_ssl: None,
            },
            netbox_base_url: Some("https://netbox.default".into()),
        }
    }

    #[tokio::test]
    async fn registry_is_idempotent_and_ignores_later_hints() {
        let (store, registry, _) = stores();

        let (first, created) = registry
            .create_or_get("https://x/doc1", DocumentHints::default())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.id, 1);
        assert_eq!(first.title, TITLE_LOADING);
        assert_eq!(first.status, DocumentStatus::Pending);

        let (second, created) = registry
            .create_or_get(
                "https://x/doc1",
                DocumentHints {
                    title: Some("late hint".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.title, TITLE_LOADING);
        assert_eq!(store.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_applies_hints_on_creation_only() {
        let (_, registry, _) = stores();
        let (doc, _) = registry
            .create_or_get(
                "https://x/doc1",
                DocumentHints {
                    title: Some("Known advisory".into()),
                    version: Some("7".into()),
                    lang: Some("de".into()),
                    publisher: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(doc.title, "Known advisory");
        assert_eq!(doc.version.as_deref(), Some("7"));
        assert_eq!(doc.lang.as_deref(), Some("de"));
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn registry_rejects_missing_url() {
        let (_, registry, _) = stores();
        let err = registry
            .create_or_get("   ", DocumentHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingUrl));
    }

    #[tokio::test]
    async fn lower_or_equal_score_never_mutates() {
        let (store, _, reconciler) = stores();
        let doc = seed_document(&store, "https://x/doc1").await;

        let original = reconciler
            .upsert_match(detection(doc.id, 5.0, "first sighting"))
            .await
            .unwrap();

        for score in [4.0, 5.0] {
            let unchanged = reconciler
                .upsert_match(detection(doc.id, score, "ignored re-detection"))
                .await
                .unwrap();
            assert_eq!(unchanged.score, original.score);
            assert_eq!(unchanged.status, original.status);
            assert_eq!(unchanged.description, original.description);
        }
        assert_eq!(
            store.list_matches(&MatchFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn higher_score_merges_and_annotates() {
        let (store, _, reconciler) = stores();
        let doc = seed_document(&store, "https://x/doc1").await;

        reconciler
            .upsert_match(detection(doc.id, 2.5, "first sighting"))
            .await
            .unwrap();
        let merged = reconciler
            .upsert_match(detection(doc.id, 7.1, "second sighting"))
            .await
            .unwrap();

        assert_eq!(merged.score, 7.1);
        assert_eq!(merged.status, MatchStatus::New);
        assert!(merged.description.contains("first sighting"));
        assert!(merged.description.contains("second sighting"));
        assert!(merged.description.contains("Score raised from 2.5 to 7.1"));
    }

    #[tokio::test]
    async fn false_positive_reopens_on_stronger_detection() {
        let (store, _, reconciler) = stores();
        let doc = seed_document(&store, "https://x/doc1").await;

        let m = reconciler
            .upsert_match(detection(doc.id, 3.0, "first sighting"))
            .await
            .unwrap();
        store
            .set_match_status(m.id, MatchStatus::FalsePositive)
            .await
            .unwrap();

        let reopened = reconciler
            .upsert_match(detection(doc.id, 8.0, "it came back"))
            .await
            .unwrap();
        assert_eq!(reopened.status, MatchStatus::Reopened);
        assert!(reopened.description.contains("first sighting"));
        assert!(reopened.description.contains("it came back"));
        assert!(reopened.description.contains("Reopened by new detection"));
    }

    #[tokio::test]
    async fn resolved_matches_are_never_reset() {
        let (store, _, reconciler) = stores();
        let doc = seed_document(&store, "https://x/doc1").await;

        let m = reconciler
            .upsert_match(detection(doc.id, 3.0, "first sighting"))
            .await
            .unwrap();
        store
            .set_match_status(m.id, MatchStatus::Resolved)
            .await
            .unwrap();

        let merged = reconciler
            .upsert_match(detection(doc.id, 9.0, "stronger hit"))
            .await
            .unwrap();
        assert_eq!(merged.status, MatchStatus::Resolved);
        assert_eq!(merged.score, 9.0);
    }

    #[tokio::test]
    async fn bulk_submission_survives_bad_elements() {
        let (store, registry, reconciler) = stores();
        let documents: Arc<dyn DocumentStore> = store.clone();
        let service = SubmissionService::new(registry, reconciler, documents);

        let results = service
            .submit_matches(vec![
                MatchSubmission {
                    csaf_document: DocumentRef::Url("https://x/doc1".into()),
                    device: Some(7),
                    software: None,
                    product_name_id: None,
                    score: 5.0,
                    description: "via url".into(),
                },
                MatchSubmission {
                    csaf_document: DocumentRef::Id(999),
                    device: None,
                    software: Some(3),
                    product_name_id: None,
                    score: 2.0,
                    description: "bad document id".into(),
                },
                MatchSubmission {
                    csaf_document: DocumentRef::Id(1),
                    device: Some(8),
                    software: None,
                    product_name_id: None,
                    score: 1.0,
                    description: "via id".into(),
                },
            ])
            .await;

        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert!(first.document_created);
        assert_eq!(first.record.document_id, 1);
        assert!(matches!(results[1], Err(SubmitError::UnknownDocument(999))));
        let third = results[2].as_ref().unwrap();
        assert!(!third.document_created);
        assert_eq!(
            store.list_matches(&MatchFilter::default()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn fetched_payload_populates_and_truncates() {
        let mut doc = pending_document("https://x/doc1");
        let long_title = "A".repeat(140);
        let payload = json!({
            "document": {
                "title": long_title,
                "lang": "en",
                "tracking": {"version": "2"},
                "publisher": {"name": "Vendor"}
            }
        });

        let outcome = apply_fetch_result(&mut doc, Ok(payload));
        assert_eq!(outcome, FetchOutcome::Loaded);
        assert_eq!(doc.status, DocumentStatus::Loaded);
        assert_eq!(doc.title.chars().count(), TITLE_MAX_LEN);
        assert_eq!(doc.lang.as_deref(), Some("en"));
        assert_eq!(doc.version.as_deref(), Some("2"));
        assert_eq!(doc.publisher.as_deref(), Some("Vendor"));
    }

    #[tokio::test]
    async fn in_band_not_found_marks_document() {
        let mut doc = pending_document("https://x/doc1");
        let outcome = apply_fetch_result(&mut doc, Ok(json!({"code": 404})));
        assert_eq!(outcome, FetchOutcome::NotFound);
        assert_eq!(doc.status, DocumentStatus::NotFound);
        assert_eq!(doc.title, TITLE_NOT_FOUND);
    }

    #[tokio::test]
    async fn fetch_failure_bumps_attempt_counter() {
        let mut doc = pending_document("https://x/doc1");
        doc.version = Some("abc".into());
        let url = doc.docurl.clone();
        apply_fetch_result(
            &mut doc,
            Err(FetchError::HttpStatus {
                status: 500,
                url,
            }),
        );
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.title, TITLE_FAILED);
        assert_eq!(doc.version.as_deref(), Some("1"));

        doc.version = Some("3".into());
        let url = doc.docurl.clone();
        apply_fetch_result(
            &mut doc,
            Err(FetchError::HttpStatus {
                status: 500,
                url,
            }),
        );
        assert_eq!(doc.version.as_deref(), Some("4"));
    }

    #[test]
    fn status_rows_prefer_the_matcher_field_for_matchers() {
        let status = json!({
            "state": "idle",
            "last_synchronization": 1700000000,
            "last_matching": 1700003600,
            "start": 1699996400
        });

        let sync_row = parse_status_row(0, "isduba", false, &status);
        assert_eq!(sync_row.state, "idle");
        assert!(sync_row.last_sync.starts_with("2023-11-14"));

        let match_row = parse_status_row(1, "matcher", true, &status);
        assert_ne!(match_row.last_sync, sync_row.last_sync);

        let empty = parse_status_row(0, "isduba", false, &json!({}));
        assert_eq!(empty.state, "Unknown");
        assert_eq!(empty.last_sync, "Never or currently running");
        assert_eq!(empty.started, "-");
    }

    #[tokio::test]
    async fn trigger_filters_resolve_to_absolute_urls() {
        let (store, registry, _) = stores();
        let (doc, _) = registry
            .create_or_get("https://isduba.example/api/documents/42", DocumentHints::default())
            .await
            .unwrap();

        let settings = Arc::new(settings_fixture());
        let documents: Arc<dyn DocumentStore> = store.clone();
        let poller = SyncStatusPoller::new(settings, documents, Duration::from_secs(5));

        let system = &poller.settings.synchronisers[1];
        let body = poller
            .trigger_body(
                system,
                TriggerRequest {
                    device: Some(7),
                    software: Some(3),
                    document: Some(doc.id),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            path_str(&body, &["device"]),
            Some("https://netbox.example/api/dcim/devices/7/")
        );
        assert_eq!(
            path_str(&body, &["software"]),
            Some("https://netbox.example/api/plugins/d3c/software/3/")
        );
        assert_eq!(
            path_str(&body, &["document"]),
            Some("https://isduba.example/api/documents/42")
        );
    }

    #[tokio::test]
    async fn unreachable_synchroniser_degrades_to_a_state_row() {
        let (store, _, _) = stores();
        let mut settings = settings_fixture();
        // Nothing listens on port 1, so the login is refused immediately.
        settings.synchronisers.truncate(1);
        settings.synchronisers[0].url = "http://127.0.0.1:1".into();
        let documents: Arc<dyn DocumentStore> = store.clone();
        let poller =
            SyncStatusPoller::new(Arc::new(settings), documents, Duration::from_secs(2));

        let rows = poller.status_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "isduba");
        assert_eq!(rows[0].state, "Connection Failed");
        assert_eq!(rows[0].last_sync, "-");
        assert_eq!(rows[0].started, "-");
    }

    #[tokio::test]
    async fn trigger_without_base_url_is_rejected() {
        let (store, _, _) = stores();
        let mut settings = settings_fixture();
        settings.netbox_base_url = None;
        settings.synchronisers[0].netbox_base_url = None;
        let settings = Arc::new(settings);
        let documents: Arc<dyn DocumentStore> = store.clone();
        let poller = SyncStatusPoller::new(settings, documents, Duration::from_secs(5));

        let system = &poller.settings.synchronisers[0];
        let err = poller
            .trigger_body(
                system,
                TriggerRequest {
                    device: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PollerError::MissingBaseUrl("device")));
    }

    #[test]
    fn settings_parse_with_fallbacks() {
        let yaml = r#"
identity_provider:
  url: https://keycloak.example
  username: csaf
  password: secret
synchroniser_defaults:
  username: shared
  password: shared-secret
  verify_ssl: false
synchronisers:
  - name: isduba
    url: https://isduba.example
  - name: matcher
    url: https://matcher.example
    username: override
    password: override-secret
    matcher: true
netbox_base_url: https://netbox.example
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();

        assert!(settings.identity_provider.verify_ssl);
        let (username, _) = settings
            .subsystem_credentials(&settings.synchronisers[0])
            .unwrap();
        assert_eq!(username, "shared");
        let (username, _) = settings
            .subsystem_credentials(&settings.synchronisers[1])
            .unwrap();
        assert_eq!(username, "override");
        assert!(!settings.subsystem_verify_ssl(&settings.synchronisers[0]));
        assert!(settings.synchronisers[1].matcher);
    }

    #[test]
    fn settings_validation_rejects_incomplete_subsystems() {
        let yaml = r#"
identity_provider:
  url: https://keycloak.example
  username: csaf
  password: secret
synchronisers:
  - name: isduba
    url: https://isduba.example
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let yaml = r#"
identity_provider:
  url: ""
  username: csaf
  password: secret
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "identity_provider:\n  url: https://keycloak.example\n  username: csaf\n  password: secret\n"
        )
        .unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.synchronisers.is_empty());

        let missing = Settings::load(Path::new("/nonexistent/cast.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    async fn seed_document(store: &Arc<MemoryStore>, docurl: &str) -> AdvisoryDocument {
        store
            .insert_document(NewDocument {
                docurl: docurl.to_string(),
                title: TITLE_LOADING.to_string(),
                version: None,
                lang: None,
                publisher: None,
                status: DocumentStatus::Pending,
            })
            .await
            .unwrap()
    }

    fn pending_document(docurl: &str) -> AdvisoryDocument {
        AdvisoryDocument {
            id: 1,
            docurl: docurl.to_string(),
            title: TITLE_LOADING.to_string(),
            version: None,
            lang: None,
            publisher: None,
            status: DocumentStatus::Pending,
            created: Utc::now(),
            last_updated: Utc::now(),
        }
    }
}
