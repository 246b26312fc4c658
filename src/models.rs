//! Shared domain types for the feed ingestion and product resolution pipeline.
//!
//! Enums here are closed sets: they double as metric labels and persisted
//! column values, so every variant has a stable string form.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Feed lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    Draft,
    Enabled,
    Paused,
    Disabled,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Draft => "DRAFT",
            FeedStatus::Enabled => "ENABLED",
            FeedStatus::Paused => "PAUSED",
            FeedStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(FeedStatus::Draft),
            "ENABLED" => Some(FeedStatus::Enabled),
            "PAUSED" => Some(FeedStatus::Paused),
            "DISABLED" => Some(FeedStatus::Disabled),
            _ => None,
        }
    }
}

/// Remote transport protocol for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    Ftp,
    Sftp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ftp => "FTP",
            TransportKind::Sftp => "SFTP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FTP" => Some(TransportKind::Ftp),
            "SFTP" => Some(TransportKind::Sftp),
            _ => None,
        }
    }
}

/// Compression wrapper around the remote feed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Gzip => "GZIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Compression::None),
            "GZIP" => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// Which ingestion pipeline a feed belongs to. Doubles as the bounded
/// `pipeline` / `source_kind` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    Affiliate,
    Retailer,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Affiliate => "affiliate",
            Pipeline::Retailer => "retailer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "affiliate" => Some(Pipeline::Affiliate),
            "retailer" => Some(Pipeline::Retailer),
            _ => None,
        }
    }

    pub const ALL: [Pipeline; 2] = [Pipeline::Affiliate, Pipeline::Retailer];
}

/// What caused a feed run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    ManualPending,
    AdminTest,
    Retry,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "SCHEDULED",
            RunTrigger::Manual => "MANUAL",
            RunTrigger::ManualPending => "MANUAL_PENDING",
            RunTrigger::AdminTest => "ADMIN_TEST",
            RunTrigger::Retry => "RETRY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(RunTrigger::Scheduled),
            "MANUAL" => Some(RunTrigger::Manual),
            "MANUAL_PENDING" => Some(RunTrigger::ManualPending),
            "ADMIN_TEST" => Some(RunTrigger::AdminTest),
            "RETRY" => Some(RunTrigger::Retry),
            _ => None,
        }
    }
}

/// Feed run terminal/active status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCEEDED" => Some(RunStatus::Succeeded),
            "FAILED" => Some(RunStatus::Failed),
            "SKIPPED" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub const ALL: [RunStatus; 4] = [
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Skipped,
    ];
}

/// Coarse failure bucket surfaced on a feed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Transport,
    Parse,
    Circuit,
    Admin,
    System,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "TRANSPORT",
            FailureKind::Parse => "PARSE",
            FailureKind::Circuit => "CIRCUIT",
            FailureKind::Admin => "ADMIN",
            FailureKind::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSPORT" => Some(FailureKind::Transport),
            "PARSE" => Some(FailureKind::Parse),
            "CIRCUIT" => Some(FailureKind::Circuit),
            "ADMIN" => Some(FailureKind::Admin),
            "SYSTEM" => Some(FailureKind::System),
            _ => None,
        }
    }
}

/// Specific failure constant surfaced on a feed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    Auth,
    Transport,
    FileNotFound,
    FileTooLarge,
    Timeout,
    TransportNotAllowed,
    ParseError,
    TooManyRows,
    CircuitOpen,
    AdminReset,
    ManuallyCancelled,
    SystemError,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Auth => "AUTH",
            FailureCode::Transport => "TRANSPORT",
            FailureCode::FileNotFound => "FILE_NOT_FOUND",
            FailureCode::FileTooLarge => "FILE_TOO_LARGE",
            FailureCode::Timeout => "TIMEOUT",
            FailureCode::TransportNotAllowed => "TRANSPORT_NOT_ALLOWED",
            FailureCode::ParseError => "PARSE_ERROR",
            FailureCode::TooManyRows => "TOO_MANY_ROWS",
            FailureCode::CircuitOpen => "CIRCUIT_OPEN",
            FailureCode::AdminReset => "ADMIN_RESET",
            FailureCode::ManuallyCancelled => "MANUALLY_CANCELLED",
            FailureCode::SystemError => "SYSTEM_ERROR",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FailureCode::Auth
            | FailureCode::Transport
            | FailureCode::FileNotFound
            | FailureCode::FileTooLarge
            | FailureCode::Timeout
            | FailureCode::TransportNotAllowed => FailureKind::Transport,
            FailureCode::ParseError | FailureCode::TooManyRows => FailureKind::Parse,
            FailureCode::CircuitOpen => FailureKind::Circuit,
            FailureCode::AdminReset | FailureCode::ManuallyCancelled => FailureKind::Admin,
            FailureCode::SystemError => FailureKind::System,
        }
    }
}

/// Why a feed run ended SKIPPED without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    LockBusy,
    UnchangedStat,
    UnchangedHash,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::LockBusy => "LOCK_BUSY",
            SkipReason::UnchangedStat => "UNCHANGED_STAT",
            SkipReason::UnchangedHash => "UNCHANGED_HASH",
        }
    }
}

/// How a product link was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Upc,
    Fingerprint,
    Manual,
    None,
    Error,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Upc => "UPC",
            MatchType::Fingerprint => "FINGERPRINT",
            MatchType::Manual => "MANUAL",
            MatchType::None => "NONE",
            MatchType::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPC" => Some(MatchType::Upc),
            "FINGERPRINT" => Some(MatchType::Fingerprint),
            "MANUAL" => Some(MatchType::Manual),
            "NONE" => Some(MatchType::None),
            "ERROR" => Some(MatchType::Error),
            _ => None,
        }
    }

    /// Relink hysteresis ordering: UPC > FINGERPRINT > NONE > ERROR.
    /// MANUAL never reaches the comparison (locked earlier in the pipeline).
    pub fn strength(&self) -> u8 {
        match self {
            MatchType::Manual => 4,
            MatchType::Upc => 3,
            MatchType::Fingerprint => 2,
            MatchType::None => 1,
            MatchType::Error => 0,
        }
    }
}

/// Product link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Matched,
    Created,
    NeedsReview,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Matched => "MATCHED",
            LinkStatus::Created => "CREATED",
            LinkStatus::NeedsReview => "NEEDS_REVIEW",
            LinkStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MATCHED" => Some(LinkStatus::Matched),
            "CREATED" => Some(LinkStatus::Created),
            "NEEDS_REVIEW" => Some(LinkStatus::NeedsReview),
            "ERROR" => Some(LinkStatus::Error),
            _ => None,
        }
    }

    pub const ALL: [LinkStatus; 4] = [
        LinkStatus::Matched,
        LinkStatus::Created,
        LinkStatus::NeedsReview,
        LinkStatus::Error,
    ];
}

/// Bounded reason codes recorded on product links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    UpcMatch,
    UpcCreated,
    IdentityKeyMatch,
    IdentityKeyCreated,
    FuzzyMatch,
    InsufficientData,
    AmbiguousFingerprint,
    ConflictingIdentifiers,
    RelinkBlockedHysteresis,
    ManualLocked,
    SourceNotFound,
    SystemError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::UpcMatch => "UPC_MATCH",
            ReasonCode::UpcCreated => "UPC_CREATED",
            ReasonCode::IdentityKeyMatch => "IDENTITY_KEY_MATCH",
            ReasonCode::IdentityKeyCreated => "IDENTITY_KEY_CREATED",
            ReasonCode::FuzzyMatch => "FUZZY_MATCH",
            ReasonCode::InsufficientData => "INSUFFICIENT_DATA",
            ReasonCode::AmbiguousFingerprint => "AMBIGUOUS_FINGERPRINT",
            ReasonCode::ConflictingIdentifiers => "CONFLICTING_IDENTIFIERS",
            ReasonCode::RelinkBlockedHysteresis => "RELINK_BLOCKED_HYSTERESIS",
            ReasonCode::ManualLocked => "MANUAL_LOCKED",
            ReasonCode::SourceNotFound => "SOURCE_NOT_FOUND",
            ReasonCode::SystemError => "SYSTEM_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPC_MATCH" => Some(ReasonCode::UpcMatch),
            "UPC_CREATED" => Some(ReasonCode::UpcCreated),
            "IDENTITY_KEY_MATCH" => Some(ReasonCode::IdentityKeyMatch),
            "IDENTITY_KEY_CREATED" => Some(ReasonCode::IdentityKeyCreated),
            "FUZZY_MATCH" => Some(ReasonCode::FuzzyMatch),
            "INSUFFICIENT_DATA" => Some(ReasonCode::InsufficientData),
            "AMBIGUOUS_FINGERPRINT" => Some(ReasonCode::AmbiguousFingerprint),
            "CONFLICTING_IDENTIFIERS" => Some(ReasonCode::ConflictingIdentifiers),
            "RELINK_BLOCKED_HYSTERESIS" => Some(ReasonCode::RelinkBlockedHysteresis),
            "MANUAL_LOCKED" => Some(ReasonCode::ManualLocked),
            "SOURCE_NOT_FOUND" => Some(ReasonCode::SourceNotFound),
            "SYSTEM_ERROR" => Some(ReasonCode::SystemError),
            _ => None,
        }
    }

    pub const ALL: [ReasonCode; 12] = [
        ReasonCode::UpcMatch,
        ReasonCode::UpcCreated,
        ReasonCode::IdentityKeyMatch,
        ReasonCode::IdentityKeyCreated,
        ReasonCode::FuzzyMatch,
        ReasonCode::InsufficientData,
        ReasonCode::AmbiguousFingerprint,
        ReasonCode::ConflictingIdentifiers,
        ReasonCode::RelinkBlockedHysteresis,
        ReasonCode::ManualLocked,
        ReasonCode::SourceNotFound,
        ReasonCode::SystemError,
    ];
}

/// What caused a resolve request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveTrigger {
    Ingest,
    Reconcile,
    Manual,
}

impl ResolveTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveTrigger::Ingest => "INGEST",
            ResolveTrigger::Reconcile => "RECONCILE",
            ResolveTrigger::Manual => "MANUAL",
        }
    }
}

/// Queued resolver work item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RequestStatus::Pending),
            "PROCESSING" => Some(RequestStatus::Processing),
            "COMPLETED" => Some(RequestStatus::Completed),
            "FAILED" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

/// Identifier kinds attached to a source product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentifierKind {
    Upc,
    Sku,
    Asin,
    Mpn,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Upc => "UPC",
            IdentifierKind::Sku => "SKU",
            IdentifierKind::Asin => "ASIN",
            IdentifierKind::Mpn => "MPN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPC" => Some(IdentifierKind::Upc),
            "SKU" => Some(IdentifierKind::Sku),
            "ASIN" => Some(IdentifierKind::Asin),
            "MPN" => Some(IdentifierKind::Mpn),
            _ => None,
        }
    }
}

/// One configured remote feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub source_id: i64,
    pub network: String,
    pub retailer_slug: String,
    pub pipeline: Pipeline,
    pub status: FeedStatus,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub remote_path: String,
    pub username: String,
    pub secret_blob: Option<String>,
    pub secret_key_id: Option<String>,
    pub secret_version: i64,
    pub compression: Compression,
    pub schedule_frequency_hours: Option<i64>,
    pub expiry_hours: i64,
    pub expiry_block_fraction: f64,
    pub max_file_size_bytes: Option<u64>,
    pub max_row_count: Option<u64>,
    pub next_run_at: Option<i64>,
    pub manual_run_pending: bool,
    pub consecutive_failures: i64,
    pub last_remote_mtime: Option<i64>,
    pub last_remote_size: Option<i64>,
    pub last_content_hash: Option<String>,
    pub feed_lock_id: i64,
}

impl Feed {
    /// Credentials are complete when host, username and a decodable secret
    /// blob are set.
    pub fn credentials_complete(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && self.decoded_secret().is_some()
    }

    /// The secret blob is stored base64-encoded next to its key id; actual
    /// key management lives outside this service.
    pub fn decoded_secret(&self) -> Option<Vec<u8>> {
        use base64::Engine;
        let blob = self.secret_blob.as_deref()?;
        base64::engine::general_purpose::STANDARD.decode(blob).ok()
    }
}

/// One execution attempt of a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRun {
    pub id: String,
    pub feed_id: i64,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub correlation_id: String,
    pub counters: RunCounters,
    pub failure_kind: Option<FailureKind>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub expiry_blocked: bool,
    pub expiry_blocked_reason: Option<String>,
    pub expiry_approved_at: Option<i64>,
    pub expiry_approved_by: Option<String>,
    pub ignored_at: Option<i64>,
    pub ignored_by: Option<String>,
    pub ignored_reason: Option<String>,
}

/// Per-run counters, persisted on the run row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub rows_read: u64,
    pub rows_parsed: u64,
    pub products_upserted: u64,
    pub prices_written: u64,
    pub products_promoted: u64,
    pub products_rejected: u64,
    pub duplicate_key_count: u64,
    pub url_hash_fallback_count: u64,
    pub error_count: u64,
}

/// One row ingested from a feed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProduct {
    pub id: i64,
    pub source_id: i64,
    pub stable_key: String,
    pub title: String,
    pub brand: Option<String>,
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub attributes: Option<String>,
    pub caliber: Option<String>,
    pub grain_weight: Option<u32>,
    pub round_count: Option<u32>,
    pub price_cents: Option<i64>,
    pub normalized_hash: Option<String>,
    pub identifiers: Vec<(IdentifierKind, String)>,
}

/// Canonical product shared across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub canonical_key: String,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub brand_norm: Option<String>,
    pub caliber: Option<String>,
    pub caliber_norm: Option<String>,
    pub grain_weight: Option<u32>,
    pub round_count: Option<u32>,
    pub upc_norm: Option<String>,
}

/// The single resolver decision attached to a source product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductLink {
    pub source_product_id: i64,
    pub product_id: Option<i64>,
    pub match_type: MatchType,
    pub status: LinkStatus,
    pub reason_code: Option<ReasonCode>,
    pub confidence: f64,
    pub resolver_version: u32,
    pub evidence_json: String,
    pub resolved_at: i64,
}

/// Queued unit of resolver work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub id: i64,
    pub idempotency_key: String,
    pub source_product_id: i64,
    pub status: RequestStatus,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub error_message: Option<String>,
    pub result_product_id: Option<i64>,
    pub updated_at: i64,
}

/// Per-source identifier trust configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrustConfig {
    pub source_id: i64,
    pub upc_trusted: bool,
    pub version: i64,
}

impl TrustConfig {
    /// Miss-on-absent default: untrusted, version 0.
    pub fn absent(source_id: i64) -> Self {
        Self {
            source_id,
            upc_trusted: false,
            version: 0,
        }
    }
}

/// Global brand alias edge (normalized from -> normalized to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandAlias {
    pub id: i64,
    pub from_norm: String,
    pub to_norm: String,
}

/// Well-known settings keys.
pub mod settings_keys {
    pub const ALLOW_PLAIN_FTP: &str = "ALLOW_PLAIN_FTP";
    pub const HARVESTER_SCHEDULER_ENABLED: &str = "HARVESTER_SCHEDULER_ENABLED";
    pub const AFFILIATE_SCHEDULER_ENABLED: &str = "AFFILIATE_SCHEDULER_ENABLED";
    pub const AUTO_EMBEDDING_ENABLED: &str = "AUTO_EMBEDDING_ENABLED";
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub log_dir: String,
    pub resolver_concurrency: usize,
    pub resolve_debounce_secs: u64,
    pub scheduler_tick_secs: u64,
    pub sweeper_tick_secs: u64,
    pub control_timeout_secs: u64,
    pub data_timeout_secs: u64,
    pub default_max_file_size_bytes: u64,
    pub default_max_row_count: u64,
    pub row_error_threshold: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./scoutfeed.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());

        let resolver_concurrency = std::env::var("RESOLVER_CONCURRENCY")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let resolve_debounce_secs = std::env::var("RESOLVE_DEBOUNCE_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .unwrap_or(15);

        let scheduler_tick_secs = std::env::var("SCHEDULER_TICK_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let sweeper_tick_secs = std::env::var("SWEEPER_TICK_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let control_timeout_secs = std::env::var("TRANSPORT_CONTROL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let data_timeout_secs = std::env::var("TRANSPORT_DATA_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let default_max_file_size_bytes = std::env::var("MAX_FEED_FILE_BYTES")
            .unwrap_or_else(|_| (500u64 * 1024 * 1024).to_string())
            .parse()
            .unwrap_or(500 * 1024 * 1024);

        let default_max_row_count = std::env::var("MAX_FEED_ROW_COUNT")
            .unwrap_or_else(|_| "500000".to_string())
            .parse()
            .unwrap_or(500_000);

        let row_error_threshold = std::env::var("ROW_ERROR_THRESHOLD")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        Ok(Self {
            database_path,
            port,
            log_dir,
            resolver_concurrency,
            resolve_debounce_secs,
            scheduler_tick_secs,
            sweeper_tick_secs,
            control_timeout_secs,
            data_timeout_secs,
            default_max_file_size_bytes,
            default_max_row_count,
            row_error_threshold,
        })
    }
}

/// Convenience: unix seconds now.
#[inline]
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
