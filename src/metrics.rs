//! Prometheus metrics for ingestion and resolution.
//!
//! Every label is drawn from a closed enum; ids and free-form strings never
//! become labels. Counters are lock-free atomics, snapshots are eventually
//! consistent, and exposition is the plain text format.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::models::{LinkStatus, Pipeline, ReasonCode, RunCounters, RunStatus, RunTrigger};

/// Which resolver path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    Upc,
    IdentityKey,
    Fuzzy,
    None,
}

impl MatchPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPath::Upc => "upc",
            MatchPath::IdentityKey => "identity_key",
            MatchPath::Fuzzy => "fuzzy",
            MatchPath::None => "none",
        }
    }

    pub const ALL: [MatchPath; 4] = [
        MatchPath::Upc,
        MatchPath::IdentityKey,
        MatchPath::Fuzzy,
        MatchPath::None,
    ];
}

/// Normalized fields whose absence the resolver counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    Brand,
    Caliber,
    Grain,
    PackCount,
    Title,
    Upc,
}

impl MissingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingField::Brand => "brand",
            MissingField::Caliber => "caliber",
            MissingField::Grain => "grain",
            MissingField::PackCount => "pack_count",
            MissingField::Title => "title",
            MissingField::Upc => "upc",
        }
    }

    pub const ALL: [MissingField; 6] = [
        MissingField::Brand,
        MissingField::Caliber,
        MissingField::Grain,
        MissingField::PackCount,
        MissingField::Title,
        MissingField::Upc,
    ];
}

const N_PIPELINE: usize = Pipeline::ALL.len();
const N_STATUS: usize = LinkStatus::ALL.len();
const N_REASON: usize = ReasonCode::ALL.len();
const N_RUN_STATUS: usize = RunStatus::ALL.len();
const N_PATH: usize = MatchPath::ALL.len();
const N_FIELD: usize = MissingField::ALL.len();

fn pipeline_idx(p: Pipeline) -> usize {
    match p {
        Pipeline::Affiliate => 0,
        Pipeline::Retailer => 1,
    }
}

fn status_idx(s: LinkStatus) -> usize {
    match s {
        LinkStatus::Matched => 0,
        LinkStatus::Created => 1,
        LinkStatus::NeedsReview => 2,
        LinkStatus::Error => 3,
    }
}

fn reason_idx(r: ReasonCode) -> usize {
    ReasonCode::ALL.iter().position(|x| *x == r).unwrap_or(0)
}

fn run_status_idx(s: RunStatus) -> usize {
    match s {
        RunStatus::Running => 0,
        RunStatus::Succeeded => 1,
        RunStatus::Failed => 2,
        RunStatus::Skipped => 3,
    }
}

fn path_idx(p: MatchPath) -> usize {
    MatchPath::ALL.iter().position(|x| *x == p).unwrap_or(0)
}

fn field_idx(f: MissingField) -> usize {
    MissingField::ALL.iter().position(|x| *x == f).unwrap_or(0)
}

fn zeroed<const N: usize>() -> [AtomicU64; N] {
    std::array::from_fn(|_| AtomicU64::new(0))
}

/// Fixed-bucket latency histogram (milliseconds).
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let buckets = vec![1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_ms: u64) {
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value_ms <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Export as a Prometheus histogram.
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name, boundary, cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, total));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.sum.load(Ordering::Relaxed)
        ));
        output.push_str(&format!("{}_count {}\n", name, total));
        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver-side counters.
pub struct ResolverMetrics {
    requests_total: [AtomicU64; N_PIPELINE],
    decisions_total: [[AtomicU64; N_STATUS]; N_PIPELINE],
    failure_total: [[AtomicU64; N_REASON]; N_PIPELINE],
    pub latency_ms: LatencyHistogram,
    match_path_total: [[AtomicU64; N_STATUS]; N_PATH],
    missing_fields_total: [AtomicU64; N_FIELD],
}

impl ResolverMetrics {
    fn new() -> Self {
        Self {
            requests_total: zeroed(),
            decisions_total: std::array::from_fn(|_| zeroed()),
            failure_total: std::array::from_fn(|_| zeroed()),
            latency_ms: LatencyHistogram::new(),
            match_path_total: std::array::from_fn(|_| zeroed()),
            missing_fields_total: zeroed(),
        }
    }

    pub fn record_request(&self, source_kind: Pipeline) {
        self.requests_total[pipeline_idx(source_kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, source_kind: Pipeline, status: LinkStatus) {
        self.decisions_total[pipeline_idx(source_kind)][status_idx(status)]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Only ERROR outcomes are recorded here.
    pub fn record_failure(&self, source_kind: Pipeline, reason: ReasonCode) {
        self.failure_total[pipeline_idx(source_kind)][reason_idx(reason)]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_path(&self, path: MatchPath, outcome: LinkStatus) {
        self.match_path_total[path_idx(path)][status_idx(outcome)]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missing_field(&self, field: MissingField) {
        self.missing_fields_total[field_idx(field)].fetch_add(1, Ordering::Relaxed);
    }
}

/// Ingest-side counters.
pub struct IngestMetrics {
    runs_total: [[AtomicU64; N_RUN_STATUS]; N_PIPELINE],
    listings_created_total: [AtomicU64; N_PIPELINE],
    listings_updated_total: [AtomicU64; N_PIPELINE],
    prices_written_total: [AtomicU64; N_PIPELINE],
}

impl IngestMetrics {
    fn new() -> Self {
        Self {
            runs_total: std::array::from_fn(|_| zeroed()),
            listings_created_total: zeroed(),
            listings_updated_total: zeroed(),
            prices_written_total: zeroed(),
        }
    }

    pub fn record_run(&self, pipeline: Pipeline, status: RunStatus) {
        self.runs_total[pipeline_idx(pipeline)][run_status_idx(status)]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_listings_created(&self, pipeline: Pipeline, n: u64) {
        self.listings_created_total[pipeline_idx(pipeline)].fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_listings_updated(&self, pipeline: Pipeline, n: u64) {
        self.listings_updated_total[pipeline_idx(pipeline)].fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_prices_written(&self, pipeline: Pipeline, n: u64) {
        self.prices_written_total[pipeline_idx(pipeline)].fetch_add(n, Ordering::Relaxed);
    }
}

/// Structured event emitted once per finished feed run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub pipeline: Pipeline,
    pub run_id: String,
    pub feed_id: i64,
    pub source_id: i64,
    pub retailer_slug: String,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub duration_ms: u64,
    pub timing: RunTiming,
    pub counters: RunCounters,
    pub error_summary: ErrorSummary,
    pub expiry_blocked: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunTiming {
    pub stat_ms: u64,
    pub download_ms: u64,
    pub parse_ms: u64,
    pub row_pipeline_ms: u64,
    pub finalize_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSummary {
    pub error_count: u64,
    pub primary_code: Option<String>,
    pub code_histogram: Vec<(String, u64)>,
}

/// Shared registry for the whole process.
pub struct Metrics {
    pub resolver: ResolverMetrics,
    pub ingest: IngestMetrics,
    summary_tx: broadcast::Sender<IngestRunSummary>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let (summary_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            resolver: ResolverMetrics::new(),
            ingest: IngestMetrics::new(),
            summary_tx,
        })
    }

    pub fn subscribe_run_summaries(&self) -> broadcast::Receiver<IngestRunSummary> {
        self.summary_tx.subscribe()
    }

    /// Emit the per-run summary event: structured log line plus broadcast.
    pub fn emit_run_summary(&self, summary: IngestRunSummary) {
        match serde_json::to_string(&summary) {
            Ok(json) => info!(target: "ingest_run_summary", summary = %json, "feed run finished"),
            Err(e) => info!(run_id = %summary.run_id, error = %e, "feed run finished"),
        }
        let _ = self.summary_tx.send(summary);
    }

    /// Export all metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP resolver_requests_total Resolve jobs started\n");
        out.push_str("# TYPE resolver_requests_total counter\n");
        for p in Pipeline::ALL {
            out.push_str(&format!(
                "resolver_requests_total{{source_kind=\"{}\"}} {}\n",
                p.as_str(),
                self.resolver.requests_total[pipeline_idx(p)].load(Ordering::Relaxed)
            ));
        }

        out.push_str("\n# HELP resolver_decisions_total Resolver decisions by status\n");
        out.push_str("# TYPE resolver_decisions_total counter\n");
        for p in Pipeline::ALL {
            for s in LinkStatus::ALL {
                out.push_str(&format!(
                    "resolver_decisions_total{{source_kind=\"{}\",status=\"{}\"}} {}\n",
                    p.as_str(),
                    s.as_str(),
                    self.resolver.decisions_total[pipeline_idx(p)][status_idx(s)]
                        .load(Ordering::Relaxed)
                ));
            }
        }

        out.push_str("\n# HELP resolver_failure_total Resolver ERROR outcomes by reason\n");
        out.push_str("# TYPE resolver_failure_total counter\n");
        for p in Pipeline::ALL {
            for r in ReasonCode::ALL {
                let v =
                    self.resolver.failure_total[pipeline_idx(p)][reason_idx(r)].load(Ordering::Relaxed);
                if v > 0 {
                    out.push_str(&format!(
                        "resolver_failure_total{{source_kind=\"{}\",reason_code=\"{}\"}} {}\n",
                        p.as_str(),
                        r.as_str(),
                        v
                    ));
                }
            }
        }

        out.push_str("\n# HELP resolver_latency_ms Resolve latency in milliseconds\n");
        out.push_str("# TYPE resolver_latency_ms histogram\n");
        out.push_str(&self.resolver.latency_ms.to_prometheus("resolver_latency_ms"));

        out.push_str("\n# HELP resolver_match_path_total Decisions by match path and outcome\n");
        out.push_str("# TYPE resolver_match_path_total counter\n");
        for path in MatchPath::ALL {
            for s in LinkStatus::ALL {
                out.push_str(&format!(
                    "resolver_match_path_total{{path=\"{}\",outcome=\"{}\"}} {}\n",
                    path.as_str(),
                    s.as_str(),
                    self.resolver.match_path_total[path_idx(path)][status_idx(s)]
                        .load(Ordering::Relaxed)
                ));
            }
        }

        out.push_str("\n# HELP resolver_missing_fields_total Normalized fields absent per resolve\n");
        out.push_str("# TYPE resolver_missing_fields_total counter\n");
        for f in MissingField::ALL {
            out.push_str(&format!(
                "resolver_missing_fields_total{{field=\"{}\"}} {}\n",
                f.as_str(),
                self.resolver.missing_fields_total[field_idx(f)].load(Ordering::Relaxed)
            ));
        }

        out.push_str("\n# HELP ingest_runs_total Feed runs by pipeline and status\n");
        out.push_str("# TYPE ingest_runs_total counter\n");
        for p in Pipeline::ALL {
            for s in RunStatus::ALL {
                out.push_str(&format!(
                    "ingest_runs_total{{pipeline=\"{}\",status=\"{}\"}} {}\n",
                    p.as_str(),
                    s.as_str(),
                    self.ingest.runs_total[pipeline_idx(p)][run_status_idx(s)]
                        .load(Ordering::Relaxed)
                ));
            }
        }

        out.push_str("\n# HELP ingest_listings_created_total Source products created\n");
        out.push_str("# TYPE ingest_listings_created_total counter\n");
        for p in Pipeline::ALL {
            out.push_str(&format!(
                "ingest_listings_created_total{{pipeline=\"{}\"}} {}\n",
                p.as_str(),
                self.ingest.listings_created_total[pipeline_idx(p)].load(Ordering::Relaxed)
            ));
        }

        out.push_str("\n# HELP ingest_listings_updated_total Source products updated\n");
        out.push_str("# TYPE ingest_listings_updated_total counter\n");
        for p in Pipeline::ALL {
            out.push_str(&format!(
                "ingest_listings_updated_total{{pipeline=\"{}\"}} {}\n",
                p.as_str(),
                self.ingest.listings_updated_total[pipeline_idx(p)].load(Ordering::Relaxed)
            ));
        }

        out.push_str("\n# HELP ingest_prices_written_total Price facts written\n");
        out.push_str("# TYPE ingest_prices_written_total counter\n");
        for p in Pipeline::ALL {
            out.push_str(&format!(
                "ingest_prices_written_total{{pipeline=\"{}\"}} {}\n",
                p.as_str(),
                self.ingest.prices_written_total[pipeline_idx(p)].load(Ordering::Relaxed)
            ));
        }

        out
    }
}
