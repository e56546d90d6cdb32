use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 17610;
const MAX_HISTORY_ITEMS: usize = 1000;
const MAX_INSIGHTS: usize = 500;
// Fingerprints use the URL plus this many leading characters of content.
const FINGERPRINT_PREFIX_CHARS: usize = 50;
const MIN_ANALYZE_CHARS: usize = 100;
const MAX_ANALYZE_CHARS: usize = 6000;
const UNCATEGORIZED: &str = "Uncategorized";
const UNKNOWN_SOURCE: &str = "unknown";
const GLOBAL_SESSION: &str = "global";

#[derive(Parser, Debug)]
#[command(name = "insight_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts ip:port (recommended, e.g. 127.0.0.1:17610) or a bare ip
    /// (implies port 17610).
    #[arg(long, default_value = "127.0.0.1:17610")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/insight-core.db")]
    db: PathBuf,

    /// Base URL of the OpenAI-compatible chat-completions API.
    #[arg(long, default_value = "https://api.openai.com")]
    llm_base_url: String,

    /// Model requested for insight extraction.
    #[arg(long, default_value = "gpt-4o-mini")]
    llm_model: String,

    /// Sampling temperature for insight extraction.
    #[arg(long, default_value_t = 0.3)]
    llm_temperature: f32,

    /// Timeout for one insight request (seconds). There is no retry.
    #[arg(long, default_value_t = 60)]
    llm_timeout_seconds: u64,
}

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<Store>>,
    statuses: Arc<Mutex<HashMap<String, StatusRecord>>>,
    http: reqwest::Client,
    llm: Arc<LlmConfig>,
}

struct LlmConfig {
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

// ---------------------------------------------------------------------------
// Persisted data model. Field names on the wire match what the browser
// extension has always written to its local storage.
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisitRecord {
    url: String,
    title: String,
    domain: String,
    visit_time: String,
    #[serde(default)]
    favicon_url: String,
    #[serde(default)]
    time_spent: i64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainTimeRecord {
    total_time: i64,
    visits: i64,
    #[serde(default)]
    last_visit: Option<String>,
    #[serde(default)]
    pages: HashMap<String, PageTimeRecord>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageTimeRecord {
    title: String,
    total_time: i64,
    visits: i64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Insight {
    content: String,
    category: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    insight_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<Value>,
}

/// One not-yet-stored insight, as produced by the model or forwarded by the
/// content script. Everything except the content is optional; the merge
/// pipeline fills in defaults.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsightCandidate {
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    position: Option<Value>,
}

#[derive(Clone, Serialize)]
struct StatusRecord {
    message: String,
    #[serde(rename = "type")]
    kind: String,
    timestamp: String,
}

// ---------------------------------------------------------------------------
// Command surface. One tagged envelope per extension message, one handler
// per variant.
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum Command {
    UpdateTimeSpent { data: TimeSpentUpdate },
    RecordVisit { data: VisitEvent },
    SaveReadingInsights { data: InsightBatch },
    AnalyzeContent { data: AnalyzePage },
    ResetTimeData,
    ClearInsights,
    GetApiKey,
    SaveApiKey {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    GetAutoAnalyze,
    SetAutoAnalyze { value: bool },
    GetExtractionStatus {
        #[serde(default)]
        session: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSpentUpdate {
    url: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    title: Option<String>,
    time_spent: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisitEvent {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    favicon_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsightBatch {
    url: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    insights: Vec<InsightCandidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzePage {
    url: String,
    #[serde(default)]
    title: Option<String>,
    content: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeResult {
    added: usize,
    total: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    added: usize,
    total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<&'static str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Store::open(&args.db)?;
    let llm = LlmConfig {
        base_url: args.llm_base_url,
        model: args.llm_model,
        temperature: args.llm_temperature,
        timeout: Duration::from_secs(args.llm_timeout_seconds.max(1)),
    };

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        statuses: Arc::new(Mutex::new(HashMap::new())),
        http: reqwest::Client::new(),
        llm: Arc::new(llm),
    };

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/command", post(post_command).options(options_ok))
        .route("/history", get(get_history))
        .route("/history/domains", get(get_history_domains))
        .route("/time/stats", get(get_time_stats))
        .route("/insights", get(get_insights))
        .route("/insights/chart", get(get_insights_chart))
        .route("/export/csv", get(get_export_csv))
        .with_state(state)
        .layer(cors);

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }
    if let Some((host, port)) = input.rsplit_once(':') {
        if host == "localhost" {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
            }
        }
    }
    Err(anyhow::anyhow!(
        "invalid --listen '{input}'. Use ip:port (e.g. 127.0.0.1:{DEFAULT_PORT}) or ip."
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ok_json<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(OkResponse::<Value> { ok: true, data: None }).into_response()
}

fn bad_request(code: &'static str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrResponse { ok: false, error: code }),
    )
        .into_response()
}

fn db_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrResponse {
            ok: false,
            error: "db_error",
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "insight_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

async fn post_command(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let command: Command = match serde_json::from_value(payload) {
        Ok(c) => c,
        Err(err) => {
            warn!("rejecting command: {err}");
            return bad_request("invalid_command");
        }
    };

    match command {
        Command::UpdateTimeSpent { data } => handle_update_time_spent(&state, data).await,
        Command::RecordVisit { data } => handle_record_visit(&state, data).await,
        Command::SaveReadingInsights { data } => handle_save_insights(&state, data).await,
        Command::AnalyzeContent { data } => handle_analyze(&state, data).await,
        Command::ResetTimeData => handle_reset_time(&state).await,
        Command::ClearInsights => handle_clear_insights(&state).await,
        Command::GetApiKey => handle_get_api_key(&state).await,
        Command::SaveApiKey { api_key } => handle_save_api_key(&state, api_key).await,
        Command::GetAutoAnalyze => handle_get_auto_analyze(&state).await,
        Command::SetAutoAnalyze { value } => handle_set_auto_analyze(&state, value).await,
        Command::GetExtractionStatus { session } => handle_get_status(&state, session).await,
    }
}

async fn handle_update_time_spent(state: &AppState, data: TimeSpentUpdate) -> Response {
    let seconds = if data.time_spent.is_finite() {
        data.time_spent.floor() as i64
    } else {
        0
    };
    if seconds <= 0 {
        warn!(
            "ignoring time update for {}: invalid seconds {}",
            data.url, data.time_spent
        );
        return ok_empty();
    }

    let domain = data
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| extract_domain(&data.url));

    let now = now_rfc3339();
    let mut store = state.store.lock().await;
    let mut time_spent = store.time_spent();
    let mut history = store.history();
    apply_time_update(
        &mut time_spent,
        &mut history,
        &data.url,
        &domain,
        data.title.as_deref(),
        seconds,
        &now,
    );
    let total = time_spent.get(&domain).map(|r| r.total_time).unwrap_or(0);

    if let Err(err) = store.set_time_spent(&time_spent) {
        error!("persist timeSpentData failed: {err}");
        return db_error();
    }
    if let Err(err) = store.set_history(&history) {
        error!("persist historyData failed: {err}");
        return db_error();
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct TimeUpdateResult {
        domain: String,
        total_seconds: i64,
    }
    ok_json(TimeUpdateResult {
        domain,
        total_seconds: total,
    })
}

async fn handle_record_visit(state: &AppState, data: VisitEvent) -> Response {
    if data.url.trim().is_empty() {
        return bad_request("missing_url");
    }

    let now = now_rfc3339();
    let mut store = state.store.lock().await;
    let mut history = store.history();
    push_visit(&mut history, &data, &now);
    let count = history.len();
    if let Err(err) = store.set_history(&history) {
        error!("persist historyData failed: {err}");
        return db_error();
    }

    #[derive(Serialize)]
    struct VisitResult {
        count: usize,
    }
    ok_json(VisitResult { count })
}

async fn handle_save_insights(state: &AppState, data: InsightBatch) -> Response {
    if data.url.trim().is_empty() {
        return bad_request("missing_url");
    }

    let mut store = state.store.lock().await;
    let existing = store.insights();
    if data.insights.is_empty() {
        info!("no insights to save for {}", data.url);
        return ok_json(MergeResult {
            added: 0,
            total: existing.len(),
        });
    }

    let domain = data
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| extract_domain(&data.url));

    let mut candidates = data.insights;
    for candidate in &mut candidates {
        if candidate.source.is_none() {
            candidate.source = data.title.clone();
        }
    }

    let kept = existing.iter().filter(|i| i.url != data.url).count();
    let merged = merge_insights(existing, &candidates, &data.url, &domain, &now_rfc3339());
    let added = merged.len().saturating_sub(kept);
    let total = merged.len();
    info!("merged {added} new insights from {} (total {total})", data.url);

    if let Err(err) = store.set_insights(&merged) {
        error!("persist readingInsights failed: {err}");
        return db_error();
    }
    ok_json(MergeResult { added, total })
}

async fn handle_analyze(state: &AppState, data: AnalyzePage) -> Response {
    let session = data
        .session
        .clone()
        .unwrap_or_else(|| GLOBAL_SESSION.to_string());

    // Malformed input is skip-and-log, not a failure.
    if data.content.trim().chars().count() < MIN_ANALYZE_CHARS {
        warn!("skipping analyze for {}: not enough content", data.url);
        set_status(state, &session, "Not enough content to analyze", "error").await;
        let total = state.store.lock().await.insights().len();
        return ok_json(AnalyzeResult {
            added: 0,
            total,
            skipped: Some("content_too_short"),
        });
    }

    let (api_key, already_analyzed, total) = {
        let store = state.store.lock().await;
        let insights = store.insights();
        let already = insights.iter().any(|i| {
            i.url == data.url || strip_http_scheme(&i.url) == strip_http_scheme(&data.url)
        });
        (store.api_key(), already, insights.len())
    };

    if already_analyzed && !data.force {
        info!("insights already stored for {}, skipping analysis", data.url);
        set_status(state, &session, "Insights already exist for this page", "info").await;
        return ok_json(AnalyzeResult {
            added: 0,
            total,
            skipped: Some("already_analyzed"),
        });
    }

    let Some(api_key) = api_key else {
        let err = AnalyzeError::MissingApiKey;
        set_status(state, &session, "Please set your API key first", "error").await;
        return analyze_error_response(&err);
    };

    set_status(state, &session, "Sending content for analysis...", "info").await;

    let candidates = match request_insights(&state.http, &state.llm, &api_key, &data).await {
        Ok(c) => c,
        Err(err) => {
            error!("analysis failed for {}: {err}", data.url);
            set_status(state, &session, err.to_string(), "error").await;
            return analyze_error_response(&err);
        }
    };

    let domain = extract_domain(&data.url);
    let source = data
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| friendly_title(&data.url));
    let mut candidates = candidates;
    for candidate in &mut candidates {
        candidate.source = Some(source.clone());
    }

    let mut store = state.store.lock().await;
    let existing = store.insights();
    let kept = existing.iter().filter(|i| i.url != data.url).count();
    let merged = merge_insights(existing, &candidates, &data.url, &domain, &now_rfc3339());
    let added = merged.len().saturating_sub(kept);
    let total = merged.len();
    if let Err(err) = store.set_insights(&merged) {
        error!("persist readingInsights failed: {err}");
        return db_error();
    }
    drop(store);

    set_status(
        state,
        &session,
        format!("Analysis complete! Found {added} insights."),
        "success",
    )
    .await;
    ok_json(AnalyzeResult {
        added,
        total,
        skipped: None,
    })
}

async fn handle_reset_time(state: &AppState) -> Response {
    let mut store = state.store.lock().await;
    let mut time_spent = store.time_spent();
    let mut history = store.history();
    reset_all_time_data(&mut time_spent, &mut history);
    if let Err(err) = store.set_time_spent(&time_spent) {
        error!("persist timeSpentData failed: {err}");
        return db_error();
    }
    if let Err(err) = store.set_history(&history) {
        error!("persist historyData failed: {err}");
        return db_error();
    }
    info!("time data has been reset");
    ok_empty()
}

async fn handle_clear_insights(state: &AppState) -> Response {
    let mut store = state.store.lock().await;
    if let Err(err) = store.set_insights(&[]) {
        error!("persist readingInsights failed: {err}");
        return db_error();
    }
    info!("reading insights cleared");
    ok_empty()
}

async fn handle_get_api_key(state: &AppState) -> Response {
    let store = state.store.lock().await;

    #[derive(Serialize)]
    struct ApiKeyReply {
        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    }
    ok_json(ApiKeyReply {
        api_key: store.api_key(),
    })
}

async fn handle_save_api_key(state: &AppState, api_key: String) -> Response {
    let trimmed = api_key.trim();
    if trimmed.is_empty() {
        return bad_request("missing_api_key");
    }
    let mut store = state.store.lock().await;
    if let Err(err) = store.set_api_key(trimmed) {
        error!("persist apiKey failed: {err}");
        return db_error();
    }
    ok_empty()
}

async fn handle_get_auto_analyze(state: &AppState) -> Response {
    let store = state.store.lock().await;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct AutoAnalyzeReply {
        auto_analyze: bool,
    }
    ok_json(AutoAnalyzeReply {
        auto_analyze: store.auto_analyze(),
    })
}

async fn handle_set_auto_analyze(state: &AppState, value: bool) -> Response {
    let mut store = state.store.lock().await;
    if let Err(err) = store.set_auto_analyze(value) {
        error!("persist autoAnalyze failed: {err}");
        return db_error();
    }
    ok_empty()
}

async fn handle_get_status(state: &AppState, session: Option<String>) -> Response {
    let session = session.unwrap_or_else(|| GLOBAL_SESSION.to_string());
    let statuses = state.statuses.lock().await;
    Json(OkResponse {
        ok: true,
        data: statuses.get(&session).cloned(),
    })
    .into_response()
}

async fn set_status(state: &AppState, session: &str, message: impl Into<String>, kind: &str) {
    let mut statuses = state.statuses.lock().await;
    statuses.insert(
        session.to_string(),
        StatusRecord {
            message: message.into(),
            kind: kind.to_string(),
            timestamp: now_rfc3339(),
        },
    );
}

// ---------------------------------------------------------------------------
// Popup read side
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct InsightsQuery {
    #[serde(default)]
    search: Option<String>,
    /// Comma-separated category names; "all" (or absent) disables the filter.
    #[serde(default)]
    categories: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryStats {
    total_visits: usize,
    unique_sites: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_domain: Option<String>,
    total_time_seconds: i64,
    total_time: String,
}

#[derive(Serialize)]
struct HistoryReport {
    items: Vec<VisitRecord>,
    stats: HistoryStats,
}

#[derive(Serialize)]
struct InsightGroup {
    url: String,
    source: String,
    insights: Vec<Insight>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsightStats {
    total: usize,
    categories: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_category: Option<String>,
}

#[derive(Serialize)]
struct InsightReport {
    groups: Vec<InsightGroup>,
    stats: InsightStats,
    categories: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DomainTimeRow {
    domain: String,
    total_seconds: i64,
    total_time: String,
    visits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_visit: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeStatsReport {
    total_seconds: i64,
    total_time: String,
    average_seconds: i64,
    average_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_domain: Option<String>,
    domains: Vec<DomainTimeRow>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CategorySlice {
    category: String,
    seconds: f64,
    label: String,
}

async fn get_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let history = state.store.lock().await.history();
    let mut filtered = filter_history(
        &history,
        q.search.as_deref().unwrap_or(""),
        TimeRange::parse(q.range.as_deref()),
        q.domain.as_deref().unwrap_or("all"),
        Utc::now(),
    );
    let stats = history_stats(&filtered);
    let limit = q.limit.unwrap_or(MAX_HISTORY_ITEMS).clamp(1, MAX_HISTORY_ITEMS);
    filtered.truncate(limit);
    ok_json(HistoryReport {
        items: filtered,
        stats,
    })
}

async fn get_history_domains(State(state): State<AppState>) -> Response {
    let history = state.store.lock().await.history();
    let mut domains: Vec<String> = history
        .iter()
        .map(|item| extract_domain(&item.url))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    domains.sort();
    ok_json(domains)
}

async fn get_time_stats(State(state): State<AppState>) -> Response {
    let time_spent = state.store.lock().await.time_spent();

    let mut rows: Vec<DomainTimeRow> = time_spent
        .iter()
        .map(|(domain, record)| DomainTimeRow {
            domain: domain.clone(),
            total_seconds: record.total_time,
            total_time: format_time_spent(record.total_time),
            visits: record.visits,
            last_visit: record.last_visit.clone(),
        })
        .collect();
    rows.sort_by(|a, b| b.total_seconds.cmp(&a.total_seconds).then_with(|| a.domain.cmp(&b.domain)));

    let total_seconds: i64 = rows.iter().map(|r| r.total_seconds).sum();
    let active_sites = rows.iter().filter(|r| r.total_seconds > 0).count() as i64;
    let average_seconds = if active_sites > 0 {
        total_seconds / active_sites
    } else {
        0
    };
    let top_domain = rows
        .iter()
        .find(|r| r.total_seconds > 0)
        .map(|r| r.domain.clone());

    ok_json(TimeStatsReport {
        total_seconds,
        total_time: format_time_spent(total_seconds),
        average_seconds,
        average_time: format_time_spent(average_seconds),
        top_domain,
        domains: rows,
    })
}

fn parse_category_param(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

async fn get_insights(State(state): State<AppState>, Query(q): Query<InsightsQuery>) -> Response {
    let insights = state.store.lock().await.insights();
    let categories_filter = parse_category_param(q.categories.as_deref());
    let filtered = filter_insights(
        &insights,
        q.search.as_deref().unwrap_or(""),
        &categories_filter,
    );
    let stats = insight_stats(&filtered);
    let groups = group_by_source(&filtered);

    // The filter bar always shows every known category, not just the
    // currently matching ones.
    let mut categories: Vec<String> = insights
        .iter()
        .map(|i| i.category.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    categories.sort();

    ok_json(InsightReport {
        groups,
        stats,
        categories,
    })
}

async fn get_insights_chart(
    State(state): State<AppState>,
    Query(q): Query<InsightsQuery>,
) -> Response {
    let (insights, time_spent) = {
        let store = state.store.lock().await;
        (store.insights(), store.time_spent())
    };
    let categories_filter = parse_category_param(q.categories.as_deref());
    let filtered = filter_insights(
        &insights,
        q.search.as_deref().unwrap_or(""),
        &categories_filter,
    );
    let distribution = category_time_distribution(&filtered, &time_spent);

    let mut slices: Vec<CategorySlice> = distribution
        .into_iter()
        .map(|(category, seconds)| CategorySlice {
            label: format_time_spent(seconds.round() as i64),
            category,
            seconds,
        })
        .collect();
    slices.sort_by(|a, b| {
        b.seconds
            .partial_cmp(&a.seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
    });
    ok_json(slices)
}

async fn get_export_csv(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let history = state.store.lock().await.history();
    let filtered = filter_history(
        &history,
        q.search.as_deref().unwrap_or(""),
        TimeRange::parse(q.range.as_deref()),
        q.domain.as_deref().unwrap_or("all"),
        Utc::now(),
    );
    let csv = export_history_csv(&filtered);
    (
        StatusCode::OK,
        [("content-type", "text/csv; charset=utf-8")],
        csv,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Identity / normalization
// ---------------------------------------------------------------------------

/// Hostname of a URL; malformed input comes back unchanged (fallback, not an
/// error).
fn extract_domain(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let scheme = &url[..scheme_end];
    let scheme_ok = scheme
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return url.to_string();
    }

    let rest = &url[scheme_end + 3..];
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = if let Some(v6) = host_port.strip_prefix('[') {
        v6.split(']').next().unwrap_or("")
    } else {
        host_port.split(':').next().unwrap_or("")
    };
    if host.is_empty() {
        return url.to_string();
    }
    host.to_ascii_lowercase()
}

/// Fallback page title derived from the domain: "https://www.example.com/x"
/// becomes "Example".
fn friendly_title(url: &str) -> String {
    let domain = extract_domain(url);
    let trimmed = domain.strip_prefix("www.").unwrap_or(&domain);
    let label = trimmed.split('.').next().unwrap_or(trimmed);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn strip_http_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Canonical form for URL equality: scheme and trailing-slash variants of the
/// same page compare equal.
fn normalize_url_for_matching(url: &str) -> String {
    let trimmed = url.strip_suffix('/').unwrap_or(url);
    let lower = trimmed.to_lowercase();
    strip_http_scheme(&lower).to_string()
}

/// Deterministic duplicate-detection fingerprint: scheme-stripped URL joined
/// with the first 50 characters of content, reduced to its alphanumeric
/// residue. Two pages whose residues collide are treated as duplicates
/// (accepted risk).
fn insight_fingerprint(url: &str, content: &str) -> String {
    let prefix: String = content.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    let mut raw = format!("{}:{}", strip_http_scheme(url), prefix);
    raw.retain(|c| c.is_ascii_alphanumeric());
    raw
}

// ---------------------------------------------------------------------------
// Visit log and time-spent aggregation
// ---------------------------------------------------------------------------

fn push_visit(history: &mut Vec<VisitRecord>, event: &VisitEvent, now: &str) {
    let domain = extract_domain(&event.url);
    let supplied = event.title.as_deref().map(str::trim).unwrap_or("");
    let title = if supplied.is_empty() || supplied == domain {
        friendly_title(&event.url)
    } else {
        supplied.to_string()
    };
    let title = if title.is_empty() {
        "Untitled".to_string()
    } else {
        title
    };

    history.insert(
        0,
        VisitRecord {
            url: event.url.clone(),
            title,
            domain,
            visit_time: now.to_string(),
            favicon_url: event.favicon_url.clone().unwrap_or_default(),
            time_spent: 0,
        },
    );
    history.truncate(MAX_HISTORY_ITEMS);
}

/// Adds active-viewing seconds to the domain and page records, and to every
/// visit-log entry whose normalized URL matches (duplicate visits are all
/// incremented; additive merges make that harmless).
fn apply_time_update(
    time_spent: &mut HashMap<String, DomainTimeRecord>,
    history: &mut [VisitRecord],
    url: &str,
    domain: &str,
    title: Option<&str>,
    seconds: i64,
    now: &str,
) -> bool {
    if seconds <= 0 {
        return false;
    }

    let record = time_spent.entry(domain.to_string()).or_default();
    record.total_time += seconds;
    record.last_visit = Some(now.to_string());

    let supplied_title = title.map(str::trim).filter(|t| !t.is_empty());
    if !record.pages.contains_key(url) {
        // First sight of this page counts as the visit.
        record.visits += 1;
    }
    let page = record
        .pages
        .entry(url.to_string())
        .or_insert_with(|| PageTimeRecord {
            title: "Untitled".to_string(),
            total_time: 0,
            visits: 1,
        });
    page.total_time += seconds;
    if let Some(t) = supplied_title {
        page.title = t.to_string();
    }

    let normalized = normalize_url_for_matching(url);
    for item in history.iter_mut() {
        if normalize_url_for_matching(&item.url) == normalized {
            item.time_spent += seconds;
        }
    }
    true
}

/// Bulk reset: drops all domain aggregates and zeroes accumulated time on
/// every visit record. The visit records themselves survive.
fn reset_all_time_data(
    time_spent: &mut HashMap<String, DomainTimeRecord>,
    history: &mut [VisitRecord],
) {
    time_spent.clear();
    for item in history.iter_mut() {
        item.time_spent = 0;
    }
}

// ---------------------------------------------------------------------------
// Insight merge pipeline
// ---------------------------------------------------------------------------

/// Merges a freshly extracted batch for one page into the stored collection.
///
/// Prior insights for the page are superseded by the batch; insights from
/// other pages are kept and their fingerprints suppress re-adding identical
/// content. New entries go to the front; the collection is capped at 500.
fn merge_insights(
    existing: Vec<Insight>,
    incoming: &[InsightCandidate],
    page_url: &str,
    page_domain: &str,
    now: &str,
) -> Vec<Insight> {
    if incoming.is_empty() {
        return existing;
    }

    let mut kept: Vec<Insight> = Vec::with_capacity(existing.len());
    let mut kept_ids: HashSet<String> = HashSet::new();
    for insight in existing {
        if insight.url == page_url {
            continue;
        }
        let id = if insight.insight_id.is_empty() {
            // Older stored entries may predate fingerprinting.
            insight_fingerprint(&insight.url, &insight.content)
        } else {
            insight.insight_id.clone()
        };
        kept_ids.insert(id);
        kept.push(insight);
    }

    let mut merged: Vec<Insight> = Vec::new();
    for candidate in incoming {
        let url = candidate
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(page_url);
        let id = insight_fingerprint(url, &candidate.content);
        if kept_ids.contains(&id) {
            continue;
        }
        merged.push(Insight {
            content: candidate.content.clone(),
            category: candidate
                .category
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| UNCATEGORIZED.to_string()),
            source: candidate.source.clone().unwrap_or_default(),
            url: url.to_string(),
            domain: page_domain.to_string(),
            timestamp: now.to_string(),
            insight_id: id,
            quote: candidate.quote.clone(),
            position: candidate.position.clone(),
        });
    }

    merged.extend(kept);
    merged.truncate(MAX_INSIGHTS);
    merged
}

// ---------------------------------------------------------------------------
// Aggregation / reporting
// ---------------------------------------------------------------------------

fn filter_insights(all: &[Insight], search: &str, categories: &[String]) -> Vec<Insight> {
    let needle = search.trim().to_lowercase();
    let restrict = !categories.is_empty() && !categories.iter().any(|c| c == "all");

    all.iter()
        .filter(|insight| {
            if !needle.is_empty() {
                let hit = insight.content.to_lowercase().contains(&needle)
                    || insight.source.to_lowercase().contains(&needle)
                    || insight.category.to_lowercase().contains(&needle);
                if !hit {
                    return false;
                }
            }
            if restrict && !categories.iter().any(|c| c == &insight.category) {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

fn group_by_source(insights: &[Insight]) -> Vec<InsightGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Insight>> = HashMap::new();

    for insight in insights {
        let key = if insight.url.is_empty() {
            UNKNOWN_SOURCE.to_string()
        } else {
            insight.url.clone()
        };
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(insight.clone());
    }

    order
        .into_iter()
        .map(|url| {
            let insights = grouped.remove(&url).unwrap_or_default();
            let source = insights
                .first()
                .map(|i| i.source.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown Source".to_string());
            InsightGroup {
                url,
                source,
                insights,
            }
        })
        .collect()
}

/// Splits each domain's recorded time across the categories of insights
/// harvested from it, proportionally by insight count. Domains with time but
/// no insights land in "Uncategorized". A lossy heuristic; totals are
/// approximate by design of the attribution, not a measurement.
fn category_time_distribution(
    insights: &[Insight],
    time_spent: &HashMap<String, DomainTimeRecord>,
) -> HashMap<String, f64> {
    let mut by_domain: HashMap<String, Vec<&Insight>> = HashMap::new();
    for insight in insights {
        let domain = extract_domain(&insight.url);
        if domain.is_empty() {
            continue;
        }
        by_domain.entry(domain).or_default().push(insight);
    }

    let mut categories: HashMap<String, f64> = HashMap::new();
    for (domain, record) in time_spent {
        if record.total_time <= 0 {
            continue;
        }
        let total = record.total_time as f64;

        let Some(domain_insights) = by_domain.get(domain) else {
            *categories.entry(UNCATEGORIZED.to_string()).or_insert(0.0) += total;
            continue;
        };

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for insight in domain_insights {
            *counts.entry(insight.category.as_str()).or_insert(0) += 1;
        }
        let domain_count = domain_insights.len() as f64;
        for (category, count) in counts {
            *categories.entry(category.to_string()).or_insert(0.0) +=
                total * count as f64 / domain_count;
        }
    }
    categories
}

fn insight_stats(insights: &[Insight]) -> InsightStats {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for insight in insights {
        if !counts.contains_key(insight.category.as_str()) {
            order.push(insight.category.as_str());
        }
        *counts.entry(insight.category.as_str()).or_insert(0) += 1;
    }

    let mut top: Option<(&str, usize)> = None;
    for category in &order {
        let n = counts[category];
        if top.map(|(_, best)| n > best).unwrap_or(true) {
            top = Some((category, n));
        }
    }

    InsightStats {
        total: insights.len(),
        categories: counts.len(),
        top_category: top.map(|(c, _)| c.to_string()),
    }
}

fn history_stats(items: &[VisitRecord]) -> HistoryStats {
    let mut domain_order: Vec<String> = Vec::new();
    let mut domain_counts: HashMap<String, usize> = HashMap::new();
    // Duplicate visits share accumulated time; count each page once, at its
    // largest observed value.
    let mut max_per_url: HashMap<String, i64> = HashMap::new();

    for item in items {
        let domain = extract_domain(&item.url);
        if !domain_counts.contains_key(&domain) {
            domain_order.push(domain.clone());
        }
        *domain_counts.entry(domain).or_insert(0) += 1;

        let key = normalize_url_for_matching(&item.url);
        let entry = max_per_url.entry(key).or_insert(0);
        if item.time_spent > *entry {
            *entry = item.time_spent;
        }
    }

    let mut top: Option<(&str, usize)> = None;
    for domain in &domain_order {
        let n = domain_counts[domain];
        if top.map(|(_, best)| n > best).unwrap_or(true) {
            top = Some((domain, n));
        }
    }

    let total_time_seconds: i64 = max_per_url.values().sum();
    HistoryStats {
        total_visits: items.len(),
        unique_sites: domain_counts.len(),
        top_domain: top.map(|(d, _)| d.to_string()),
        total_time_seconds,
        total_time: format_time_spent(total_time_seconds),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TimeRange {
    All,
    Today,
    Yesterday,
    Week,
    Month,
}

impl TimeRange {
    fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("all") {
            "today" => TimeRange::Today,
            "yesterday" => TimeRange::Yesterday,
            "week" => TimeRange::Week,
            "month" => TimeRange::Month,
            _ => TimeRange::All,
        }
    }
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn filter_history(
    items: &[VisitRecord],
    search: &str,
    range: TimeRange,
    domain_filter: &str,
    now: DateTime<Utc>,
) -> Vec<VisitRecord> {
    let needle = search.trim().to_lowercase();
    items
        .iter()
        .filter(|item| {
            if !needle.is_empty() {
                let hit = item.title.to_lowercase().contains(&needle)
                    || extract_domain(&item.url).contains(&needle);
                if !hit {
                    return false;
                }
            }
            if range != TimeRange::All {
                // Unparseable timestamps never match a bounded range.
                let Some(ts) = parse_timestamp(&item.visit_time) else {
                    return false;
                };
                let ok = match range {
                    TimeRange::All => true,
                    TimeRange::Today => ts.date_naive() == now.date_naive(),
                    TimeRange::Yesterday => now
                        .date_naive()
                        .pred_opt()
                        .map(|d| ts.date_naive() == d)
                        .unwrap_or(false),
                    TimeRange::Week => ts >= now - chrono::Duration::days(7),
                    TimeRange::Month => {
                        ts >= now.checked_sub_months(chrono::Months::new(1)).unwrap_or(now)
                    }
                };
                if !ok {
                    return false;
                }
            }
            if !domain_filter.is_empty()
                && domain_filter != "all"
                && extract_domain(&item.url) != domain_filter
            {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

fn format_time_spent(seconds: i64) -> String {
    if seconds <= 0 {
        return "0s".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn format_visit_time(ts: &str) -> String {
    match parse_timestamp(ts) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

fn csv_field(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn export_history_csv(items: &[VisitRecord]) -> String {
    let mut out = String::new();
    let header = ["Title", "Domain", "Visit Time", "Time Spent"];
    out.push_str(
        &header
            .iter()
            .map(|h| csv_field(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for item in items {
        let title = if item.title.is_empty() {
            "Untitled".to_string()
        } else {
            item.title.clone()
        };
        let row = [
            title,
            extract_domain(&item.url),
            format_visit_time(&item.visit_time),
            format_time_spent(item.time_spent),
        ];
        out.push_str(
            &row.iter()
                .map(|cell| csv_field(cell))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// LLM insight extraction
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum AnalyzeError {
    #[error("no API key configured")]
    MissingApiKey,
    #[error("insight request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("insight endpoint returned status {0}")]
    Api(u16),
    #[error("could not parse insights from model reply: {0}")]
    Parse(String),
}

fn analyze_error_response(err: &AnalyzeError) -> Response {
    let (status, code) = match err {
        AnalyzeError::MissingApiKey => (StatusCode::BAD_REQUEST, "missing_api_key"),
        AnalyzeError::Network(_) => (StatusCode::BAD_GATEWAY, "llm_unreachable"),
        AnalyzeError::Api(_) => (StatusCode::BAD_GATEWAY, "llm_error"),
        AnalyzeError::Parse(_) => (StatusCode::BAD_GATEWAY, "llm_parse_error"),
    };
    (status, Json(ErrResponse { ok: false, error: code })).into_response()
}

const SYSTEM_PROMPT: &str = "You extract short reading insights from web page text. \
Reply with a JSON array only, no prose.";

fn build_insight_prompt(title: &str, url: &str, content: &str) -> String {
    format!(
        r#"Read the page text below and extract 3 to 5 short insights a reader would want to remember.

Reply with a JSON array of objects, each shaped like:
  {{"category": "<one or two word theme>", "content": "<the insight, at most 25 words>", "quote": "<short supporting quote from the text, optional>"}}

Title: {title}
URL: {url}

Page text:
{body}"#,
        title = title,
        url = url,
        body = truncate_chars(content, MAX_ANALYZE_CHARS),
    )
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

async fn request_insights(
    client: &reqwest::Client,
    cfg: &LlmConfig,
    api_key: &str,
    page: &AnalyzePage,
) -> Result<Vec<InsightCandidate>, AnalyzeError> {
    let prompt = build_insight_prompt(
        page.title.as_deref().unwrap_or(""),
        &page.url,
        &page.content,
    );
    let payload = serde_json::json!({
        "model": cfg.model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": prompt}
        ],
        "temperature": cfg.temperature,
    });

    let endpoint = format!("{}/v1/chat/completions", cfg.base_url.trim_end_matches('/'));
    let response = client
        .post(&endpoint)
        .bearer_auth(api_key)
        .timeout(cfg.timeout)
        .json(&payload)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AnalyzeError::Api(response.status().as_u16()));
    }

    let body: ChatResponse = response.json().await?;
    let reply = body
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| AnalyzeError::Parse("reply contained no choices".to_string()))?;
    parse_insight_candidates(&reply)
}

/// The model is asked for a bare JSON array but routinely wraps it in prose
/// or code fences; take the outermost bracket-delimited substring.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_insight_candidates(reply: &str) -> Result<Vec<InsightCandidate>, AnalyzeError> {
    let raw = extract_json_array(reply)
        .ok_or_else(|| AnalyzeError::Parse("no JSON array in reply".to_string()))?;
    let value: Value =
        serde_json::from_str(raw).map_err(|err| AnalyzeError::Parse(err.to_string()))?;
    let Value::Array(items) = value else {
        return Err(AnalyzeError::Parse("reply is not a JSON array".to_string()));
    };

    let mut out = Vec::new();
    for item in items {
        let Value::Object(obj) = item else {
            continue;
        };
        // Models vary between {category, content} and {title, insight}.
        let content = obj
            .get("content")
            .or_else(|| obj.get("insight"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(content) = content else {
            continue;
        };
        let category = obj
            .get("category")
            .or_else(|| obj.get("title"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNCATEGORIZED);
        let quote = obj
            .get("quote")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        out.push(InsightCandidate {
            content: content.to_string(),
            category: Some(category.to_string()),
            url: None,
            source: None,
            quote,
            position: None,
        });
    }

    if out.is_empty() {
        return Err(AnalyzeError::Parse(
            "no usable insights in reply".to_string(),
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Persisted key-value store
// ---------------------------------------------------------------------------

const KEY_HISTORY: &str = "historyData";
const KEY_TIME_SPENT: &str = "timeSpentData";
const KEY_INSIGHTS: &str = "readingInsights";
const KEY_API_KEY: &str = "apiKey";
const KEY_AUTO_ANALYZE: &str = "autoAnalyze";

/// One JSON document per key, the schema the extension has always used. All
/// mutation goes through the typed accessors so the caps and dedup invariants
/// cannot be bypassed by ad-hoc writes.
struct Store {
    conn: Connection,
}

impl Store {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv_store (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
        )?;
        Ok(Store { conn })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json: Option<String> = match self.conn.query_row(
            "SELECT value_json FROM kv_store WHERE key = ?1",
            [key],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                error!("kv read failed for {key}: {err}");
                None
            }
        };
        let json = json?;
        match serde_json::from_str(&json) {
            Ok(v) => Some(v),
            Err(err) => {
                // Corrupted value: fall back to the default rather than wedge
                // every caller.
                warn!("discarding corrupted value for {key}: {err}");
                None
            }
        }
    }

    fn put<T: Serialize>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            r#"
INSERT INTO kv_store (key, value_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value_json=excluded.value_json,
  updated_at=excluded.updated_at
"#,
            (key, &json, &now_rfc3339()),
        )?;
        Ok(())
    }

    fn history(&self) -> Vec<VisitRecord> {
        self.get(KEY_HISTORY).unwrap_or_default()
    }

    fn set_history(&mut self, history: &[VisitRecord]) -> anyhow::Result<()> {
        self.put(KEY_HISTORY, &history)
    }

    fn time_spent(&self) -> HashMap<String, DomainTimeRecord> {
        self.get(KEY_TIME_SPENT).unwrap_or_default()
    }

    fn set_time_spent(&mut self, data: &HashMap<String, DomainTimeRecord>) -> anyhow::Result<()> {
        self.put(KEY_TIME_SPENT, data)
    }

    fn insights(&self) -> Vec<Insight> {
        self.get(KEY_INSIGHTS).unwrap_or_default()
    }

    fn set_insights(&mut self, insights: &[Insight]) -> anyhow::Result<()> {
        self.put(KEY_INSIGHTS, &insights)
    }

    fn api_key(&self) -> Option<String> {
        self.get::<String>(KEY_API_KEY)
            .filter(|k| !k.trim().is_empty())
    }

    fn set_api_key(&mut self, key: &str) -> anyhow::Result<()> {
        self.put(KEY_API_KEY, &key)
    }

    fn auto_analyze(&self) -> bool {
        self.get(KEY_AUTO_ANALYZE).unwrap_or(false)
    }

    fn set_auto_analyze(&mut self, value: bool) -> anyhow::Result<()> {
        self.put(KEY_AUTO_ANALYZE, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_insight(url: &str, content: &str, category: &str) -> Insight {
        Insight {
            content: content.to_string(),
            category: category.to_string(),
            source: "Some Page".to_string(),
            url: url.to_string(),
            domain: extract_domain(url),
            timestamp: "2026-02-15T00:00:00Z".to_string(),
            insight_id: insight_fingerprint(url, content),
            quote: None,
            position: None,
        }
    }

    fn mk_candidate(content: &str, category: &str) -> InsightCandidate {
        InsightCandidate {
            content: content.to_string(),
            category: Some(category.to_string()),
            url: None,
            source: None,
            quote: None,
            position: None,
        }
    }

    fn mk_visit(url: &str, title: &str, visit_time: &str, time_spent: i64) -> VisitRecord {
        VisitRecord {
            url: url.to_string(),
            title: title.to_string(),
            domain: extract_domain(url),
            visit_time: visit_time.to_string(),
            favicon_url: String::new(),
            time_spent,
        }
    }

    #[test]
    fn extract_domain_strips_scheme_path_and_port() {
        assert_eq!(
            extract_domain("https://www.example.com/path?q=1#frag"),
            "www.example.com"
        );
        assert_eq!(extract_domain("http://EXAMPLE.com:8080/x"), "example.com");
        assert_eq!(
            extract_domain("https://user:pw@news.ycombinator.com/item"),
            "news.ycombinator.com"
        );
    }

    #[test]
    fn extract_domain_returns_malformed_input_unchanged() {
        assert_eq!(extract_domain("not a url"), "not a url");
        assert_eq!(extract_domain("example.com/no-scheme"), "example.com/no-scheme");
        assert_eq!(extract_domain("://missing-scheme"), "://missing-scheme");
        assert_eq!(extract_domain("https:///nohost"), "https:///nohost");
    }

    #[test]
    fn friendly_title_uses_first_domain_label() {
        assert_eq!(friendly_title("https://www.example.com/a/b"), "Example");
        assert_eq!(friendly_title("https://news.ycombinator.com"), "News");
    }

    #[test]
    fn normalize_url_equates_scheme_and_slash_variants() {
        let a = normalize_url_for_matching("HTTPS://Example.com/Article/");
        let b = normalize_url_for_matching("http://example.com/article");
        assert_eq!(a, b);
        assert_eq!(a, "example.com/article");
    }

    #[test]
    fn fingerprint_is_deterministic_and_alphanumeric() {
        let a = insight_fingerprint("https://a.com/x", "Foo bar, baz!");
        let b = insight_fingerprint("https://a.com/x", "Foo bar, baz!");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, insight_fingerprint("https://a.com/y", "Foo bar, baz!"));
        assert_ne!(a, insight_fingerprint("https://a.com/x", "different text"));
    }

    #[test]
    fn fingerprint_only_depends_on_content_prefix() {
        let long_a = format!("{}{}", "x".repeat(50), "tail one");
        let long_b = format!("{}{}", "x".repeat(50), "tail two");
        assert_eq!(
            insight_fingerprint("https://a.com", &long_a),
            insight_fingerprint("https://a.com", &long_b)
        );
    }

    #[test]
    fn merge_suppresses_duplicate_for_same_page() {
        let existing = vec![mk_insight("https://a.com", "Foo bar baz quux", "Tech")];
        let incoming = vec![mk_candidate("Foo bar baz quux", "Tech")];
        let merged = merge_insights(existing, &incoming, "https://a.com", "a.com", "now");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "Foo bar baz quux");
    }

    #[test]
    fn merge_is_idempotent_for_repeated_batches() {
        let incoming = vec![
            mk_candidate("First takeaway about things", "Tech"),
            mk_candidate("Second takeaway about stuff", "Business"),
        ];
        let once = merge_insights(Vec::new(), &incoming, "https://a.com/p", "a.com", "t1");
        assert_eq!(once.len(), 2);
        let twice = merge_insights(once.clone(), &incoming, "https://a.com/p", "a.com", "t2");
        assert_eq!(twice.len(), once.len());
    }

    #[test]
    fn merge_supersedes_prior_insights_for_the_page() {
        let existing = vec![
            mk_insight("https://a.com/p", "Old insight one", "Tech"),
            mk_insight("https://a.com/p", "Old insight two", "Tech"),
            mk_insight("https://b.com", "Unrelated insight", "Science"),
        ];
        let incoming = vec![mk_candidate("Brand new insight", "Tech")];
        let merged = merge_insights(existing, &incoming, "https://a.com/p", "a.com", "now");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "Brand new insight");
        assert_eq!(merged[0].url, "https://a.com/p");
        assert_eq!(merged[1].url, "https://b.com");
    }

    #[test]
    fn merge_with_empty_incoming_is_a_noop() {
        let existing = vec![mk_insight("https://a.com/p", "Something", "Tech")];
        let merged = merge_insights(existing.clone(), &[], "https://a.com/p", "a.com", "now");
        assert_eq!(merged.len(), existing.len());
        assert_eq!(merged[0].content, "Something");
    }

    #[test]
    fn merge_prepends_new_and_caps_at_limit() {
        let existing: Vec<Insight> = (0..MAX_INSIGHTS - 1)
            .map(|i| {
                mk_insight(
                    &format!("https://site{i}.com"),
                    &format!("Insight number {i}"),
                    "Misc",
                )
            })
            .collect();
        let incoming = vec![
            mk_candidate("Fresh insight alpha", "Tech"),
            mk_candidate("Fresh insight beta", "Tech"),
            mk_candidate("Fresh insight gamma", "Tech"),
        ];
        let merged = merge_insights(existing, &incoming, "https://new.com", "new.com", "now");
        assert_eq!(merged.len(), MAX_INSIGHTS);
        assert_eq!(merged[0].content, "Fresh insight alpha");
        assert_eq!(merged[2].content, "Fresh insight gamma");
        // Oldest tail entries fall off.
        assert!(merged
            .iter()
            .all(|i| i.content != format!("Insight number {}", MAX_INSIGHTS - 2)));
    }

    #[test]
    fn merge_stamps_domain_and_defaults() {
        let incoming = vec![InsightCandidate {
            content: "Takeaway".to_string(),
            category: None,
            url: None,
            source: None,
            quote: None,
            position: None,
        }];
        let merged = merge_insights(Vec::new(), &incoming, "https://a.com/p", "a.com", "t0");
        assert_eq!(merged[0].domain, "a.com");
        assert_eq!(merged[0].url, "https://a.com/p");
        assert_eq!(merged[0].category, UNCATEGORIZED);
        assert_eq!(merged[0].timestamp, "t0");
        assert!(!merged[0].insight_id.is_empty());
    }

    #[test]
    fn time_update_accumulates_and_counts_page_once() {
        let mut time_spent = HashMap::new();
        let mut history: Vec<VisitRecord> = Vec::new();
        assert!(apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            30,
            "t1"
        ));
        assert!(apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            30,
            "t2"
        ));

        let record = &time_spent["a.com"];
        assert_eq!(record.total_time, 60);
        assert_eq!(record.visits, 1);
        assert_eq!(record.last_visit.as_deref(), Some("t2"));
        let page = &record.pages["https://a.com"];
        assert_eq!(page.total_time, 60);
        assert_eq!(page.visits, 1);
        assert_eq!(page.title, "Untitled");
    }

    #[test]
    fn time_update_rejects_non_positive_seconds() {
        let mut time_spent = HashMap::new();
        let mut history: Vec<VisitRecord> = Vec::new();
        assert!(!apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            0,
            "t"
        ));
        assert!(!apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            -5,
            "t"
        ));
        assert!(time_spent.is_empty());
    }

    #[test]
    fn time_update_keeps_newest_non_empty_title() {
        let mut time_spent = HashMap::new();
        let mut history: Vec<VisitRecord> = Vec::new();
        apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            Some("First Title"),
            10,
            "t1",
        );
        apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            10,
            "t2",
        );
        apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            Some("Second Title"),
            10,
            "t3",
        );
        assert_eq!(time_spent["a.com"].pages["https://a.com"].title, "Second Title");
    }

    #[test]
    fn time_update_increments_all_matching_history_entries() {
        let mut time_spent = HashMap::new();
        let mut history = vec![
            mk_visit("https://a.com/article/", "A", "2026-02-15T00:00:00Z", 0),
            mk_visit("http://a.com/article", "A again", "2026-02-14T00:00:00Z", 5),
            mk_visit("https://b.com", "B", "2026-02-13T00:00:00Z", 0),
        ];
        apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com/article",
            "a.com",
            None,
            30,
            "t",
        );
        assert_eq!(history[0].time_spent, 30);
        assert_eq!(history[1].time_spent, 35);
        assert_eq!(history[2].time_spent, 0);
    }

    #[test]
    fn reset_zeroes_time_but_keeps_visits() {
        let mut time_spent = HashMap::new();
        let mut history = vec![mk_visit("https://a.com", "A", "2026-02-15T00:00:00Z", 0)];
        apply_time_update(
            &mut time_spent,
            &mut history,
            "https://a.com",
            "a.com",
            None,
            120,
            "t",
        );
        reset_all_time_data(&mut time_spent, &mut history);
        assert!(time_spent.is_empty());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].time_spent, 0);
    }

    #[test]
    fn push_visit_substitutes_friendly_title() {
        let mut history = Vec::new();
        push_visit(
            &mut history,
            &VisitEvent {
                url: "https://www.example.com/post".to_string(),
                title: Some("www.example.com".to_string()),
                favicon_url: None,
            },
            "t1",
        );
        push_visit(
            &mut history,
            &VisitEvent {
                url: "https://other.com".to_string(),
                title: None,
                favicon_url: Some("https://other.com/favicon.ico".to_string()),
            },
            "t2",
        );
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].title, "Other");
        assert_eq!(history[0].favicon_url, "https://other.com/favicon.ico");
        assert_eq!(history[1].title, "Example");
        assert_eq!(history[1].time_spent, 0);
    }

    #[test]
    fn push_visit_caps_history_length() {
        let mut history = Vec::new();
        for i in 0..MAX_HISTORY_ITEMS + 10 {
            push_visit(
                &mut history,
                &VisitEvent {
                    url: format!("https://site{i}.com"),
                    title: Some(format!("Site {i}")),
                    favicon_url: None,
                },
                "t",
            );
        }
        assert_eq!(history.len(), MAX_HISTORY_ITEMS);
        assert_eq!(
            history[0].url,
            format!("https://site{}.com", MAX_HISTORY_ITEMS + 9)
        );
    }

    #[test]
    fn filter_insights_composes_search_and_categories() {
        let all = vec![
            mk_insight("https://a.com", "Rust borrow checker explained", "Tech"),
            mk_insight("https://b.com", "Quarterly earnings grew", "Business"),
            mk_insight("https://c.com", "Rust conference recap", "Community"),
        ];

        let hits = filter_insights(&all, "rust", &[]);
        assert_eq!(hits.len(), 2);

        let hits = filter_insights(&all, "rust", &["Tech".to_string()]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, "Tech");

        let hits = filter_insights(&all, "", &["all".to_string()]);
        assert_eq!(hits.len(), 3);

        let hits = filter_insights(
            &all,
            "",
            &["Business".to_string(), "Community".to_string()],
        );
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn group_by_source_preserves_order_and_handles_missing_url() {
        let mut orphan = mk_insight("", "No URL here", "Misc");
        orphan.url = String::new();
        let all = vec![
            mk_insight("https://a.com", "First", "Tech"),
            mk_insight("https://b.com", "Second", "Tech"),
            mk_insight("https://a.com", "Third", "Tech"),
            orphan,
        ];
        let groups = group_by_source(&all);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].url, "https://a.com");
        assert_eq!(groups[0].insights.len(), 2);
        assert_eq!(groups[0].insights[0].content, "First");
        assert_eq!(groups[0].insights[1].content, "Third");
        assert_eq!(groups[1].url, "https://b.com");
        assert_eq!(groups[2].url, UNKNOWN_SOURCE);
    }

    #[test]
    fn category_distribution_splits_time_proportionally() {
        let insights = vec![
            mk_insight("https://a.com/1", "One", "Tech"),
            mk_insight("https://a.com/2", "Two", "Tech"),
            mk_insight("https://a.com/3", "Three", "Business"),
        ];
        let mut time_spent = HashMap::new();
        time_spent.insert(
            "a.com".to_string(),
            DomainTimeRecord {
                total_time: 100,
                visits: 3,
                last_visit: None,
                pages: HashMap::new(),
            },
        );

        let dist = category_time_distribution(&insights, &time_spent);
        assert!((dist["Tech"] - 66.6667).abs() < 0.01);
        assert!((dist["Business"] - 33.3333).abs() < 0.01);
    }

    #[test]
    fn category_distribution_buckets_uninsighted_domains() {
        let insights = vec![mk_insight("https://a.com", "One", "Tech")];
        let mut time_spent = HashMap::new();
        time_spent.insert(
            "a.com".to_string(),
            DomainTimeRecord {
                total_time: 40,
                ..Default::default()
            },
        );
        time_spent.insert(
            "idle.com".to_string(),
            DomainTimeRecord {
                total_time: 60,
                ..Default::default()
            },
        );
        time_spent.insert(
            "zero.com".to_string(),
            DomainTimeRecord::default(),
        );

        let dist = category_time_distribution(&insights, &time_spent);
        assert!((dist["Tech"] - 40.0).abs() < f64::EPSILON);
        assert!((dist[UNCATEGORIZED] - 60.0).abs() < f64::EPSILON);
        assert_eq!(dist.len(), 2);
    }

    #[test]
    fn insight_stats_reports_top_category() {
        let all = vec![
            mk_insight("https://a.com", "One", "Tech"),
            mk_insight("https://b.com", "Two", "Business"),
            mk_insight("https://c.com", "Three", "Tech"),
        ];
        let stats = insight_stats(&all);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.categories, 2);
        assert_eq!(stats.top_category.as_deref(), Some("Tech"));
    }

    #[test]
    fn history_stats_deduplicate_time_per_url() {
        let items = vec![
            mk_visit("https://a.com/x", "A", "2026-02-15T00:00:00Z", 30),
            mk_visit("http://a.com/x/", "A dup", "2026-02-15T01:00:00Z", 50),
            mk_visit("https://b.com", "B", "2026-02-15T02:00:00Z", 20),
        ];
        let stats = history_stats(&items);
        assert_eq!(stats.total_visits, 3);
        assert_eq!(stats.unique_sites, 2);
        assert_eq!(stats.top_domain.as_deref(), Some("a.com"));
        // a.com/x counted once at its max (50), plus b.com (20).
        assert_eq!(stats.total_time_seconds, 70);
    }

    #[test]
    fn filter_history_applies_range_search_and_domain() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let items = vec![
            mk_visit("https://a.com/today", "Today Post", "2026-08-30T08:00:00Z", 0),
            mk_visit("https://a.com/yday", "Yesterday Post", "2026-08-29T20:00:00Z", 0),
            mk_visit("https://b.com/old", "Older Post", "2026-08-10T00:00:00Z", 0),
            mk_visit("https://b.com/ancient", "Ancient Post", "2025-01-01T00:00:00Z", 0),
            mk_visit("https://c.com/bad", "Broken Clock", "not-a-timestamp", 0),
        ];

        let today = filter_history(&items, "", TimeRange::Today, "all", now);
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].title, "Today Post");

        let yesterday = filter_history(&items, "", TimeRange::Yesterday, "all", now);
        assert_eq!(yesterday.len(), 1);
        assert_eq!(yesterday[0].title, "Yesterday Post");

        let week = filter_history(&items, "", TimeRange::Week, "all", now);
        assert_eq!(week.len(), 2);

        let month = filter_history(&items, "", TimeRange::Month, "all", now);
        assert_eq!(month.len(), 3);

        let search = filter_history(&items, "b.com", TimeRange::All, "all", now);
        assert_eq!(search.len(), 2);

        let domain = filter_history(&items, "", TimeRange::All, "a.com", now);
        assert_eq!(domain.len(), 2);

        // Unparseable timestamps only survive the unbounded range.
        let all = filter_history(&items, "", TimeRange::All, "all", now);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn format_time_spent_picks_units() {
        assert_eq!(format_time_spent(0), "0s");
        assert_eq!(format_time_spent(-3), "0s");
        assert_eq!(format_time_spent(45), "45s");
        assert_eq!(format_time_spent(200), "3m 20s");
        assert_eq!(format_time_spent(7500), "2h 5m");
    }

    #[test]
    fn csv_export_quotes_every_field_and_doubles_quotes() {
        let items = vec![
            mk_visit(
                "https://a.com/x",
                "He said \"hi\", twice",
                "2026-02-15T10:30:00Z",
                65,
            ),
            mk_visit("https://b.com", "Plain", "2026-02-15T11:00:00Z", 0),
        ];
        let csv = export_history_csv(&items);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "\"Title\",\"Domain\",\"Visit Time\",\"Time Spent\"");
        assert_eq!(
            lines[1],
            "\"He said \"\"hi\"\", twice\",\"a.com\",\"2026-02-15 10:30:00\",\"1m 5s\""
        );
        assert_eq!(lines[2], "\"Plain\",\"b.com\",\"2026-02-15 11:00:00\",\"0s\"");
    }

    #[test]
    fn json_array_extraction_tolerates_prose_and_fences() {
        let fenced = "Here you go:\n```json\n[{\"category\":\"Tech\",\"content\":\"A point\"}]\n```\nEnjoy!";
        let parsed = parse_insight_candidates(fenced).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].content, "A point");
        assert_eq!(parsed[0].category.as_deref(), Some("Tech"));

        let prose = "I found these: [{\"title\":\"Business\",\"insight\":\"Margins shrank\",\"quote\":\"margins fell 3%\"}] hope it helps";
        let parsed = parse_insight_candidates(prose).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].content, "Margins shrank");
        assert_eq!(parsed[0].category.as_deref(), Some("Business"));
        assert_eq!(parsed[0].quote.as_deref(), Some("margins fell 3%"));
    }

    #[test]
    fn json_array_extraction_fails_without_an_array() {
        assert!(matches!(
            parse_insight_candidates("no structured data here"),
            Err(AnalyzeError::Parse(_))
        ));
        assert!(matches!(
            parse_insight_candidates("broken [ not json }"),
            Err(AnalyzeError::Parse(_))
        ));
        // An array with nothing usable is a parse failure, not silent success.
        assert!(matches!(
            parse_insight_candidates("[1, 2, 3]"),
            Err(AnalyzeError::Parse(_))
        ));
        assert!(matches!(
            parse_insight_candidates("[]"),
            Err(AnalyzeError::Parse(_))
        ));
    }

    #[test]
    fn json_array_extraction_skips_unusable_entries() {
        let mixed = "[{\"content\":\"Good one\"}, 42, {\"category\":\"Tech\"}, {\"insight\":\"  \"}]";
        let parsed = parse_insight_candidates(mixed).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].content, "Good one");
        assert_eq!(parsed[0].category.as_deref(), Some(UNCATEGORIZED));
    }

    #[test]
    fn prompt_truncates_content_at_char_boundary() {
        let content = "é".repeat(MAX_ANALYZE_CHARS + 100);
        let prompt = build_insight_prompt("T", "https://a.com", &content);
        assert!(prompt.chars().filter(|c| *c == 'é').count() <= MAX_ANALYZE_CHARS);
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
    }

    #[test]
    fn store_round_trips_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kv.db")).unwrap();

        assert!(store.history().is_empty());
        assert!(store.api_key().is_none());
        assert!(!store.auto_analyze());

        let history = vec![mk_visit("https://a.com", "A", "2026-02-15T00:00:00Z", 12)];
        store.set_history(&history).unwrap();
        let loaded = store.history();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].url, "https://a.com");
        assert_eq!(loaded[0].time_spent, 12);

        store.set_api_key("sk-test").unwrap();
        assert_eq!(store.api_key().as_deref(), Some("sk-test"));

        store.set_auto_analyze(true).unwrap();
        assert!(store.auto_analyze());

        let insights = vec![mk_insight("https://a.com", "Something", "Tech")];
        store.set_insights(&insights).unwrap();
        assert_eq!(store.insights()[0].insight_id, insights[0].insight_id);
    }

    #[test]
    fn store_defaults_on_corrupted_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kv.db")).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO kv_store (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                (KEY_HISTORY, "{not json", "t"),
            )
            .unwrap();
        assert!(store.history().is_empty());
        // A good write repairs the key.
        store
            .set_history(&[mk_visit("https://a.com", "A", "t", 0)])
            .unwrap();
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn parse_listen_accepts_common_forms() {
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1").unwrap().port(),
            DEFAULT_PORT
        );
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert_eq!(parse_listen("localhost:8080").unwrap().port(), 8080);
        assert!(parse_listen("nonsense").is_err());
    }

    #[test]
    fn commands_deserialize_from_extension_envelopes() {
        let cmd: Command = serde_json::from_value(serde_json::json!({
            "action": "updateTimeSpent",
            "data": {"url": "https://a.com", "domain": "a.com", "timeSpent": 30}
        }))
        .unwrap();
        assert!(matches!(cmd, Command::UpdateTimeSpent { .. }));

        let cmd: Command = serde_json::from_value(serde_json::json!({
            "action": "saveApiKey",
            "apiKey": "sk-123"
        }))
        .unwrap();
        match cmd {
            Command::SaveApiKey { api_key } => assert_eq!(api_key, "sk-123"),
            _ => panic!("wrong variant"),
        }

        let cmd: Command =
            serde_json::from_value(serde_json::json!({"action": "resetTimeData"})).unwrap();
        assert!(matches!(cmd, Command::ResetTimeData));

        assert!(serde_json::from_value::<Command>(
            serde_json::json!({"action": "unknownThing"})
        )
        .is_err());
    }
}
