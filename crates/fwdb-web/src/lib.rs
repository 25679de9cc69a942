//! Axum + Askama web UI for FWDB: upload, preview, apply, browse, admin.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use fwdb_adapters::{open_spreadsheet, validate_file_format, IngestReport, ReadError};
use fwdb_core::{ContactRecord, EmailKey, UpdateMode, REQUIRED_COLUMNS, TABLE_NAME};
use fwdb_reconcile::{
    export_diff_csv, export_filename, ingest_file, ApplyReport, DiffEntry, ReconcileConfig,
    ReconcileError, ReconcileSession, Reconciler, SessionSlot, UploadIdentity,
};
use fwdb_storage::{UploadStore, ValidationError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "fwdb-web";

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub struct AppState {
    pub workspace_root: PathBuf,
    pub reconciler: Reconciler,
    pub uploads: UploadStore,
    pub session: SessionSlot,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, reconciler: Reconciler) -> Self {
        let uploads = UploadStore::new(reconciler.config().uploads_dir.clone());
        Self {
            workspace_root: workspace_root.into(),
            reconciler,
            uploads,
            session: SessionSlot::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ChangeView {
    column: &'static str,
    old: String,
    new: String,
}

#[derive(Debug, Clone)]
struct EntryView {
    key: String,
    email: String,
    name: String,
    surname: String,
    included: bool,
    changes: Vec<ChangeView>,
}

impl EntryView {
    fn new(entry: &DiffEntry, included: bool) -> Self {
        Self {
            key: entry.key.to_string(),
            email: entry.email.clone(),
            name: entry.name.clone(),
            surname: entry.surname.clone(),
            included,
            changes: entry
                .changes
                .iter()
                .map(|c| ChangeView {
                    column: c.column.as_str(),
                    old: c.display_old().to_string(),
                    new: c.display_new().to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct SheetFailureView {
    name: String,
    error: String,
    hints: Vec<String>,
}

#[derive(Debug, Clone)]
struct RenamedView {
    sheet: String,
    required: String,
    found: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    table_name: &'static str,
    table_exists: bool,
    row_count: usize,
    required_columns: String,
    session_file: String,
    notice: String,
}

#[derive(Template)]
#[template(path = "sheets.html")]
struct SheetsTemplate {
    file_name: String,
    content_hash: String,
    mode: String,
    sheets: Vec<String>,
}

#[derive(Template)]
#[template(path = "preview.html")]
struct PreviewTemplate {
    file_name: String,
    mode: String,
    mode_help: &'static str,
    processed_sheets: Vec<String>,
    failed_sheets: Vec<SheetFailureView>,
    renamed: Vec<RenamedView>,
    rows_read: usize,
    rows_in_batch: usize,
    collapsed_duplicates: usize,
    skipped_blank_email: usize,
    stored_rows: usize,
    updates: Vec<EntryView>,
    inserts: Vec<EntryView>,
    duplicates: Vec<EntryView>,
    unchanged: usize,
    included: usize,
    actionable: usize,
}

#[derive(Template)]
#[template(path = "apply_result.html")]
struct ApplyResultTemplate {
    message: String,
    mode: String,
    updated: usize,
    inserted: usize,
    kept: usize,
    unchanged: usize,
    excluded: usize,
    duplicates_skipped: usize,
    updates: Vec<EntryView>,
    inserts: Vec<EntryView>,
}

#[derive(Template)]
#[template(path = "records.html")]
struct RecordsTemplate {
    query: String,
    total: usize,
    rows: Vec<ContactRecord>,
}

#[derive(Template)]
#[template(path = "drop_confirm.html")]
struct DropConfirmTemplate {
    table_name: &'static str,
    row_count: usize,
    snapshot_before_drop: bool,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    title: String,
    message: String,
    hints: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyForm {
    key: String,
}

#[derive(Debug, Deserialize)]
struct ModeForm {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct SelectForm {
    which: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RecordForm {
    company: String,
    name: String,
    surname: String,
    email: String,
    position: String,
    phone: String,
    by_email: Option<String>,
}

impl RecordForm {
    fn record(&self) -> ContactRecord {
        ContactRecord::from_values([
            self.company.clone(),
            self.name.clone(),
            self.surname.clone(),
            self.email.clone(),
            self.position.clone(),
            self.phone.clone(),
        ])
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RecordEditForm {
    before_company: String,
    before_name: String,
    before_surname: String,
    before_email: String,
    before_position: String,
    before_phone: String,
    #[serde(flatten)]
    after: RecordForm,
}

impl RecordEditForm {
    fn before(&self) -> ContactRecord {
        ContactRecord::from_values([
            self.before_company.clone(),
            self.before_name.clone(),
            self.before_surname.clone(),
            self.before_email.clone(),
            self.before_position.clone(),
            self.before_phone.clone(),
        ])
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfirmForm {
    confirm: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/upload", post(upload_handler))
        .route("/sheets", post(sheets_handler))
        .route("/preview", get(preview_handler))
        .route("/preview/toggle", post(preview_toggle_handler))
        .route("/preview/mode", post(preview_mode_handler))
        .route("/preview/select", post(preview_select_handler))
        .route("/preview/diff.csv", get(preview_diff_csv_handler))
        .route("/apply", post(apply_handler))
        .route("/records", get(records_handler))
        .route("/records/update", post(records_update_handler))
        .route("/records/delete", post(records_delete_handler))
        .route("/records/export.csv", get(records_export_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .route("/admin/drop", post(admin_drop_handler))
        .route("/admin/drop/confirm", post(admin_drop_confirm_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(ReconcileConfig::from_env()).await
}

pub async fn serve(config: ReconcileConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let workspace_root = config.workspace_root.clone();
    let reconciler = Reconciler::connect(config).await?;
    let state = AppState::new(workspace_root, reconciler);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web ui listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_index(&state, String::new()).await
}

async fn render_index(state: &AppState, notice: String) -> Response {
    match state.reconciler.stats().await {
        Ok(stats) => render_html(IndexTemplate {
            table_name: TABLE_NAME,
            table_exists: stats.exists,
            row_count: stats.row_count,
            required_columns: REQUIRED_COLUMNS.join(", "),
            session_file: state
                .session
                .current_upload()
                .await
                .map(|u| u.file_name)
                .unwrap_or_default(),
            notice,
        }),
        Err(err) => reconcile_error(err),
    }
}

struct UploadForm {
    file_name: String,
    bytes: Vec<u8>,
    mode: UpdateMode,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm, String> {
    let mut mode = UpdateMode::default();
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "mode" => {
                let text = field.text().await.map_err(|e| e.body_text())?;
                mode = text.parse().map_err(|e: fwdb_core::UnknownUpdateMode| e.to_string())?;
            }
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|e| e.body_text())?;
                file = Some((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }
    let (file_name, bytes) = file.ok_or_else(|| "no file was uploaded".to_string())?;
    Ok(UploadForm {
        file_name,
        bytes,
        mode,
    })
}

async fn upload_handler(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let form = match read_upload_form(&mut multipart).await {
        Ok(form) => form,
        Err(message) => return error_page(StatusCode::BAD_REQUEST, "Upload failed", message, Vec::new()),
    };
    if let Err(err) = validate_file_format(&form.file_name, form.bytes.len() as u64) {
        return reconcile_error(err.into());
    }
    let stored = match state.uploads.store_bytes(&form.file_name, &form.bytes).await {
        Ok(stored) => stored,
        Err(err) => return server_error(err),
    };
    let sheets = match open_spreadsheet(&stored.absolute_path) {
        Ok(spreadsheet) => spreadsheet.sheet_names().to_vec(),
        Err(err) => return reconcile_error(err.into()),
    };
    if sheets.len() > 1 {
        return render_html(SheetsTemplate {
            file_name: form.file_name,
            content_hash: stored.content_hash,
            mode: form.mode.to_string(),
            sheets,
        });
    }
    start_session(&state, stored.content_hash, form.file_name, stored.absolute_path, form.mode, Vec::new()).await
}

async fn sheets_handler(
    State(state): State<Arc<AppState>>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Response {
    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    let content_hash = field("content_hash");
    let file_name = field("file_name");
    let selected = fields
        .iter()
        .filter(|(k, _)| k == "sheet")
        .map(|(_, v)| v.clone())
        .collect::<Vec<_>>();
    let mode = match field("mode").parse::<UpdateMode>() {
        Ok(mode) => mode,
        Err(err) => return error_page(StatusCode::BAD_REQUEST, "Invalid mode", err.to_string(), Vec::new()),
    };
    if content_hash.len() != 64 || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return error_page(
            StatusCode::BAD_REQUEST,
            "Upload expired",
            "the uploaded file could not be found; upload it again".to_string(),
            Vec::new(),
        );
    }
    if selected.is_empty() {
        return error_page(
            StatusCode::BAD_REQUEST,
            "No sheet selected",
            "Please select at least one sheet to process.".to_string(),
            Vec::new(),
        );
    }
    let path = state
        .uploads
        .root()
        .join(state.uploads.upload_relative_path(&content_hash, &file_name));
    start_session(&state, content_hash, file_name, path, mode, selected).await
}

async fn start_session(
    state: &AppState,
    content_hash: String,
    file_name: String,
    path: PathBuf,
    mode: UpdateMode,
    selected: Vec<String>,
) -> Response {
    let ingested = match ingest_file(&path, &selected) {
        Ok(ingested) => ingested,
        Err(err) => return reconcile_error(err),
    };
    let upload = UploadIdentity {
        content_hash,
        file_name,
        sheets: ingested.report.processed.iter().map(|s| s.name.clone()).collect(),
    };
    match state.reconciler.start_session(upload, path, ingested, mode).await {
        Ok(session) => {
            if !state.session.begin(session).await {
                let mut guard = state.session.lock().await;
                if let Some(current) = guard.as_mut().filter(|current| current.mode() != mode) {
                    if let Err(err) = state.reconciler.set_mode(current, mode).await {
                        return reconcile_error(err);
                    }
                    info!(%mode, "same upload re-submitted with another mode");
                } else {
                    info!("same upload re-submitted; keeping current selections");
                }
            }
            Redirect::to("/preview").into_response()
        }
        Err(err) => reconcile_error(err),
    }
}

fn mode_help(mode: UpdateMode) -> &'static str {
    match mode {
        UpdateMode::Replace => "Replace mode (smart update): existing records that match by email are updated, new records are added, and records not in the file are kept. Nothing is deleted.",
        UpdateMode::Append => "Append mode (no duplicates): only new emails are added. Records whose email already exists are skipped and left unchanged.",
    }
}

fn preview_template(session: &ReconcileSession) -> PreviewTemplate {
    let diff = session.diff();
    let mask = session.mask();
    let view = |entries: &[DiffEntry]| {
        entries
            .iter()
            .map(|e| EntryView::new(e, mask.is_included(&e.key)))
            .collect::<Vec<_>>()
    };
    let report: &IngestReport = &session.report;
    PreviewTemplate {
        file_name: session.upload.file_name.clone(),
        mode: session.mode().to_string(),
        mode_help: mode_help(session.mode()),
        processed_sheets: report.processed.iter().map(|s| format!("{} ({} rows)", s.name, s.rows)).collect(),
        failed_sheets: report
            .failed
            .iter()
            .map(|f| SheetFailureView {
                name: f.name.clone(),
                error: f.error.clone(),
                hints: f.hints.clone(),
            })
            .collect(),
        renamed: report
            .processed
            .iter()
            .flat_map(|s| {
                s.renamed.iter().map(|(required, found)| RenamedView {
                    sheet: s.name.clone(),
                    required: required.clone(),
                    found: found.clone(),
                })
            })
            .collect(),
        rows_read: report.rows_read,
        rows_in_batch: report.rows_in_batch,
        collapsed_duplicates: report.collapsed_duplicates,
        skipped_blank_email: report.skipped_blank_email,
        stored_rows: diff.stored_rows,
        updates: view(&diff.updates),
        inserts: view(&diff.inserts),
        duplicates: view(&diff.duplicates),
        unchanged: diff.unchanged.len(),
        included: session.included_count(),
        actionable: diff.updates.len() + diff.inserts.len(),
    }
}

async fn preview_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut guard = state.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return Redirect::to("/").into_response();
    };
    if let Err(err) = state.reconciler.refresh(session).await {
        return reconcile_error(err);
    }
    render_html(preview_template(session))
}

async fn preview_toggle_handler(State(state): State<Arc<AppState>>, Form(form): Form<KeyForm>) -> Response {
    let mut guard = state.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return reconcile_error(ReconcileError::NoSession);
    };
    if session.toggle(&EmailKey::from_email(&form.key)).is_none() {
        warn!(key = %form.key, "toggle for a key with nothing to apply");
    }
    Redirect::to("/preview").into_response()
}

async fn preview_mode_handler(State(state): State<Arc<AppState>>, Form(form): Form<ModeForm>) -> Response {
    let mode = match form.mode.parse::<UpdateMode>() {
        Ok(mode) => mode,
        Err(err) => return error_page(StatusCode::BAD_REQUEST, "Invalid mode", err.to_string(), Vec::new()),
    };
    let mut guard = state.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return reconcile_error(ReconcileError::NoSession);
    };
    match state.reconciler.set_mode(session, mode).await {
        Ok(()) => Redirect::to("/preview").into_response(),
        Err(err) => reconcile_error(err),
    }
}

async fn preview_select_handler(State(state): State<Arc<AppState>>, Form(form): Form<SelectForm>) -> Response {
    let mut guard = state.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return reconcile_error(ReconcileError::NoSession);
    };
    session.select_all(form.which != "none");
    Redirect::to("/preview").into_response()
}

async fn preview_diff_csv_handler(State(state): State<Arc<AppState>>) -> Response {
    let guard = state.session.lock().await;
    let Some(session) = guard.as_ref() else {
        return reconcile_error(ReconcileError::NoSession);
    };
    match export_diff_csv(session.diff()) {
        Ok(bytes) => csv_download(export_filename("changes", Utc::now()), bytes),
        Err(err) => server_error(err),
    }
}

async fn apply_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut guard = state.session.lock().await;
    let Some(session) = guard.as_ref() else {
        return reconcile_error(ReconcileError::NoSession);
    };
    match state.reconciler.apply_session(session).await {
        Ok(report) => {
            *guard = None;
            render_html(apply_result_template(report))
        }
        Err(err) => reconcile_error(err),
    }
}

fn apply_result_template(report: ApplyReport) -> ApplyResultTemplate {
    let counts = report.counts;
    ApplyResultTemplate {
        message: report.message,
        mode: report.mode.to_string(),
        updated: counts.updated,
        inserted: counts.inserted,
        kept: counts.kept,
        unchanged: counts.unchanged,
        excluded: counts.excluded,
        duplicates_skipped: counts.duplicates_skipped,
        updates: report.committed_updates.iter().map(|e| EntryView::new(e, true)).collect(),
        inserts: report.committed_inserts.iter().map(|e| EntryView::new(e, true)).collect(),
    }
}

async fn records_handler(State(state): State<Arc<AppState>>, Query(query): Query<RecordsQuery>) -> Response {
    let q = query.q.unwrap_or_default();
    let total = match state.reconciler.stats().await {
        Ok(stats) => stats.row_count,
        Err(err) => return reconcile_error(err),
    };
    match state.reconciler.search(&q).await {
        Ok(rows) => render_html(RecordsTemplate { query: q, total, rows }),
        Err(err) => reconcile_error(err),
    }
}

async fn records_update_handler(State(state): State<Arc<AppState>>, Form(form): Form<RecordEditForm>) -> Response {
    let before = form.before();
    let after = form.after.record();
    if before == after {
        return Redirect::to("/records").into_response();
    }
    let result = if form.after.by_email.is_some() {
        state.reconciler.update_by_key(&before.key(), &after).await.map(|_| ())
    } else {
        state.reconciler.update_row(&before, &after).await
    };
    match result {
        Ok(()) => Redirect::to("/records").into_response(),
        Err(err) => reconcile_error(err),
    }
}

async fn records_delete_handler(State(state): State<Arc<AppState>>, Form(form): Form<RecordForm>) -> Response {
    let row = form.record();
    let result = if form.by_email.is_some() {
        state.reconciler.delete_by_key(&row.key()).await.map(|_| ())
    } else {
        state.reconciler.delete_row(&row).await
    };
    match result {
        Ok(()) => Redirect::to("/records").into_response(),
        Err(err) => reconcile_error(err),
    }
}

async fn records_export_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.export_table_csv().await {
        Ok(bytes) => csv_download(export_filename(TABLE_NAME, Utc::now()), bytes),
        Err(err) => reconcile_error(err),
    }
}

async fn admin_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "table": TABLE_NAME,
            "exists": stats.exists,
            "row_count": stats.row_count,
            "session_active": state.session.current_upload().await.is_some(),
        }))
        .into_response(),
        Err(err) => reconcile_error(err),
    }
}

async fn admin_drop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.stats().await {
        Ok(stats) if !stats.exists => render_index(&state, "No data to delete.".to_string()).await,
        Ok(stats) => render_html(DropConfirmTemplate {
            table_name: TABLE_NAME,
            row_count: stats.row_count,
            snapshot_before_drop: state.reconciler.config().snapshot_before_drop,
        }),
        Err(err) => reconcile_error(err),
    }
}

async fn admin_drop_confirm_handler(State(state): State<Arc<AppState>>, Form(form): Form<ConfirmForm>) -> Response {
    if form.confirm != "yes" {
        return render_index(&state, "Drop cancelled.".to_string()).await;
    }
    match state.reconciler.drop_table().await {
        Ok(report) => {
            state.session.clear().await;
            let mut notice = format!("Table '{TABLE_NAME}' deleted ({} rows).", report.rows_removed);
            if let Some(snapshot) = &report.snapshot {
                notice.push_str(&format!(" Snapshot saved to {}.", snapshot.manifest_path.display()));
            }
            render_index(&state, notice).await
        }
        Err(err) => reconcile_error(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => (
            [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
            css,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn csv_download(file_name: String, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")),
        ],
        bytes,
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn error_page(status: StatusCode, title: &str, message: String, hints: Vec<String>) -> Response {
    let mut resp = render_html(ErrorTemplate {
        title: title.to_string(),
        message,
        hints,
    });
    *resp.status_mut() = status;
    resp
}

fn reconcile_error(err: ReconcileError) -> Response {
    warn!(error = %err, "request failed");
    let message = err.to_string();
    match &err {
        ReconcileError::Read(read) => {
            let title = match read {
                ReadError::Encrypted { .. } => "File is protected",
                ReadError::Empty | ReadError::UnsupportedType(_) => "Invalid file",
                _ => "Could not read file",
            };
            let hints = read.remedy().map(|r| vec![r.to_string()]).unwrap_or_default();
            error_page(StatusCode::BAD_REQUEST, title, message, hints)
        }
        ReconcileError::Schema(schema) => {
            let mut hints = schema.hints();
            hints.push(format!("Required columns: {}", REQUIRED_COLUMNS.join(", ")));
            error_page(StatusCode::UNPROCESSABLE_ENTITY, "Missing columns", message, hints)
        }
        ReconcileError::Validation(ValidationError::Ambiguous { .. }) => error_page(
            StatusCode::CONFLICT,
            "Several identical rows",
            message,
            vec!["Tick 'every row with this email' to edit or delete them together.".to_string()],
        ),
        ReconcileError::Validation(_) => error_page(StatusCode::CONFLICT, "Row not changed", message, Vec::new()),
        ReconcileError::NoSession => error_page(StatusCode::CONFLICT, "Nothing to apply", message, Vec::new()),
        ReconcileError::Store(_) | ReconcileError::Export(_) => {
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "Database error", message, Vec::new())
        }
    }
}
