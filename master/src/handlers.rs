use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use common::{
    EngineError, JobInfo, JobRequest, JobResults, PersistHandle, PersistedInfo, WorkerMetrics,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::JobController;
use crate::session::Session;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub controller: Arc<JobController>,
}

impl AppState {
    pub fn new(session: Arc<Session>) -> Self {
        let controller = Arc::new(JobController::new(Arc::clone(&session)));
        Self {
            session,
            controller,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/persisted", get(list_persisted))
        .route("/api/v1/persisted/:handle", delete(release_persisted))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidStageComposition(_)
            | EngineError::SourceUnavailable { .. }
            | EngineError::MalformedBoundary { .. }
            | EngineError::ParseError { .. } => StatusCode::BAD_REQUEST,
            EngineError::UnknownJob(_) | EngineError::UnknownHandle(_) => StatusCode::NOT_FOUND,
            EngineError::InsufficientStorage { .. } => StatusCode::INSUFFICIENT_STORAGE,
            EngineError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Resuelve la fuente, valida el grafo y lanza el job
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<JobInfo> {
    // la fuente persistida queda tomada hasta que el job tiene la suya
    let _pin = state.session.pin_source(&req.source)?;
    let partitions = state.session.resolve_source(&req.source)?;
    let handle =
        state
            .controller
            .submit_named(&req.name, req.graph, partitions, req.directive)?;
    let job = state.controller.info(&handle)?;
    info!("job {} creado vía HTTP ({} tareas)", job.id, job.total_tasks);
    Ok(Json(job))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.controller.list_jobs())
}

// Devuelve info básica de un job
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobInfo> {
    let handle = state.controller.find(&id)?;
    Ok(Json(state.controller.info(&handle)?))
}

// Resultado del job; 404 mientras no haya terminado
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<JobResults> {
    let handle = state.controller.find(&id)?;
    match state.controller.results(&handle)? {
        Some(results) => Ok(Json(results)),
        None => Err(ApiError::not_found(format!("job {id} todavía en ejecución"))),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobInfo> {
    let handle = state.controller.find(&id)?;
    state.controller.cancel(&handle)?;
    Ok(Json(state.controller.info(&handle)?))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(state.session.workers())
}

async fn list_persisted(State(state): State<AppState>) -> Json<Vec<PersistedInfo>> {
    Json(state.session.persisted())
}

// Suelta una referencia; al llegar a cero se libera el almacenamiento
async fn release_persisted(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<serde_json::Value> {
    let handle = PersistHandle(handle);
    let refs = state.session.release(&handle)?;
    Ok(Json(json!({ "handle": handle, "refs": refs })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use common::{EngineConfig, FnRegistry, JobStatus, StorageTier};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let mut config = EngineConfig::default();
        config.workers = 2;
        config.persist.dir =
            std::env::temp_dir().join(format!("flowlite-http-{}", uuid::Uuid::new_v4()));
        AppState::new(Arc::new(Session::new(config, FnRegistry::with_builtins())))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn wordcount_request() -> Value {
        json!({
            "name": "wc",
            "graph": {"stages": [
                {"op": "collect", "func": "tokenize"},
                {"op": "filter", "func": "nonempty_token"},
                {"op": "key_by",
                 "key": {"field": "token"},
                 "value": {"field": "count"}},
                {"op": "aggregate", "kind": "sum_by_key"}
            ]},
            "source": {
                "type": "inline",
                "records": [{"text": "hola mundo"}, {"text": "hola"}],
                "partitions": 2
            }
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_responde_ok() {
        let app = build_router(state());
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crear_job_y_leer_resultados() {
        let st = state();
        let app = build_router(st.clone());

        let (status, body) = send(&app, post_json("/api/v1/jobs", wordcount_request())).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let id = body["id"].as_str().unwrap().to_string();
        assert_eq!(body["total_tasks"], 2);

        let handle = st.controller.find(&id).unwrap();
        st.controller.wait(&handle).await.unwrap();

        let (status, body) = send(&app, get(&format!("/api/v1/jobs/{id}/results"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "COMPLETED");
        assert_eq!(body["result"]["output"]["data"]["data"]["hola"], 2.0);
        assert_eq!(body["result"]["output"]["data"]["data"]["mundo"], 1.0);

        let (_, jobs) = send(&app, get("/api/v1/jobs")).await;
        assert_eq!(jobs.as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grafo_invalido_devuelve_400() {
        let app = build_router(state());
        let mut req = wordcount_request();
        req["graph"]["stages"][0]["func"] = json!("no_existe");

        let (status, body) = send(&app, post_json("/api/v1/jobs", req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no_existe"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_desconocido_devuelve_404() {
        let app = build_router(state());
        let (status, _) = send(&app, get("/api/v1/jobs/nada")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, post_json("/api/v1/jobs/nada/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resultados_no_disponibles_hasta_terminar() {
        let mut reg = FnRegistry::with_builtins();
        reg.register_map("lento", |r| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(r.clone())
        });
        let mut config = EngineConfig::default();
        config.workers = 1;
        let st = AppState::new(Arc::new(Session::new(config, reg)));
        let app = build_router(st.clone());

        let req = json!({
            "name": "lento",
            "graph": {"stages": [{"op": "map", "func": "lento"}]},
            "source": {"type": "inline", "records": [1, 2, 3, 4, 5, 6, 7, 8], "partitions": 1}
        });
        let (_, body) = send(&app, post_json("/api/v1/jobs", req)).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, get(&format!("/api/v1/jobs/{id}/results"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, post_json(&format!("/api/v1/jobs/{id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");

        let (status, body) = send(&app, get(&format!("/api/v1/jobs/{id}/results"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], serde_json::to_value(JobStatus::Cancelled).unwrap());
        assert!(body["result"].is_null());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn liberar_persistido_por_http() {
        let st = state();
        let parts = common::source::from_records(vec![json!(1), json!(2)], 1);
        let handle = st.session.persist("nums", &parts, StorageTier::Memory).unwrap();
        let app = build_router(st);

        let (_, list) = send(&app, get("/api/v1/persisted")).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/persisted/{}", handle))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, del).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refs"], 0);

        let again = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/persisted/{}", handle))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, again).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_sobre_persistido_no_deja_referencias() {
        let st = state();
        let parts = common::source::from_records(vec![json!(1), json!(2), json!(3)], 2);
        let handle = st.session.persist("nums", &parts, StorageTier::Disk).unwrap();
        let app = build_router(st.clone());

        let req = json!({
            "name": "contar",
            "graph": {"stages": [{"op": "aggregate", "kind": "count"}]},
            "source": {"type": "persisted", "handle": handle}
        });
        let (status, body) = send(&app, post_json("/api/v1/jobs", req)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let id = body["id"].as_str().unwrap().to_string();

        let job = st.controller.find(&id).unwrap();
        st.controller.wait(&job).await.unwrap();
        assert_eq!(st.session.store().refs(&handle), Some(1));

        let missing = json!({
            "name": "nada",
            "graph": {"stages": []},
            "source": {"type": "persisted", "handle": "no-existe"}
        });
        let (status, _) = send(&app, post_json("/api/v1/jobs", missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        st.session.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lista_workers() {
        let app = build_router(state());
        let (status, body) = send(&app, get("/api/v1/workers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }
}
