//! HTTP submission endpoint.
//!
//! `POST /process` with a form-encoded `id`, `url` and `postBackUrl` puts a
//! job on the queue. Every request must carry a signed bearer token (see
//! [`crate::callback::verify`]).

use crate::callback;
use crate::job::Job;
use crate::queue::MessageQueue;
use axum::extract::rejection::FormRejection;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONNECTION};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MISSING_PARAMETERS: &str = "Missing parameters. `id`, `url` and `postBackUrl` are required.";

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn MessageQueue>,
    pub secret: Arc<str>,
}

impl AppState {
    pub fn new(queue: Arc<dyn MessageQueue>, secret: &str) -> Self {
        Self {
            queue,
            secret: Arc::from(secret),
        }
    }
}

/// Fields are optional so a missing one yields our own 400 instead of a
/// generic extractor rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessForm {
    id: Option<String>,
    url: Option<String>,
    post_back_url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/process", post(process))
        .layer(middleware::from_fn_with_state(state.clone(), require_signature))
        .with_state(state)
}

/// Serves the API until `shutdown` fires.
pub async fn serve(host: &str, port: u16, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("The REST API is listening at http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn require_signature(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Err(e) = callback::verify(&state.secret, authorization) {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            reason = %e,
            "Rejected unauthenticated request"
        );
        return (
            StatusCode::UNAUTHORIZED,
            [(CONNECTION, "close")],
            "Unauthenticated request",
        )
            .into_response();
    }

    next.run(request).await
}

async fn process(State(state): State<AppState>, form: Result<Form<ProcessForm>, FormRejection>) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            warn!(reason = %rejection, "Rejected unreadable submission");
            return (StatusCode::BAD_REQUEST, MISSING_PARAMETERS).into_response();
        }
    };
    let (Some(id), Some(url), Some(post_back_url)) = (
        present(form.id),
        present(form.url),
        present(form.post_back_url),
    ) else {
        return (StatusCode::BAD_REQUEST, MISSING_PARAMETERS).into_response();
    };

    let job = Job::new(id, url, post_back_url);
    match state.queue.enqueue(&job).await {
        Ok(()) => Json(job).into_response(),
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Unable to submit a job to the queue");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to queue the job").into_response()
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
