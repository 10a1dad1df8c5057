//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    http::header,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Extension, Json, Router,
};
use common::protocol::{GateState, StatusMsg};
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{CaptureTrigger, TriggerOutcome},
    live_view::LiveView,
    meter::METER,
    utils::MJPEG_BOUNDARY,
};

/// State shared by all endpoints.
pub struct AppState {
    pub view: LiveView,
    pub trigger: Arc<dyn CaptureTrigger>,
    /// Ends open streams on shutdown.
    pub cancel: CancellationToken,
}

/// Build the router serving the live view.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/enable_cam", post(enable_cam))
        .route("/stream", get(stream))
        .route("/overlays", get(overlays))
        .route("/status", get(status))
        .layer(Extension(state))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index(Extension(state): Extension<Arc<AppState>>) -> Html<String> {
    Html(render_index(&state.view.status()))
}

/// Trigger control of the index page.
pub async fn enable_cam(Extension(state): Extension<Arc<AppState>>) -> Redirect {
    match state.trigger.trigger().await {
        Ok(TriggerOutcome::Started) => log::info!("Webcam enabled"),
        Ok(TriggerOutcome::Ignored(reason)) => log::debug!("Trigger ignored: {:?}", reason),
        // Already reported to the error handler and shown on the page
        Err(err) => log::debug!("Trigger failed: {err}"),
    }
    Redirect::to("/")
}

/// Live view with overlays as MJPEG stream.
pub async fn stream(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    log::info!("Live stream requested");

    let cancel = state.cancel.clone();
    let stream = BroadcastStream::new(state.view.subscribe())
        .filter_map(|item| async move {
            match item {
                Ok(bytes) => {
                    METER.tick_streamed();
                    Some(Ok::<_, Infallible>(bytes))
                }
                // Slow clients skip frames
                Err(_lagged) => None,
            }
        })
        .take_until(async move { cancel.cancelled().await });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
    )];

    (headers, body)
}

/// Overlay nodes of the current frame.
pub async fn overlays(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.view.overlays())
}

pub async fn status(Extension(state): Extension<Arc<AppState>>) -> Json<StatusMsg> {
    Json(state.view.status())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the index page for the given status.
pub fn render_index(status: &StatusMsg) -> String {
    let section_class = if status.model_loaded { "" } else { "invisible" };
    let button_state = match (status.model_loaded, status.gate) {
        (true, GateState::Armed) => "",
        _ => " disabled",
    };
    let notice = match status.gate {
        GateState::Unsupported => "<p class=\"warning\">No camera available on this system.</p>",
        _ if !status.model_loaded => "<p>Loading model, please wait...</p>",
        _ => "",
    };
    let error = status
        .last_error
        .as_deref()
        .map(|err| format!("<p class=\"error\">{}</p>", escape_html(err)))
        .unwrap_or_default();
    let live_view = match status.gate {
        GateState::Starting | GateState::Running => r#"<img id="webcam" src="/stream" width="100%">"#,
        _ => "",
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Live object detection</title>
    <style>
        .invisible {{ opacity: 0.2; }}
        .error {{ color: #c00; }}
        #liveView {{ position: relative; }}
    </style>
</head>
<body>
    <h3>Live object detection</h3>
    {notice}
    <section id="demos" class="{section_class}">
        <form method="post" action="/enable_cam">
            <button id="webcamButton" type="submit"{button_state}>Enable Webcam</button>
        </form>
        {error}
        <div id="liveView">{live_view}</div>
    </section>
</body>
</html>
"#
    )
}
