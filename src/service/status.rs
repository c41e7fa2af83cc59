use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Status,
    core::status,
    dashboard::{Dashboard, Metrics},
    utils::response::ResponseBuilder,
};

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requests: Option<Metrics>,
}

/// Liveness and readiness probes, served apart from the relief API.
///
/// `/status/ready` answers 503 until the first request snapshot reached the
/// dashboard; an operator hitting the API before that would see an empty queue.
pub struct StatusHttpApp {
    config: Status,
    dashboard: Arc<Dashboard>,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status, dashboard: Arc<Dashboard>) -> Self {
        Self {
            config: cfg.clone(),
            dashboard,
        }
    }

    pub fn status_http_service(cfg: &Status, dashboard: Arc<Dashboard>) -> Service<Self> {
        let app = Self::new(cfg, dashboard);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }

    fn handle(&self, path: &str) -> Response<Vec<u8>> {
        match path {
            "/status/live" => ResponseBuilder::success_json(&StatusResponse {
                status: "ok",
                error: None,
                requests: None,
            }),
            "/status/ready" => self.ready(),
            _ => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn ready(&self) -> Response<Vec<u8>> {
        if status::is_ready() {
            ResponseBuilder::success_json(&StatusResponse {
                status: "ok",
                error: None,
                requests: Some(self.dashboard.metrics()),
            })
        } else {
            ResponseBuilder::json(
                StatusCode::SERVICE_UNAVAILABLE,
                &StatusResponse {
                    status: "error",
                    error: Some("Request snapshot not loaded yet"),
                    requests: None,
                },
            )
        }
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        self.handle(http_session.req_header().uri.path())
    }
}
