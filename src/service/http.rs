use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, http::RequestHeader, protocols::http::ServerSession,
    services::listening::Service,
};
use pingora_limits::rate::Rate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    auth::OperatorAuth,
    config::{Intake, RateLimit},
    core::{ReliefError, ReliefResult},
    dashboard::{export_csv, export_filename, Dashboard, FilterMode},
    geo::known_districts,
    lifecycle::{ApproveOutcome, RequestLifecycle},
    request::{Request, Submission},
    utils::{
        request::{
            get_bearer_token, get_peer_ip, get_query_value, read_request_body,
            resolve_client_ip,
        },
        response::ResponseBuilder,
    },
};

/// Upper bound for JSON request bodies.
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Shared state behind every handler.
pub struct ReliefContext {
    pub lifecycle: RequestLifecycle,
    pub auth: OperatorAuth,
    pub dashboard: Arc<Dashboard>,
    intake_limit: Option<IntakeLimiter>,
}

impl ReliefContext {
    pub fn new(
        lifecycle: RequestLifecycle,
        auth: OperatorAuth,
        dashboard: Arc<Dashboard>,
        intake: &Intake,
    ) -> Self {
        Self {
            lifecycle,
            auth,
            dashboard,
            intake_limit: intake
                .rate_limit
                .as_ref()
                .map(|limit| IntakeLimiter::new(limit, intake.trust_forwarded_headers)),
        }
    }
}

/// Per-client cap on citizen submissions.
struct IntakeLimiter {
    rate: Rate,
    count: isize,
    trust_forwarded: bool,
}

impl IntakeLimiter {
    fn new(cfg: &RateLimit, trust_forwarded: bool) -> Self {
        Self {
            rate: Rate::new(Duration::from_secs(cfg.time_window as _)),
            count: cfg.count as isize,
            trust_forwarded,
        }
    }

    fn check_request(
        &self,
        req_header: &RequestHeader,
        peer: Option<IpAddr>,
    ) -> ReliefResult<()> {
        self.check(&resolve_client_ip(req_header, peer, self.trust_forwarded))
    }

    fn check(&self, client: &str) -> ReliefResult<()> {
        let curr_window_requests = self.rate.observe(&client, 1);
        if curr_window_requests > self.count {
            log::warn!("Submission rate limit exceeded for client {client}");
            return Err(ReliefError::RateLimited(
                "too many submissions, please wait before trying again".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Public,
    Operator,
}

#[async_trait]
trait Handler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>>;
}

struct Route {
    access: Access,
    handler: Box<dyn Handler + Send + Sync>,
}

/// Public and operator JSON API.
pub struct ReliefHttpApp {
    ctx: Arc<ReliefContext>,
    router: Router<HashMap<Method, Route>>,
}

impl ReliefHttpApp {
    pub fn new(ctx: Arc<ReliefContext>) -> Self {
        let mut this = Self {
            ctx,
            router: Router::new(),
        };

        this.route("/api/requests", Method::POST, Access::Public, Box::new(SubmitHandler))
            .route("/api/requests/{id}", Method::GET, Access::Public, Box::new(LookupHandler))
            .route(
                "/api/requests/{id}/track",
                Method::GET,
                Access::Public,
                Box::new(TrackHandler),
            )
            .route("/api/districts", Method::GET, Access::Public, Box::new(DistrictsHandler))
            .route("/api/auth/sign-in", Method::POST, Access::Public, Box::new(SignInHandler))
            .route(
                "/api/auth/sign-out",
                Method::POST,
                Access::Operator,
                Box::new(SignOutHandler),
            )
            .route("/api/dashboard", Method::GET, Access::Operator, Box::new(DashboardHandler))
            .route(
                "/api/requests/{id}/approve",
                Method::POST,
                Access::Operator,
                Box::new(ApproveHandler),
            )
            .route(
                "/api/requests/{id}",
                Method::DELETE,
                Access::Operator,
                Box::new(DeleteHandler),
            )
            .route("/api/export", Method::GET, Access::Operator, Box::new(ExportHandler));

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        access: Access,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        let route = Route { access, handler };
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, route);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, route);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to register route {path}: {e}");
                }
            }
        }
        self
    }

    pub fn relief_http_service(ctx: Arc<ReliefContext>) -> Service<Self> {
        Service::new("Relief HTTP".to_string(), Self::new(ctx))
    }

    fn authorize(&self, req_header: &RequestHeader) -> ReliefResult<()> {
        let token = get_bearer_token(req_header)
            .ok_or_else(|| ReliefError::Unauthorized("missing bearer token".to_string()))?;
        self.ctx.auth.verify(token).map(|_| ())
    }
}

#[async_trait]
impl ServeHttp for ReliefHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        let Match { value, params } = match self.router.at(&path) {
            Ok(matched) => matched,
            Err(_) => return ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        };
        let Some(route) = value.get(&method) else {
            return ResponseBuilder::error_http(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        };

        if route.access == Access::Operator {
            if let Err(err) = self.authorize(http_session.req_header()) {
                log::debug!("Rejected operator call {method} {path}: {err}");
                return ResponseBuilder::from_error(&err);
            }
        }

        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        match route.handler.handle(&self.ctx, http_session, params).await {
            Ok(resp) => resp,
            Err(err) => {
                if !matches!(
                    err,
                    ReliefError::Validation(_)
                        | ReliefError::NotFound(_)
                        | ReliefError::Unauthorized(_)
                        | ReliefError::RateLimited(_)
                ) {
                    log::error!("{method} {path} failed: {err}");
                }
                ResponseBuilder::from_error(&err)
            }
        }
    }
}

fn path_id(params: &BTreeMap<String, String>) -> ReliefResult<&str> {
    params
        .get("id")
        .map(String::as_str)
        .ok_or_else(|| ReliefError::Validation("missing request id".to_string()))
}

async fn read_json<T: DeserializeOwned>(session: &mut ServerSession) -> ReliefResult<T> {
    let body = read_request_body(session, MAX_BODY_BYTES).await?;
    serde_json::from_slice(&body)
        .map_err(|e| ReliefError::Validation(format!("invalid JSON body: {e}")))
}

fn filter_param(session: &ServerSession) -> FilterMode {
    get_query_value(session.req_header(), "filter")
        .map(FilterMode::from_name)
        .unwrap_or_default()
}

struct SubmitHandler;

#[async_trait]
impl Handler for SubmitHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        if let Some(limiter) = &ctx.intake_limit {
            limiter.check_request(session.req_header(), get_peer_ip(session))?;
        }

        let submission: Submission = read_json(session).await?;
        let receipt = ctx.lifecycle.submit(submission).await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, &receipt))
    }
}

struct LookupHandler;

#[async_trait]
impl Handler for LookupHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        _session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let request = ctx.lifecycle.lookup(path_id(&params)?).await?;
        Ok(ResponseBuilder::success_json(&request))
    }
}

struct TrackHandler;

#[async_trait]
impl Handler for TrackHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        _session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let view = ctx.lifecycle.track(path_id(&params)?).await?;
        Ok(ResponseBuilder::success_json(&view))
    }
}

struct DistrictsHandler;

#[async_trait]
impl Handler for DistrictsHandler {
    async fn handle(
        &self,
        _ctx: &ReliefContext,
        _session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        Ok(ResponseBuilder::success_json(&known_districts()))
    }
}

#[derive(Deserialize)]
struct SignInBody {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct SignInResponse {
    email: String,
    token: String,
    expires_at: DateTime<Utc>,
}

struct SignInHandler;

#[async_trait]
impl Handler for SignInHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let body: SignInBody = read_json(session).await?;
        let operator = ctx.auth.sign_in(&body.email, &body.password)?;
        Ok(ResponseBuilder::success_json(&SignInResponse {
            email: operator.email,
            token: operator.token,
            expires_at: operator.expires_at,
        }))
    }
}

struct SignOutHandler;

#[async_trait]
impl Handler for SignOutHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let token = get_bearer_token(session.req_header())
            .ok_or_else(|| ReliefError::Unauthorized("missing bearer token".to_string()))?;
        ctx.auth.sign_out(token)?;
        Ok(ResponseBuilder::no_content())
    }
}

struct DashboardHandler;

#[async_trait]
impl Handler for DashboardHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let view = ctx.dashboard.view(filter_param(session));
        Ok(ResponseBuilder::success_json(&view))
    }
}

#[derive(Serialize)]
struct ApproveResponse<'a> {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    precision: Option<&'static str>,
    request: &'a Request,
}

impl<'a> From<&'a ApproveOutcome> for ApproveResponse<'a> {
    fn from(outcome: &'a ApproveOutcome) -> Self {
        match outcome {
            ApproveOutcome::Approved { request, precision } => Self {
                outcome: "approved",
                precision: Some(precision.as_str()),
                request,
            },
            ApproveOutcome::AlreadyApproved { request } => Self {
                outcome: "already_approved",
                precision: None,
                request,
            },
        }
    }
}

struct ApproveHandler;

#[async_trait]
impl Handler for ApproveHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        _session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let outcome = ctx.lifecycle.approve(path_id(&params)?).await?;
        Ok(ResponseBuilder::success_json(&ApproveResponse::from(
            &outcome,
        )))
    }
}

struct DeleteHandler;

#[async_trait]
impl Handler for DeleteHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        confirmed_delete(ctx, session.req_header(), path_id(&params)?).await?;
        Ok(ResponseBuilder::no_content())
    }
}

fn require_confirmation(req_header: &RequestHeader) -> ReliefResult<()> {
    if get_query_value(req_header, "confirm") == Some("true") {
        Ok(())
    } else {
        Err(ReliefError::Validation(
            "deletion is permanent and must be confirmed with confirm=true".to_string(),
        ))
    }
}

/// Permanently remove a request, only once the operator confirmed it.
async fn confirmed_delete(
    ctx: &ReliefContext,
    req_header: &RequestHeader,
    id: &str,
) -> ReliefResult<()> {
    require_confirmation(req_header)?;
    ctx.lifecycle.delete(id).await
}

struct ExportHandler;

#[async_trait]
impl Handler for ExportHandler {
    async fn handle(
        &self,
        ctx: &ReliefContext,
        session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> ReliefResult<Response<Vec<u8>>> {
        let filter = filter_param(session);
        let view = ctx.dashboard.view(filter);
        let body = export_csv(view.visible_requests())?;
        Ok(ResponseBuilder::csv_attachment(body, &export_filename(filter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config,
        geo::GeoResolver,
        request::Submission,
        store::MemoryRequestStore,
    };

    fn header(uri: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", uri.as_bytes(), None).unwrap();
        for (name, value) in headers {
            req.insert_header(name.to_string(), value.to_string()).unwrap();
        }
        req
    }

    fn context(rate_limit: Option<&RateLimit>) -> Arc<ReliefContext> {
        let auth = OperatorAuth::from_config(&config::Auth {
            secret: "0123456789abcdef".to_string(),
            token_ttl: 3600,
            operators: vec![config::Operator {
                email: "ops@example.org".to_string(),
                password: "correct horse".to_string(),
            }],
        })
        .unwrap();
        let lifecycle = RequestLifecycle::new(
            Arc::new(MemoryRequestStore::new()),
            GeoResolver::default(),
        );
        Arc::new(ReliefContext::new(
            lifecycle,
            auth,
            Arc::new(Dashboard::new()),
            &Intake {
                rate_limit: rate_limit.cloned(),
                trust_forwarded_headers: false,
            },
        ))
    }

    fn access(app: &ReliefHttpApp, path: &str, method: Method) -> Option<Access> {
        let matched = app.router.at(path).ok()?;
        matched.value.get(&method).map(|route| route.access)
    }

    #[test]
    fn test_route_table() {
        let app = ReliefHttpApp::new(context(None));

        assert_eq!(access(&app, "/api/requests", Method::POST), Some(Access::Public));
        assert_eq!(access(&app, "/api/requests/abc", Method::GET), Some(Access::Public));
        assert_eq!(
            access(&app, "/api/requests/abc/track", Method::GET),
            Some(Access::Public)
        );
        assert_eq!(access(&app, "/api/districts", Method::GET), Some(Access::Public));
        assert_eq!(access(&app, "/api/auth/sign-in", Method::POST), Some(Access::Public));

        assert_eq!(
            access(&app, "/api/requests/abc", Method::DELETE),
            Some(Access::Operator)
        );
        assert_eq!(
            access(&app, "/api/requests/abc/approve", Method::POST),
            Some(Access::Operator)
        );
        assert_eq!(access(&app, "/api/dashboard", Method::GET), Some(Access::Operator));
        assert_eq!(access(&app, "/api/export", Method::GET), Some(Access::Operator));
        assert_eq!(
            access(&app, "/api/auth/sign-out", Method::POST),
            Some(Access::Operator)
        );

        assert_eq!(access(&app, "/api/requests/abc", Method::PUT), None);
        assert_eq!(access(&app, "/api/unknown", Method::GET), None);
    }

    #[test]
    fn test_intake_limiter() {
        let limiter = IntakeLimiter::new(
            &RateLimit {
                time_window: 60,
                count: 2,
            },
            false,
        );
        assert!(limiter.check("203.0.113.7").is_ok());
        assert!(limiter.check("203.0.113.7").is_ok());
        assert!(matches!(
            limiter.check("203.0.113.7"),
            Err(ReliefError::RateLimited(_))
        ));
        assert!(limiter.check("198.51.100.1").is_ok());
    }

    #[test]
    fn test_approve_response_shape() {
        let outcome = ApproveOutcome::AlreadyApproved {
            request: serde_json::from_value(serde_json::json!({
                "id": "abc",
                "district": "Galle",
                "item": "Water",
                "urgency": "High",
                "lat": 6.05,
                "lng": 80.22,
                "status": "approved",
                "timestamp": "2024-11-28T10:00:00Z"
            }))
            .unwrap(),
        };
        let json = serde_json::to_value(ApproveResponse::from(&outcome)).unwrap();
        assert_eq!(json["outcome"], "already_approved");
        assert!(json.get("precision").is_none());
        assert_eq!(json["request"]["status"], "approved");
    }

    #[test]
    fn test_intake_limit_ignores_spoofed_forwarding_headers() {
        let limit = RateLimit {
            time_window: 60,
            count: 2,
        };
        let peer: Option<IpAddr> = Some("192.0.2.10".parse().unwrap());

        let limiter = IntakeLimiter::new(&limit, false);
        let mut results = Vec::new();
        for i in 0..5 {
            let req = header(
                "/api/requests",
                &[("X-Forwarded-For", format!("10.9.9.{i}").as_str())],
            );
            results.push(limiter.check_request(&req, peer));
        }
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        for result in &results[2..] {
            assert!(matches!(result, Err(ReliefError::RateLimited(_))));
        }

        // behind a trusted proxy each forwarded client gets its own budget
        let limiter = IntakeLimiter::new(&limit, true);
        for i in 0..5 {
            let req = header(
                "/api/requests",
                &[("X-Forwarded-For", format!("10.9.9.{i}").as_str())],
            );
            assert!(limiter.check_request(&req, peer).is_ok());
        }
    }

    #[test]
    fn test_operator_gate() {
        let ctx = context(None);
        let app = ReliefHttpApp::new(ctx.clone());

        let err = app.authorize(&header("/api/dashboard", &[])).unwrap_err();
        assert!(matches!(err, ReliefError::Unauthorized(_)));
        assert_eq!(ResponseBuilder::from_error(&err).status(), StatusCode::UNAUTHORIZED);

        let err = app
            .authorize(&header("/api/dashboard", &[("Authorization", "Bearer not-a-jwt")]))
            .unwrap_err();
        assert!(matches!(err, ReliefError::Unauthorized(_)));

        let session = ctx.auth.sign_in("ops@example.org", "correct horse").unwrap();
        let bearer = format!("Bearer {}", session.token);
        let signed_in = header("/api/dashboard", &[("Authorization", bearer.as_str())]);
        assert!(app.authorize(&signed_in).is_ok());

        ctx.auth.sign_out(&session.token).unwrap();
        let err = app.authorize(&signed_in).unwrap_err();
        assert!(matches!(err, ReliefError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let ctx = context(None);
        let receipt = ctx
            .lifecycle
            .submit(Submission {
                district: "Galle".to_string(),
                item: "Water".to_string(),
                urgency: "High".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = receipt.id.as_str();

        for uri in [
            format!("/api/requests/{id}"),
            format!("/api/requests/{id}?confirm=false"),
            format!("/api/requests/{id}?confirm"),
        ] {
            let err = confirmed_delete(&ctx, &header(&uri, &[]), id)
                .await
                .unwrap_err();
            assert!(matches!(err, ReliefError::Validation(_)));
            assert_eq!(ResponseBuilder::from_error(&err).status(), StatusCode::BAD_REQUEST);
            assert!(ctx.lifecycle.lookup(id).await.is_ok());
        }

        let confirmed = header(&format!("/api/requests/{id}?confirm=true"), &[]);
        confirmed_delete(&ctx, &confirmed, id).await.unwrap();
        assert!(ctx.lifecycle.lookup(id).await.unwrap_err().is_not_found());
    }
}
