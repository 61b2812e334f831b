use std::{
    mem,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::protocol::{RefreshRequest, RefreshResponse, TokenPair, TokenRequest};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{AuthError, BusinessError, GatewayError, TransportError},
    session::{CredentialStore, Session},
};

pub const TOKEN_PATH: &str = "/token";
pub const TOKEN_REFRESH_PATH: &str = "/token/refresh";
pub const TOKEN_BLACKLIST_PATH: &str = "/token/blacklist";

const BOOTSTRAP_PATHS: [&str; 3] = [TOKEN_PATH, TOKEN_REFRESH_PATH, TOKEN_BLACKLIST_PATH];

fn is_bootstrap_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.trim_end_matches('/');
    BOOTSTRAP_PATHS.iter().any(|bootstrap| path == *bootstrap)
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, GatewayError> {
        let value = serde_json::to_value(body)
            .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_bootstrap(&self) -> bool {
        is_bootstrap_path(&self.path)
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|err| GatewayError::Decode(err.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

type RefreshOutcome = Result<String, AuthError>;

#[derive(Default)]
struct RefreshCycle {
    in_progress: bool,
    queue: Vec<oneshot::Sender<RefreshOutcome>>,
}

// Clears the cycle on every exit path of the refresh task, including panics and aborts.
// Waiters still queued at that point observe a dropped sender.
struct CycleTeardown {
    gateway: Arc<RequestGateway>,
    outcome: Option<RefreshOutcome>,
}

impl Drop for CycleTeardown {
    fn drop(&mut self) {
        let waiters = {
            let mut cycle = self.gateway.lock_cycle();
            cycle.in_progress = false;
            mem::take(&mut cycle.queue)
        };
        match self.outcome.take() {
            Some(outcome) => {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
            None => drop(waiters),
        }
    }
}

enum Attempt {
    Done(ApiResponse),
    Unauthorized { sent_token: Option<String> },
}

pub struct RequestGateway {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    request_timeout: Duration,
    cycle: StdMutex<RefreshCycle>,
}

impl RequestGateway {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Self::with_client(Client::new(), base_url, credentials, request_timeout)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Arc::new(Self {
            http,
            base_url,
            credentials,
            request_timeout,
            cycle: StdMutex::new(RefreshCycle::default()),
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn refresh_in_progress(&self) -> bool {
        self.lock_cycle().in_progress
    }

    pub async fn execute(
        self: &Arc<Self>,
        request: ApiRequest,
    ) -> Result<ApiResponse, GatewayError> {
        let token = self.credentials.access_token();
        let sent_token = match self.attempt(&request, token).await? {
            Attempt::Done(response) => return Ok(response),
            Attempt::Unauthorized { sent_token } => sent_token,
        };

        debug!(
            method = %request.method,
            path = %request.path,
            "gateway: access token rejected, awaiting refresh"
        );
        let fresh_token = self.await_fresh_token(sent_token).await?;

        match self.attempt(&request, Some(fresh_token)).await? {
            Attempt::Done(response) => Ok(response),
            Attempt::Unauthorized { .. } => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "gateway: request rejected again after refresh"
                );
                Err(AuthError::RetryRejected.into())
            }
        }
    }

    pub async fn execute_json<T: DeserializeOwned>(
        self: &Arc<Self>,
        request: ApiRequest,
    ) -> Result<T, GatewayError> {
        self.execute(request).await?.json()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, GatewayError> {
        let request = ApiRequest::post(TOKEN_PATH).json(&TokenRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let pair: TokenPair = self.send_bootstrap(&request).await?.json()?;
        let session = Session::from_tokens(pair.access, pair.refresh)
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        self.credentials.login(session.clone());
        Ok(session)
    }

    /// Revokes the refresh token server-side when possible, then clears the session.
    pub async fn logout(&self) {
        if let Some(refresh) = self.credentials.refresh_token() {
            let request = ApiRequest::post(TOKEN_BLACKLIST_PATH).json(&RefreshRequest { refresh });
            let revoke = match request {
                Ok(request) => self.send_bootstrap(&request).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = revoke {
                warn!(error = %err, "gateway: refresh token revocation failed");
            }
        }
        self.credentials.clear();
    }

    async fn send_bootstrap(&self, request: &ApiRequest) -> Result<ApiResponse, GatewayError> {
        match self.attempt(request, None).await? {
            Attempt::Done(response) => Ok(response),
            // attempt() never reports Unauthorized for bootstrap paths.
            Attempt::Unauthorized { .. } => Err(BusinessError {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body: String::new(),
            }
            .into()),
        }
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        token: Option<String>,
    ) -> Result<Attempt, GatewayError> {
        let url = self.url_for(&request.path)?;
        let mut headers = request.headers.clone();
        match &token {
            Some(token) => {
                let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;
                bearer.set_sensitive(true);
                headers.insert(AUTHORIZATION, bearer);
            }
            None => {
                headers.remove(AUTHORIZATION);
            }
        }
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers)
            .timeout(self.request_timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| {
            let err = TransportError::from_reqwest(&err);
            warn!(
                path = %request.path,
                code = %err.code,
                "gateway: request did not reach the server"
            );
            err
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED && !request.is_bootstrap() {
            return Ok(Attempt::Unauthorized { sent_token: token });
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(&err))?
            .to_vec();

        if !status.is_success() {
            return Err(BusinessError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }

        Ok(Attempt::Done(ApiResponse {
            status,
            headers,
            body,
        }))
    }

    fn url_for(&self, path: &str) -> Result<Url, GatewayError> {
        let joined = if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        };
        Url::parse(&joined).map_err(|err| GatewayError::InvalidRequest(err.to_string()))
    }

    /// Joins the in-progress refresh cycle, starting one if none is running.
    async fn await_fresh_token(
        self: &Arc<Self>,
        sent_token: Option<String>,
    ) -> Result<String, GatewayError> {
        let waiter = {
            let mut cycle = self.lock_cycle();
            if !cycle.in_progress {
                // Tokens only change inside a cycle, so this read is final while the lock is held.
                let current = self.credentials.access_token();
                if let Some(current) = current.filter(|current| Some(current) != sent_token.as_ref())
                {
                    // Rotated by a cycle that finished after this request was sent.
                    return Ok(current);
                }
            }
            let (tx, rx) = oneshot::channel();
            cycle.queue.push(tx);
            if !cycle.in_progress {
                cycle.in_progress = true;
                let gateway = Arc::clone(self);
                tokio::spawn(async move {
                    gateway.run_refresh_cycle().await;
                });
            }
            rx
        };

        match waiter.await {
            Ok(outcome) => outcome.map_err(GatewayError::from),
            Err(_) => Err(AuthError::RefreshAbandoned.into()),
        }
    }

    async fn run_refresh_cycle(self: Arc<Self>) {
        let mut teardown = CycleTeardown {
            gateway: Arc::clone(&self),
            outcome: None,
        };
        let outcome = self.refresh_tokens().await;
        match &outcome {
            Ok(_) => info!("gateway: access token refreshed"),
            Err(err) => {
                warn!(error = %err, "gateway: token refresh failed, clearing session");
                self.credentials.clear();
            }
        }
        teardown.outcome = Some(outcome);
    }

    async fn refresh_tokens(&self) -> RefreshOutcome {
        let refresh = self
            .credentials
            .refresh_token()
            .ok_or(AuthError::MissingRefreshToken)?;
        let request = ApiRequest::post(TOKEN_REFRESH_PATH)
            .json(&RefreshRequest { refresh })
            .map_err(refresh_failed)?;
        let response: RefreshResponse = self
            .send_bootstrap(&request)
            .await
            .and_then(|response| response.json())
            .map_err(refresh_failed)?;
        let session = self
            .credentials
            .replace_tokens(response.access, response.refresh)
            .map_err(|err| AuthError::RefreshFailed {
                reason: err.to_string(),
            })?;
        Ok(session.access_token)
    }

    fn lock_cycle(&self) -> std::sync::MutexGuard<'_, RefreshCycle> {
        self.cycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn refresh_failed(err: GatewayError) -> AuthError {
    AuthError::RefreshFailed {
        reason: err.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
