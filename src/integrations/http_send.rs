//! HTTP-controlled endpoints.
//!
//! Every layer holds one request. A request is sent when it appears or
//! changes; removing it sends nothing. Requests sharing a `queueId` are sent
//! one after another, everything without one shares a default queue.
//!
//! ```json
//! { "type": "post", "url": "http://gfx/api/show", "params": { "id": 4 }, "queueId": "gfx" }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, NoProxy, Proxy, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{
    decode_content, ActionResult, Command, CommandContext, CommandError, CommandPhase,
    ConnectionError, Conversion, DiffContext, DeviceConnection, Phase, ProgrammingError,
    StateDiffer, Timed,
};
use crate::queue::SendMode;
use crate::timeline::{layers_for_device, Mappings, Snapshot};

pub const KIND: &str = "http_send";

/// Ad-hoc request action, payload is request content.
pub const SEND_COMMAND_ACTION: &str = "send_command";

/// Ordering group for requests without a queue id.
pub const DEFAULT_QUEUE_ID: &str = "default";

const CONTENT_TAGS: &[&str] = &["get", "post", "put", "delete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamsType {
    #[default]
    Json,
    Form,
}

/// One request, as it appears in timeline content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(rename = "type")]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub params_type: ParamsType,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Lower goes first among requests due at the same time.
    #[serde(default)]
    pub temporal_priority: i64,
    #[serde(default)]
    pub queue_id: Option<String>,
}

impl HttpRequest {
    /// Params flattened to string pairs for query strings and forms.
    fn param_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRequest {
    pub object_id: String,
    pub request: HttpRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpSendState {
    pub layers: BTreeMap<String, LayerRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpSendCommand {
    pub layer: String,
    pub request: HttpRequest,
}

impl CommandPhase for HttpSendCommand {
    fn phase(&self) -> Phase {
        Phase::Engage
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpSendDiffer;

impl HttpSendDiffer {
    pub fn new() -> Self {
        Self
    }
}

impl StateDiffer for HttpSendDiffer {
    type State = HttpSendState;
    type Payload = HttpSendCommand;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_state(&self) -> HttpSendState {
        HttpSendState::default()
    }

    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<HttpSendState>, ProgrammingError> {
        let mut state = HttpSendState::default();
        let mut warnings = Vec::new();

        for (layer, object, _) in layers_for_device(device_id, snapshot, mappings) {
            if object.is_lookahead {
                continue;
            }
            let request: Option<HttpRequest> =
                decode_content(KIND, layer, &object.content, CONTENT_TAGS, &mut warnings)?;
            if let Some(request) = request {
                state.layers.insert(
                    layer.to_string(),
                    LayerRequest {
                        object_id: object.object_id.clone(),
                        request,
                    },
                );
            }
        }

        Ok(Conversion::new(state, warnings))
    }

    fn diff(
        &self,
        old: &Timed<HttpSendState>,
        new: &Timed<HttpSendState>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<HttpSendCommand>>, ProgrammingError> {
        let mut changed: Vec<(&String, &LayerRequest)> = new
            .state
            .layers
            .iter()
            .filter(|(layer, entry)| {
                old.state
                    .layers
                    .get(*layer)
                    .map(|previous| previous.request != entry.request)
                    .unwrap_or(true)
            })
            .collect();
        changed.sort_by(|(a_layer, a), (b_layer, b)| {
            a.request
                .temporal_priority
                .cmp(&b.request.temporal_priority)
                .then_with(|| a_layer.cmp(b_layer))
        });

        Ok(changed
            .into_iter()
            .map(|(layer, entry)| {
                let group = entry
                    .request
                    .queue_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_QUEUE_ID.to_string());
                let context = CommandContext::new(format!("layer {} request", layer))
                    .with_change(&old.state.layers.get(layer), entry);
                Command::new(
                    ctx.time,
                    HttpSendCommand {
                        layer: layer.clone(),
                        request: entry.request.clone(),
                    },
                    context,
                )
                .for_object(Some(entry.object_id.clone()))
                .in_group(group)
            })
            .collect())
    }

    fn send_mode(&self) -> SendMode {
        SendMode::InOrder
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Refresh a fetched token this long before it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Wait after a failed token request before asking again.
const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSendOptions {
    /// Checked with HEAD by the connection monitor. Without it the endpoint
    /// always counts as reachable.
    pub probe_url: Option<String>,
    /// Fixed token. Takes precedence over client credentials.
    pub bearer_token: Option<String>,
    /// OAuth client credentials; tokens come from `{oauth_token_host}/oauth/token`.
    pub oauth_token_host: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_audience: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Hosts reached without the proxy.
    pub no_proxy: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for HttpSendOptions {
    fn default() -> Self {
        Self {
            probe_url: None,
            bearer_token: None,
            oauth_token_host: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_audience: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: Vec::new(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
struct ClientCredentials {
    token_url: String,
    client_id: String,
    client_secret: String,
    audience: Option<String>,
}

impl ClientCredentials {
    fn from_options(options: &HttpSendOptions) -> Option<Self> {
        match (&options.oauth_token_host, &options.oauth_client_id, &options.oauth_client_secret) {
            (Some(host), Some(id), Some(secret)) => Some(Self {
                token_url: format!("{}/oauth/token", host.trim_end_matches('/')),
                client_id: id.clone(),
                client_secret: secret.clone(),
                audience: options.oauth_audience.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug)]
struct AccessToken {
    value: String,
    refresh_at: Option<Instant>,
    expires_at: Option<Instant>,
}

impl AccessToken {
    fn from_response(response: TokenResponse, received: Instant) -> Self {
        let lifetime = response.expires_in.map(Duration::from_secs);
        Self {
            value: response.access_token,
            refresh_at: lifetime.map(|l| received + l.saturating_sub(TOKEN_EXPIRY_MARGIN)),
            expires_at: lifetime.map(|l| received + l),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.refresh_at.map_or(true, |at| now < at)
    }

    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct TokenCache {
    token: Option<AccessToken>,
    retry_after: Option<Instant>,
}

/// Map a non-success status onto the retry taxonomy.
fn classify_status(status: StatusCode, body: &str) -> CommandError {
    let message = format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CommandError::Transient(message)
    } else {
        CommandError::Fatal(message)
    }
}

fn classify_error(err: &reqwest::Error) -> CommandError {
    if err.is_connect() {
        CommandError::ConnectionLost(err.to_string())
    } else if err.is_builder() {
        CommandError::Fatal(err.to_string())
    } else {
        CommandError::Transient(err.to_string())
    }
}

fn proxy_error(url: &str, err: reqwest::Error) -> ConnectionError {
    ConnectionError::Protocol(format!("proxy '{}': {}", url, err))
}

pub struct ReqwestConnection {
    client: Client,
    options: HttpSendOptions,
    credentials: Option<ClientCredentials>,
    tokens: Mutex<TokenCache>,
}

impl ReqwestConnection {
    pub fn new(options: HttpSendOptions) -> Result<Self, ConnectionError> {
        let mut builder = Client::builder().timeout(Duration::from_millis(options.timeout_ms));
        let no_proxy = options.no_proxy.join(",");
        if let Some(url) = &options.http_proxy {
            let proxy = Proxy::http(url.as_str()).map_err(|e| proxy_error(url, e))?;
            builder = builder.proxy(proxy.no_proxy(NoProxy::from_string(&no_proxy)));
        }
        if let Some(url) = &options.https_proxy {
            let proxy = Proxy::https(url.as_str()).map_err(|e| proxy_error(url, e))?;
            builder = builder.proxy(proxy.no_proxy(NoProxy::from_string(&no_proxy)));
        }
        let client = builder
            .build()
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        let credentials = match options.bearer_token {
            Some(_) => None,
            None => ClientCredentials::from_options(&options),
        };
        Ok(Self {
            client,
            options,
            credentials,
            tokens: Mutex::new(TokenCache::default()),
        })
    }

    async fn fetch_token(&self, credentials: &ClientCredentials) -> Result<TokenResponse, String> {
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(audience) = &credentials.audience {
            form.push(("audience", audience.as_str()));
        }
        let response = self
            .client
            .post(&credentials.token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("token endpoint answered {}", status));
        }
        response.json::<TokenResponse>().await.map_err(|e| e.to_string())
    }

    /// Token for the next request, fetching or refreshing it when due.
    async fn bearer(&self) -> Result<Option<String>, CommandError> {
        if let Some(token) = &self.options.bearer_token {
            return Ok(Some(token.clone()));
        }
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };

        let mut cache = self.tokens.lock().await;
        let now = Instant::now();
        if let Some(token) = cache.token.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(Some(token.value.clone()));
        }

        let waiting = cache.retry_after.is_some_and(|at| now < at);
        if !waiting {
            match self.fetch_token(credentials).await {
                Ok(response) => {
                    let token = AccessToken::from_response(response, Instant::now());
                    info!(url = %credentials.token_url, expires_in = ?token.expires_at.map(|at| at - now), "Access token received");
                    let value = token.value.clone();
                    cache.token = Some(token);
                    cache.retry_after = None;
                    return Ok(Some(value));
                }
                Err(e) => {
                    warn!(url = %credentials.token_url, error = %e, "Access token request failed");
                    cache.retry_after = Some(now + TOKEN_RETRY_DELAY);
                }
            }
        }

        // A token inside its refresh margin still works until it expires
        match cache.token.as_ref().filter(|t| t.is_valid(now)) {
            Some(token) => Ok(Some(token.value.clone())),
            None => Err(CommandError::Transient("no access token available".to_string())),
        }
    }

    async fn send_request(&self, request: &HttpRequest) -> Result<(), CommandError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url);

        builder = match (request.method, request.params_type) {
            (HttpMethod::Get, _) => builder.query(&request.param_pairs()),
            (_, ParamsType::Json) => builder.json(&request.params),
            (_, ParamsType::Form) => builder.form(&request.param_pairs()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(token) = self.bearer().await? {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status();
        if status.is_success() {
            debug!(url = %request.url, status = %status, "Request sent");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(url = %request.url, status = %status, "Request rejected");
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl DeviceConnection<HttpSendCommand, HttpSendState> for ReqwestConnection {
    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.credentials.is_some() {
            // Failures are retried by the first request that needs a token
            if let Err(e) = self.bearer().await {
                warn!(error = %e, "No access token on connect");
            }
        }
        self.probe().await
    }

    async fn disconnect(&self) {}

    async fn probe(&self) -> Result<(), ConnectionError> {
        let Some(url) = &self.options.probe_url else {
            return Ok(());
        };
        // Any answer at all means the endpoint is up
        match self.client.head(url).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err(ConnectionError::Timeout(self.options.timeout_ms)),
            Err(e) => Err(ConnectionError::Unreachable(e.to_string())),
        }
    }

    /// Endpoints cannot be read back; their state is whatever was last sent.
    async fn query_state(&self) -> Result<HttpSendState, ConnectionError> {
        Ok(HttpSendState::default())
    }

    async fn send(&self, command: &Command<HttpSendCommand>) -> Result<(), CommandError> {
        self.send_request(&command.payload.request).await
    }

    async fn execute_action(&self, action: &str, payload: &Value) -> ActionResult {
        if action != SEND_COMMAND_ACTION {
            return ActionResult::not_found(action);
        }
        let request = match HttpRequest::deserialize(payload) {
            Ok(request) => request,
            Err(e) => return ActionResult::error(format!("Invalid request: {}", e)),
        };
        match self.send_request(&request).await {
            Ok(()) => ActionResult::ok(),
            Err(e) => ActionResult::error(e.to_string()),
        }
    }
}
