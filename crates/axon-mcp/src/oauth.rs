use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::client::OAuthConfig;
use crate::transport::TransportError;

const PENDING_AUTH_TTL: Duration = Duration::from_secs(10 * 60);

pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// Authorization-code + PKCE, matching the `generate_state_and_pkce`
/// pattern: a 32-byte random verifier, base64url-no-pad, SHA-256'd for the
/// challenge.
pub fn generate_pkce() -> PkceCodes {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    let code_verifier = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);
    let digest = Sha256::digest(code_verifier.as_bytes());
    let code_challenge = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, digest);
    PkceCodes { code_verifier, code_challenge }
}

pub fn generate_state() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Handed back to the caller so they can redirect the user and later poll
/// for completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorizationHandle {
    pub authorize_url: String,
    pub oauth_config_id: String,
    pub mcp_client_id: String,
}

struct PendingAuthorization {
    mcp_client_id: String,
    code_verifier: String,
    redirect_uri: String,
    created_at: Instant,
}

#[derive(Debug, Clone, Deserialize)]
struct DynamicClientRegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct DynamicClientRegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: Vec<&'a str>,
    token_endpoint_auth_method: &'a str,
    grant_types: Vec<&'a str>,
    response_types: Vec<&'a str>,
}

/// Drives the authorization-code + PKCE dance for HTTP MCP clients,
/// including RFC 7591 dynamic client registration when the server doesn't
/// hand out a static `client_id`.
pub struct OAuthFlowManager {
    http: wreq::Client,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
}

impl OAuthFlowManager {
    pub fn new() -> Self {
        Self { http: wreq::Client::new(), pending: Mutex::new(HashMap::new()) }
    }

    async fn prune_expired(&self, guard: &mut HashMap<String, PendingAuthorization>) {
        let now = Instant::now();
        guard.retain(|_, entry| now.duration_since(entry.created_at) <= PENDING_AUTH_TTL);
    }

    /// Registers a dynamic client if `registration_url` is set and no
    /// `client_id` is already configured, then builds the authorize URL and
    /// stashes the PKCE verifier keyed by `state` for the later token
    /// exchange.
    pub async fn begin_authorization(
        &self,
        mcp_client_id: &str,
        config: &OAuthConfig,
    ) -> Result<PendingAuthorizationHandle, TransportError> {
        let client_id = match (&config.client_id, &config.registration_url) {
            (Some(id), _) => id.clone(),
            (None, Some(registration_url)) => self.register_dynamic_client(registration_url, config).await?,
            (None, None) => {
                return Err(TransportError::Malformed(
                    "oauth config has neither a client_id nor a registration_url".into(),
                ));
            }
        };

        let pkce = generate_pkce();
        let state = generate_state();
        let scope = config.scope.clone().unwrap_or_default();

        let authorize_url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            config.authorize_url,
            urlencoding::encode(&client_id),
            urlencoding::encode(&config.redirect_uri),
            urlencoding::encode(&scope),
            urlencoding::encode(&pkce.code_challenge),
            urlencoding::encode(&state),
        );

        let mut guard = self.pending.lock().await;
        self.prune_expired(&mut guard).await;
        guard.insert(
            state.clone(),
            PendingAuthorization {
                mcp_client_id: mcp_client_id.to_string(),
                code_verifier: pkce.code_verifier,
                redirect_uri: config.redirect_uri.clone(),
                created_at: Instant::now(),
            },
        );

        Ok(PendingAuthorizationHandle { authorize_url, oauth_config_id: state, mcp_client_id: mcp_client_id.to_string() })
    }

    async fn register_dynamic_client(
        &self,
        registration_url: &str,
        config: &OAuthConfig,
    ) -> Result<String, TransportError> {
        let body = DynamicClientRegistrationRequest {
            client_name: "axon-gateway",
            redirect_uris: vec![config.redirect_uri.as_str()],
            token_endpoint_auth_method: "none",
            grant_types: vec!["authorization_code"],
            response_types: vec!["code"],
        };
        let resp = self
            .http
            .post(registration_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("dynamic client registration returned {}", resp.status())));
        }
        let parsed: DynamicClientRegistrationResponse =
            resp.json().await.map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(parsed.client_id)
    }

    /// Exchanges an authorization code for tokens, given the `state` the
    /// callback carried back. Returns the raw token response on success; the
    /// caller (the registry) is responsible for transitioning the client's
    /// connection state to `Connected`.
    pub async fn complete_with_code(&self, state: &str, code: &str, token_url: &str) -> Result<serde_json::Value, TransportError> {
        let pending = {
            let mut guard = self.pending.lock().await;
            guard.remove(state)
        };
        let Some(pending) = pending else {
            return Err(TransportError::Malformed(format!("no pending authorization for state `{state}`")));
        };

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        let resp = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("token exchange returned {}", resp.status())));
        }
        let _ = &pending.mcp_client_id;
        resp.json().await.map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

impl Default for OAuthFlowManager {
    fn default() -> Self {
        Self::new()
    }
}
