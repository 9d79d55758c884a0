//! The remote service client used by push.
//!
//! Credentials come from a YAML file mapping client ids to their
//! secret, server and scopes. A bearer token is obtained once with the
//! client-credentials grant and attached to every chunk POST.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientCredentials {
    pub secret: String,
    pub server: Url,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials(BTreeMap<String, ClientCredentials>);

impl Credentials {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Credentials> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening credentials file {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("parsing credentials file {}", path.display()))
    }

    pub fn client(&self, client_id: &str) -> anyhow::Result<&ClientCredentials> {
        self.0
            .get(client_id)
            .with_context(|| format!("credentials file has no client {client_id:?}"))
    }
}

pub struct RemoteClient {
    http: reqwest::Client,
    server: Url,
    token: String,
}

impl RemoteClient {
    /// Authenticate against the remote's token endpoint and build a
    /// client bound to its data endpoint.
    pub async fn connect(client_id: &str, credentials: &ClientCredentials) -> anyhow::Result<RemoteClient> {
        let http = reqwest::Client::new();
        let token_url = credentials.server.join("/auth/token")?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        tracing::info!(server = %credentials.server, "requesting access token");
        let response = http
            .post(token_url)
            .basic_auth(client_id, Some(&credentials.secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", &credentials.scopes.join(" ")),
            ])
            .send()
            .await
            .context("requesting access token")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token request failed: {status}: {body}");
        }
        let token: TokenResponse = response.json().await.context("parsing token response")?;

        Ok(RemoteClient {
            http,
            server: credentials.server.clone(),
            token: token.access_token,
        })
    }

    /// A client with a pre-issued token, used by tests and by
    /// deployments that manage tokens externally.
    pub fn with_token(server: Url, token: String) -> RemoteClient {
        RemoteClient {
            http: reqwest::Client::new(),
            server,
            token,
        }
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    /// POST one chunk and return the remote's `_data` array.
    pub async fn send_chunk(&self, body: String) -> anyhow::Result<Vec<Value>> {
        let response = self
            .http
            .post(self.server.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await
            .context("sending chunk")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("remote rejected chunk: {status}: {body}");
        }

        let mut payload: serde_json::Map<String, Value> =
            response.json().await.context("parsing chunk response")?;
        match payload.remove("_data") {
            Some(Value::Array(items)) => Ok(items),
            _ => anyhow::bail!("chunk response has no _data array"),
        }
    }
}
