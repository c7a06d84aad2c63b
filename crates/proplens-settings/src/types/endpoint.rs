//! API endpoint settings.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Result, SettingsError};

/// Where the GraphQL API and its realtime socket live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointSettings {
    /// HTTPS GraphQL endpoint used for mutations and queries.
    pub graphql_url: String,
    /// Realtime WebSocket endpoint. Derived from `graphql_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            graphql_url: "http://localhost:20002/graphql".to_string(),
            realtime_url: None,
        }
    }
}

impl EndpointSettings {
    /// The parsed GraphQL endpoint.
    pub fn graphql_endpoint(&self) -> Result<Url> {
        parse_url("graphqlUrl", &self.graphql_url)
    }

    /// The realtime endpoint: the configured one, or one derived from the
    /// GraphQL URL (`https`→`wss`, `http`→`ws`, and the AppSync
    /// `appsync-api` host label becomes `appsync-realtime-api`).
    pub fn realtime_endpoint(&self) -> Result<Url> {
        if let Some(explicit) = &self.realtime_url {
            return parse_url("realtimeUrl", explicit);
        }
        derive_realtime_url(&self.graphql_endpoint()?)
    }

    /// `host[:port]` of the GraphQL endpoint, as carried in the socket
    /// authorization bundle.
    pub fn api_host(&self) -> Result<String> {
        let url = self.graphql_endpoint()?;
        let host = url
            .host_str()
            .ok_or_else(|| SettingsError::InvalidValue(format!("graphqlUrl has no host: {url}")))?;
        Ok(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SettingsError::InvalidValue(format!("{field} is empty")));
    }
    Url::parse(trimmed).map_err(|e| SettingsError::InvalidValue(format!("{field}: {e}")))
}

/// Map an HTTP(S) GraphQL URL onto its realtime counterpart.
pub fn derive_realtime_url(graphql: &Url) -> Result<Url> {
    let scheme = match graphql.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(SettingsError::InvalidValue(format!(
                "cannot derive realtime URL from scheme {other}"
            )));
        }
    };
    let swapped = graphql
        .as_str()
        .replacen(graphql.scheme(), scheme, 1)
        .replacen("appsync-api", "appsync-realtime-api", 1);
    Url::parse(&swapped).map_err(|e| SettingsError::InvalidValue(format!("realtimeUrl: {e}")))
}
