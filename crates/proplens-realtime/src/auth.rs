//! Credentials and the AppSync authorization bundle.
//!
//! The same bundle travels twice: base64url-encoded inside the
//! `Sec-WebSocket-Protocol` header (`header-<b64>`) at connect time, and as
//! `extensions.authorization` of every `start` frame.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::protocol::GRAPHQL_WS;

/// A caller credential.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Bearer token (Cognito/OIDC), sent as `Authorization`.
    Token(String),
    /// API key, sent as `x-api-key`.
    ApiKey(String),
}

impl Credential {
    /// HTTP header name carrying this credential.
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Token(_) => "Authorization",
            Self::ApiKey(_) => "x-api-key",
        }
    }

    /// Raw credential value.
    pub fn secret(&self) -> &str {
        match self {
            Self::Token(v) | Self::ApiKey(v) => v,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(***)"),
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

/// `{host, Authorization}` or `{host, "x-api-key"}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthBundle {
    host: String,
    credential: Credential,
}

impl AuthBundle {
    /// Bundle for `host` (the GraphQL API host, not the realtime host).
    pub fn new(host: impl Into<String>, credential: &Credential) -> Self {
        Self {
            host: host.into(),
            credential: credential.clone(),
        }
    }

    /// Value of the `Sec-WebSocket-Protocol` request header:
    /// `graphql-ws, header-<base64url(JSON bundle)>`.
    pub fn subprotocols(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(format!(
            "{GRAPHQL_WS}, header-{}",
            URL_SAFE_NO_PAD.encode(json)
        ))
    }
}

impl Serialize for AuthBundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("host", &self.host)?;
        map.serialize_entry(self.credential.header_name(), self.credential.secret())?;
        map.end()
    }
}
