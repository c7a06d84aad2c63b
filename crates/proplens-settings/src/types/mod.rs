//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod endpoint;
mod runtime;

pub use endpoint::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "endpoint": { "graphqlUrl": "https://abc.appsync-api.eu-west-1.amazonaws.com/graphql" },
///   "monitor": { "maxRetries": 5 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProplensSettings {
    /// API endpoints.
    pub endpoint: EndpointSettings,
    /// Realtime socket tuning.
    pub transport: TransportSettings,
    /// Job monitor tuning.
    pub monitor: MonitorSettings,
    /// GraphQL HTTP client tuning.
    pub rpc: RpcSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
