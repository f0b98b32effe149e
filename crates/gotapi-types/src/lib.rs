//! Shared wire types for the GotAPI gateway components.
//!
//! This crate provides the records that cross component boundaries:
//! the app-facing [`Command`] and [`Reply`] envelopes, the plugin bus
//! [`PluginMessage`], and the capability metadata plugins declare
//! ([`PluginInformation`], [`Service`]). All types are serializable so the
//! same shapes can travel over HTTP, WebSocket frames, and the plugin bus.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Profile names with protocol meaning.
pub mod profile {
    /// Pseudo-profile that fans out to every plugin's service list.
    pub const SERVICE_DISCOVERY: &str = "servicediscovery";
    pub const AVAILABILITY: &str = "availability";
    pub const AUTHORIZATION: &str = "authorization";
    pub const SERVICE_INFORMATION: &str = "serviceInformation";
    /// Plugin-bus profile used to ask one plugin for its services.
    pub const NETWORK_SERVICE_DISCOVERY: &str = "networkServiceDiscovery";

    /// Whether `profile` names the discovery pseudo-profile (`serviceDiscovery`
    /// and `servicediscovery` are both accepted).
    #[must_use]
    pub fn is_service_discovery(profile: &str) -> bool {
        profile.eq_ignore_ascii_case(SERVICE_DISCOVERY)
    }
}

/// Attribute names with protocol meaning.
pub mod attribute {
    pub const GRANT: &str = "grant";
    pub const ACCESS_TOKEN: &str = "accesstoken";
    pub const VERIFY: &str = "verify";
    pub const CREATE_CLIENT: &str = "createClient";
    pub const REQUEST_ACCESS_TOKEN: &str = "requestAccessToken";
    pub const GET_NETWORK_SERVICES: &str = "getNetworkServices";
}

/// Parameter names the gateway itself interprets.
pub mod param {
    pub const ACCESS_TOKEN: &str = "accessToken";
    pub const SERVICE_ID: &str = "serviceId";
    pub const NONCE: &str = "nonce";
    pub const KEY: &str = "key";
    pub const CLIENT_ID: &str = "clientId";
    pub const SCOPE: &str = "scope";
}

pub const INVALID_STATUS_MESSAGE: &str =
    "An invalid HTTP status code was specified by the Plug-In.";
pub const MISSING_STATUS_MESSAGE: &str = "The Plug-In did not specify the HTTP status code.";

/// HTTP verb of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported method: {0}")]
pub struct UnsupportedMethod(pub String);

impl FromStr for Method {
    type Err = UnsupportedMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(UnsupportedMethod(s.to_string())),
        }
    }
}

/// Kind of a plugin bus message travelling towards the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Correlated answer to an earlier request (matched by `requestCode`).
    Response,
    /// Unsolicited push, never correlated.
    Event,
}

/// Failure taxonomy reported to apps in `errorText`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidProfile,
    InvalidAttribute,
    InvalidParameter,
    InvalidServiceId,
    UnknownService,
    OutOfScope,
    NotAuthorized,
    InvalidClientId,
    InvalidToken,
    Timeout,
    InvalidMethod,
    Error,
}

impl ErrorKind {
    /// Default HTTP status for this kind.
    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::InvalidProfile
            | Self::InvalidAttribute
            | Self::InvalidParameter
            | Self::InvalidServiceId
            | Self::InvalidClientId => 400,
            Self::InvalidToken => 401,
            Self::OutOfScope | Self::NotAuthorized => 403,
            Self::UnknownService => 404,
            Self::InvalidMethod => 405,
            Self::Timeout => 408,
            Self::Error => 500,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidProfile => "INVALID_PROFILE",
            Self::InvalidAttribute => "INVALID_ATTRIBUTE",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::InvalidServiceId => "INVALID_SERVICE_ID",
            Self::UnknownService => "UNKNOWN_SERVICE",
            Self::OutOfScope => "OUT_OF_SCOPE",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::InvalidClientId => "INVALID_CLIENT_ID",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Timeout => "TIMEOUT",
            Self::InvalidMethod => "INVALID_METHOD",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the status an app sees for a failed plugin reply.
///
/// Returns the status and, when the plugin broke the status contract, the
/// message that replaces the plugin's own. Statuses in `400..1000` are kept.
#[must_use]
pub fn plugin_failure_status(result: i64, error_code: Option<i64>) -> (u16, Option<&'static str>) {
    let accepted = |code: i64| {
        (400..1000)
            .contains(&code)
            .then(|| u16::try_from(code).ok())
            .flatten()
    };
    match error_code {
        Some(code) => match accepted(code) {
            Some(status) => (status, None),
            None => (500, Some(INVALID_STATUS_MESSAGE)),
        },
        None => match accepted(result) {
            Some(status) => (status, None),
            None => (500, Some(MISSING_STATUS_MESSAGE)),
        },
    }
}

/// Split a comma separated scope list into profile names.
///
/// Whitespace around entries is dropped, as are empty entries.
#[must_use]
pub fn parse_scope(scope: &str) -> Vec<String> {
    scope
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One controllable capability instance exposed by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub service_id: String,
    pub name: String,
    pub online: bool,
    /// Profiles this service answers.
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Service {
    #[must_use]
    pub fn new(service_id: impl Into<String>, name: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            service_id: service_id.into(),
            name: name.into(),
            online: true,
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            manufacturer: None,
            version: None,
            kind: None,
        }
    }

    #[must_use]
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Whether this service answers `profile`.
    ///
    /// Exact match, except `serviceInformation` which matches in any case.
    #[must_use]
    pub fn supports(&self, profile: &str) -> bool {
        let info = profile.eq_ignore_ascii_case(profile::SERVICE_INFORMATION);
        self.scopes
            .iter()
            .any(|s| s == profile || (info && s.eq_ignore_ascii_case(profile)))
    }
}

/// What a plugin declares about itself at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PluginInformation {
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl PluginInformation {
    #[must_use]
    pub fn new(name: impl Into<String>, services: Vec<Service>) -> Self {
        Self {
            name: name.into(),
            services,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("The frame is not a JSON object.")]
    NotAnObject,

    #[error("The field `{0}` must be a string.")]
    NotAString(&'static str),

    #[error(transparent)]
    Method(#[from] UnsupportedMethod),
}

/// Inbound command from a web app.
///
/// Both front ends build the same record: the method and the two-level
/// namespace, plus every other parameter (including `serviceId`,
/// `accessToken` and `nonce`) in `params`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    pub method: Method,
    pub profile: String,
    pub attribute: String,
    pub params: Map<String, Value>,
    /// Origin of the calling app, handed to plugins during authorization.
    pub package: Option<String>,
}

impl Command {
    #[must_use]
    pub fn new(method: Method, profile: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            method,
            profile: profile.into(),
            attribute: attribute.into(),
            params: Map::new(),
            package: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    /// Build a command from a WebSocket JSON frame.
    ///
    /// `method`, `profile` and `attribute` are lifted out; a nested `params`
    /// object is flattened; every other key becomes a parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not an object, a namespace field is
    /// not a string, or the method is not supported.
    pub fn from_frame(frame: Value) -> Result<Self, FrameError> {
        let Value::Object(mut fields) = frame else {
            return Err(FrameError::NotAnObject);
        };

        let mut take_str = |name: &'static str| match fields.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(FrameError::NotAString(name)),
        };

        let method = match take_str("method")? {
            Some(m) => m.parse()?,
            None => Method::Get,
        };
        let profile = take_str("profile")?.unwrap_or_default();
        let attribute = take_str("attribute")?.unwrap_or_default();

        let mut params = match fields.remove("params") {
            Some(Value::Object(nested)) => nested,
            Some(other) => {
                fields.insert("params".to_string(), other);
                Map::new()
            }
            None => Map::new(),
        };
        params.extend(fields);

        Ok(Self {
            method,
            profile,
            attribute,
            params,
            package: None,
        })
    }

    /// String value of a parameter. Numbers and booleans are not coerced.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// The `serviceId` parameter, empty when absent.
    #[must_use]
    pub fn service_id(&self) -> &str {
        self.param(param::SERVICE_ID).unwrap_or_default()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.param(param::ACCESS_TOKEN).filter(|t| !t.is_empty())
    }

    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.param(param::NONCE).filter(|n| !n.is_empty())
    }
}

/// Outbound envelope returned to a web app or pushed over WebSocket.
///
/// `result` is 0 on success; on failure it equals the HTTP status and the
/// `error*` fields are filled in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub result: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub version: String,
    /// Additional fields a plugin attached to its answer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn error(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            result: status,
            error_code: Some(status),
            error_text: Some(kind.as_str().to_string()),
            error_message: Some(message.into()),
            status_code: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == 0
    }

    /// HTTP status for this reply.
    #[must_use]
    pub fn status(&self) -> u16 {
        if self.is_success() { 200 } else { self.result }
    }
}

/// Envelope exchanged with a plugin over its message channel.
///
/// Requests flow router to plugin; responses and events flow back with
/// `action` set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// App id of the gateway, stamped on every plugin-bound message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Plugin-level token (never the app's token).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub result: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginMessage {
    #[must_use]
    pub fn request(profile: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            attribute: attribute.into(),
            ..Self::default()
        }
    }

    /// Successful answer to `request`, carrying its correlation fields.
    #[must_use]
    pub fn response_to(request: &Self) -> Self {
        Self {
            request_code: request.request_code.clone(),
            action: Some(Action::Response),
            profile: request.profile.clone(),
            attribute: request.attribute.clone(),
            method: request.method,
            service_id: request.service_id.clone(),
            ..Self::default()
        }
    }

    /// Failed answer to `request`.
    #[must_use]
    pub fn error_to(request: &Self, status: u16, message: impl Into<String>) -> Self {
        Self {
            result: i64::from(status),
            error_code: Some(i64::from(status)),
            error_message: Some(message.into()),
            ..Self::response_to(request)
        }
    }

    /// Unsolicited push derived from an earlier request.
    ///
    /// The plugin token is kept so the gateway can find the owning app.
    #[must_use]
    pub fn event_from(request: &Self, data: Value) -> Self {
        Self {
            action: Some(Action::Event),
            access_token: request.access_token.clone(),
            data: Some(data),
            ..Self::response_to(request)
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}
