//! Store Registration
//!
//! The coordinator authenticates end users itself; the store only announces
//! which login providers its application accepts. That announcement rides in
//! the registration frame sent right after every connect:
//!
//! ```json
//! { "appSecret": "...", "storeId": "<uuid>", "authInfo": { "anonymous": true, ... } }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Google sign-in settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAuth {
    /// OAuth client id.
    pub client_id: String,
}

/// Email magic-link settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAuth {
    /// API key of the mail provider.
    pub secret_api_key: String,
}

/// Login providers enabled for this application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProviders {
    /// Guests without an account.
    #[serde(default)]
    pub anonymous: bool,
    /// Nickname-only login.
    #[serde(default)]
    pub nickname: bool,
    /// Google sign-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleAuth>,
    /// Email login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailAuth>,
}

impl AuthProviders {
    /// Read provider settings through a variable lookup.
    ///
    /// With nothing configured, anonymous login is enabled so a bare
    /// deployment is usable.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| var(name).map(|v| v == "true" || v == "1");

        let google = var("AUTH_GOOGLE_CLIENT_ID").map(|client_id| GoogleAuth { client_id });
        let email = var("AUTH_EMAIL_SECRET_API_KEY").map(|secret_api_key| EmailAuth { secret_api_key });
        let nickname = flag("AUTH_NICKNAME").unwrap_or(false);
        let anonymous = flag("AUTH_ANONYMOUS")
            .unwrap_or(!nickname && google.is_none() && email.is_none());

        Self {
            anonymous,
            nickname,
            google,
            email,
        }
    }

    /// Read provider settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Whether any provider is enabled.
    pub fn is_configured(&self) -> bool {
        self.anonymous || self.nickname || self.google.is_some() || self.email.is_some()
    }
}

/// First frame sent on every connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Shared secret identifying the application.
    pub app_secret: String,
    /// This store process.
    pub store_id: Uuid,
    /// Enabled login providers.
    pub auth_info: AuthProviders,
}

impl Registration {
    /// Serialize to the JSON frame payload.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
