use serde::Deserialize;

/// Project URL and anon key shared by the REST, auth and realtime clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
        }
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    pub fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.url, endpoint)
    }

    /// Realtime websocket endpoint; `http(s)` becomes `ws(s)`.
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!(
            "{base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Human-readable message and optional error code from a Supabase error body.
///
/// PostgREST uses `{code, message}`, GoTrue uses `{msg}` or
/// `{error, error_description}`.
pub(crate) fn describe_error(body: &str) -> (String, Option<String>) {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.code.map(|c| match c {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .or_else(|| parsed.error.and_then(|e| e.as_str().map(str::to_string)))
        .unwrap_or_else(|| body.trim().to_string());
    (message, code)
}
