//! Client for the remote's JSON status endpoint.

use {reqwest::header::ACCEPT, reqwest::StatusCode, thiserror::Error};

/// Caller overrides merged over the default status request: query a different
/// host or port, replace the path, or add request headers.
#[derive(Debug, Clone, Default)]
pub struct ProxyInfoOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// The error returned when the status endpoint cannot be queried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatusError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{message}")]
    Endpoint { message: String },
    #[error("failed to parse status response: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Issue `GET https://<remote>/<tunnel-id>` and return the parsed JSON body.
///
/// The same self-signed certificate trust applies here as on the tunnel
/// connections themselves, so certificate verification is disabled. On a
/// non-200 response the returned error carries the body's `message` field when
/// the body parses as JSON, and the parse error otherwise.
pub async fn query_proxy_info(
    remote_address: &str,
    tunnel_id: &str,
    options: ProxyInfoOptions,
) -> Result<serde_json::Value, StatusError> {
    let host = options.host.as_deref().unwrap_or(remote_address);
    let path = match &options.path {
        Some(path) => path.clone(),
        None => format!("/{}", tunnel_id),
    };
    let url = match options.port {
        Some(port) => format!("https://{}:{}{}", host, port, path),
        None => format!("https://{}{}", host, path),
    };

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let mut request = client.get(&url).header(ACCEPT, "application/json");
    for (name, value) in &options.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if status == StatusCode::OK {
        return serde_json::from_str(&body).map_err(StatusError::Parse);
    }

    let message = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(body) => body
            .get("message")
            .and_then(|message| message.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("status endpoint returned {}", status)),
        Err(error) => return Err(StatusError::Parse(error)),
    };
    Err(StatusError::Endpoint { message })
}
