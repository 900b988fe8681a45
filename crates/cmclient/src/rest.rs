//
// rest.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! REST operations against the notebook server's kernel endpoints.

use cmshared::models::{KernelModel, KernelSpecModel, KernelSpecs};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode};

use crate::error::CmError;

/// Characters escaped in URL path segments and query values: everything but
/// unreserved characters.
const URL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a path segment or query value containing user data.
pub(crate) fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, URL_SEGMENT).to_string()
}

/// Connection settings for a notebook server.
///
/// The websocket URL is derived from the base URL when not supplied. The
/// embedded HTTP client is shared by every operation made with these
/// settings.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// Base URL for REST requests, e.g. `http://localhost:8888`
    pub base_url: String,

    /// Base URL for websocket connections, e.g. `ws://localhost:8888`
    pub ws_url: String,

    /// Authorization token, sent as an `Authorization: token <t>` header
    pub token: Option<String>,

    client: reqwest::Client,
}

/// Per-call overrides, merged over a manager's cached defaults.
#[derive(Clone, Debug, Default)]
pub struct SettingsOverrides {
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub token: Option<String>,
}

impl ServerSettings {
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let ws_url = derive_ws_url(&base_url);
        ServerSettings {
            base_url,
            ws_url,
            token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Produce settings with the given overrides merged over these defaults.
    pub fn with_overrides(&self, overrides: &SettingsOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(base_url) = &overrides.base_url {
            merged.base_url = base_url.trim_end_matches('/').to_string();
            merged.ws_url = derive_ws_url(&merged.base_url);
        }
        if let Some(ws_url) = &overrides.ws_url {
            merged.ws_url = ws_url.trim_end_matches('/').to_string();
        }
        if let Some(token) = &overrides.token {
            merged.token = Some(token.clone());
        }
        merged
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// The websocket URL for a kernel's channels endpoint.
    pub(crate) fn channels_url(&self, kernel_id: &str, client_id: &str) -> String {
        format!(
            "{}/api/kernels/{}/channels?session_id={}",
            self.ws_url,
            encode(kernel_id),
            encode(client_id)
        )
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("token {}", token));
        }
        builder
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings::new("http://localhost:8888")
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

async fn send_expecting(
    settings: &ServerSettings,
    method: Method,
    url: String,
    body: Option<serde_json::Value>,
    expected: StatusCode,
) -> Result<reqwest::Response, CmError> {
    let mut builder = settings.request(method, &url);
    if let Some(body) = body {
        builder = builder.json(&body);
    }
    let response = builder
        .send()
        .await
        .map_err(|e| CmError::Network(anyhow::anyhow!(e)))?;
    if response.status() != expected {
        return Err(CmError::BadStatus {
            url,
            expected: expected.as_u16(),
            actual: response.status().as_u16(),
        });
    }
    Ok(response)
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, CmError> {
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| CmError::InvalidResponse(format!("response body is not JSON: {}", e)))
}

fn parse_kernel_model(value: serde_json::Value) -> Result<KernelModel, CmError> {
    serde_json::from_value::<KernelModel>(value)
        .map_err(|e| CmError::InvalidResponse(format!("invalid kernel model: {}", e)))
}

/// List the kernels running on the server.
pub async fn list_kernels(settings: &ServerSettings) -> Result<Vec<KernelModel>, CmError> {
    let response = send_expecting(
        settings,
        Method::GET,
        settings.api_url("api/kernels"),
        None,
        StatusCode::OK,
    )
    .await?;
    let body = read_json(response).await?;
    serde_json::from_value::<Vec<KernelModel>>(body)
        .map_err(|e| CmError::InvalidResponse(format!("invalid kernel list: {}", e)))
}

/// Start a new kernel from the named spec.
pub async fn start_kernel(
    settings: &ServerSettings,
    name: &str,
) -> Result<KernelModel, CmError> {
    let response = send_expecting(
        settings,
        Method::POST,
        settings.api_url("api/kernels"),
        Some(serde_json::json!({ "name": name })),
        StatusCode::CREATED,
    )
    .await?;
    parse_kernel_model(read_json(response).await?)
}

/// Fetch the model for a single kernel. A missing kernel is an error.
pub async fn get_kernel(settings: &ServerSettings, id: &str) -> Result<KernelModel, CmError> {
    let url = settings.api_url(&format!("api/kernels/{}", encode(id)));
    let response = settings
        .request(Method::GET, &url)
        .send()
        .await
        .map_err(|e| CmError::Network(anyhow::anyhow!(e)))?;
    match response.status() {
        StatusCode::OK => parse_kernel_model(read_json(response).await?),
        StatusCode::NOT_FOUND => Err(CmError::NoSuchKernel(id.to_string())),
        actual => Err(CmError::BadStatus {
            url,
            expected: StatusCode::OK.as_u16(),
            actual: actual.as_u16(),
        }),
    }
}

/// Interrupt a running kernel.
pub async fn interrupt_kernel(settings: &ServerSettings, id: &str) -> Result<(), CmError> {
    send_expecting(
        settings,
        Method::POST,
        settings.api_url(&format!("api/kernels/{}/interrupt", encode(id))),
        None,
        StatusCode::NO_CONTENT,
    )
    .await?;
    Ok(())
}

/// Restart a kernel. The server answers with the (unchanged) kernel model.
pub async fn restart_kernel(settings: &ServerSettings, id: &str) -> Result<KernelModel, CmError> {
    let response = send_expecting(
        settings,
        Method::POST,
        settings.api_url(&format!("api/kernels/{}/restart", encode(id))),
        None,
        StatusCode::OK,
    )
    .await?;
    parse_kernel_model(read_json(response).await?)
}

/// Shut down a kernel.
pub async fn shutdown_kernel(settings: &ServerSettings, id: &str) -> Result<(), CmError> {
    send_expecting(
        settings,
        Method::DELETE,
        settings.api_url(&format!("api/kernels/{}", encode(id))),
        None,
        StatusCode::NO_CONTENT,
    )
    .await?;
    Ok(())
}

/// Fetch the server's kernel spec collection.
pub async fn get_kernel_specs(settings: &ServerSettings) -> Result<KernelSpecs, CmError> {
    let response = send_expecting(
        settings,
        Method::GET,
        settings.api_url("api/kernelspecs"),
        None,
        StatusCode::OK,
    )
    .await?;
    validate_kernel_specs(read_json(response).await?)
}

/// Fetch a single kernel spec by name.
pub async fn get_kernel_spec(
    settings: &ServerSettings,
    name: &str,
) -> Result<KernelSpecModel, CmError> {
    let url = settings.api_url(&format!("api/kernelspecs/{}", encode(name)));
    let response = settings
        .request(Method::GET, &url)
        .send()
        .await
        .map_err(|e| CmError::Network(anyhow::anyhow!(e)))?;
    match response.status() {
        StatusCode::OK => {
            let body = read_json(response).await?;
            serde_json::from_value::<KernelSpecModel>(body)
                .map_err(|e| CmError::InvalidResponse(format!("invalid kernel spec: {}", e)))
        }
        StatusCode::NOT_FOUND => Err(CmError::NoSuchKernel(name.to_string())),
        actual => Err(CmError::BadStatus {
            url,
            expected: StatusCode::OK.as_u16(),
            actual: actual.as_u16(),
        }),
    }
}

/// Validate a raw kernelspecs payload.
///
/// Entries that fail schema validation are dropped with a warning. A payload
/// with no valid entries is an error. A missing `default`, or one that names
/// an absent spec, falls back to the first valid spec name.
pub(crate) fn validate_kernel_specs(raw: serde_json::Value) -> Result<KernelSpecs, CmError> {
    let specs_raw = raw
        .get("kernelspecs")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            CmError::InvalidResponse("kernelspecs payload has no spec collection".to_string())
        })?;

    let mut kernelspecs = std::collections::BTreeMap::new();
    for (name, value) in specs_raw {
        match serde_json::from_value::<KernelSpecModel>(value.clone()) {
            Ok(model) => {
                kernelspecs.insert(name.clone(), model);
            }
            Err(e) => {
                log::warn!("Removing invalid kernel spec '{}': {}", name, e);
            }
        }
    }

    if kernelspecs.is_empty() {
        return Err(CmError::InvalidResponse(
            "kernelspecs payload has no valid specs".to_string(),
        ));
    }

    let declared = raw.get("default").and_then(|v| v.as_str());
    let default = match declared {
        Some(name) if kernelspecs.contains_key(name) => name.to_string(),
        _ => {
            let first = kernelspecs.keys().next().unwrap().clone();
            log::warn!(
                "Default kernel spec {:?} not present; falling back to '{}'",
                declared,
                first
            );
            first
        }
    };

    Ok(KernelSpecs {
        default,
        kernelspecs,
    })
}
