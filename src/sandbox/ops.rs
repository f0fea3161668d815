//! Host functions reachable from inside the sandbox.
//!
//! These ops are the whole bridge between a snippet and the host. The
//! bootstrap script captures them in closures and then removes the engine
//! namespace, so a snippet can only reach them through the console, `now()`
//! and (when granted) `fetch` accessors it installs.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use deno_core::{op2, OpState};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::output::{OutputBuffer, Stream};

deno_core::extension!(
    codelet_ext,
    ops = [
        op_codelet_log,
        op_codelet_final,
        op_codelet_reject,
        op_codelet_now,
        op_codelet_fetch,
    ],
);

/// Set when the snippet's final value was a promise that rejected.
#[derive(Debug, Clone)]
pub struct FinalRejection(pub String);

#[op2(fast)]
pub fn op_codelet_log(state: &mut OpState, is_error: bool, #[string] payload: String) {
    let stream = if is_error { Stream::Error } else { Stream::Result };
    if let Some(buffer) = state.try_borrow_mut::<OutputBuffer>() {
        buffer.push_log(stream, &payload);
    }
}

#[op2(fast)]
pub fn op_codelet_final(state: &mut OpState, #[string] payload: String) {
    if let Some(buffer) = state.try_borrow_mut::<OutputBuffer>() {
        buffer.push_final(&payload);
    }
}

#[op2(fast)]
pub fn op_codelet_reject(state: &mut OpState, #[string] message: String) {
    state.put(FinalRejection(message));
}

/// The one clock a snippet gets: milliseconds since the Unix epoch.
#[op2(fast)]
pub fn op_codelet_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

#[op2(async)]
#[string]
pub async fn op_codelet_fetch(state: Rc<RefCell<OpState>>, #[string] request: String) -> String {
    let gate = state.borrow().try_borrow::<NetworkGate>().cloned();

    let reply = match gate {
        Some(gate) => gate.fetch(&request).await,
        None => Err("network access is not permitted by policy".to_string()),
    };

    match reply {
        Ok(reply) => serde_json::to_string(&reply)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string()),
        Err(message) => {
            debug!(error = %message, "Sandbox fetch failed");
            serde_json::json!({ "error": message }).to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchReply {
    ok: bool,
    status: u16,
    status_text: String,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Outbound HTTP for snippets, present in op state only when the policy
/// grants the network capability.
#[derive(Debug, Clone)]
pub struct NetworkGate {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl NetworkGate {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            max_body_bytes,
        })
    }

    async fn fetch(&self, raw: &str) -> Result<FetchReply, String> {
        let request: FetchRequest =
            serde_json::from_str(raw).map_err(|e| format!("invalid fetch request: {}", e))?;

        let url = Url::parse(&request.url).map_err(|e| format!("invalid URL: {}", e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported URL scheme: {}", url.scheme()));
        }
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid method: {}", request.method))?;

        debug!(method = %method, url = %url, "Sandbox fetch");

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| e.to_string())?;

        if let Some(length) = response.content_length() {
            if length > self.max_body_bytes as u64 {
                return Err(format!(
                    "response body of {} bytes exceeds the {} byte limit",
                    length, self.max_body_bytes
                ));
            }
        }

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(format!(
                    "response body exceeds the {} byte limit",
                    self.max_body_bytes
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchReply {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: final_url,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
