//! Attachment upload pipeline: sign → put → notify, one file at a time.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::Method;
use http::header::{ACCEPT, HeaderName};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::challenges::core::{UpstreamClientError, UpstreamHttpClient, UpstreamRequest, UpstreamResponse};
use crate::transport::FileToUpload;

use super::endpoints::{EndpointError, EndpointKind, Endpoints};

static NEXT_ACTION: HeaderName = HeaderName::from_static("next-action");

static PREFIXED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+:(.+)$").expect("invalid prefixed line regex"));

static UPLOAD_OBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{[^{}]*"uploadUrl"[^{}]*\}"#).expect("invalid upload object regex")
});

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not decode the signed upload response")]
    ResponseUnparseable,
    #[error("upload failed with status {0}")]
    Failed(u16),
    #[error("upload notification response has no retrieval URL")]
    NotifyMalformed,
    #[error("rate limited during upload")]
    RateLimited,
    #[error("file {name} has invalid base64 data: {source}")]
    InvalidData {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error(transparent)]
    Transport(#[from] UpstreamClientError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Which decoding strategy understood the sign response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    PrefixedLine,
    WholeBody,
    EmbeddedObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUpload {
    pub upload_url: String,
    pub key: String,
}

/// Descriptor injected into the chat payload for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

pub struct UploadPipeline {
    client: Arc<dyn UpstreamHttpClient>,
    endpoints: Arc<Endpoints>,
}

impl UploadPipeline {
    pub fn new(client: Arc<dyn UpstreamHttpClient>, endpoints: Arc<Endpoints>) -> Self {
        Self { client, endpoints }
    }

    /// Uploads every file in order, stopping at the first failure.
    pub async fn upload_all(&self, files: &[FileToUpload]) -> Result<Vec<Attachment>, UploadError> {
        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            attachments.push(self.upload(file).await?);
        }
        Ok(attachments)
    }

    pub async fn upload(&self, file: &FileToUpload) -> Result<Attachment, UploadError> {
        let bytes = STANDARD
            .decode(file.data.trim())
            .map_err(|source| UploadError::InvalidData {
                name: file.file_name.clone(),
                source,
            })?;

        let signed = self.sign(file).await?;
        self.put(&signed, &file.content_type, Bytes::from(bytes)).await?;
        let url = self.notify(&signed.key).await?;
        log::debug!("uploaded {} as {}", file.file_name, signed.key);

        Ok(Attachment {
            name: signed.key,
            content_type: file.content_type.clone(),
            url,
        })
    }

    async fn sign(&self, file: &FileToUpload) -> Result<SignedUpload, UploadError> {
        let url = self.endpoints.url(EndpointKind::FileSign).await?;
        let action = self.endpoints.templates().file_sign_action.clone();
        let response = self
            .rpc(url, action.as_deref(), json!([file.file_name, file.content_type]))
            .await?;
        let (signed, strategy) = decode_sign_response(&response.text())?;
        log::debug!("sign response decoded via {strategy:?}");
        Ok(signed)
    }

    async fn put(&self, signed: &SignedUpload, content_type: &str, body: Bytes) -> Result<(), UploadError> {
        let url = Url::parse(&signed.upload_url).map_err(|_| UploadError::ResponseUnparseable)?;
        let request = UpstreamRequest::new(Method::PUT, url).with_body(body, content_type);
        let response = self.client.send(request).await?;
        check_status(&response)
    }

    async fn notify(&self, key: &str) -> Result<String, UploadError> {
        let url = self.endpoints.url(EndpointKind::FileNotify).await?;
        let action = self.endpoints.templates().file_notify_action.clone();
        let response = self.rpc(url, action.as_deref(), json!([key])).await?;
        parse_notify_response(&response.text()).ok_or(UploadError::NotifyMalformed)
    }

    async fn rpc(&self, url: Url, action: Option<&str>, args: Value) -> Result<UpstreamResponse, UploadError> {
        let mut request = UpstreamRequest::post(url)
            .with_json(&args)
            .with_header(ACCEPT, "text/x-component");
        if let Some(action) = action {
            request = request.with_header(NEXT_ACTION.clone(), action);
        }
        let response = self.client.send(request).await?;
        check_status(&response)?;
        Ok(response)
    }
}

fn check_status(response: &UpstreamResponse) -> Result<(), UploadError> {
    match response.status {
        429 => Err(UploadError::RateLimited),
        _ if response.is_success() => Ok(()),
        status => Err(UploadError::Failed(status)),
    }
}

/// Decodes the sign response with the first strategy that yields both an
/// upload URL and a key.
pub fn decode_sign_response(text: &str) -> Result<(SignedUpload, DecodeStrategy), UploadError> {
    for line in text.lines() {
        if let Some(caps) = PREFIXED_LINE_RE.captures(line)
            && let Some(signed) = caps.get(1).and_then(|json| signed_from_json(json.as_str()))
        {
            return Ok((signed, DecodeStrategy::PrefixedLine));
        }
    }

    if let Some(signed) = signed_from_json(text.trim()) {
        return Ok((signed, DecodeStrategy::WholeBody));
    }

    UPLOAD_OBJECT_RE
        .find_iter(text)
        .find_map(|object| signed_from_json(object.as_str()))
        .map(|signed| (signed, DecodeStrategy::EmbeddedObject))
        .ok_or(UploadError::ResponseUnparseable)
}

fn signed_from_json(raw: &str) -> Option<SignedUpload> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let fields = value.get("data").filter(|data| data.is_object()).unwrap_or(&value);
    Some(SignedUpload {
        upload_url: fields.get("uploadUrl")?.as_str()?.to_string(),
        key: fields.get("key")?.as_str()?.to_string(),
    })
}

/// Retrieval URL from the `1:` line of a notify response.
pub fn parse_notify_response(text: &str) -> Option<String> {
    let rest = text.lines().find_map(|line| line.trim_start().strip_prefix("1:"))?.trim();
    match serde_json::from_str::<Value>(rest) {
        Ok(Value::String(url)) => Some(url),
        Ok(value) => value
            .get("url")
            .or_else(|| value.get("data").and_then(|data| data.get("url")))
            .and_then(Value::as_str)
            .map(str::to_string),
        Err(_) if rest.starts_with("http") => Some(rest.trim_matches('"').to_string()),
        Err(_) => None,
    }
}

/// Sets `experimental_attachments` on the first user-authored message.
/// Returns `false` when the payload has no such message.
pub fn inject_attachments(payload: &mut Value, attachments: &[Attachment]) -> bool {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };
    let Some(message) = messages
        .iter_mut()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return false;
    };
    let Some(object) = message.as_object_mut() else {
        return false;
    };
    let encoded = serde_json::to_value(attachments).unwrap_or_else(|_| Value::Array(Vec::new()));
    object.insert("experimental_attachments".into(), encoded);
    true
}
