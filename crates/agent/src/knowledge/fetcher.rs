use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch of `{url}` failed: {message}")]
    Transport { url: String, message: String },
    #[error("fetch of `{url}` returned {status}")]
    Status { url: String, status: u16 },
}

/// Retrieves the readable text behind a knowledge-source URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

pub struct HttpDocumentFetcher {
    client: reqwest::Client,
}

impl HttpDocumentFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|error| {
            FetchError::Transport { url: String::new(), message: error.to_string() }
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let transport = |error: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: error.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
        }

        let is_markup = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("html") || value.contains("xml"))
            .unwrap_or(false);
        let body = response.text().await.map_err(transport)?;

        Ok(if is_markup || looks_like_markup(&body) { strip_markup(&body) } else { body })
    }
}

fn looks_like_markup(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with('<') && head.contains('>')
}

/// Drops tags, `script`/`style` bodies, and comments; decodes the common
/// entities and collapses whitespace.
pub fn strip_markup(markup: &str) -> String {
    let lower = markup.to_ascii_lowercase();
    let mut text = String::with_capacity(markup.len());
    let mut index = 0;

    while index < markup.len() {
        let rest = &markup[index..];
        let lower_rest = &lower[index..];

        if lower_rest.starts_with("<!--") {
            index += lower_rest.find("-->").map(|end| end + 3).unwrap_or(rest.len());
            continue;
        }
        if let Some(skipped) = skip_element(lower_rest, "script").or_else(|| skip_element(lower_rest, "style")) {
            index += skipped;
            text.push(' ');
            continue;
        }
        if rest.starts_with('<') {
            index += rest.find('>').map(|end| end + 1).unwrap_or(rest.len());
            text.push(' ');
            continue;
        }

        let next = rest.find('<').unwrap_or(rest.len());
        text.push_str(&rest[..next]);
        index += next;
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn skip_element(lower_rest: &str, name: &str) -> Option<usize> {
    let open = format!("<{name}");
    if !lower_rest.starts_with(&open) {
        return None;
    }
    let close = format!("</{name}>");
    Some(
        lower_rest
            .find(&close)
            .map(|end| end + close.len())
            .unwrap_or(lower_rest.len()),
    )
}
