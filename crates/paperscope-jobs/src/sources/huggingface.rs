//! Hugging Face trending papers connector.
//!
//! Two modes share one normalizer:
//! - `Api`: `GET <endpoint>?limit=N` returning the daily papers JSON list.
//! - `Page`: the trending HTML page, whose paper list is embedded as
//!   HTML-escaped JSON in the `data-props` attribute of the `DailyPapers`
//!   element.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use paperscope_core::{Discovery, Error, Result};

use super::payload::{entry_list, normalize_entries};
use super::SourceConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuggingFaceMode {
    Api,
    Page,
}

pub struct HuggingFaceConnector {
    source_id: String,
    mode: HuggingFaceMode,
    endpoint: String,
    limit: usize,
    client: reqwest::Client,
}

impl HuggingFaceConnector {
    pub fn new(
        source_id: &str,
        mode: HuggingFaceMode,
        endpoint: &str,
        limit: usize,
        client: reqwest::Client,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            mode,
            endpoint: endpoint.to_string(),
            limit,
            client,
        }
    }

    async fn get(&self) -> Result<reqwest::Response> {
        let mut request = self.client.get(&self.endpoint);
        if self.mode == HuggingFaceMode::Api {
            request = request.query(&[("limit", self.limit)]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(
                status.as_u16(),
                format!("GET {}", self.endpoint),
            ));
        }
        Ok(response)
    }
}

fn daily_papers_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<[a-zA-Z]+\s[^>]*data-target="DailyPapers"[^>]*>"#).expect("static regex is valid")
    })
}

fn data_props_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data-props="([^"]*)""#).expect("static regex is valid"))
}

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("static regex is valid"))
}

/// Decode HTML character references in one pass.
pub fn html_unescape(s: &str) -> String {
    entity_regex()
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match name {
                    "quot" => Some('"'),
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "apos" => Some('\''),
                    "nbsp" => Some('\u{a0}'),
                    _ => None,
                }
            };
            decoded.map(String::from).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Pull the embedded paper payloads out of the trending page.
pub fn extract_page_payloads(html: &str) -> Vec<Value> {
    daily_papers_tag_regex()
        .find_iter(html)
        .filter_map(|tag| data_props_regex().captures(tag.as_str()))
        .filter_map(|caps| serde_json::from_str::<Value>(&html_unescape(&caps[1])).ok())
        .collect()
}

#[async_trait]
impl SourceConnector for HuggingFaceConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    #[instrument(skip(self), fields(subsystem = "jobs", component = "huggingface", op = "discover", source_id = %self.source_id, mode = ?self.mode))]
    async fn discover(&self) -> Result<Discovery> {
        let response = self.get().await?;
        match self.mode {
            HuggingFaceMode::Api => {
                let payload: Value = response
                    .json()
                    .await
                    .map_err(|e| Error::PermanentInput(format!("daily papers payload: {e}")))?;
                let entries = entry_list(&payload).ok_or_else(|| {
                    Error::PermanentInput("daily papers payload has no entry list".into())
                })?;
                Ok(normalize_entries(&self.source_id, entries, self.limit))
            }
            HuggingFaceMode::Page => {
                let html = response.text().await?;
                let payloads = extract_page_payloads(&html);
                if payloads.is_empty() {
                    return Err(Error::PermanentInput(
                        "trending page has no DailyPapers payload".into(),
                    ));
                }
                let entries: Vec<Value> = payloads
                    .iter()
                    .filter_map(entry_list)
                    .flatten()
                    .cloned()
                    .collect();
                debug!(entries = entries.len(), "Extracted page payload");
                Ok(normalize_entries(&self.source_id, &entries, self.limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> reqwest::Client {
        crate::build_http_client().unwrap()
    }

    #[test]
    fn test_html_unescape() {
        assert_eq!(html_unescape("{&quot;a&quot;:&#39;x&#x27;}"), "{\"a\":'x'}");
        assert_eq!(html_unescape("&amp;quot;"), "&quot;");
        assert_eq!(html_unescape("&bogus; &lt;"), "&bogus; <");
    }

    #[test]
    fn test_extract_page_payloads() {
        let props = html_unescape_inverse(&json!({"dailyPapers": [{"paper": {"id": "2401.1", "title": "T"}}]}).to_string());
        let html = format!(
            "<html><main><div class=\"x\" data-target=\"DailyPapers\" data-props=\"{props}\"></div></main></html>"
        );
        let payloads = extract_page_payloads(&html);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["dailyPapers"][0]["paper"]["id"], "2401.1");
    }

    fn html_unescape_inverse(s: &str) -> String {
        s.replace('&', "&amp;").replace('"', "&quot;")
    }

    #[tokio::test]
    async fn test_api_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/daily_papers"))
            .and(query_param("limit", "2"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"paper": {"id": "2401.00001", "title": "One", "authors": [{"name": "A. Smith"}]}},
                {"paper": {"title": "missing id"}},
                {"paper": {"id": "2401.00002", "title": "Two"}},
                {"paper": {"id": "2401.00003", "title": "Three"}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let connector = HuggingFaceConnector::new(
            "huggingface",
            HuggingFaceMode::Api,
            &format!("{}/api/daily_papers", server.uri()),
            2,
            client(),
        );
        let discovery = connector.discover().await.unwrap();
        assert_eq!(discovery.candidates.len(), 2);
        assert_eq!(discovery.skipped, 1);
        assert_eq!(discovery.candidates[0].paper_key(), "huggingface:2401.00001");
    }

    #[tokio::test]
    async fn test_page_discovery() {
        let server = MockServer::start().await;
        let props = html_unescape_inverse(
            &json!({"dailyPapers": [
                {"paper": {"id": "2401.5", "title": "Five", "arxivUrl": "https://arxiv.org/abs/2401.5"}}
            ]})
            .to_string(),
        );
        Mock::given(method("GET"))
            .and(path("/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<div data-target=\"DailyPapers\" data-props=\"{props}\"></div>"
            )))
            .mount(&server)
            .await;

        let connector = HuggingFaceConnector::new(
            "hf-page",
            HuggingFaceMode::Page,
            &format!("{}/papers", server.uri()),
            10,
            client(),
        );
        let discovery = connector.discover().await.unwrap();
        assert_eq!(discovery.candidates.len(), 1);
        assert_eq!(discovery.candidates[0].document_url, "https://arxiv.org/pdf/2401.5.pdf");
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let connector = HuggingFaceConnector::new("hf", HuggingFaceMode::Api, &server.uri(), 5, client());
        assert!(connector.discover().await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let connector = HuggingFaceConnector::new("hf", HuggingFaceMode::Api, &server.uri(), 5, client());
        let err = connector.discover().await.unwrap_err();
        assert!(matches!(err, Error::PermanentInput(_)));
    }
}
