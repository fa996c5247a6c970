//! Normalization of Hugging Face-style paper payloads.
//!
//! The daily papers API, the trending page props and curated lists all use
//! variations of the same JSON shape. Entries may wrap the paper in a
//! `paper` object; identifiers, PDF links and dates come under several names.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;

use paperscope_core::{defaults, CandidateRecord, Discovery};

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn first_text(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k).and_then(text))
}

/// Accepts RFC 3339 timestamps and `Mon DD, YYYY` dates.
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%b %d, %Y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Derive the PDF link from an arXiv URL, falling back to the canonical one.
pub fn resolve_pdf_url(arxiv_url: Option<&str>, external_id: &str) -> String {
    if let Some(url) = arxiv_url.map(str::trim).filter(|u| !u.is_empty()) {
        if url.contains("/pdf/") {
            return if url.ends_with(".pdf") {
                url.to_string()
            } else {
                format!("{url}.pdf")
            };
        }
        if url.contains("/abs/") {
            return format!("{}.pdf", url.replace("/abs/", "/pdf/"));
        }
    }
    format!("{}/{external_id}.pdf", defaults::ARXIV_PDF_BASE)
}

fn authors(paper: &Value) -> Vec<String> {
    let Some(Value::Array(items)) = paper.get("authors") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|a| match a {
            Value::Object(_) => first_text(a, &["name", "fullname", "fullName"]),
            other => text(other),
        })
        .collect()
}

fn categories(paper: &Value) -> Vec<String> {
    let raw = ["ai_keywords", "tags"]
        .iter()
        .find_map(|k| paper.get(*k).filter(|v| !v.is_null()));
    match raw {
        Some(Value::Array(items)) => items.iter().filter_map(text).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Normalize one payload entry. `None` means the entry is unusable.
pub fn parse_entry(source_id: &str, entry: &Value, now: DateTime<Utc>) -> Option<CandidateRecord> {
    let paper = match entry.get("paper") {
        Some(p) if p.is_object() => p,
        _ => entry,
    };
    if !paper.is_object() {
        return None;
    }

    let external_id = first_text(paper, &["id", "paperId", "arxivId", "slug"])?;
    let title = first_text(paper, &["title", "paperTitle"])
        .or_else(|| first_text(entry, &["title"]))
        .unwrap_or_else(|| "Untitled".to_string());

    let arxiv_url = first_text(paper, &["arxivUrl", "arxiv_url"]);
    let document_url = first_text(paper, &["pdfUrl", "pdf_url"])
        .unwrap_or_else(|| resolve_pdf_url(arxiv_url.as_deref(), &external_id));
    if !(document_url.starts_with("http://") || document_url.starts_with("https://")) {
        return None;
    }

    let published_at = first_text(paper, &["publishedAt", "published_at"])
        .or_else(|| first_text(entry, &["publishedAt"]))
        .and_then(|raw| parse_published(&raw));

    Some(CandidateRecord {
        source_id: source_id.to_string(),
        external_id,
        title,
        authors: authors(paper),
        abstract_text: first_text(paper, &["summary", "ai_summary", "abstract"]).unwrap_or_default(),
        categories: categories(paper),
        document_url,
        published_at,
        discovered_at: now,
    })
}

/// Normalize a list of entries, skipping unusable ones and duplicates.
pub fn normalize_entries(source_id: &str, entries: &[Value], limit: usize) -> Discovery {
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut discovery = Discovery::default();

    for entry in entries {
        if discovery.candidates.len() >= limit {
            break;
        }
        match parse_entry(source_id, entry, now) {
            Some(candidate) if seen.insert(candidate.external_id.clone()) => {
                discovery.candidates.push(candidate);
            }
            Some(candidate) => {
                debug!(source_id, external_id = %candidate.external_id, "Skipping duplicate entry");
                discovery.skipped += 1;
            }
            None => {
                debug!(source_id, "Skipping malformed entry");
                discovery.skipped += 1;
            }
        }
    }
    discovery
}

/// Locate the entry list in a payload: a bare array, or an object holding one.
pub fn entry_list(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(obj) => ["dailyPapers", "papers", "items"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use serde_json::json;

    #[test]
    fn test_parses_daily_papers_entry() {
        let entry = json!({
            "paper": {
                "id": "2401.01234",
                "title": "Sparse   Experts\n at Scale",
                "summary": "We study experts.",
                "authors": [{"name": "A. Smith"}, {"fullname": "B. Jones"}, "C. Lee"],
                "publishedAt": "2024-01-03T12:00:00.000Z",
                "ai_keywords": ["moe", "scaling"]
            },
            "title": "ignored"
        });
        let c = parse_entry("huggingface", &entry, Utc::now()).unwrap();
        assert_eq!(c.external_id, "2401.01234");
        assert_eq!(c.title, "Sparse Experts at Scale");
        assert_eq!(c.authors, vec!["A. Smith", "B. Jones", "C. Lee"]);
        assert_eq!(c.categories, vec!["moe", "scaling"]);
        assert_eq!(c.document_url, "https://arxiv.org/pdf/2401.01234.pdf");
        assert_eq!(c.published_at.unwrap().year(), 2024);
    }

    #[test]
    fn test_pdf_url_resolution() {
        assert_eq!(
            resolve_pdf_url(Some("https://arxiv.org/abs/2401.1"), "x"),
            "https://arxiv.org/pdf/2401.1.pdf"
        );
        assert_eq!(
            resolve_pdf_url(Some("https://arxiv.org/pdf/2401.1"), "x"),
            "https://arxiv.org/pdf/2401.1.pdf"
        );
        assert_eq!(resolve_pdf_url(None, "2401.2"), "https://arxiv.org/pdf/2401.2.pdf");
    }

    #[test]
    fn test_explicit_pdf_url_wins() {
        let entry = json!({"id": "x1", "pdfUrl": "https://example.org/x1.pdf", "arxivUrl": "https://arxiv.org/abs/1"});
        let c = parse_entry("s", &entry, Utc::now()).unwrap();
        assert_eq!(c.document_url, "https://example.org/x1.pdf");
        assert_eq!(c.title, "Untitled");
    }

    #[test]
    fn test_published_date_formats() {
        assert_eq!(parse_published("Jan 05, 2024").unwrap().day(), 5);
        assert!(parse_published("2024-01-05T00:00:00+02:00").is_some());
        assert!(parse_published("yesterday").is_none());
    }

    #[test]
    fn test_tags_as_comma_string() {
        let entry = json!({"id": "x", "tags": "llm, agents ,"});
        let c = parse_entry("s", &entry, Utc::now()).unwrap();
        assert_eq!(c.categories, vec!["llm", "agents"]);
    }

    #[test]
    fn test_normalize_skips_malformed_and_duplicates() {
        let entries = vec![
            json!({"id": "a", "title": "A"}),
            json!({"title": "no id"}),
            json!({"id": "a", "title": "A again"}),
            json!("not an object"),
            json!({"id": "b", "title": "B", "pdfUrl": "ftp://nope"}),
            json!({"id": "c", "title": "C"}),
        ];
        let d = normalize_entries("s", &entries, 10);
        let ids: Vec<_> = d.candidates.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(d.skipped, 4);
    }

    #[test]
    fn test_normalize_respects_limit() {
        let entries: Vec<_> = (0..5).map(|i| json!({"id": format!("p{i}")})).collect();
        assert_eq!(normalize_entries("s", &entries, 2).candidates.len(), 2);
    }

    #[test]
    fn test_entry_list_shapes() {
        assert_eq!(entry_list(&json!([1, 2])).unwrap().len(), 2);
        assert_eq!(entry_list(&json!({"dailyPapers": [1]})).unwrap().len(), 1);
        assert!(entry_list(&json!({"other": []})).is_none());
    }
}
