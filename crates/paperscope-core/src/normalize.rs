//! Natural-key normalization shared by storage, checkpoints, and the graph.

use std::sync::OnceLock;

use regex::Regex;

/// `source:external_id`, the identity of a paper everywhere in the pipeline.
pub fn paper_key(source_id: &str, external_id: &str) -> String {
    format!("{}:{}", source_id.trim(), external_id.trim())
}

/// Normalize an author name so spelling variants merge into one node.
///
/// Lowercases, drops punctuation other than hyphens and apostrophes, and
/// collapses whitespace: `"A. Smith"`, `"a smith"` and `" A.  SMITH "` all
/// become `"a smith"`.
pub fn normalize_author(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '\'' {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a concept label into a slug: lowercase, runs of
/// non-alphanumerics become `-`, trimmed of leading/trailing dashes.
pub fn normalize_concept(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut pending_dash = false;
    for c in label.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Normalize a relation predicate: lowercase words joined by `_`, `related` when empty.
pub fn normalize_predicate(predicate: &str) -> String {
    let slug = normalize_concept(predicate).replace('-', "_");
    if slug.is_empty() {
        crate::defaults::DEFAULT_RELATION.to_string()
    } else {
        slug
    }
}

fn arxiv_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:arxiv:)?(\d{4}\.\d{4,5})(?:v\d+)?$").expect("static regex is valid")
    })
}

/// Extract a bare arXiv identifier (`2401.01234`) from a label, if it is one.
pub fn arxiv_id(label: &str) -> Option<String> {
    let label = label.trim().to_lowercase();
    arxiv_id_regex()
        .captures(&label)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Make an identifier safe to use as a single path segment.
pub fn storage_segment(raw: &str) -> String {
    let segment: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let segment = segment.trim_matches('.').to_string();
    if segment.is_empty() {
        "unknown".to_string()
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_variants_merge() {
        assert_eq!(normalize_author("A. Smith"), "a smith");
        assert_eq!(normalize_author(" A.  SMITH "), "a smith");
        assert_eq!(normalize_author("a smith"), "a smith");
        assert_eq!(normalize_author("Jean-Luc O'Neil"), "jean-luc o'neil");
    }

    #[test]
    fn test_concept_slug() {
        assert_eq!(
            normalize_concept("Graph Neural Networks"),
            "graph-neural-networks"
        );
        assert_eq!(normalize_concept("  (LoRA) fine-tuning!"), "lora-fine-tuning");
        assert_eq!(normalize_concept("!!!"), "");
    }

    #[test]
    fn test_predicate_normalization() {
        assert_eq!(normalize_predicate("Builds On"), "builds_on");
        assert_eq!(normalize_predicate(""), "related");
    }

    #[test]
    fn test_arxiv_id_detection() {
        assert_eq!(arxiv_id("2401.01234"), Some("2401.01234".to_string()));
        assert_eq!(arxiv_id("arXiv:2401.01234v2"), Some("2401.01234".to_string()));
        assert_eq!(arxiv_id("transformers"), None);
    }

    #[test]
    fn test_storage_segment() {
        assert_eq!(storage_segment("hep-th/9901001"), "hep-th-9901001");
        assert_eq!(storage_segment("2401.01234"), "2401.01234");
        assert_eq!(storage_segment(".."), "unknown");
        assert_eq!(storage_segment(""), "unknown");
    }

    #[test]
    fn test_paper_key() {
        assert_eq!(paper_key("hf", " 2401.01234 "), "hf:2401.01234");
    }
}
