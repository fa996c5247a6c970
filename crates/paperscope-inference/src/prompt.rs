//! Prompt construction for structured enrichment.

use paperscope_core::{ArtifactRef, CandidateRecord};

use crate::provider::{Capability, PromptRequest};

/// Everything the gateway knows about a paper when enriching it.
#[derive(Debug, Clone, Copy)]
pub struct EnrichmentInput<'a> {
    pub candidate: &'a CandidateRecord,
    pub artifact: &'a ArtifactRef,
    /// Text extracted from the stored document, if any.
    pub excerpt: Option<&'a str>,
}

pub const SYSTEM_PROMPT: &str = "You are a meticulous research analyst. You read machine learning \
papers and return strictly valid JSON describing them. Never invent facts that are not supported \
by the metadata or excerpt; leave a list empty instead.";

/// Compose the prompt, asking only for the fields the capability set covers.
pub fn build_prompt(input: &EnrichmentInput<'_>, capabilities: &[Capability]) -> PromptRequest {
    let c = input.candidate;

    let mut metadata = vec![
        format!("Title: {}", c.title),
        format!("Source: {}", c.source_id),
        format!("External ID: {}", c.external_id),
    ];
    if !c.authors.is_empty() {
        metadata.push(format!("Authors: {}", c.authors.join(", ")));
    }
    if let Some(published) = c.published_at {
        metadata.push(format!("Published at: {}", published.to_rfc3339()));
    }
    if !c.categories.is_empty() {
        metadata.push(format!("Categories: {}", c.categories.join(", ")));
    }

    let abstract_text = if c.abstract_text.trim().is_empty() {
        "Not provided"
    } else {
        c.abstract_text.trim()
    };

    let mut sections = vec![
        format!("Paper metadata:\n{}", metadata.join("\n")),
        format!("Abstract:\n{abstract_text}"),
    ];
    if let Some(excerpt) = input.excerpt.map(str::trim).filter(|e| !e.is_empty()) {
        sections.push(format!("PDF excerpt (trimmed):\n{excerpt}"));
    }

    let mut fields = Vec::new();
    if capabilities.contains(&Capability::Summarize) {
        fields.push("\"summary\": string (4-6 sentences covering problem, method, results)");
        fields.push("\"key_points\": string[] (3-6 short findings)");
        fields.push("\"tags\": string[] (up to 8 lowercase topic tags)");
        fields.push("\"chapters\": {\"title\": string, \"explanation\": string, \"related_concepts\": string[]}[] (one entry per major section, in paper order)");
    }
    if capabilities.contains(&Capability::ExtractEntities) {
        fields.push("\"key_concepts\": string[] (techniques, tasks, and ideas central to the paper)");
        fields.push("\"entities\": {\"name\": string, \"type\": \"model\" | \"dataset\" | \"method\" | \"metric\" | \"organization\"}[]");
    }
    if capabilities.contains(&Capability::ExtractRelations) {
        fields.push("\"relation_triples\": {\"subject\": string, \"predicate\": string, \"object\": string}[] (subjects and objects should reuse names from key_concepts or entities, or be arXiv ids of cited papers)");
    }

    sections.push(format!(
        "Return a single JSON object with these fields:\n{}",
        fields
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    ));

    PromptRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt: sections.join("\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn fixtures() -> (CandidateRecord, ArtifactRef) {
        let candidate = CandidateRecord {
            source_id: "huggingface".into(),
            external_id: "2401.00001".into(),
            title: "Scaling Sparse Experts".into(),
            authors: vec!["A. Smith".into(), "B. Jones".into()],
            abstract_text: String::new(),
            categories: vec!["moe".into()],
            document_url: "https://arxiv.org/pdf/2401.00001.pdf".into(),
            published_at: None,
            discovered_at: Utc::now(),
        };
        let artifact = ArtifactRef {
            paper_key: candidate.paper_key(),
            storage_path: PathBuf::from("/tmp/document.pdf"),
            checksum: "blake3:00".into(),
            byte_size: 1,
            document_url: candidate.document_url.clone(),
            fetched_at: Utc::now(),
            fetch_attempts: 1,
        };
        (candidate, artifact)
    }

    #[test]
    fn test_prompt_contains_metadata_and_excerpt() {
        let (candidate, artifact) = fixtures();
        let input = EnrichmentInput {
            candidate: &candidate,
            artifact: &artifact,
            excerpt: Some("  Section 1. Introduction  "),
        };
        let req = build_prompt(&input, &Capability::ALL);
        assert!(req.prompt.contains("Title: Scaling Sparse Experts"));
        assert!(req.prompt.contains("Authors: A. Smith, B. Jones"));
        assert!(req.prompt.contains("Abstract:\nNot provided"));
        assert!(req.prompt.contains("PDF excerpt (trimmed):\nSection 1. Introduction"));
        assert!(req.prompt.contains("relation_triples"));
        assert!(!req.system.is_empty());
    }

    #[test]
    fn test_prompt_limited_to_capabilities() {
        let (candidate, artifact) = fixtures();
        let input = EnrichmentInput {
            candidate: &candidate,
            artifact: &artifact,
            excerpt: None,
        };
        let req = build_prompt(&input, &[Capability::Summarize]);
        assert!(req.prompt.contains("\"summary\""));
        assert!(req.prompt.contains("\"chapters\""));
        assert!(!req.prompt.contains("relation_triples"));
        assert!(!req.prompt.contains("PDF excerpt"));
    }
}
