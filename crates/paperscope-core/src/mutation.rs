//! Translation of enrichment output into a [`GraphMutation`].

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::models::{
    ArtifactRef, CandidateRecord, Chapter, EdgeUpsert, EnrichmentResult, GraphMutation, NodeKey,
    NodeUpsert, RelType,
};
use crate::normalize::{arxiv_id, normalize_author, normalize_concept, normalize_predicate, paper_key};

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Chapters as stored on the Paper node; related concepts carry the
/// normalized key of the Concept node they refer to.
fn chapters_property(chapters: &[Chapter]) -> Value {
    chapters
        .iter()
        .map(|chapter| {
            let related: Vec<Value> = chapter
                .related_concepts
                .iter()
                .map(|c| {
                    json!({
                        "label": c.label,
                        "node_type": c.node_type.as_deref().unwrap_or("Concept"),
                        "concept_key": normalize_concept(&c.label),
                    })
                })
                .collect();
            json!({
                "title": chapter.title,
                "explanation": chapter.explanation,
                "related_concepts": related,
            })
        })
        .collect()
}

/// Build the mutation for one candidate.
///
/// Emits the Paper node, Author nodes (deduplicated by normalized name) with
/// AUTHORED_BY edges, Concept nodes for key concepts and entities with
/// MENTIONS edges, and RELATES_TO edges for relation triples. Triple
/// endpoints that are neither a concept of this mutation nor this paper are
/// marked `require_existing` and resolved against the graph at apply time.
pub fn build_mutation(
    candidate: &CandidateRecord,
    artifact: &ArtifactRef,
    enrichment: &EnrichmentResult,
) -> GraphMutation {
    let this_paper = candidate.paper_key();
    let paper = NodeKey::paper(this_paper.clone());

    let mut nodes = vec![NodeUpsert {
        key: paper.clone(),
        properties: props(json!({
            "source_id": candidate.source_id,
            "external_id": candidate.external_id,
            "title": candidate.title,
            "abstract": candidate.abstract_text,
            "categories": candidate.categories,
            "document_url": candidate.document_url,
            "published_at": candidate.published_at,
            "storage_path": artifact.storage_path,
            "checksum": artifact.checksum,
            "summary": enrichment.summary,
            "key_points": enrichment.key_points,
            "tags": enrichment.tags,
            "chapters": chapters_property(&enrichment.chapters),
            "provider": enrichment.provider,
            "enriched_at": enrichment.generated_at,
        })),
    }];
    let mut edges = Vec::new();

    let mut seen_authors = BTreeSet::new();
    for (position, name) in candidate.authors.iter().enumerate() {
        let normalized = normalize_author(name);
        if normalized.is_empty() || !seen_authors.insert(normalized.clone()) {
            continue;
        }
        let author = NodeKey::author(normalized);
        nodes.push(NodeUpsert {
            key: author.clone(),
            properties: props(json!({ "name": name.trim() })),
        });
        edges.push(EdgeUpsert {
            from: paper.clone(),
            rel: RelType::AuthoredBy,
            to: author,
            relation: String::new(),
            properties: props(json!({ "position": position })),
            require_existing: false,
        });
    }

    let mut concepts = BTreeSet::new();
    let concept_labels = enrichment
        .key_concepts
        .iter()
        .map(|c| (c.as_str(), None))
        .chain(
            enrichment
                .entities
                .iter()
                .map(|e| (e.name.as_str(), Some(e.kind.as_str()))),
        );
    for (label, kind) in concept_labels {
        let normalized = normalize_concept(label);
        if normalized.is_empty() || !concepts.insert(normalized.clone()) {
            continue;
        }
        let concept = NodeKey::concept(normalized);
        let mut properties = props(json!({ "name": label.trim() }));
        if let Some(kind) = kind.filter(|k| !k.is_empty()) {
            properties.insert("kind".to_string(), json!(kind));
        }
        nodes.push(NodeUpsert {
            key: concept.clone(),
            properties,
        });
        edges.push(EdgeUpsert {
            from: paper.clone(),
            rel: RelType::Mentions,
            to: concept,
            relation: String::new(),
            properties: Map::new(),
            require_existing: false,
        });
    }

    let resolve = |label: &str| -> Option<(NodeKey, bool)> {
        if let Some(id) = arxiv_id(label) {
            let key = paper_key(&candidate.source_id, &id);
            let known = key == this_paper;
            return Some((NodeKey::paper(key), !known));
        }
        let normalized = normalize_concept(label);
        if normalized.is_empty() {
            return None;
        }
        let known = concepts.contains(&normalized);
        Some((NodeKey::concept(normalized), !known))
    };

    for triple in &enrichment.relation_triples {
        let (Some((from, from_unknown)), Some((to, to_unknown))) =
            (resolve(&triple.subject), resolve(&triple.object))
        else {
            debug!(
                paper_key = %this_paper,
                subject = %triple.subject,
                object = %triple.object,
                "Skipping relation with empty endpoint"
            );
            continue;
        };
        if from == to {
            continue;
        }
        let relation = normalize_predicate(&triple.predicate);
        let duplicate = edges.iter().any(|e: &EdgeUpsert| {
            e.rel == RelType::RelatesTo && e.from == from && e.to == to && e.relation == relation
        });
        if duplicate {
            continue;
        }
        edges.push(EdgeUpsert {
            from,
            rel: RelType::RelatesTo,
            to,
            relation,
            properties: props(json!({ "predicate": triple.predicate.trim() })),
            require_existing: from_unknown || to_unknown,
        });
    }

    GraphMutation {
        paper_key: this_paper,
        nodes,
        edges,
        prune_paper_edges: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChapterConcept, Entity, NodeLabel, RelationTriple};
    use chrono::Utc;
    use std::path::PathBuf;

    fn fixtures() -> (CandidateRecord, ArtifactRef, EnrichmentResult) {
        let now = Utc::now();
        let candidate = CandidateRecord {
            source_id: "hf".into(),
            external_id: "2401.00001".into(),
            title: "Sparse Mixtures".into(),
            authors: vec!["A. Smith".into(), "A Smith".into(), "B. Jones".into()],
            abstract_text: "We study sparsity.".into(),
            categories: vec!["moe".into()],
            document_url: "https://arxiv.org/pdf/2401.00001.pdf".into(),
            published_at: None,
            discovered_at: now,
        };
        let artifact = ArtifactRef {
            paper_key: candidate.paper_key(),
            storage_path: PathBuf::from("/tmp/hf/2026/2401.00001/document.pdf"),
            checksum: "blake3:abc".into(),
            byte_size: 10,
            document_url: candidate.document_url.clone(),
            fetched_at: now,
            fetch_attempts: 1,
        };
        let enrichment = EnrichmentResult {
            paper_key: candidate.paper_key(),
            provider: "mock:v1".into(),
            summary: "A summary".into(),
            key_points: vec![],
            key_concepts: vec!["Mixture of Experts".into(), "mixture-of-experts".into()],
            entities: vec![Entity {
                name: "Switch Transformer".into(),
                kind: "model".into(),
            }],
            relation_triples: vec![
                RelationTriple {
                    subject: "Mixture of Experts".into(),
                    predicate: "extends".into(),
                    object: "Switch Transformer".into(),
                },
                RelationTriple {
                    subject: "Mixture of Experts".into(),
                    predicate: "builds on".into(),
                    object: "Dense Attention".into(),
                },
                RelationTriple {
                    subject: "2401.00001".into(),
                    predicate: "cites".into(),
                    object: "arXiv:2312.09999".into(),
                },
                RelationTriple {
                    subject: "???".into(),
                    predicate: "x".into(),
                    object: "Switch Transformer".into(),
                },
            ],
            tags: vec![],
            chapters: vec![],
            generated_at: now,
        };
        (candidate, artifact, enrichment)
    }

    #[test]
    fn test_authors_deduplicated_by_normalized_name() {
        let (c, a, e) = fixtures();
        let m = build_mutation(&c, &a, &e);
        let authors: Vec<_> = m
            .nodes
            .iter()
            .filter(|n| n.key.label == NodeLabel::Author)
            .collect();
        assert_eq!(authors.len(), 2);
        assert_eq!(
            m.edges
                .iter()
                .filter(|e| e.rel == RelType::AuthoredBy)
                .count(),
            2
        );
    }

    #[test]
    fn test_concepts_and_entities_merge_by_slug() {
        let (c, a, e) = fixtures();
        let m = build_mutation(&c, &a, &e);
        let concepts: Vec<_> = m
            .nodes
            .iter()
            .filter(|n| n.key.label == NodeLabel::Concept)
            .map(|n| n.key.key.as_str())
            .collect();
        assert_eq!(concepts, vec!["mixture-of-experts", "switch-transformer"]);
        let entity = m
            .nodes
            .iter()
            .find(|n| n.key.key == "switch-transformer")
            .unwrap();
        assert_eq!(entity.properties["kind"], "model");
    }

    #[test]
    fn test_relation_resolution_flags() {
        let (c, a, e) = fixtures();
        let m = build_mutation(&c, &a, &e);
        let relates: Vec<_> = m
            .edges
            .iter()
            .filter(|e| e.rel == RelType::RelatesTo)
            .collect();
        assert_eq!(relates.len(), 3);

        let extends = relates.iter().find(|e| e.relation == "extends").unwrap();
        assert!(!extends.require_existing);

        let builds_on = relates.iter().find(|e| e.relation == "builds_on").unwrap();
        assert!(builds_on.require_existing);
        assert_eq!(builds_on.to, NodeKey::concept("dense-attention"));

        let cites = relates.iter().find(|e| e.relation == "cites").unwrap();
        assert_eq!(cites.from, NodeKey::paper("hf:2401.00001"));
        assert_eq!(cites.to, NodeKey::paper("hf:2312.09999"));
        assert!(cites.require_existing);
    }

    #[test]
    fn test_paper_node_first() {
        let (c, a, e) = fixtures();
        let m = build_mutation(&c, &a, &e);
        assert_eq!(m.nodes[0].key, NodeKey::paper("hf:2401.00001"));
        assert_eq!(m.nodes[0].properties["checksum"], "blake3:abc");
        assert!(m.prune_paper_edges);
    }

    #[test]
    fn test_chapters_stored_on_paper_with_concept_keys() {
        let (c, a, mut e) = fixtures();
        e.chapters = vec![Chapter {
            title: "Introduction".into(),
            explanation: "Why sparse experts matter.".into(),
            related_concepts: vec![ChapterConcept {
                label: "Mixture of Experts".into(),
                node_type: None,
            }],
        }];
        let m = build_mutation(&c, &a, &e);
        let chapters = &m.nodes[0].properties["chapters"];
        assert_eq!(chapters[0]["title"], "Introduction");
        let related = &chapters[0]["related_concepts"][0];
        assert_eq!(related["concept_key"], "mixture-of-experts");
        assert_eq!(related["node_type"], "Concept");
    }

    #[test]
    fn test_build_is_deterministic() {
        let (c, a, e) = fixtures();
        assert_eq!(build_mutation(&c, &a, &e), build_mutation(&c, &a, &e));
    }
}
