//! Validation of raw provider output into an [`EnrichmentResult`].
//!
//! Structurally invalid output (no JSON object, wrong field types, missing
//! summary) is reported as [`Error::Serialization`], which the gateway
//! treats as "retry once, then give up on this provider".

use chrono::Utc;
use serde_json::{Map, Value};

use paperscope_core::{
    defaults, Chapter, ChapterConcept, EnrichmentResult, Entity, Error, RelationTriple, Result,
};

use crate::provider::Capability;

/// Slice out the outermost JSON object, tolerating code fences and chatter.
fn json_object_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Serialization(format!("invalid structured output: {}", msg.into()))
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Fetch an optional array field; present-but-not-an-array is invalid.
fn array<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Result<Vec<&'a Value>> {
    let mut out = Vec::new();
    for key in keys {
        match obj.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => out.extend(items.iter()),
            Some(_) => return Err(invalid(format!("field '{key}' must be an array"))),
        }
    }
    Ok(out)
}

fn name_of(value: &Value) -> Option<String> {
    match value {
        Value::Object(o) => ["name", "label", "concept"]
            .iter()
            .find_map(|k| o.get(*k).and_then(scalar_text)),
        other => scalar_text(other),
    }
}

fn push_unique(out: &mut Vec<String>, item: String, cap: usize) {
    if out.len() < cap && !out.iter().any(|x| x.eq_ignore_ascii_case(&item)) {
        out.push(item);
    }
}

fn triple_of(value: &Value) -> Option<RelationTriple> {
    let pick = |o: &Map<String, Value>, keys: &[&str]| keys.iter().find_map(|k| o.get(*k).and_then(scalar_text));
    match value {
        Value::Object(o) => Some(RelationTriple {
            subject: pick(o, &["subject", "source", "from"])?,
            predicate: pick(o, &["predicate", "relation", "type"]).unwrap_or_default(),
            object: pick(o, &["object", "target", "to"])?,
        }),
        Value::Array(items) if items.len() == 3 => Some(RelationTriple {
            subject: scalar_text(&items[0])?,
            predicate: scalar_text(&items[1]).unwrap_or_default(),
            object: scalar_text(&items[2])?,
        }),
        _ => None,
    }
}

fn chapter_concept_of(value: &Value) -> Option<ChapterConcept> {
    match value {
        Value::Object(o) => Some(ChapterConcept {
            label: ["label", "name"].iter().find_map(|k| o.get(*k).and_then(scalar_text))?,
            node_type: ["type", "node_type"].iter().find_map(|k| o.get(*k).and_then(scalar_text)),
        }),
        other => scalar_text(other).map(|label| ChapterConcept { label, node_type: None }),
    }
}

/// A chapter needs a title; the explanation falls back to its summary.
fn chapter_of(value: &Value) -> Result<Option<Chapter>> {
    let Value::Object(o) = value else { return Ok(None) };
    let pick = |keys: &[&str]| keys.iter().find_map(|k| o.get(*k).and_then(scalar_text));
    let Some(title) = pick(&["title", "name"]) else { return Ok(None) };
    let explanation = pick(&["explanation", "summary"]).unwrap_or_default();

    let mut related_concepts: Vec<ChapterConcept> = Vec::new();
    for item in array(o, &["related_concepts"])? {
        let Some(concept) = chapter_concept_of(item) else { continue };
        if related_concepts.len() < defaults::MAX_CHAPTER_CONCEPTS
            && !related_concepts.iter().any(|c| c.label.eq_ignore_ascii_case(&concept.label))
        {
            related_concepts.push(concept);
        }
    }
    Ok(Some(Chapter { title, explanation, related_concepts }))
}

/// Validate and normalize a provider response.
pub fn parse_enrichment(
    raw: &str,
    paper_key: &str,
    provider: &str,
    capabilities: &[Capability],
) -> Result<EnrichmentResult> {
    let slice = json_object_slice(raw).ok_or_else(|| invalid("no JSON object in response"))?;
    let value: Value =
        serde_json::from_str(slice).map_err(|e| invalid(format!("unparsable JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(invalid("top-level value is not an object"));
    };

    let wants = |c: Capability| capabilities.contains(&c);

    let summary = match obj.get("summary") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(_) => return Err(invalid("field 'summary' must be a string")),
    };
    if wants(Capability::Summarize) && summary.is_empty() {
        return Err(invalid("missing summary"));
    }

    let mut key_points = Vec::new();
    let mut tags = Vec::new();
    let mut chapters = Vec::new();
    if wants(Capability::Summarize) {
        for item in array(&obj, &["key_points"])? {
            if let Some(text) = scalar_text(item) {
                push_unique(&mut key_points, text, defaults::MAX_CONCEPTS);
            }
        }
        for item in array(&obj, &["tags"])? {
            if let Some(tag) = scalar_text(item) {
                push_unique(&mut tags, tag.to_lowercase(), defaults::MAX_TAGS);
            }
        }
        for item in array(&obj, &["chapters"])? {
            if chapters.len() >= defaults::MAX_CHAPTERS {
                break;
            }
            if let Some(chapter) = chapter_of(item)? {
                chapters.push(chapter);
            }
        }
    }

    let mut key_concepts = Vec::new();
    let mut entities: Vec<Entity> = Vec::new();
    if wants(Capability::ExtractEntities) {
        for item in array(&obj, &["key_concepts", "concepts"])? {
            if let Some(name) = name_of(item) {
                push_unique(&mut key_concepts, name, defaults::MAX_CONCEPTS);
            }
        }
        for item in array(&obj, &["entities"])? {
            let Some(name) = name_of(item) else { continue };
            let kind = item
                .get("type")
                .or_else(|| item.get("kind"))
                .and_then(scalar_text)
                .unwrap_or_default();
            if entities.len() < defaults::MAX_CONCEPTS
                && !entities.iter().any(|e| e.name.eq_ignore_ascii_case(&name))
            {
                entities.push(Entity { name, kind });
            }
        }
    }

    let mut relation_triples = Vec::new();
    if wants(Capability::ExtractRelations) {
        for item in array(&obj, &["relation_triples", "relations", "relationships"])? {
            if let Some(triple) = triple_of(item) {
                if relation_triples.len() < defaults::MAX_RELATIONS
                    && !relation_triples.contains(&triple)
                {
                    relation_triples.push(triple);
                }
            }
        }
    }

    Ok(EnrichmentResult {
        paper_key: paper_key.to_string(),
        provider: provider.to_string(),
        summary,
        key_points,
        key_concepts,
        entities,
        relation_triples,
        tags,
        chapters,
        generated_at: Utc::now(),
    })
}
