//! Validation of raw model output into a [`Judgement`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tickets::Priority;

/// Structured triage assessment of one ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judgement {
    pub summary: String,
    pub priority: Priority,
    pub helpful_notes: Option<String>,
    pub related_skills: Vec<String>,
}

/// Pull the JSON payload out of a response that may be wrapped in code fences
/// or surrounded by prose.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip a language tag such as `json`
        let body_start = after
            .find('\n')
            .filter(|&nl| after[..nl].chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|nl| nl + 1)
            .unwrap_or_else(|| after.len() - after.trim_start_matches(char::is_alphabetic).len());
        let body = &after[body_start..];
        let end = body.find("```").unwrap_or(body.len());
        return body[..end].trim();
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|s| !s.is_empty())
}

/// Trim skills and drop blanks and case-insensitive duplicates, keeping first spelling
fn normalize_skills(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut skills: Vec<String> = Vec::with_capacity(raw.len());
    for skill in raw {
        let skill = skill.trim();
        if skill.is_empty() {
            continue;
        }
        if !skills.iter().any(|s| s.eq_ignore_ascii_case(skill)) {
            skills.push(skill.to_string());
        }
    }
    skills
}

/// Parse model text into a [`Judgement`].
///
/// Anything that is not a JSON object is a [`Error::JudgementParse`]. Missing
/// fields default, an unknown priority becomes `medium`.
pub fn parse_judgement(response: &str) -> Result<Judgement> {
    let payload = strip_code_fences(response);

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::JudgementParse(format!("{} in {:?}", e, truncate(payload, 120))))?;

    let obj = value
        .as_object()
        .ok_or_else(|| Error::JudgementParse("expected a JSON object".to_string()))?;

    let priority = string_field(obj, &["priority"]);

    Ok(Judgement {
        summary: string_field(obj, &["summary"]).unwrap_or_default(),
        priority: Priority::normalize(priority.as_deref()),
        helpful_notes: string_field(obj, &["helpfulNotes", "helpful_notes"]),
        related_skills: normalize_skills(
            obj.get("relatedSkills").or_else(|| obj.get("related_skills")),
        ),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
