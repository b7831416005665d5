//! Plan-mode prompt construction and parsing of the agent's structured reply.
//!
//! Parsing is total: every input yields a `PlanResult`. When no JSON object
//! can be recovered the result has `valid_json == false`, the untouched input
//! in `raw_text`, and every structured field empty.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::models::{PlanOption, PlanQuestion, PlanResult};
use crate::util::extract_json_object;

pub const FEEDBACK_MARKER: &str = "[user feedback]";

fn plan_schema() -> Value {
    json!({
        "summary": "One or two sentences describing the goal",
        "steps": ["Step 1: concrete action", "Step 2: concrete action"],
        "risks": ["Risk: description"],
        "affected_files": ["path/to/file"],
        "new_dependencies": ["package name (empty list if none)"],
        "estimated_time": "e.g. 5-10 minutes",
        "validation": "How to verify the change (tests to run, behavior to check)",
        "rollback": "How to undo the change",
        "questions": [{
            "id": "q1",
            "title": "Decision title",
            "question": "The question the reviewer must answer",
            "options": [
                {"key": "a", "label": "Option A", "description": "Consequence"},
                {"key": "b", "label": "Option B", "description": "Consequence"}
            ],
            "recommended_option_key": "a"
        }],
        "recommended_prompt": "The prompt to use when this plan is executed"
    })
}

/// Prompt for a PLAN attempt: analyse the request and answer with one JSON
/// object, without touching any files.
pub fn build_plan_prompt(task_prompt: &str) -> String {
    let schema = serde_json::to_string_pretty(&plan_schema()).unwrap_or_default();
    format!(
        "You are in plan mode. Analyse the request below and produce a detailed \
         execution plan. Do not modify, create or delete any files.\n\n\
         Reply with a single JSON object that parses as-is, using these fields:\n\
         {schema}\n\n\
         Use empty lists for fields that do not apply. Put every decision the \
         reviewer must make in `questions`. A short note may follow the JSON.\n\n\
         Request:\n{task_prompt}"
    )
}

/// Prompt for the EXEC attempt of a confirmed plan.
pub fn build_exec_prompt(
    original_prompt: &str,
    plan: Option<&PlanResult>,
    answers: &BTreeMap<String, String>,
) -> String {
    let Some(plan) = plan else {
        return original_prompt.to_string();
    };

    let mut lines = vec!["Confirmed execution context:".to_string()];
    if !plan.summary.is_empty() {
        lines.push(format!("- Plan summary: {}", plan.summary));
    }
    if !plan.steps.is_empty() {
        lines.push("- Steps:".to_string());
        lines.extend(plan.steps.iter().map(|s| format!("  - {s}")));
    }
    if !answers.is_empty() {
        lines.push("- Reviewer decisions:".to_string());
        for (question_id, option_key) in answers {
            let label = plan
                .question(question_id)
                .and_then(|q| {
                    let option = q.options.iter().find(|o| &o.key == option_key)?;
                    Some(format!("{} → {}", q.title, option.label))
                })
                .unwrap_or_default();
            if label.is_empty() {
                lines.push(format!("  - {question_id}: {option_key}"));
            } else {
                lines.push(format!("  - {question_id}: {option_key} ({label})"));
            }
        }
    }
    if !plan.recommended_prompt.is_empty() {
        lines.push("- Recommended prompt:".to_string());
        lines.push(plan.recommended_prompt.clone());
    }
    lines.push("- Original request:".to_string());
    lines.push(original_prompt.to_string());
    lines.join("\n")
}

/// Prompt of a revised PLAN task: the previous prompt plus reviewer feedback.
pub fn build_revised_prompt(prompt: &str, feedback: &str) -> String {
    format!("{prompt}\n\n{FEEDBACK_MARKER}\n{}", feedback.trim())
}

pub fn parse_plan_output(raw_text: &str) -> PlanResult {
    let object = match serde_json::from_str::<Value>(raw_text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => extract_json_object(raw_text),
    };
    let Some(object) = object else {
        return PlanResult {
            raw_text: raw_text.to_string(),
            valid_json: false,
            ..Default::default()
        };
    };

    PlanResult {
        summary: text_field(&object, "summary"),
        steps: list_field(&object, "steps"),
        risks: list_field(&object, "risks"),
        affected_files: list_field(&object, "affected_files"),
        new_dependencies: list_field(&object, "new_dependencies"),
        estimated_time: text_field(&object, "estimated_time"),
        validation: text_field(&object, "validation"),
        rollback: text_field(&object, "rollback"),
        questions: parse_questions(object.get("questions")),
        recommended_prompt: text_field(&object, "recommended_prompt"),
        raw_text: raw_text.to_string(),
        valid_json: true,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .map(|v| value_text(v).trim().to_string())
        .unwrap_or_default()
}

fn list_field(object: &Map<String, Value>, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| value_text(v).trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_questions(value: Option<&Value>) -> Vec<PlanQuestion> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let q = item.as_object()?;
            let id = Some(text_field(q, "id"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("q{}", idx + 1));
            let title = Some(text_field(q, "title"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| id.clone());
            let recommended = Some(text_field(q, "recommended_option_key")).filter(|s| !s.is_empty());
            Some(PlanQuestion {
                title,
                question: text_field(q, "question"),
                options: parse_options(q.get("options")),
                recommended_option_key: recommended,
                id,
            })
        })
        .collect()
}

fn parse_options(value: Option<&Value>) -> Vec<PlanOption> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut options: Vec<PlanOption> = Vec::new();
    for item in items {
        let Some(o) = item.as_object() else { continue };
        let key = Some(text_field(o, "key"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("o{}", options.len() + 1));
        let label = Some(text_field(o, "label"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| key.clone());
        options.push(PlanOption {
            label,
            description: text_field(o, "description"),
            key,
        });
    }
    options
}
