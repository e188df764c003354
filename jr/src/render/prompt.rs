//! The prompt-render capability and its default implementation

use std::collections::HashMap;

use handlebars::Handlebars;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::llm::FileRef;
use crate::survey::{Agent, ModelSpec, Question, Scenario};

/// Errors from prompt rendering
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template error: {0}")]
    Template(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The output of rendering one task's prompts.
#[derive(Debug, Clone)]
pub struct RenderedParts {
    pub system_prompt: String,
    pub user_prompt: String,
    pub files: Option<Vec<FileRef>>,
}

/// Renders prompts for a task. The engine treats this as an opaque
/// capability; [`HandlebarsRenderer`] is the default implementation.
pub trait PromptRenderer: Send + Sync {
    fn render(
        &self,
        scenario: &Scenario,
        agent: &Agent,
        model: &ModelSpec,
        question: &Question,
        prior_answers: &HashMap<String, Value>,
    ) -> Result<RenderedParts, RenderError>;
}

const DEFAULT_PERSONA: &str =
    "You are answering questions as if you were a human. Do not break character.";

/// Handlebars-backed renderer.
///
/// Question text is a template evaluated against the scenario fields and
/// prior answers, so `{{ topic }}` pipes a scenario value and
/// `{{ q1.answer }}` pipes an earlier answer.
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    fn template_context(
        scenario: &Scenario,
        prior_answers: &HashMap<String, Value>,
    ) -> Map<String, Value> {
        let mut context = scenario.values.clone();
        for (question_name, answer) in prior_answers {
            context.insert(question_name.clone(), json!({"answer": answer}));
        }
        context
    }

    fn scenario_files(scenario: &Scenario) -> Option<Vec<FileRef>> {
        let files: Vec<FileRef> = scenario
            .values
            .values()
            .filter_map(|value| {
                let obj = value.as_object()?;
                let base64_string = obj.get("base64_string")?.as_str()?;
                obj.get("mime_type")?;
                obj.get("suffix")?;
                Some(FileRef {
                    base64_string: base64_string.to_string(),
                    mime_type: obj.get("mime_type").and_then(Value::as_str).map(String::from),
                    suffix: obj.get("suffix").and_then(Value::as_str).map(String::from),
                })
            })
            .collect();
        if files.is_empty() { None } else { Some(files) }
    }

    fn format_option(option: &Value) -> String {
        match option {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl PromptRenderer for HandlebarsRenderer {
    fn render(
        &self,
        scenario: &Scenario,
        agent: &Agent,
        _model: &ModelSpec,
        question: &Question,
        prior_answers: &HashMap<String, Value>,
    ) -> Result<RenderedParts, RenderError> {
        // System prompt: persona instruction plus traits
        let mut system_prompt = agent
            .instruction
            .clone()
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
        if !agent.traits.is_empty() {
            system_prompt.push_str("\nYour traits: ");
            system_prompt.push_str(&serde_json::to_string(&agent.traits)?);
        }

        // User prompt: question text with scenario/answer substitution
        let context = Self::template_context(scenario, prior_answers);
        let mut user_prompt = self
            .registry
            .render_template(&question.question_text, &context)
            .map_err(|e| RenderError::Template(e.to_string()))?;

        if let Some(Value::Array(options)) = &question.question_options {
            user_prompt.push_str("\n\nOptions:\n");
            for option in options {
                user_prompt.push_str("- ");
                user_prompt.push_str(&Self::format_option(option));
                user_prompt.push('\n');
            }
            user_prompt.push_str("\nRespond with exactly one of the options.");
        }

        if !prior_answers.is_empty() {
            user_prompt.push_str("\n\nEarlier answers:\n");
            let mut names: Vec<&String> = prior_answers.keys().collect();
            names.sort();
            for name in names {
                user_prompt.push_str(&format!("- {}: {}\n", name, prior_answers[name]));
            }
        }

        Ok(RenderedParts {
            system_prompt,
            user_prompt,
            files: Self::scenario_files(scenario),
        })
    }
}

/// Resolve template variables in a question's options value.
///
/// - `"{{ q1.answer }}"` substitutes the prior answer
/// - `"{{ scenario.attr }}"` substitutes the scenario attribute
/// - `{"from": template, "add": [extras]}` resolves `from` to a list and
///   concatenates `add`
/// - anything else is returned as-is
pub fn resolve_question_options(
    options: &Value,
    answers: &HashMap<String, Value>,
    scenario: &Scenario,
) -> Value {
    if let Value::Object(map) = options
        && let Some(from_template) = map.get("from")
    {
        let additional = map
            .get("add")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(from_str) = from_template.as_str()
            && let Value::Array(mut base) = resolve_template_string(from_str, answers, scenario)
        {
            base.extend(additional);
            return Value::Array(base);
        }
        if !additional.is_empty() {
            return Value::Array(additional);
        }
        return options.clone();
    }

    if let Value::String(template) = options
        && template.contains("{{")
    {
        return resolve_template_string(template, answers, scenario);
    }

    options.clone()
}

fn resolve_template_string(
    template: &str,
    answers: &HashMap<String, Value>,
    scenario: &Scenario,
) -> Value {
    let answer_re = Regex::new(r"^\{\{\s*(\w+)\.answer\s*\}\}$").unwrap_or_else(|_| unreachable!());
    if let Some(captures) = answer_re.captures(template.trim())
        && let Some(answer) = answers.get(&captures[1])
        && !answer.is_null()
    {
        return answer.clone();
    }

    let scenario_re =
        Regex::new(r"^\{\{\s*scenario\.(\w+)\s*\}\}$").unwrap_or_else(|_| unreachable!());
    if let Some(captures) = scenario_re.captures(template.trim())
        && let Some(value) = scenario.get(&captures[1])
    {
        return value.clone();
    }

    // Unresolvable; hand back the raw template
    Value::String(template.to_string())
}
