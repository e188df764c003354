//! Dependency DAG extraction
//!
//! The question-name DAG combines three sources:
//! - the memory plan (a question sees prior answers)
//! - answer piping (a question's text or options reference `{{ q.answer }}`)
//! - implicit rule-ordering edges: every question after a routed question
//!   depends on it, so skip evaluation sees the gating answer

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::Survey;

fn piping_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\.answer\s*\}\}").unwrap_or_else(|_| unreachable!()))
}

/// Question names referenced via `{{ name.answer }}` in a string.
fn piped_names(text: &str) -> Vec<String> {
    piping_regex()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Names piped into a question's options value (string template or
/// `{"from": template, ...}` form).
fn option_piped_names(options: &Value) -> Vec<String> {
    match options {
        Value::String(s) => piped_names(s),
        Value::Object(map) => map
            .get("from")
            .and_then(|f| f.as_str())
            .map(piped_names)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Extract the question-name dependency DAG from a survey.
///
/// Returns `question_name -> set of prerequisite question names`. Only
/// questions with at least one prerequisite appear as keys.
pub fn extract_dag(survey: &Survey) -> HashMap<String, HashSet<String>> {
    let known: HashSet<&str> = survey
        .questions
        .iter()
        .map(|q| q.question_name.as_str())
        .collect();

    let mut dag: HashMap<String, HashSet<String>> = HashMap::new();
    let mut add_edge = |child: &str, parent: &str| {
        if parent != child && known.contains(parent) {
            dag.entry(child.to_string())
                .or_default()
                .insert(parent.to_string());
        }
    };

    // Memory plan edges
    for (question, priors) in &survey.memory_plan {
        for prior in priors {
            add_edge(question, prior);
        }
    }

    // Piping edges from question text and options
    for question in &survey.questions {
        for name in piped_names(&question.question_text) {
            add_edge(&question.question_name, &name);
        }
        if let Some(options) = &question.question_options {
            for name in option_piped_names(options) {
                add_edge(&question.question_name, &name);
            }
        }
    }

    // Implicit rule-ordering edges: everything after a routed question
    // waits for it, so skip evaluation sees the gating answer.
    for rule in survey.rule_collection.non_default_rules() {
        let Some(source) = survey.questions.get(rule.current_q) else {
            continue;
        };
        let source_name = source.question_name.clone();
        for target in survey.questions.iter().skip(rule.current_q + 1) {
            add_edge(&target.question_name, &source_name);
        }
    }

    dag
}

/// Reject cyclic DAGs at submit with the offending question names.
///
/// Kahn's algorithm over the extracted edges; whatever cannot be peeled
/// off is part of (or downstream of) a cycle.
pub fn validate_acyclic(dag: &HashMap<String, HashSet<String>>) -> Result<(), Vec<String>> {
    let mut unmet: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (child, parents) in dag {
        unmet.entry(child.as_str()).or_insert(0);
        for parent in parents {
            *unmet.entry(child.as_str()).or_insert(0) += 1;
            unmet.entry(parent.as_str()).or_insert(0);
            dependents.entry(parent.as_str()).or_default().push(child.as_str());
        }
    }

    let mut queue: Vec<&str> = unmet
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut resolved = 0;
    while let Some(name) = queue.pop() {
        resolved += 1;
        if let Some(children) = dependents.get(name) {
            for child in children {
                let count = unmet.entry(child).or_insert(0);
                *count -= 1;
                if *count == 0 {
                    queue.push(child);
                }
            }
        }
    }

    if resolved == unmet.len() {
        Ok(())
    } else {
        let mut cyclic: Vec<String> = unmet
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        cyclic.sort();
        Err(cyclic)
    }
}
