//! Survey inputs: questions, scenarios, agents, models
//!
//! A survey is an ordered list of questions plus the routing/memory
//! structure around them: a memory plan (which prior answers a question
//! sees), a rule collection (branching and skip rules as data), and the
//! list of questions whose options get randomized per interview.

mod dag;
mod rules;

pub use dag::{extract_dag, validate_acyclic};
pub use rules::{CmpOp, Condition, NextQuestion, Rule, RuleCollection};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Direct-answer callable on a question (functional questions).
/// Receives the scenario and the agent's traits.
pub type QuestionFn = dyn Fn(&Scenario, Option<&Map<String, Value>>) -> eyre::Result<Value> + Send + Sync;

/// Direct-answer callable on an agent.
pub type AgentFn = dyn Fn(&Question, &Scenario) -> eyre::Result<Value> + Send + Sync;

/// One question in a survey.
#[derive(Clone, Serialize, Deserialize)]
pub struct Question {
    pub question_name: String,
    pub question_text: String,

    #[serde(default = "default_question_type")]
    pub question_type: String,

    /// Options for multiple-choice questions. May be a plain list, a
    /// template string like `"{{ q1.answer }}"`, or a dict of the form
    /// `{"from": template, "add": [extras]}`.
    #[serde(default)]
    pub question_options: Option<Value>,

    /// Functional answerer; never serialized, lives only on the client.
    #[serde(skip)]
    pub func: Option<Arc<QuestionFn>>,
}

fn default_question_type() -> String {
    "free_text".to_string()
}

impl Question {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            question_name: name.into(),
            question_text: text.into(),
            question_type: default_question_type(),
            question_options: None,
            func: None,
        }
    }

    /// Multiple-choice constructor.
    pub fn multiple_choice(
        name: impl Into<String>,
        text: impl Into<String>,
        options: Vec<Value>,
    ) -> Self {
        Self {
            question_name: name.into(),
            question_text: text.into(),
            question_type: "multiple_choice".to_string(),
            question_options: Some(Value::Array(options)),
            func: None,
        }
    }

    /// Attach a functional answerer; the task will bypass the LLM pipeline.
    pub fn with_func(mut self, func: Arc<QuestionFn>) -> Self {
        self.func = Some(func);
        self
    }
}

impl std::fmt::Debug for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Question")
            .field("question_name", &self.question_name)
            .field("question_type", &self.question_type)
            .field("has_func", &self.func.is_some())
            .finish()
    }
}

/// A scenario: a named bag of values substituted into prompts.
///
/// Values shaped like a file store entry (`base64_string` + `mime_type` +
/// `suffix`) get their payload offloaded to blob storage at submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scenario {
    pub values: Map<String, Value>,
}

impl Scenario {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }
}

impl FromIterator<(String, Value)> for Scenario {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// An agent: persona traits plus an optional direct-answer capability.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub traits: Map<String, Value>,

    #[serde(default)]
    pub instruction: Option<String>,

    /// Direct answerer; never serialized, lives only on the client.
    #[serde(skip)]
    pub direct_answerer: Option<Arc<AgentFn>>,
}

impl Agent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: Value) -> Self {
        self.traits.insert(key.into(), value);
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_direct_answerer(mut self, f: Arc<AgentFn>) -> Self {
        self.direct_answerer = Some(f);
        self
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("traits", &self.traits)
            .field("has_direct_answerer", &self.direct_answerer.is_some())
            .finish()
    }
}

/// Describes a model: enough for queue routing, prompt rendering, and
/// pricing. The executing client is registered separately because
/// callables don't serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model name, e.g. "claude-3-5-haiku-20241022"
    pub model: String,

    /// Inference service the model routes through, e.g. "anthropic"
    pub service: String,

    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub input_price_per_million_tokens: Option<f64>,

    #[serde(default)]
    pub output_price_per_million_tokens: Option<f64>,
}

impl ModelSpec {
    pub fn new(model: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            service: service.into(),
            parameters: Map::new(),
            api_key: None,
            input_price_per_million_tokens: None,
            output_price_per_million_tokens: None,
        }
    }
}

/// A survey: ordered questions plus routing structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub questions: Vec<Question>,

    /// question_name -> prior question names whose answers the question sees
    #[serde(default)]
    pub memory_plan: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub rule_collection: RuleCollection,

    /// Questions whose options are randomized per interview
    #[serde(default)]
    pub questions_to_randomize: Vec<String>,
}

impl Survey {
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions,
            memory_plan: HashMap::new(),
            rule_collection: RuleCollection::default(),
            questions_to_randomize: Vec::new(),
        }
    }

    pub fn with_memory(mut self, question: impl Into<String>, priors: Vec<String>) -> Self {
        self.memory_plan.insert(question.into(), priors);
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rule_collection.add_rule(rule);
        self
    }

    pub fn with_randomized(mut self, question: impl Into<String>) -> Self {
        self.questions_to_randomize.push(question.into());
        self
    }

    /// question_name -> position in the survey
    pub fn question_index_map(&self) -> HashMap<String, usize> {
        self.questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.question_name.clone(), i))
            .collect()
    }

    pub fn question_names(&self) -> Vec<String> {
        self.questions
            .iter()
            .map(|q| q.question_name.clone())
            .collect()
    }

    pub fn question_by_name(&self, name: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.question_name == name)
    }
}
