//! Branching rules as data
//!
//! Rules are a compact IR evaluated against the combined answer namespace
//! (prior answers keyed as `"{question}.answer"`, plus scenario fields and
//! agent traits under their own names). Only user-defined rules are stored;
//! the default "go to the next question" behavior is implicit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a rule routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextQuestion {
    /// Jump to the question at this index
    Index(usize),
    /// Terminate the survey; all downstream questions are skipped
    EndOfSurvey,
}

/// Comparison operator for rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    IsNull,
}

/// A condition over the answer namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Question whose answer is inspected
    pub question: String,
    pub op: CmpOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn equals(question: impl Into<String>, value: Value) -> Self {
        Self {
            question: question.into(),
            op: CmpOp::Eq,
            value,
        }
    }

    pub fn not_equals(question: impl Into<String>, value: Value) -> Self {
        Self {
            question: question.into(),
            op: CmpOp::Ne,
            value,
        }
    }

    /// Evaluate against the combined answer namespace. An answer missing
    /// from the namespace never matches Eq/Ne.
    pub fn evaluate(&self, answers: &HashMap<String, Value>) -> bool {
        let key = format!("{}.answer", self.question);
        let answer = answers.get(&key).or_else(|| answers.get(&self.question));

        match self.op {
            CmpOp::Eq => answer.map(|a| *a == self.value).unwrap_or(false),
            CmpOp::Ne => answer.map(|a| *a != self.value).unwrap_or(false),
            CmpOp::IsNull => answer.map(|a| a.is_null()).unwrap_or(true),
        }
    }
}

/// A user-defined routing rule attached to one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Index of the question this rule fires from
    pub current_q: usize,

    pub condition: Condition,

    /// Where to go when the condition holds
    pub next_q: NextQuestion,

    /// When true, the rule is evaluated before the question at `current_q`
    /// runs and skips it outright if the condition holds.
    #[serde(default)]
    pub before_rule: bool,
}

impl Rule {
    /// A jump rule: after `current_q`, if the condition holds, go to `next_q`.
    pub fn jump(current_q: usize, condition: Condition, next_q: usize) -> Self {
        Self {
            current_q,
            condition,
            next_q: NextQuestion::Index(next_q),
            before_rule: false,
        }
    }

    /// A stop rule: after `current_q`, if the condition holds, end the survey.
    pub fn stop(current_q: usize, condition: Condition) -> Self {
        Self {
            current_q,
            condition,
            next_q: NextQuestion::EndOfSurvey,
            before_rule: false,
        }
    }

    /// A skip rule evaluated before `current_q` runs.
    pub fn skip_before(current_q: usize, condition: Condition) -> Self {
        Self {
            current_q,
            condition,
            next_q: NextQuestion::Index(current_q + 1),
            before_rule: true,
        }
    }
}

/// The user-defined rules of a survey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCollection {
    rules: Vec<Rule>,
}

impl RuleCollection {
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Only user-defined rules exist here; the implicit "go to next" rules
    /// are not materialized.
    pub fn non_default_rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Should the question at `index` be skipped before running?
    pub fn skip_question_before_running(
        &self,
        index: usize,
        answers: &HashMap<String, Value>,
    ) -> bool {
        self.rules
            .iter()
            .filter(|r| r.before_rule && r.current_q == index)
            .any(|r| r.condition.evaluate(answers))
    }

    /// Which question follows the one at `index`, given the answers so far?
    /// Defaults to `index + 1`; the last matching user rule wins.
    pub fn next_question(&self, index: usize, answers: &HashMap<String, Value>) -> NextQuestion {
        let mut next = NextQuestion::Index(index + 1);
        for rule in &self.rules {
            if !rule.before_rule && rule.current_q == index && rule.condition.evaluate(answers) {
                next = rule.next_q;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{k}.answer"), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_equals() {
        let cond = Condition::equals("q1", json!("yes"));
        assert!(cond.evaluate(&answers(&[("q1", json!("yes"))])));
        assert!(!cond.evaluate(&answers(&[("q1", json!("no"))])));
        assert!(!cond.evaluate(&HashMap::new()));
    }

    #[test]
    fn test_next_question_default() {
        let rules = RuleCollection::default();
        assert_eq!(
            rules.next_question(0, &HashMap::new()),
            NextQuestion::Index(1)
        );
    }

    #[test]
    fn test_jump_rule() {
        let mut rules = RuleCollection::default();
        rules.add_rule(Rule::jump(0, Condition::equals("q1", json!("yes")), 2));

        let yes = answers(&[("q1", json!("yes"))]);
        assert_eq!(rules.next_question(0, &yes), NextQuestion::Index(2));

        let no = answers(&[("q1", json!("no"))]);
        assert_eq!(rules.next_question(0, &no), NextQuestion::Index(1));
    }

    #[test]
    fn test_stop_rule() {
        let mut rules = RuleCollection::default();
        rules.add_rule(Rule::stop(1, Condition::equals("q2", json!("done"))));

        let done = answers(&[("q2", json!("done"))]);
        assert_eq!(rules.next_question(1, &done), NextQuestion::EndOfSurvey);
    }

    #[test]
    fn test_skip_before_rule() {
        let mut rules = RuleCollection::default();
        rules.add_rule(Rule::skip_before(2, Condition::equals("q1", json!("skip me"))));

        let matching = answers(&[("q1", json!("skip me"))]);
        assert!(rules.skip_question_before_running(2, &matching));
        assert!(!rules.skip_question_before_running(1, &matching));
        assert!(!rules.skip_question_before_running(2, &HashMap::new()));
    }

    #[test]
    fn test_last_matching_rule_wins() {
        let mut rules = RuleCollection::default();
        rules.add_rule(Rule::jump(0, Condition::equals("q1", json!("a")), 2));
        rules.add_rule(Rule::jump(0, Condition::equals("q1", json!("a")), 3));

        let ans = answers(&[("q1", json!("a"))]);
        assert_eq!(rules.next_question(0, &ans), NextQuestion::Index(3));
    }
}
