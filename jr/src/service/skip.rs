//! Skip-logic evaluation

use std::collections::HashMap;

use serde_json::Value;

use super::{JobService, ServiceError};
use crate::domain::{Answer, TaskDefinition};
use crate::survey::{NextQuestion, Survey};

/// Pre-fetched data for evaluating skip logic over a batch of tasks.
/// Render workers build one per interview so per-task evaluation does no
/// storage reads.
pub struct SkipContext<'a> {
    pub survey: &'a Survey,
    pub question_index_map: &'a HashMap<String, usize>,
    pub answers: &'a HashMap<String, Answer>,
    pub scenario: Option<&'a Value>,
    pub agent: Option<&'a Value>,
    pub task_def: &'a TaskDefinition,
}

impl JobService {
    /// Decide whether a task should be skipped. Returns the skip reason,
    /// or `None` to proceed.
    ///
    /// Fetches everything it needs; hot paths should build a
    /// [`SkipContext`] and call [`JobService::should_skip_with_context`].
    pub fn should_skip_task(
        &self,
        job_id: &str,
        interview_id: &str,
        task_id: &str,
    ) -> Result<Option<String>, ServiceError> {
        let Some(task_def) = self.tasks().get_definition(job_id, interview_id, task_id)? else {
            return Ok(None);
        };
        let Some(survey_data) = self.jobs().get_survey(job_id)? else {
            return Ok(None);
        };
        let survey: Survey =
            serde_json::from_value(survey_data).map_err(kvstore::StoreError::Serde)?;
        let question_index_map = survey.question_index_map();

        let question_names = survey.question_names();
        let answers = self
            .answers()
            .get_for_interview(job_id, interview_id, &question_names)?;

        let scenario = self.jobs().get_scenario(job_id, &task_def.scenario_id)?;
        let agent = self.jobs().get_agent(job_id, &task_def.agent_id)?;

        self.should_skip_with_context(&SkipContext {
            survey: &survey,
            question_index_map: &question_index_map,
            answers: &answers,
            scenario: scenario.as_ref(),
            agent: agent.as_ref(),
            task_def: &task_def,
        })
    }

    /// Skip evaluation against pre-fetched data.
    ///
    /// A task is skipped when a memory dependency produced a null answer,
    /// when a before-rule fires, or when the previous question's routing
    /// jumps past it (including off the end of the survey).
    pub fn should_skip_with_context(
        &self,
        ctx: &SkipContext<'_>,
    ) -> Result<Option<String>, ServiceError> {
        let question_name = &ctx.task_def.question_name;
        let Some(&question_index) = ctx.question_index_map.get(question_name) else {
            return Ok(None);
        };

        // The first question is never skipped
        if question_index == 0 {
            return Ok(None);
        }

        // Fast path: no user-defined rules means nothing can skip
        if ctx.survey.rule_collection.is_empty() {
            return Ok(None);
        }

        // A failed memory dependency (null answer) skips the question
        if let Some(priors) = ctx.survey.memory_plan.get(question_name) {
            for prior in priors {
                if let Some(answer) = ctx.answers.get(prior)
                    && answer.answer.is_null()
                {
                    return Ok(Some(format!("Memory dependency '{prior}' failed")));
                }
            }
        }

        let combined = combined_answer_namespace(ctx.answers, ctx.scenario, ctx.agent);

        if ctx
            .survey
            .rule_collection
            .skip_question_before_running(question_index, &combined)
        {
            return Ok(Some(
                "Skip rule evaluated to true before running".to_string(),
            ));
        }

        // Does the previous question's routing jump past this one?
        let prev_index = question_index - 1;
        match ctx.survey.rule_collection.next_question(prev_index, &combined) {
            NextQuestion::EndOfSurvey => Ok(Some("EndOfSurvey reached".to_string())),
            NextQuestion::Index(next) if next > question_index => {
                Ok(Some(format!("Skip rule: jump from {prev_index} to {next}")))
            }
            NextQuestion::Index(_) => Ok(None),
        }
    }
}

/// The namespace rules evaluate against: answers under `{q}.answer`,
/// scenario fields and agent traits under their own names.
pub(crate) fn combined_answer_namespace(
    answers: &HashMap<String, Answer>,
    scenario: Option<&Value>,
    agent: Option<&Value>,
) -> HashMap<String, Value> {
    let mut combined = HashMap::new();

    for (question_name, answer) in answers {
        combined.insert(format!("{question_name}.answer"), answer.answer.clone());
    }

    if let Some(Value::Object(fields)) = scenario {
        for (key, value) in fields {
            combined.insert(key.clone(), value.clone());
        }
    }

    if let Some(traits) = agent.and_then(|a| a.get("traits")).and_then(Value::as_object) {
        for (key, value) in traits {
            combined.insert(key.clone(), value.clone());
        }
    }

    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionType;
    use crate::survey::{Condition, Question, Rule};
    use kvstore::MemoryStorage;
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> JobService {
        JobService::new(Arc::new(MemoryStorage::new()))
    }

    fn task_def(question_name: &str) -> TaskDefinition {
        TaskDefinition {
            task_id: "t".to_string(),
            job_id: "j".to_string(),
            interview_id: "i".to_string(),
            scenario_id: "s".to_string(),
            agent_id: "a".to_string(),
            model_id: "m".to_string(),
            question_id: "q".to_string(),
            question_name: question_name.to_string(),
            iteration: 0,
            depends_on: vec![],
            dependents: vec![],
            execution_type: ExecutionType::Llm,
        }
    }

    fn answer(question: &str, value: Value) -> (String, Answer) {
        (question.to_string(), Answer::new("j", "i", question, value))
    }

    fn evaluate(
        survey: &Survey,
        question_name: &str,
        answers: HashMap<String, Answer>,
    ) -> Option<String> {
        let index_map = survey.question_index_map();
        let task_def = task_def(question_name);
        service()
            .should_skip_with_context(&SkipContext {
                survey,
                question_index_map: &index_map,
                answers: &answers,
                scenario: None,
                agent: None,
                task_def: &task_def,
            })
            .unwrap()
    }

    fn three_question_survey() -> Survey {
        Survey::new(vec![
            Question::new("q1", "One?"),
            Question::new("q2", "Two?"),
            Question::new("q3", "Three?"),
        ])
    }

    #[test]
    fn test_first_question_never_skipped() {
        let survey = three_question_survey()
            .with_rule(Rule::skip_before(0, Condition::equals("q1", json!("x"))));
        assert_eq!(evaluate(&survey, "q1", HashMap::new()), None);
    }

    #[test]
    fn test_fast_path_no_rules() {
        let survey = three_question_survey();
        let answers = [answer("q1", Value::Null)].into();
        // Null memory answer would skip, but with no rules evaluation
        // never gets that far
        assert_eq!(evaluate(&survey, "q2", answers), None);
    }

    #[test]
    fn test_memory_dependency_failed() {
        let survey = three_question_survey()
            .with_memory("q2", vec!["q1".to_string()])
            .with_rule(Rule::jump(1, Condition::equals("q2", json!("z")), 2));
        let answers = [answer("q1", Value::Null)].into();
        assert_eq!(
            evaluate(&survey, "q2", answers),
            Some("Memory dependency 'q1' failed".to_string())
        );
    }

    #[test]
    fn test_jump_rule_skips_intermediate() {
        // Rule at q1 (index 0): answering "yes" jumps to q3 (index 2)
        let survey = three_question_survey()
            .with_rule(Rule::jump(0, Condition::equals("q1", json!("yes")), 2));

        let answers: HashMap<String, Answer> = [answer("q1", json!("yes"))].into();
        assert_eq!(
            evaluate(&survey, "q2", answers),
            Some("Skip rule: jump from 0 to 2".to_string())
        );

        // q3 is the jump target, not skipped
        let answers: HashMap<String, Answer> = [answer("q1", json!("yes"))].into();
        assert_eq!(evaluate(&survey, "q3", answers), None);

        // "no" follows the default route; nothing is skipped
        let answers: HashMap<String, Answer> = [answer("q1", json!("no"))].into();
        assert_eq!(evaluate(&survey, "q2", answers), None);
    }

    #[test]
    fn test_end_of_survey() {
        let survey = three_question_survey()
            .with_rule(Rule::stop(0, Condition::equals("q1", json!("done"))));
        let answers: HashMap<String, Answer> = [answer("q1", json!("done"))].into();
        assert_eq!(
            evaluate(&survey, "q2", answers),
            Some("EndOfSurvey reached".to_string())
        );
    }

    #[test]
    fn test_before_rule() {
        let survey = three_question_survey()
            .with_rule(Rule::skip_before(1, Condition::equals("q1", json!("skip"))));
        let answers: HashMap<String, Answer> = [answer("q1", json!("skip"))].into();
        assert_eq!(
            evaluate(&survey, "q2", answers),
            Some("Skip rule evaluated to true before running".to_string())
        );
    }

    #[test]
    fn test_namespace_includes_scenario_and_traits() {
        let answers = [answer("q1", json!("v"))].into();
        let scenario = json!({"region": "north"});
        let agent = json!({"traits": {"age": 30}});
        let combined =
            combined_answer_namespace(&answers, Some(&scenario), Some(&agent));

        assert_eq!(combined["q1.answer"], json!("v"));
        assert_eq!(combined["region"], json!("north"));
        assert_eq!(combined["age"], json!(30));
    }
}
