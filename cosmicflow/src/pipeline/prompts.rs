//! Built-in prompt templates.
//!
//! Every template can be replaced through [`PromptSet`]; replacements must
//! use the same variables.

use serde::{Deserialize, Serialize};

use crate::llm::PromptTemplate;

/// Heading that precedes the batch's trigger-event JSON in table prompts.
pub const BATCH_EVENTS_HEADING: &str = "Trigger events in this batch";

/// Phrase that opens every semantic review prompt.
pub const REVIEW_MARKER: &str = "Review the following";

const TRIGGER_EVENTS_SYSTEM: &str = "You are a COSMIC function-point analyst. \
You decompose software requirements into trigger events and functional processes. \
Answer with a single JSON object and nothing else.";

const TRIGGER_EVENTS_USER: &str = r#"Requirement: {requirement_name}
Background: {background}
Functional users: {functional_users}
Detailed plan:
{detailed_plan}

Identify the trigger events of this requirement and, for each, the functional processes it starts.
- The table built from your answer must have about {target_rows} rows, so list between {process_min} and {process_max} functional processes in total.
- Each trigger event has 1 to {max_processes_per_event} functional processes.
- Process descriptions are short verb phrases; do not describe validation steps.

Output format:
{"functional_user_requirements": [{"requirement": "...", "functional_users": {"initiator": "...", "receiver": "..."}, "trigger_events": [{"name": "...", "functional_processes": ["...", "..."]}]}]}"#;

const COSMIC_TABLE_SYSTEM: &str = "You are a COSMIC function-point analyst. \
You expand functional processes into data movements. \
Answer with a single markdown table and nothing else.";

const COSMIC_TABLE_USER: &str = r"Requirement: {requirement_name}
Background: {background}
Functional users: {functional_users}

This is batch {batch_number} of {batch_count}. Generate rows only for the trigger events listed below.
The batch has {process_count} functional processes; produce {row_min} to {row_max} rows in total.

Rules:
- Columns, in order: 客户需求 | 功能用户 | 功能用户需求 | 触发事件 | 功能过程 | 子过程描述 | 数据移动类型 | 数据组 | 数据属性 | 复用度 | CFP | ΣCFP
- 客户需求 is always '{requirement_name}'. 复用度 is '新增', CFP and ΣCFP are '1'.
- Every functional process has 2 to 5 rows, starts with an E row and ends with an X or W row.
- Data movement type is one of E, X, R, W. Never more than 2 consecutive R rows.
- Data attributes: 2 to 15 per row, separated by '、', never repeated across rows.
- A data group is never both an entry input and an exit output of the same process.

{batch_events_heading}:
{events_json}";

const SEMANTIC_REVIEW_SYSTEM: &str = "You are a senior COSMIC reviewer. \
You judge whether generated artifacts are plausible for the business they describe.";

const SEMANTIC_REVIEW_USER: &str = r#"{review_marker} {stage} artifact for requirement '{requirement_name}' (target {target_rows} rows), {scope}.

{candidate}

List only business-logic problems: implausible data groups, movements that do not fit the process, missing obvious steps.
Answer with a JSON array, empty if everything is plausible:
[{"severity": "logic", "location": <row number or short text>, "message": "...", "suggested_fix": "..."}]"#;

const CORRECTION_SYSTEM: &str = "You revise your previous answer according to review findings.";

const CORRECTION_USER: &str = r"The previous output did not pass validation:
{findings}

Current version after automatic fixes:
{candidate}

Revise only the failing points listed above and leave everything else unchanged, then output the complete revised content in the same format.";

/// The templates the pipeline renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    /// Stage 1 generation.
    #[serde(default = "trigger_events_template")]
    pub trigger_events: PromptTemplate,
    /// Stage 2 generation, one call per batch.
    #[serde(default = "cosmic_table_template")]
    pub cosmic_table: PromptTemplate,
    /// Semantic review.
    #[serde(default = "semantic_review_template")]
    pub semantic_review: PromptTemplate,
    /// Correction rounds.
    #[serde(default = "correction_template")]
    pub correction: PromptTemplate,
}

fn trigger_events_template() -> PromptTemplate {
    PromptTemplate::new("trigger_events", TRIGGER_EVENTS_SYSTEM, TRIGGER_EVENTS_USER)
}

fn cosmic_table_template() -> PromptTemplate {
    PromptTemplate::new("cosmic_table", COSMIC_TABLE_SYSTEM, COSMIC_TABLE_USER)
}

fn semantic_review_template() -> PromptTemplate {
    PromptTemplate::new("semantic_review", SEMANTIC_REVIEW_SYSTEM, SEMANTIC_REVIEW_USER)
}

fn correction_template() -> PromptTemplate {
    PromptTemplate::new("correction", CORRECTION_SYSTEM, CORRECTION_USER)
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            trigger_events: trigger_events_template(),
            cosmic_table: cosmic_table_template(),
            semantic_review: semantic_review_template(),
            correction: correction_template(),
        }
    }
}

impl PromptSet {
    /// Replaces the stage 1 template.
    #[must_use]
    pub fn with_trigger_events(mut self, template: PromptTemplate) -> Self {
        self.trigger_events = template;
        self
    }

    /// Replaces the stage 2 template.
    #[must_use]
    pub fn with_cosmic_table(mut self, template: PromptTemplate) -> Self {
        self.cosmic_table = template;
        self
    }

    /// Replaces the review template.
    #[must_use]
    pub fn with_semantic_review(mut self, template: PromptTemplate) -> Self {
        self.semantic_review = template;
        self
    }

    /// Replaces the correction template.
    #[must_use]
    pub fn with_correction(mut self, template: PromptTemplate) -> Self {
        self.correction = template;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::variables;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_placeholders() {
        let set = PromptSet::default();
        assert_eq!(
            set.correction.placeholders(),
            vec!["candidate".to_string(), "findings".to_string()]
        );
        assert_eq!(
            set.semantic_review.placeholders(),
            vec!["candidate", "requirement_name", "review_marker", "scope", "stage", "target_rows"]
        );
        assert!(set.cosmic_table.placeholders().contains(&"events_json".to_string()));
        assert!(!set.trigger_events.placeholders().contains(&"requirement".to_string()));
    }

    #[test]
    fn test_json_example_is_literal() {
        let rendered = PromptSet::default()
            .correction
            .render(&variables([("findings", "- x"), ("candidate", "| a |")]))
            .unwrap();
        assert!(rendered.user.starts_with("The previous output"));
        assert!(rendered.user.contains("| a |"));
    }
}
