//! The deterministic rule validator.
//!
//! Every check here is a pure function of the candidate, the validation
//! context and the [`RuleSetConfig`], so the same input always yields the
//! same findings in the same order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::autofix::{has_markup, normalize_attributes, strip_markup, AutoFix};
use super::finding::{Finding, Location};
use super::{ValidationContext, Validator};
use crate::core::{Candidate, Column, CosmicTable, MovementType, TriggerOutline};

/// Rule set parameters. Shared read-only by every batch of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetConfig {
    /// Fewest processes per trigger event.
    #[serde(default = "default_min_processes_per_event")]
    pub min_processes_per_event: usize,
    /// Most processes per trigger event.
    #[serde(default = "default_max_processes_per_event")]
    pub max_processes_per_event: usize,
    /// Most trigger events per functional user requirement.
    #[serde(default = "default_max_events_per_requirement")]
    pub max_events_per_requirement: usize,
    /// The total process count must be at least `target_rows / this`.
    #[serde(default = "default_process_lower_divisor")]
    pub process_lower_divisor: f64,
    /// The total process count must be at most `target_rows / this`.
    #[serde(default = "default_process_upper_divisor")]
    pub process_upper_divisor: f64,
    /// Longest functional user requirement name, in characters.
    #[serde(default = "default_max_name_chars")]
    pub max_name_chars: usize,
    /// Terms a process description must not contain.
    #[serde(default = "default_forbidden_process_terms")]
    pub forbidden_process_terms: Vec<String>,
    /// Terms a sub-process description must not contain.
    #[serde(default = "default_forbidden_subprocess_terms")]
    pub forbidden_subprocess_terms: Vec<String>,
    /// Fewest attributes per row.
    #[serde(default = "default_min_attributes")]
    pub min_attributes: usize,
    /// Most attributes per row.
    #[serde(default = "default_max_attributes")]
    pub max_attributes: usize,
    /// Fewest rows per functional process.
    #[serde(default = "default_min_rows_per_process")]
    pub min_rows_per_process: usize,
    /// Most rows per functional process.
    #[serde(default = "default_max_rows_per_process")]
    pub max_rows_per_process: usize,
    /// Longest run of consecutive Read rows within a process.
    #[serde(default = "default_max_consecutive_reads")]
    pub max_consecutive_reads: usize,
    /// Cells whose value is fixed.
    #[serde(default = "default_fixed_cells")]
    pub fixed_cells: BTreeMap<Column, String>,
}

fn default_min_processes_per_event() -> usize {
    1
}

fn default_max_processes_per_event() -> usize {
    6
}

fn default_max_events_per_requirement() -> usize {
    6
}

fn default_process_lower_divisor() -> f64 {
    3.3
}

fn default_process_upper_divisor() -> f64 {
    2.5
}

fn default_max_name_chars() -> usize {
    40
}

fn default_forbidden_process_terms() -> Vec<String> {
    vec!["校验".to_string()]
}

fn default_forbidden_subprocess_terms() -> Vec<String> {
    ["临时表", "内存", "缓存", "校验", "解析", "日志"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_min_attributes() -> usize {
    2
}

fn default_max_attributes() -> usize {
    15
}

fn default_min_rows_per_process() -> usize {
    2
}

fn default_max_rows_per_process() -> usize {
    5
}

fn default_max_consecutive_reads() -> usize {
    2
}

fn default_fixed_cells() -> BTreeMap<Column, String> {
    BTreeMap::from([
        (Column::Reuse, "新增".to_string()),
        (Column::Cfp, "1".to_string()),
        (Column::TotalCfp, "1".to_string()),
    ])
}

impl Default for RuleSetConfig {
    fn default() -> Self {
        Self {
            min_processes_per_event: default_min_processes_per_event(),
            max_processes_per_event: default_max_processes_per_event(),
            max_events_per_requirement: default_max_events_per_requirement(),
            process_lower_divisor: default_process_lower_divisor(),
            process_upper_divisor: default_process_upper_divisor(),
            max_name_chars: default_max_name_chars(),
            forbidden_process_terms: default_forbidden_process_terms(),
            forbidden_subprocess_terms: default_forbidden_subprocess_terms(),
            min_attributes: default_min_attributes(),
            max_attributes: default_max_attributes(),
            min_rows_per_process: default_min_rows_per_process(),
            max_rows_per_process: default_max_rows_per_process(),
            max_consecutive_reads: default_max_consecutive_reads(),
            fixed_cells: default_fixed_cells(),
        }
    }
}

impl RuleSetConfig {
    /// Creates the default rule set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allowed total process count for a target row count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn process_range(&self, target_rows: usize) -> (usize, usize) {
        let rows = target_rows as f64;
        let lower = (rows / self.process_lower_divisor).floor().max(0.0) as usize;
        let upper = (rows / self.process_upper_divisor).floor().max(0.0) as usize;
        (lower.max(1), upper.max(lower.max(1)))
    }

    /// Checks that the bounds are consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_processes_per_event == 0 || self.min_processes_per_event > self.max_processes_per_event {
            return Err("processes per event: need 1 <= min <= max".to_string());
        }
        if self.min_attributes > self.max_attributes {
            return Err("attributes per row: min exceeds max".to_string());
        }
        if self.min_rows_per_process == 0 || self.min_rows_per_process > self.max_rows_per_process {
            return Err("rows per process: need 1 <= min <= max".to_string());
        }
        if self.process_upper_divisor <= 0.0 || self.process_lower_divisor < self.process_upper_divisor {
            return Err("process divisors: need lower >= upper > 0".to_string());
        }
        Ok(())
    }
}

/// Checks candidates against the rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleValidator {
    config: RuleSetConfig,
}

impl RuleValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(config: RuleSetConfig) -> Self {
        Self { config }
    }

    /// The rule set in use.
    #[must_use]
    pub fn config(&self) -> &RuleSetConfig {
        &self.config
    }

    /// Runs every rule for the candidate's stage.
    #[must_use]
    pub fn check(&self, candidate: &Candidate, ctx: &ValidationContext) -> Vec<Finding> {
        match candidate {
            Candidate::Outline(outline) => self.check_outline(outline, ctx),
            Candidate::Table(table) => self.check_table(table, ctx),
        }
    }

    fn check_outline(&self, outline: &TriggerOutline, ctx: &ValidationContext) -> Vec<Finding> {
        let cfg = &self.config;
        let mut findings = Vec::new();

        if outline.events.is_empty() {
            findings.push(
                Finding::logic("outline.empty", Location::Artifact, "No trigger events were produced")
                    .with_suggestion("List the trigger events of the requirement with their processes"),
            );
            return findings;
        }

        if outline.has_missing_ids() {
            findings.push(Finding::syntax(
                "outline.missing_ids",
                Location::Artifact,
                "Some trigger events or processes have no id",
                AutoFix::AssignOutlineIds,
            ));
        }

        let untrimmed = outline.events.iter().any(|e| {
            e.name.trim() != e.name
                || e.user_requirement.trim() != e.user_requirement
                || e.functional_processes.iter().any(|p| p.description.trim() != p.description)
        });
        if untrimmed {
            findings.push(Finding::syntax(
                "outline.whitespace",
                Location::Artifact,
                "Names or descriptions have surrounding whitespace",
                AutoFix::TrimOutlineText,
            ));
        }

        let mut event_ids = HashSet::new();
        let mut process_ids = HashSet::new();
        let mut descriptions: HashMap<&str, usize> = HashMap::new();
        let mut per_requirement: BTreeMap<&str, usize> = BTreeMap::new();

        for (i, event) in outline.events.iter().enumerate() {
            let at = Location::Event { index: i };
            let id = event.id.trim();
            if !id.is_empty() && !event_ids.insert(id) {
                findings.push(Finding::logic(
                    "outline.duplicate_id",
                    at.clone(),
                    format!("Trigger event id '{id}' is used more than once"),
                ));
            }
            if event.name.trim().is_empty() {
                findings.push(Finding::logic("outline.event_name", at.clone(), "Trigger event has no name"));
            }
            let requirement = event.user_requirement.trim();
            if !requirement.is_empty() {
                *per_requirement.entry(requirement).or_default() += 1;
                if requirement.chars().count() > cfg.max_name_chars {
                    findings.push(Finding::logic(
                        "outline.name_length",
                        at.clone(),
                        format!(
                            "Functional user requirement '{requirement}' is longer than {} characters",
                            cfg.max_name_chars
                        ),
                    ));
                }
            }

            let count = event.process_count();
            if count < cfg.min_processes_per_event || count > cfg.max_processes_per_event {
                findings.push(
                    Finding::logic(
                        "outline.processes_per_event",
                        at.clone(),
                        format!(
                            "Trigger event '{}' has {count} functional processes, expected {}..={}",
                            event.name, cfg.min_processes_per_event, cfg.max_processes_per_event
                        ),
                    )
                    .with_suggestion("Split or merge trigger events so each has a valid process count"),
                );
            }

            for (j, process) in event.functional_processes.iter().enumerate() {
                let at = Location::Process { event: i, process: j };
                let pid = process.id.trim();
                if !pid.is_empty() && !process_ids.insert(pid) {
                    findings.push(Finding::logic(
                        "outline.duplicate_id",
                        at.clone(),
                        format!("Functional process id '{pid}' is used more than once"),
                    ));
                }
                let description = process.description.trim();
                if description.is_empty() {
                    findings.push(Finding::logic("outline.process_name", at, "Functional process has no description"));
                    continue;
                }
                if let Some(term) = cfg.forbidden_process_terms.iter().find(|t| description.contains(t.as_str())) {
                    findings.push(
                        Finding::logic(
                            "outline.forbidden_term",
                            at.clone(),
                            format!("Functional process '{description}' contains '{term}'"),
                        )
                        .with_suggestion("Fold checks into the process they belong to"),
                    );
                }
                let seen = descriptions.entry(description).or_default();
                *seen += 1;
                if *seen == 2 {
                    findings.push(Finding::logic(
                        "outline.duplicate_process",
                        at,
                        format!("Functional process '{description}' appears more than once"),
                    ));
                }
            }
        }

        for (requirement, events) in per_requirement {
            if events > cfg.max_events_per_requirement {
                findings.push(Finding::logic(
                    "outline.events_per_requirement",
                    Location::Described {
                        text: requirement.to_string(),
                    },
                    format!(
                        "Functional user requirement '{requirement}' has {events} trigger events, at most {} allowed",
                        cfg.max_events_per_requirement
                    ),
                ));
            }
        }

        let (lower, upper) = cfg.process_range(ctx.target_rows);
        let total = outline.process_count();
        if total < lower || total > upper {
            findings.push(
                Finding::logic(
                    "outline.process_total",
                    Location::Artifact,
                    format!(
                        "{total} functional processes for a target of {} rows, expected {lower}..={upper}",
                        ctx.target_rows
                    ),
                )
                .with_suggestion(if total < lower {
                    "Identify additional functional processes"
                } else {
                    "Merge closely related functional processes"
                }),
            );
        }

        findings
    }

    fn check_table(&self, table: &CosmicTable, ctx: &ValidationContext) -> Vec<Finding> {
        let cfg = &self.config;
        let mut findings = Vec::new();

        if table.is_empty() {
            findings.push(
                Finding::logic("table.empty", Location::Artifact, "The table has no rows")
                    .with_suggestion("Produce the data movement rows for every process of the batch"),
            );
            return findings;
        }

        let mut attribute_sets: HashMap<Vec<String>, usize> = HashMap::new();

        for (i, row) in table.rows.iter().enumerate() {
            let cell = |column| Location::Cell { row: i, column };

            for column in Column::ALL {
                if column != Column::MovementType && has_markup(row.get(column)) {
                    findings.push(Finding::syntax(
                        "table.markup",
                        cell(column),
                        format!("{column} contains markup"),
                        AutoFix::StripMarkup { row: i, column },
                    ));
                }
            }

            if !ctx.requirement_name.is_empty() && row.get(Column::CustomerRequirement) != ctx.requirement_name {
                findings.push(Finding::syntax(
                    "table.customer_requirement",
                    cell(Column::CustomerRequirement),
                    format!(
                        "Customer requirement is '{}', expected '{}'",
                        row.get(Column::CustomerRequirement),
                        ctx.requirement_name
                    ),
                    AutoFix::SetCell {
                        row: i,
                        column: Column::CustomerRequirement,
                        value: ctx.requirement_name.clone(),
                    },
                ));
            }

            for (&column, value) in &cfg.fixed_cells {
                if row.get(column) != value && !has_markup(row.get(column)) {
                    findings.push(Finding::syntax(
                        "table.fixed_value",
                        cell(column),
                        format!("{column} must be '{value}'"),
                        AutoFix::SetCell {
                            row: i,
                            column,
                            value: value.clone(),
                        },
                    ));
                }
            }

            for column in [
                Column::FunctionalUser,
                Column::UserRequirement,
                Column::TriggerEvent,
                Column::FunctionalProcess,
            ] {
                if row.get(column).is_empty() {
                    findings.push(Finding::logic("table.required", cell(column), format!("{column} is empty")));
                }
            }

            let raw_type = row.get(Column::MovementType);
            if row.movement_type().is_none() {
                match lenient_type(raw_type) {
                    Some(to) => findings.push(Finding::syntax(
                        "table.movement_alias",
                        cell(Column::MovementType),
                        format!("Movement type '{raw_type}' is not a code"),
                        AutoFix::CoerceMovementType { row: i, to },
                    )),
                    None => findings.push(
                        Finding::logic(
                            "table.movement_type",
                            cell(Column::MovementType),
                            format!("Unknown data movement type '{raw_type}'"),
                        )
                        .with_suggestion("Use one of E, X, R, W"),
                    ),
                }
            }

            if row.get(Column::DataGroup).is_empty() {
                findings.push(Finding::logic("table.data_group", cell(Column::DataGroup), "Data group is empty"));
            }

            let raw_attributes = row.get(Column::DataAttributes);
            if raw_attributes.is_empty() {
                findings.push(Finding::logic(
                    "table.data_attributes",
                    cell(Column::DataAttributes),
                    "Data attributes are empty",
                ));
            } else {
                if normalize_attributes(raw_attributes) != raw_attributes && !has_markup(raw_attributes) {
                    findings.push(Finding::syntax(
                        "table.attribute_separator",
                        cell(Column::DataAttributes),
                        "Data attributes are not separated canonically",
                        AutoFix::NormalizeAttributes { row: i },
                    ));
                }
                let mut attributes = row.attributes();
                let count = attributes.len();
                if count < cfg.min_attributes || count > cfg.max_attributes {
                    findings.push(Finding::logic(
                        "table.attribute_count",
                        cell(Column::DataAttributes),
                        format!(
                            "{count} data attributes, expected {}..={}",
                            cfg.min_attributes, cfg.max_attributes
                        ),
                    ));
                }
                attributes.sort();
                if let Some(&first) = attribute_sets.get(&attributes) {
                    findings.push(
                        Finding::logic(
                            "table.duplicate_attributes",
                            Location::Row { row: i },
                            format!("Data attributes repeat those of row {}", first + 1),
                        )
                        .with_suggestion("Give each data movement its own attribute set"),
                    );
                } else {
                    attribute_sets.insert(attributes, i);
                }
            }

            let sub_process = row.get(Column::SubProcess);
            if sub_process.is_empty() {
                findings.push(Finding::logic("table.sub_process", cell(Column::SubProcess), "Sub-process description is empty"));
            } else {
                if sub_process == row.get(Column::FunctionalProcess) {
                    findings.push(Finding::logic(
                        "table.sub_process_name",
                        cell(Column::SubProcess),
                        "Sub-process description repeats the functional process name",
                    ));
                }
                if let Some(term) = cfg.forbidden_subprocess_terms.iter().find(|t| sub_process.contains(t.as_str())) {
                    findings.push(Finding::logic(
                        "table.forbidden_term",
                        cell(Column::SubProcess),
                        format!("Sub-process '{sub_process}' describes internal processing ('{term}')"),
                    ));
                }
            }
        }

        self.check_process_groups(table, &mut findings);
        if let Some(ref batch) = ctx.batch {
            check_batch_scope(table, batch, &mut findings);
        }
        findings
    }

    fn check_process_groups(&self, table: &CosmicTable, findings: &mut Vec<Finding>) {
        let cfg = &self.config;
        for group in table.process_groups() {
            let at = || Location::ProcessRows {
                trigger_event: group.trigger_event.clone(),
                process: group.process.clone(),
            };
            let kinds: Vec<Option<MovementType>> = group
                .rows
                .iter()
                .map(|&r| lenient_type(table.rows[r].get(Column::MovementType)))
                .collect();

            let rows = group.rows.len();
            if rows < cfg.min_rows_per_process || rows > cfg.max_rows_per_process {
                findings.push(Finding::logic(
                    "process.row_count",
                    at(),
                    format!(
                        "{rows} rows, expected {}..={}",
                        cfg.min_rows_per_process, cfg.max_rows_per_process
                    ),
                ));
            }

            if !kinds
                .iter()
                .any(|k| matches!(k, Some(MovementType::Entry | MovementType::Exit)))
            {
                findings.push(Finding::logic("process.entry_or_exit", at(), "No Entry or Exit movement"));
            }
            if let Some(Some(first)) = kinds.first() {
                if *first != MovementType::Entry {
                    findings.push(
                        Finding::logic("process.first_entry", at(), format!("Starts with {first}, expected E"))
                            .with_suggestion("Begin with the Entry that triggers the process"),
                    );
                }
            }
            if let Some(Some(last)) = kinds.last() {
                if !last.is_output() {
                    findings.push(
                        Finding::logic("process.last_output", at(), format!("Ends with {last}, expected X or W"))
                            .with_suggestion("End with the Exit or Write that completes the process"),
                    );
                }
            }

            let mut run = 0;
            let mut longest = 0;
            for kind in &kinds {
                run = if *kind == Some(MovementType::Read) { run + 1 } else { 0 };
                longest = longest.max(run);
            }
            if longest > cfg.max_consecutive_reads {
                findings.push(Finding::logic(
                    "process.consecutive_reads",
                    at(),
                    format!("{longest} consecutive Read rows, at most {}", cfg.max_consecutive_reads),
                ));
            }

            let mut inputs = HashSet::new();
            let mut outputs = HashSet::new();
            for (&r, kind) in group.rows.iter().zip(&kinds) {
                let data_group = table.rows[r].get(Column::DataGroup);
                match kind {
                    Some(MovementType::Entry) => {
                        inputs.insert(data_group);
                    }
                    Some(k) if k.is_output() => {
                        outputs.insert(data_group);
                    }
                    _ => {}
                }
            }
            let mut shared: Vec<&&str> = inputs.intersection(&outputs).filter(|g| !g.is_empty()).collect();
            shared.sort();
            for data_group in shared {
                findings.push(Finding::logic(
                    "process.group_in_and_out",
                    at(),
                    format!("Data group '{data_group}' is both an Entry input and an output"),
                ));
            }
        }
    }
}

fn lenient_type(raw: &str) -> Option<MovementType> {
    MovementType::from_alias(&strip_markup(raw))
}

fn check_batch_scope(table: &CosmicTable, batch: &super::BatchScope, findings: &mut Vec<Finding>) {
    let mut expected: HashSet<(&str, &str)> = HashSet::new();
    for event in &batch.events {
        for process in &event.functional_processes {
            expected.insert((event.name.as_str(), process.description.as_str()));
        }
    }

    let mut covered = HashSet::new();
    for (i, row) in table.rows.iter().enumerate() {
        let key = row.process_key();
        if expected.contains(&key) {
            covered.insert(key);
        } else if !key.0.is_empty() && !key.1.is_empty() {
            findings.push(
                Finding::logic(
                    "batch.foreign_process",
                    Location::Row { row: i },
                    format!("Process '{}' of '{}' is not part of this batch", key.1, key.0),
                )
                .with_suggestion("Use the trigger event and process names exactly as given"),
            );
        }
    }

    for event in &batch.events {
        for process in &event.functional_processes {
            if !covered.contains(&(event.name.as_str(), process.description.as_str())) {
                findings.push(Finding::logic(
                    "batch.missing_process",
                    Location::ProcessRows {
                        trigger_event: event.name.clone(),
                        process: process.description.clone(),
                    },
                    format!("Process '{}' has no rows", process.description),
                ));
            }
        }
    }

    let actual = table.len();
    if actual.abs_diff(batch.predicted_rows) > batch.tolerance_rows {
        findings.push(
            Finding::logic(
                "batch.completeness",
                Location::Artifact,
                format!(
                    "{actual} rows generated, about {} expected (±{})",
                    batch.predicted_rows, batch.tolerance_rows
                ),
            )
            .as_advisory(),
        );
    }
}

#[async_trait]
impl Validator for RuleValidator {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn deterministic(&self) -> bool {
        true
    }

    async fn validate(&self, candidate: &Candidate, ctx: &ValidationContext) -> Vec<Finding> {
        self.check(candidate, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CosmicRow, FunctionalProcess, PipelineStage, TriggerEvent};
    use crate::validation::{BatchScope, Severity};

    fn ctx() -> ValidationContext {
        ValidationContext::new(PipelineStage::CosmicTable, "订单系统", 40)
    }

    fn row(process: &str, kind: &str, group: &str, attrs: &str) -> CosmicRow {
        CosmicRow::new()
            .with(Column::CustomerRequirement, "订单系统")
            .with(Column::FunctionalUser, "发起者：客户\n接收者：订单系统")
            .with(Column::UserRequirement, "订单管理")
            .with(Column::TriggerEvent, "客户下单")
            .with(Column::FunctionalProcess, process)
            .with(Column::SubProcess, format!("{process}-{kind}"))
            .with(Column::MovementType, kind)
            .with(Column::DataGroup, group)
            .with(Column::DataAttributes, attrs)
            .with(Column::Reuse, "新增")
            .with(Column::Cfp, "1")
            .with(Column::TotalCfp, "1")
    }

    fn good_table() -> CosmicTable {
        CosmicTable::new(vec![
            row("创建订单", "E", "下单请求", "订单号、金额"),
            row("创建订单", "R", "商品信息", "商品号、库存"),
            row("创建订单", "W", "订单记录", "订单号、状态"),
        ])
    }

    fn codes(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.code.as_str()).collect()
    }

    #[test]
    fn test_valid_table_has_no_findings() {
        let findings = RuleValidator::default().check(&Candidate::Table(good_table()), &ctx());
        assert!(findings.is_empty(), "{findings:?}");
    }

    #[test]
    fn test_alias_and_separator_are_syntax() {
        let mut table = good_table();
        table.rows[0].set(Column::MovementType, "Entry");
        table.rows[1].set(Column::DataAttributes, "商品号, 库存");
        let findings = RuleValidator::default().check(&Candidate::Table(table), &ctx());
        assert_eq!(codes(&findings), vec!["table.movement_alias", "table.attribute_separator"]);
        assert!(findings.iter().all(|f| f.severity == Severity::Syntax && f.auto_fix.is_some()));
    }

    #[test]
    fn test_unknown_type_and_empty_group_are_logic() {
        let mut table = good_table();
        table.rows[1].set(Column::MovementType, "Q");
        table.rows[2].set(Column::DataGroup, "");
        let findings = RuleValidator::default().check(&Candidate::Table(table), &ctx());
        assert!(codes(&findings).contains(&"table.movement_type"));
        assert!(codes(&findings).contains(&"table.data_group"));
        assert!(findings.iter().all(|f| f.severity == Severity::Logic));
    }

    #[test]
    fn test_fixed_cells_and_requirement_name() {
        let mut table = good_table();
        table.rows[0].set(Column::Reuse, "复用");
        table.rows[0].set(Column::CustomerRequirement, "别的系统");
        let findings = RuleValidator::default().check(&Candidate::Table(table), &ctx());
        assert_eq!(codes(&findings), vec!["table.customer_requirement", "table.fixed_value"]);
    }

    #[test]
    fn test_process_shape_rules() {
        let table = CosmicTable::new(vec![
            row("查询订单", "R", "订单记录", "订单号、状态"),
            row("查询订单", "R", "商品信息", "商品号、名称"),
            row("查询订单", "R", "物流信息", "运单号、状态"),
            row("查询订单", "R", "支付信息", "流水号、金额"),
        ]);
        let findings = RuleValidator::default().check(&Candidate::Table(table), &ctx());
        let codes = codes(&findings);
        assert!(codes.contains(&"process.entry_or_exit"));
        assert!(codes.contains(&"process.first_entry"));
        assert!(codes.contains(&"process.last_output"));
        assert!(codes.contains(&"process.consecutive_reads"));
    }

    #[test]
    fn test_duplicate_attributes_and_shared_group() {
        let table = CosmicTable::new(vec![
            row("创建订单", "E", "订单", "订单号、金额"),
            row("创建订单", "X", "订单", "金额、订单号"),
        ]);
        let findings = RuleValidator::default().check(&Candidate::Table(table), &ctx());
        let codes = codes(&findings);
        assert!(codes.contains(&"table.duplicate_attributes"));
        assert!(codes.contains(&"process.group_in_and_out"));
    }

    #[test]
    fn test_batch_scope_cross_check_and_completeness() {
        let events = vec![TriggerEvent::new("TE-1", "客户下单")
            .with_process(FunctionalProcess::new("FP-1.1", "创建订单"))
            .with_process(FunctionalProcess::new("FP-1.2", "修改订单"))];
        let scope = BatchScope {
            index: 0,
            events,
            predicted_rows: 6,
            tolerance_rows: 1,
        };
        let ctx = ctx().with_batch(scope);
        let findings = RuleValidator::default().check(&Candidate::Table(good_table()), &ctx);
        let missing = findings.iter().find(|f| f.code == "batch.missing_process").unwrap();
        assert!(missing.message.contains("修改订单"));
        let completeness = findings.iter().find(|f| f.code == "batch.completeness").unwrap();
        assert!(completeness.advisory);
    }

    #[test]
    fn test_outline_rules() {
        let outline = TriggerOutline::new(vec![
            TriggerEvent::new("", "客户下单 ")
                .with_process(FunctionalProcess::new("", "创建订单"))
                .with_process(FunctionalProcess::new("", "订单校验")),
            TriggerEvent::new("", "客户撤单").with_process(FunctionalProcess::new("", "创建订单")),
        ]);
        let ctx = ValidationContext::new(PipelineStage::TriggerEvents, "订单系统", 40);
        let findings = RuleValidator::default().check(&Candidate::Outline(outline), &ctx);
        assert_eq!(
            codes(&findings),
            vec![
                "outline.missing_ids",
                "outline.whitespace",
                "outline.forbidden_term",
                "outline.duplicate_process",
                "outline.process_total",
            ]
        );
    }

    #[test]
    fn test_empty_outline() {
        let ctx = ValidationContext::new(PipelineStage::TriggerEvents, "x", 40);
        let findings = RuleValidator::default().check(&Candidate::Outline(TriggerOutline::default()), &ctx);
        assert_eq!(codes(&findings), vec!["outline.empty"]);
    }

    #[test]
    fn test_process_range() {
        let cfg = RuleSetConfig::default();
        assert_eq!(cfg.process_range(40), (12, 16));
        assert_eq!(cfg.process_range(1), (1, 1));
        assert!(cfg.validate().is_ok());
        let bad = RuleSetConfig {
            min_attributes: 9,
            max_attributes: 3,
            ..RuleSetConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
