//! Candidate extraction from raw completions.
//!
//! Stage 1 completions carry a JSON object somewhere in free text (often in a
//! fenced block). Stage 2 completions carry a markdown table. Both are parsed
//! leniently: the artifact is located first, then decoded, and what cannot be
//! decoded becomes a [`CodecError`] that the correction loop turns into a
//! logic finding.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::core::{Candidate, Column, CosmicRow, CosmicTable, PipelineStage, TriggerEvent, TriggerOutline};
use crate::errors::CodecError;
use crate::validation::{Finding, FindingSource, Location};

/// Decodes a completion into the candidate type of `stage`.
pub fn decode(stage: PipelineStage, text: &str) -> Result<Candidate, CodecError> {
    match stage {
        PipelineStage::TriggerEvents => parse_outline(text).map(Candidate::Outline),
        PipelineStage::CosmicTable => parse_table(text).map(Candidate::Table),
    }
}

/// Converts an extraction failure into the finding that re-prompts the model.
#[must_use]
pub fn extraction_finding(error: &CodecError) -> Finding {
    let (code, suggestion) = match error {
        CodecError::NoJson | CodecError::InvalidJson(_) => (
            "codec.json",
            "Output one JSON object with a trigger_events array",
        ),
        CodecError::NoTable => (
            "codec.table",
            "Output one markdown table with the twelve standard columns",
        ),
        CodecError::MissingColumns(_) => (
            "codec.columns",
            "Use exactly the twelve standard column headers",
        ),
    };
    Finding::logic(code, Location::Artifact, error.to_string())
        .with_suggestion(suggestion)
        .from_source(FindingSource::Codec)
}

/// Finds the first complete JSON value starting at the first `open` bracket.
fn first_json_value(text: &str, open: char) -> Option<Result<Value, serde_json::Error>> {
    let start = text.find(open)?;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    stream.next()
}

/// Extracts the first JSON array in `text`.
#[must_use]
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    match first_json_value(text, '[')? {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Parses a stage 1 completion.
///
/// Accepts either `{"trigger_events": [...]}` (also `events`) or the nested
/// `{"functional_user_requirements": [{"requirement", "trigger_events"}]}`
/// layout, which is flattened with each event tagged by its requirement.
pub fn parse_outline(text: &str) -> Result<TriggerOutline, CodecError> {
    let value = first_json_value(text, '{')
        .ok_or(CodecError::NoJson)?
        .map_err(|e| CodecError::InvalidJson(e.to_string()))?;

    if let Some(requirements) = value.get("functional_user_requirements") {
        let requirements = requirements
            .as_array()
            .ok_or_else(|| CodecError::InvalidJson("functional_user_requirements is not an array".into()))?;
        let mut events = Vec::new();
        for requirement in requirements {
            let name = requirement
                .get("requirement")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let nested = requirement
                .get("trigger_events")
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            let parsed: Vec<TriggerEvent> =
                serde_json::from_value(nested).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
            events.extend(parsed.into_iter().map(|mut event| {
                if event.user_requirement.is_empty() {
                    event.user_requirement.clone_from(&name);
                }
                event
            }));
        }
        return Ok(TriggerOutline::new(events));
    }

    if value.get("trigger_events").is_some() || value.get("events").is_some() {
        return serde_json::from_value(value).map_err(|e| CodecError::InvalidJson(e.to_string()));
    }

    Err(CodecError::InvalidJson(
        "expected a trigger_events or functional_user_requirements array".to_string(),
    ))
}

static SEPARATOR_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-{2,}:?\s*(\|\s*:?-{2,}:?\s*)*\|?$").expect("separator pattern is valid")
});

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("line break pattern is valid"));

fn split_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner
        .split('|')
        .map(|cell| LINE_BREAK.replace_all(cell.trim(), "\n").into_owned())
        .collect()
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

/// Parses the first markdown table of a stage 2 completion.
///
/// Headers may be Chinese or English. Repeated header and separator rows
/// inside the body are skipped, as are rows with no content.
pub fn parse_table(text: &str) -> Result<CosmicTable, CodecError> {
    let lines: Vec<&str> = text.lines().collect();
    let header_at = lines
        .windows(2)
        .position(|pair| is_table_line(pair[0]) && SEPARATOR_ROW.is_match(pair[1].trim()))
        .ok_or(CodecError::NoTable)?;

    let header = split_cells(lines[header_at]);
    let mapping: Vec<Option<Column>> = header.iter().map(|h| Column::from_header(h)).collect();
    let missing: Vec<String> = Column::ALL
        .into_iter()
        .filter(|c| !mapping.contains(&Some(*c)))
        .map(|c| c.header().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CodecError::MissingColumns(missing));
    }

    let mut rows = Vec::new();
    for line in lines[header_at + 2..].iter().take_while(|l| is_table_line(l)) {
        if SEPARATOR_ROW.is_match(line.trim()) {
            continue;
        }
        let cells = split_cells(line);
        if cells.iter().all(String::is_empty) {
            continue;
        }
        let repeated_header = cells
            .iter()
            .zip(&mapping)
            .all(|(cell, column)| column.map_or(true, |c| Column::from_header(cell) == Some(c)));
        if repeated_header {
            continue;
        }
        let mut row = CosmicRow::new();
        for (cell, column) in cells.into_iter().zip(&mapping) {
            if let Some(column) = column {
                row.set(*column, cell);
            }
        }
        rows.push(row);
    }

    Ok(CosmicTable::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MovementType;
    use pretty_assertions::assert_eq;

    const TABLE: &str = "下面是结果：\n\n\
| 客户需求 | 功能用户 | 功能用户需求 | 触发事件 | 功能过程 | 子过程描述 | 数据移动类型 | 数据组 | 数据属性 | 复用度 | CFP | ΣCFP |\n\
|---|---|---|---|---|---|---|---|---|---|---|---|\n\
| 订单系统 | 发起者：客户<br>接收者：系统 | 订单管理 | 客户下单 | 创建订单 | 接收下单请求 | E | 订单请求 | 订单号、金额 | 新增 | 1 | 1 |\n\
| 订单系统 | 发起者：客户<br>接收者：系统 | 订单管理 | 客户下单 | 创建订单 | 返回下单结果 | X | 下单结果 | 结果码、说明 | 新增 | 1 | 1 |\n\
\n以上共 2 行。";

    #[test]
    fn test_parse_table_with_surrounding_prose() {
        let table = parse_table(TABLE).unwrap();
        assert_eq!(table.len(), 2);
        let row = &table.rows[0];
        assert_eq!(row.get(Column::FunctionalUser), "发起者：客户\n接收者：系统");
        assert_eq!(row.movement_type(), Some(MovementType::Entry));
        assert_eq!(table.rows[1].get(Column::TotalCfp), "1");
    }

    #[test]
    fn test_parse_table_round_trips_rendering() {
        let table = parse_table(TABLE).unwrap();
        let again = parse_table(&table.to_markdown()).unwrap();
        assert_eq!(again, table);
    }

    #[test]
    fn test_parse_table_english_headers_and_repeated_header() {
        let text = "| Customer Requirement | Functional User | Functional User Requirement | Trigger Event | Functional Process | Sub-process | Data Movement Type | Data Group | Data Attributes | Reuse | CFP | Total CFP |\n\
| :-- | --- | --- | --- | --- | --- | --- | --- | --- | --- | --- | --- |\n\
| r | u | q | t | p | s | Entry | g | a、b | 新增 | 1 | 1 |\n\
| Customer Requirement | Functional User | Functional User Requirement | Trigger Event | Functional Process | Sub-process | Data Movement Type | Data Group | Data Attributes | Reuse | CFP | Total CFP |\n\
| --- | --- | --- | --- | --- | --- | --- | --- | --- | --- | --- | --- |\n\
| r | u | q | t | p | s2 | X | g2 | c、d | 新增 | 1 | 1 |";
        let table = parse_table(text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].get(Column::MovementType), "Entry");
        assert_eq!(table.rows[1].get(Column::SubProcess), "s2");
    }

    #[test]
    fn test_parse_table_reports_missing_columns() {
        let text = "| 客户需求 | 数据组 |\n|---|---|\n| a | b |";
        match parse_table(text) {
            Err(CodecError::MissingColumns(missing)) => {
                assert_eq!(missing.len(), 10);
                assert!(missing.contains(&"数据移动类型".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_table_without_table() {
        assert_eq!(parse_table("no table here"), Err(CodecError::NoTable));
    }

    #[test]
    fn test_parse_outline_fenced_flat() {
        let text = "Here you go:\n```json\n{\"trigger_events\": [{\"id\": \"TE-1\", \"name\": \"客户下单\", \"functional_processes\": [\"创建订单\", {\"id\": \"FP-1.2\", \"description\": \"取消订单\"}]}]}\n```\nDone {ok}";
        let outline = parse_outline(text).unwrap();
        assert_eq!(outline.events.len(), 1);
        assert_eq!(outline.process_count(), 2);
        assert_eq!(outline.events[0].functional_processes[0].id, "");
        assert_eq!(outline.events[0].functional_processes[1].id, "FP-1.2");
    }

    #[test]
    fn test_parse_outline_nested_requirements() {
        let text = r#"{"functional_user_requirements": [
            {"requirement": "订单管理", "trigger_events": [
                {"event": "客户下单", "functional_processes": ["创建订单"]},
                {"event": "客户撤单", "functional_processes": ["取消订单", "退款登记"]}
            ]},
            {"requirement": "商品管理", "trigger_events": [
                {"event": "商家上架", "functional_processes": ["新增商品"]}
            ]}
        ]}"#;
        let outline = parse_outline(text).unwrap();
        assert_eq!(outline.events.len(), 3);
        assert_eq!(outline.events[1].name, "客户撤单");
        assert_eq!(outline.events[1].user_requirement, "订单管理");
        assert_eq!(outline.events[2].user_requirement, "商品管理");
        assert_eq!(outline.process_count(), 4);
    }

    #[test]
    fn test_parse_outline_errors() {
        assert_eq!(parse_outline("nothing"), Err(CodecError::NoJson));
        assert!(matches!(parse_outline("{\"other\": 1}"), Err(CodecError::InvalidJson(_))));
        assert!(matches!(parse_outline("{\"trigger_events\": 3"), Err(CodecError::InvalidJson(_))));
    }

    #[test]
    fn test_extract_json_array() {
        let items = extract_json_array("Findings:\n[{\"message\": \"x\"}] trailing").unwrap();
        assert_eq!(items.len(), 1);
        assert!(extract_json_array("none").is_none());
    }

    #[test]
    fn test_extraction_finding_is_logic() {
        let finding = extraction_finding(&CodecError::NoTable);
        assert_eq!(finding.severity, crate::validation::Severity::Logic);
        assert_eq!(finding.source, FindingSource::Codec);
        assert!(finding.suggested_fix.is_some());
    }
}
