//! COSMIC table rows and columns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::model::{DataMovement, MovementType};
use super::outline::TriggerOutline;

/// Characters accepted between data attributes.
pub const ATTRIBUTE_SEPARATORS: &[char] = &['、', '，', ',', ';', '；'];

/// The twelve columns of a COSMIC table, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    /// 客户需求
    CustomerRequirement,
    /// 功能用户
    FunctionalUser,
    /// 功能用户需求
    UserRequirement,
    /// 触发事件
    TriggerEvent,
    /// 功能过程
    FunctionalProcess,
    /// 子过程描述
    SubProcess,
    /// 数据移动类型
    MovementType,
    /// 数据组
    DataGroup,
    /// 数据属性
    DataAttributes,
    /// 复用度
    Reuse,
    /// CFP
    Cfp,
    /// ΣCFP
    TotalCfp,
}

impl Column {
    /// All columns in table order.
    pub const ALL: [Self; 12] = [
        Self::CustomerRequirement,
        Self::FunctionalUser,
        Self::UserRequirement,
        Self::TriggerEvent,
        Self::FunctionalProcess,
        Self::SubProcess,
        Self::MovementType,
        Self::DataGroup,
        Self::DataAttributes,
        Self::Reuse,
        Self::Cfp,
        Self::TotalCfp,
    ];

    /// Header used when rendering tables.
    #[must_use]
    pub const fn header(self) -> &'static str {
        match self {
            Self::CustomerRequirement => "客户需求",
            Self::FunctionalUser => "功能用户",
            Self::UserRequirement => "功能用户需求",
            Self::TriggerEvent => "触发事件",
            Self::FunctionalProcess => "功能过程",
            Self::SubProcess => "子过程描述",
            Self::MovementType => "数据移动类型",
            Self::DataGroup => "数据组",
            Self::DataAttributes => "数据属性",
            Self::Reuse => "复用度",
            Self::Cfp => "CFP",
            Self::TotalCfp => "ΣCFP",
        }
    }

    /// English name of the column.
    #[must_use]
    pub const fn english(self) -> &'static str {
        match self {
            Self::CustomerRequirement => "customer requirement",
            Self::FunctionalUser => "functional user",
            Self::UserRequirement => "functional user requirement",
            Self::TriggerEvent => "trigger event",
            Self::FunctionalProcess => "functional process",
            Self::SubProcess => "sub-process",
            Self::MovementType => "data movement type",
            Self::DataGroup => "data group",
            Self::DataAttributes => "data attributes",
            Self::Reuse => "reuse",
            Self::Cfp => "cfp",
            Self::TotalCfp => "total cfp",
        }
    }

    /// Resolves a header cell in either language.
    #[must_use]
    pub fn from_header(header: &str) -> Option<Self> {
        let cleaned = header.trim().trim_matches('*').trim();
        if cleaned.is_empty() {
            return None;
        }
        let lower = cleaned.to_lowercase().replace(&['_', '-'][..], " ");
        Self::ALL.into_iter().find(|c| {
            c.header() == cleaned
                || c.english().replace('-', " ") == lower
                || (matches!(c, Self::TotalCfp) && (lower == "σcfp" || lower == "sum cfp"))
                || (matches!(c, Self::SubProcess) && lower == "sub process description")
        })
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// One data-movement row of the table. Cells are kept as text so that
/// malformed model output can be reported precisely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmicRow {
    cells: [String; 12],
}

impl CosmicRow {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a cell.
    #[must_use]
    pub fn with(mut self, column: Column, value: impl Into<String>) -> Self {
        self.cells[column.index()] = value.into();
        self
    }

    /// Reads a cell.
    #[must_use]
    pub fn get(&self, column: Column) -> &str {
        &self.cells[column.index()]
    }

    /// Mutable access to a cell.
    pub fn get_mut(&mut self, column: Column) -> &mut String {
        &mut self.cells[column.index()]
    }

    /// Sets a cell in place.
    pub fn set(&mut self, column: Column, value: impl Into<String>) {
        self.cells[column.index()] = value.into();
    }

    /// The canonical movement type, if the cell holds exactly a valid code.
    #[must_use]
    pub fn movement_type(&self) -> Option<MovementType> {
        MovementType::from_code(self.get(Column::MovementType))
    }

    /// Data attributes split on any accepted separator.
    #[must_use]
    pub fn attributes(&self) -> Vec<String> {
        self.get(Column::DataAttributes)
            .split(ATTRIBUTE_SEPARATORS)
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Key identifying the functional process this row belongs to.
    #[must_use]
    pub fn process_key(&self) -> (&str, &str) {
        (self.get(Column::TriggerEvent), self.get(Column::FunctionalProcess))
    }

    /// All cells in column order.
    #[must_use]
    pub fn cells(&self) -> &[String; 12] {
        &self.cells
    }
}

/// A group of consecutive rows sharing one functional process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRows {
    /// Trigger event name.
    pub trigger_event: String,
    /// Functional process name.
    pub process: String,
    /// Indices of the process's rows in the table, in order.
    pub rows: Vec<usize>,
}

/// An ordered COSMIC table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmicTable {
    /// Rows in table order.
    pub rows: Vec<CosmicRow>,
}

impl CosmicTable {
    /// Creates a table from rows.
    #[must_use]
    pub fn new(rows: Vec<CosmicRow>) -> Self {
        Self { rows }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends another table's rows (merged tables keep a single header).
    pub fn append(&mut self, other: Self) {
        self.rows.extend(other.rows);
    }

    /// Groups rows by functional process, in order of first appearance.
    #[must_use]
    pub fn process_groups(&self) -> Vec<ProcessRows> {
        let mut groups: Vec<ProcessRows> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let (event, process) = row.process_key();
            let key = (event.to_string(), process.to_string());
            match index.get(&key) {
                Some(&g) => groups[g].rows.push(i),
                None => {
                    index.insert(key, groups.len());
                    groups.push(ProcessRows {
                        trigger_event: event.to_string(),
                        process: process.to_string(),
                        rows: vec![i],
                    });
                }
            }
        }
        groups
    }

    /// Number of distinct functional processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.process_groups().len()
    }

    /// Renders the table as markdown with the standard headers.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push('|');
        for column in Column::ALL {
            out.push(' ');
            out.push_str(column.header());
            out.push_str(" |");
        }
        out.push_str("\n|");
        for _ in Column::ALL {
            out.push_str("---|");
        }
        for row in &self.rows {
            out.push_str("\n|");
            for cell in row.cells() {
                out.push(' ');
                out.push_str(&escape_cell(cell));
                out.push_str(" |");
            }
        }
        out.push('\n');
        out
    }

    /// Returns a copy of `outline` with each process's data movements filled
    /// from this table. Rows whose process is not in the outline, or whose
    /// movement type is not canonical, are skipped.
    #[must_use]
    pub fn populate(&self, outline: &TriggerOutline) -> TriggerOutline {
        let mut populated = outline.clone();
        let mut by_process: HashMap<(&str, &str), Vec<&CosmicRow>> = HashMap::new();
        for row in &self.rows {
            by_process.entry(row.process_key()).or_default().push(row);
        }
        for event in &mut populated.events {
            for process in &mut event.functional_processes {
                let Some(rows) = by_process.get(&(event.name.as_str(), process.description.as_str()))
                else {
                    continue;
                };
                process.data_movements = rows
                    .iter()
                    .filter_map(|row| {
                        Some(DataMovement {
                            kind: row.movement_type()?,
                            data_group: row.get(Column::DataGroup).to_string(),
                            data_attributes: row.attributes(),
                            process_id: process.id.clone(),
                        })
                    })
                    .collect();
            }
        }
        populated
    }
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "/").replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FunctionalProcess, TriggerEvent};
    use pretty_assertions::assert_eq;

    fn row(process: &str, kind: &str, group: &str) -> CosmicRow {
        CosmicRow::new()
            .with(Column::TriggerEvent, "客户下单")
            .with(Column::FunctionalProcess, process)
            .with(Column::MovementType, kind)
            .with(Column::DataGroup, group)
            .with(Column::DataAttributes, "订单号、金额，状态")
    }

    #[test]
    fn test_column_headers_resolve_both_languages() {
        for column in Column::ALL {
            assert_eq!(Column::from_header(column.header()), Some(column));
            assert_eq!(Column::from_header(column.english()), Some(column));
        }
        assert_eq!(Column::from_header("Data_Group"), Some(Column::DataGroup));
        assert_eq!(Column::from_header("**数据组**"), Some(Column::DataGroup));
        assert_eq!(Column::from_header("unknown"), None);
    }

    #[test]
    fn test_row_attributes_split() {
        let r = row("创建订单", "E", "订单");
        assert_eq!(r.attributes(), vec!["订单号", "金额", "状态"]);
        assert_eq!(r.movement_type(), Some(MovementType::Entry));
    }

    #[test]
    fn test_process_groups_in_first_appearance_order() {
        let table = CosmicTable::new(vec![
            row("创建订单", "E", "a"),
            row("取消订单", "E", "b"),
            row("创建订单", "W", "c"),
        ]);
        let groups = table.process_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].process, "创建订单");
        assert_eq!(groups[0].rows, vec![0, 2]);
        assert_eq!(table.process_count(), 2);
    }

    #[test]
    fn test_to_markdown_escapes_cells() {
        let table = CosmicTable::new(vec![row("a|b", "E", "g").with(Column::FunctionalUser, "x\ny")]);
        let md = table.to_markdown();
        let lines: Vec<&str> = md.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("| 客户需求 |"));
        assert!(lines[2].contains("a/b"));
        assert!(lines[2].contains("x<br>y"));
    }

    #[test]
    fn test_populate_attaches_movements() {
        let outline = TriggerOutline::new(vec![TriggerEvent::new("TE-1", "客户下单")
            .with_process(FunctionalProcess::new("FP-1.1", "创建订单"))]);
        let table = CosmicTable::new(vec![
            row("创建订单", "E", "订单输入"),
            row("创建订单", "bogus", "x"),
            row("创建订单", "W", "订单记录"),
            row("不存在", "E", "y"),
        ]);
        let populated = table.populate(&outline);
        let movements = &populated.events[0].functional_processes[0].data_movements;
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1].kind, MovementType::Write);
        assert_eq!(movements[1].process_id, "FP-1.1");
    }

    #[test]
    fn test_append_keeps_order() {
        let mut a = CosmicTable::new(vec![row("p1", "E", "a")]);
        a.append(CosmicTable::new(vec![row("p2", "E", "b")]));
        assert_eq!(a.len(), 2);
        assert_eq!(a.rows[1].get(Column::FunctionalProcess), "p2");
    }
}
