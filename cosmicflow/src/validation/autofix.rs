//! Deterministic, machine-applicable fixes for syntax findings.

use serde::{Deserialize, Serialize};

use crate::core::{Candidate, Column, MovementType, ATTRIBUTE_SEPARATORS};

/// The separator attributes are normalised to.
pub const CANONICAL_SEPARATOR: &str = "、";

/// A fix the correction loop applies without calling the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fix", rename_all = "snake_case")]
pub enum AutoFix {
    /// Assign `TE-n` / `FP-n.m` ids where missing.
    AssignOutlineIds,
    /// Trim whitespace around outline names and descriptions.
    TrimOutlineText,
    /// Remove markdown emphasis and code marks from a cell.
    StripMarkup {
        /// Row index.
        row: usize,
        /// Column.
        column: Column,
    },
    /// Replace a movement type alias with its code.
    CoerceMovementType {
        /// Row index.
        row: usize,
        /// Canonical type.
        to: MovementType,
    },
    /// Re-join attributes with the canonical separator.
    NormalizeAttributes {
        /// Row index.
        row: usize,
    },
    /// Overwrite a cell with a required value.
    SetCell {
        /// Row index.
        row: usize,
        /// Column.
        column: Column,
        /// Required value.
        value: String,
    },
}

/// Removes `**`, `__` and backticks.
#[must_use]
pub fn strip_markup(text: &str) -> String {
    text.replace("**", "").replace("__", "").replace('`', "").trim().to_string()
}

/// Returns true if `text` carries markdown markup.
#[must_use]
pub fn has_markup(text: &str) -> bool {
    text.contains("**") || text.contains("__") || text.contains('`')
}

/// Splits on every accepted separator and re-joins with the canonical one.
#[must_use]
pub fn normalize_attributes(text: &str) -> String {
    text.split(ATTRIBUTE_SEPARATORS)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(CANONICAL_SEPARATOR)
}

impl AutoFix {
    /// Applies the fix. Returns false if it does not fit the candidate
    /// (wrong stage or row out of range) or changed nothing.
    pub fn apply(&self, candidate: &mut Candidate) -> bool {
        match (self, candidate) {
            (Self::AssignOutlineIds, Candidate::Outline(outline)) => outline.assign_missing_ids() > 0,
            (Self::TrimOutlineText, Candidate::Outline(outline)) => outline.trim_text() > 0,
            (Self::StripMarkup { row, column }, Candidate::Table(table)) => {
                table.rows.get_mut(*row).is_some_and(|r| {
                    let cell = r.get_mut(*column);
                    let stripped = strip_markup(cell);
                    let changed = stripped != *cell;
                    *cell = stripped;
                    changed
                })
            }
            (Self::CoerceMovementType { row, to }, Candidate::Table(table)) => {
                table.rows.get_mut(*row).is_some_and(|r| {
                    let cell = r.get_mut(Column::MovementType);
                    let changed = cell != to.code();
                    *cell = to.code().to_string();
                    changed
                })
            }
            (Self::NormalizeAttributes { row }, Candidate::Table(table)) => {
                table.rows.get_mut(*row).is_some_and(|r| {
                    let cell = r.get_mut(Column::DataAttributes);
                    let normalized = normalize_attributes(cell);
                    let changed = normalized != *cell;
                    *cell = normalized;
                    changed
                })
            }
            (Self::SetCell { row, column, value }, Candidate::Table(table)) => {
                table.rows.get_mut(*row).is_some_and(|r| {
                    let cell = r.get_mut(*column);
                    let changed = cell != value;
                    cell.clone_from(value);
                    changed
                })
            }
            _ => false,
        }
    }

    /// One-line description used as the finding's suggested fix.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::AssignOutlineIds => "assign TE-n / FP-n.m ids".to_string(),
            Self::TrimOutlineText => "trim surrounding whitespace".to_string(),
            Self::StripMarkup { column, .. } => format!("remove markup from {column}"),
            Self::CoerceMovementType { to, .. } => format!("use movement type code {to}"),
            Self::NormalizeAttributes { .. } => {
                format!("separate attributes with '{CANONICAL_SEPARATOR}'")
            }
            Self::SetCell { column, value, .. } => format!("set {column} to '{value}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CosmicRow, CosmicTable, FunctionalProcess, TriggerEvent, TriggerOutline};

    fn table() -> Candidate {
        Candidate::Table(CosmicTable::new(vec![CosmicRow::new()
            .with(Column::MovementType, "Entry")
            .with(Column::DataGroup, "**订单**")
            .with(Column::DataAttributes, "订单号, 金额；状态")
            .with(Column::Reuse, "复用")]))
    }

    #[test]
    fn test_table_fixes_apply() {
        let mut candidate = table();
        assert!(AutoFix::CoerceMovementType { row: 0, to: MovementType::Entry }.apply(&mut candidate));
        assert!(AutoFix::StripMarkup { row: 0, column: Column::DataGroup }.apply(&mut candidate));
        assert!(AutoFix::NormalizeAttributes { row: 0 }.apply(&mut candidate));
        assert!(AutoFix::SetCell { row: 0, column: Column::Reuse, value: "新增".into() }.apply(&mut candidate));

        let row = &candidate.as_table().unwrap().rows[0];
        assert_eq!(row.get(Column::MovementType), "E");
        assert_eq!(row.get(Column::DataGroup), "订单");
        assert_eq!(row.get(Column::DataAttributes), "订单号、金额、状态");
        assert_eq!(row.get(Column::Reuse), "新增");
    }

    #[test]
    fn test_fixes_are_idempotent() {
        let mut candidate = table();
        let fix = AutoFix::NormalizeAttributes { row: 0 };
        assert!(fix.apply(&mut candidate));
        assert!(!fix.apply(&mut candidate));
    }

    #[test]
    fn test_fix_does_not_fit_other_stage_or_row() {
        let mut outline = Candidate::Outline(TriggerOutline::default());
        assert!(!AutoFix::NormalizeAttributes { row: 0 }.apply(&mut outline));
        let mut candidate = table();
        assert!(!AutoFix::NormalizeAttributes { row: 9 }.apply(&mut candidate));
    }

    #[test]
    fn test_outline_fixes_apply() {
        let mut candidate = Candidate::Outline(TriggerOutline::new(vec![
            TriggerEvent::new("", " 客户下单 ").with_process(FunctionalProcess::new("", "创建订单")),
        ]));
        assert!(AutoFix::TrimOutlineText.apply(&mut candidate));
        assert!(AutoFix::AssignOutlineIds.apply(&mut candidate));
        let outline = candidate.as_outline().unwrap();
        assert_eq!(outline.events[0].name, "客户下单");
        assert_eq!(outline.events[0].functional_processes[0].id, "FP-1.1");
    }

    #[test]
    fn test_helpers() {
        assert_eq!(strip_markup("`E`"), "E");
        assert!(has_markup("**x**"));
        assert!(!has_markup("x_y"));
        assert_eq!(normalize_attributes(" a ,b;; c "), "a、b、c");
    }
}
