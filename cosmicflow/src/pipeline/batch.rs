//! Batch planning for table generation.
//!
//! The planner walks the outline's trigger events in order and groups them
//! into batches measured in functional processes. A trigger event is never
//! split, so batch sizes are elastic within `base_size · (1 ± tolerance)`.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::core::TriggerEvent;

/// Batch planner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Functional processes per batch.
    #[serde(default = "default_base_size")]
    pub base_size: usize,
    /// Elasticity around the base size, as a fraction.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Rows per process assumed before any batch has completed.
    #[serde(default = "default_rows_per_process")]
    pub default_rows_per_process: f64,
    /// Completeness tolerance as a fraction of the target row count.
    #[serde(default = "default_completeness_tolerance")]
    pub completeness_tolerance: f64,
    /// Close the current batch whenever the functional user requirement changes.
    #[serde(default)]
    pub group_by_requirement: bool,
}

fn default_base_size() -> usize {
    5
}

fn default_tolerance() -> f64 {
    0.2
}

fn default_rows_per_process() -> f64 {
    3.0
}

fn default_completeness_tolerance() -> f64 {
    0.03
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            base_size: default_base_size(),
            tolerance: default_tolerance(),
            default_rows_per_process: default_rows_per_process(),
            completeness_tolerance: default_completeness_tolerance(),
            group_by_requirement: false,
        }
    }
}

impl BatchConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base size.
    #[must_use]
    pub fn with_base_size(mut self, size: usize) -> Self {
        self.base_size = size;
        self
    }

    /// Sets the elasticity tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets requirement grouping.
    #[must_use]
    pub fn with_group_by_requirement(mut self, group: bool) -> Self {
        self.group_by_requirement = group;
        self
    }

    /// Smallest and largest regular batch, in processes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn bounds(&self) -> (usize, usize) {
        let base = self.base_size.max(1) as f64;
        let tolerance = self.tolerance.max(0.0);
        let lower = (base * (1.0 - tolerance) - 1e-9).ceil().max(1.0) as usize;
        let upper = (base * (1.0 + tolerance) + 1e-9).floor() as usize;
        (lower, upper.max(self.base_size.max(1)))
    }

    /// Rows a batch may deviate from its prediction: the completeness
    /// tolerance of `target_rows`, at least one row.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn tolerance_rows(&self, target_rows: usize) -> usize {
        ((target_rows as f64 * self.completeness_tolerance).round() as usize).max(1)
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_size == 0 {
            return Err("base_size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err("tolerance must be in [0, 1)".to_string());
        }
        if self.default_rows_per_process <= 0.0 {
            return Err("default_rows_per_process must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.completeness_tolerance) {
            return Err("completeness_tolerance must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// A group of consecutive trigger events generated by one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Zero-based position in the plan.
    pub index: usize,
    /// Positions of the batch's events in the outline.
    pub span: Range<usize>,
    /// Ids of the batch's events, in outline order.
    pub event_ids: Vec<String>,
    /// Functional processes in the batch.
    pub process_count: usize,
    /// Rows the batch is expected to produce.
    pub predicted_rows: usize,
    /// Rows it did produce, once merged.
    pub actual_rows: Option<usize>,
}

impl Batch {
    /// Number of trigger events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.span.len()
    }

    /// Returns true if the batch has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// The batch's events.
    #[must_use]
    pub fn events<'a>(&self, events: &'a [TriggerEvent]) -> &'a [TriggerEvent] {
        &events[self.span.clone()]
    }
}

/// Running rows-per-process average over the batches completed so far.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRateEstimator {
    default_rate: f64,
    processes: usize,
    rows: usize,
}

impl RowRateEstimator {
    /// Creates an estimator that starts from `default_rate`.
    #[must_use]
    pub fn new(default_rate: f64) -> Self {
        Self {
            default_rate,
            processes: 0,
            rows: 0,
        }
    }

    /// Records a completed batch.
    pub fn record(&mut self, processes: usize, rows: usize) {
        self.processes += processes;
        self.rows += rows;
    }

    /// Current rows-per-process estimate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(&self) -> f64 {
        if self.processes == 0 {
            self.default_rate
        } else {
            self.rows as f64 / self.processes as f64
        }
    }

    /// Predicted rows for `processes` processes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn predict(&self, processes: usize) -> usize {
        (processes as f64 * self.rate()).round() as usize
    }
}

/// Partitions trigger events into batches.
#[derive(Debug, Clone, Default)]
pub struct BatchPlanner {
    config: BatchConfig,
}

impl BatchPlanner {
    /// Creates a planner.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Plans batches over `events`.
    ///
    /// A batch closes once it holds `base_size` processes, or earlier when
    /// the next event would take it past the upper bound. An undersized
    /// final batch is merged into its predecessor when the result fits the
    /// upper bound; otherwise trailing events of the predecessor move into
    /// it as long as the predecessor stays within bounds.
    #[must_use]
    pub fn plan(&self, events: &[TriggerEvent]) -> Vec<Batch> {
        let (lower, upper) = self.config.bounds();
        let base = self.config.base_size.max(1);
        let weights: Vec<usize> = events.iter().map(TriggerEvent::process_count).collect();

        let mut spans: Vec<Range<usize>> = Vec::new();
        let mut start = 0;
        let mut count = 0;
        for (i, &weight) in weights.iter().enumerate() {
            let requirement_changed = self.config.group_by_requirement
                && i > start
                && events[i].user_requirement != events[i - 1].user_requirement;
            if i > start && (count + weight > upper || requirement_changed) {
                spans.push(start..i);
                start = i;
                count = 0;
            }
            count += weight;
            if count >= base {
                spans.push(start..i + 1);
                start = i + 1;
                count = 0;
            }
        }
        if start < events.len() {
            spans.push(start..events.len());
        }

        rebalance_tail(&mut spans, &weights, events, lower, upper, self.config.group_by_requirement);

        let estimator = RowRateEstimator::new(self.config.default_rows_per_process);
        spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let process_count = weights[span.clone()].iter().sum();
                Batch {
                    index,
                    event_ids: events[span.clone()].iter().map(|e| e.id.clone()).collect(),
                    span,
                    process_count,
                    predicted_rows: estimator.predict(process_count),
                    actual_rows: None,
                }
            })
            .collect()
    }

    /// Expected row range shown to the model for a prediction.
    #[must_use]
    pub fn expected_range(&self, predicted_rows: usize, target_rows: usize) -> (usize, usize) {
        let slack = self.config.tolerance_rows(target_rows);
        (predicted_rows.saturating_sub(slack).max(1), predicted_rows + slack)
    }
}

fn rebalance_tail(
    spans: &mut Vec<Range<usize>>,
    weights: &[usize],
    events: &[TriggerEvent],
    lower: usize,
    upper: usize,
    group_by_requirement: bool,
) {
    let n = spans.len();
    if n < 2 {
        return;
    }
    let sum = |span: &Range<usize>| -> usize { weights[span.clone()].iter().sum() };
    let (prev, last) = (spans[n - 2].clone(), spans[n - 1].clone());
    if sum(&last) >= lower {
        return;
    }
    if group_by_requirement
        && events[prev.end - 1].user_requirement != events[last.start].user_requirement
    {
        return;
    }

    if sum(&prev) + sum(&last) <= upper {
        spans.pop();
        spans[n - 2] = prev.start..last.end;
        return;
    }

    let (mut prev, mut last) = (prev, last);
    while prev.len() > 1 {
        let moving = weights[prev.end - 1];
        let prev_after = sum(&prev) - moving;
        let last_after = sum(&last) + moving;
        if sum(&last) >= lower || prev_after < lower || last_after > upper {
            break;
        }
        prev.end -= 1;
        last.start -= 1;
    }
    spans[n - 2] = prev;
    spans[n - 1] = last;
}
