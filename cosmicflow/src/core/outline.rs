//! The stage 1 outline and its immutable hand-off artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::model::{FunctionalProcess, TriggerEvent};
use crate::errors::ArtifactError;
use crate::utils::content_hash;

/// Trigger events and their functional processes, as produced by stage 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOutline {
    /// Trigger events in generation order.
    #[serde(alias = "trigger_events")]
    pub events: Vec<TriggerEvent>,
}

impl TriggerOutline {
    /// Creates an outline from events.
    #[must_use]
    pub fn new(events: Vec<TriggerEvent>) -> Self {
        Self { events }
    }

    /// Total number of functional processes across all events.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.events.iter().map(TriggerEvent::process_count).sum()
    }

    /// Looks up an event by id.
    #[must_use]
    pub fn event(&self, id: &str) -> Option<&TriggerEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Iterates over `(event, process)` pairs in order.
    pub fn processes(&self) -> impl Iterator<Item = (&TriggerEvent, &FunctionalProcess)> {
        self.events
            .iter()
            .flat_map(|e| e.functional_processes.iter().map(move |p| (e, p)))
    }

    /// Returns true if any event or process lacks an id.
    #[must_use]
    pub fn has_missing_ids(&self) -> bool {
        self.events.iter().any(|e| {
            e.id.trim().is_empty()
                || e.functional_processes
                    .iter()
                    .any(|p| p.id.trim().is_empty())
        })
    }

    /// Assigns positional ids (`TE-n`, `FP-n.m`) to every event and process
    /// that has none. Existing ids are kept.
    ///
    /// Returns the number of ids assigned.
    pub fn assign_missing_ids(&mut self) -> usize {
        let mut assigned = 0;
        for (i, event) in self.events.iter_mut().enumerate() {
            if event.id.trim().is_empty() {
                event.id = format!("TE-{}", i + 1);
                assigned += 1;
            }
            for (j, process) in event.functional_processes.iter_mut().enumerate() {
                if process.id.trim().is_empty() {
                    process.id = format!("FP-{}.{}", i + 1, j + 1);
                    assigned += 1;
                }
            }
        }
        assigned
    }

    /// Trims surrounding whitespace from every name and description.
    ///
    /// Returns the number of values changed.
    pub fn trim_text(&mut self) -> usize {
        fn trim(value: &mut String) -> usize {
            let trimmed = value.trim();
            if trimmed.len() == value.len() {
                0
            } else {
                *value = trimmed.to_string();
                1
            }
        }

        let mut changed = 0;
        for event in &mut self.events {
            changed += trim(&mut event.id);
            changed += trim(&mut event.name);
            changed += trim(&mut event.user_requirement);
            for process in &mut event.functional_processes {
                changed += trim(&mut process.id);
                changed += trim(&mut process.description);
            }
        }
        changed
    }

    /// Returns the events whose ids are listed, in outline order.
    #[must_use]
    pub fn select(&self, ids: &[String]) -> Vec<TriggerEvent> {
        self.events
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect()
    }

    /// Index from process description to `(event id, process id)`.
    #[must_use]
    pub fn process_index(&self) -> HashMap<&str, (&str, &str)> {
        self.processes()
            .map(|(e, p)| (p.description.as_str(), (e.id.as_str(), p.id.as_str())))
            .collect()
    }
}

/// A validated outline frozen for stage 2.
///
/// The content hash is the SHA-256 of the outline's canonical JSON, so a
/// stage 2 run can be repeated against a fixed, versioned stage 1 output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineArtifact {
    /// The frozen outline.
    pub outline: TriggerOutline,
    /// Hex SHA-256 of the canonical JSON encoding.
    pub content_hash: String,
    /// When the artifact was frozen.
    pub created_at: DateTime<Utc>,
}

impl OutlineArtifact {
    /// Freezes an outline.
    pub fn new(outline: TriggerOutline) -> Result<Self, ArtifactError> {
        let content_hash = Self::hash_outline(&outline)?;
        Ok(Self {
            outline,
            content_hash,
            created_at: Utc::now(),
        })
    }

    fn hash_outline(outline: &TriggerOutline) -> Result<String, ArtifactError> {
        let canonical =
            serde_json::to_vec(outline).map_err(|e| ArtifactError::Serialization(e.to_string()))?;
        Ok(content_hash(canonical))
    }

    /// Recomputes the hash and compares it with the stored one.
    pub fn verify(&self) -> Result<(), ArtifactError> {
        let actual = Self::hash_outline(&self.outline)?;
        if actual == self.content_hash {
            Ok(())
        } else {
            Err(ArtifactError::HashMismatch {
                expected: self.content_hash.clone(),
                actual,
            })
        }
    }

    /// Serializes the artifact to pretty JSON.
    pub fn to_json(&self) -> Result<String, ArtifactError> {
        serde_json::to_string_pretty(self).map_err(|e| ArtifactError::Serialization(e.to_string()))
    }

    /// Loads an artifact and checks its hash.
    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        let artifact: Self =
            serde_json::from_str(json).map_err(|e| ArtifactError::Serialization(e.to_string()))?;
        artifact.verify()?;
        Ok(artifact)
    }

    /// Short form of the hash for logs.
    #[must_use]
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..self.content_hash.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outline() -> TriggerOutline {
        TriggerOutline::new(vec![
            TriggerEvent::new("", " 客户下单 ")
                .with_process(FunctionalProcess::new("", "创建订单"))
                .with_process(FunctionalProcess::new("FP-custom", "取消订单")),
            TriggerEvent::new("TE-9", "客户查询").with_process(FunctionalProcess::new("", "查询订单")),
        ])
    }

    #[test]
    fn test_assign_missing_ids_keeps_existing() {
        let mut outline = outline();
        assert!(outline.has_missing_ids());
        assert_eq!(outline.assign_missing_ids(), 3);
        assert!(!outline.has_missing_ids());
        assert_eq!(outline.events[0].id, "TE-1");
        assert_eq!(outline.events[0].functional_processes[0].id, "FP-1.1");
        assert_eq!(outline.events[0].functional_processes[1].id, "FP-custom");
        assert_eq!(outline.events[1].id, "TE-9");
        assert_eq!(outline.events[1].functional_processes[0].id, "FP-2.1");
        assert_eq!(outline.assign_missing_ids(), 0);
    }

    #[test]
    fn test_trim_text() {
        let mut outline = outline();
        assert_eq!(outline.trim_text(), 1);
        assert_eq!(outline.events[0].name, "客户下单");
        assert_eq!(outline.trim_text(), 0);
    }

    #[test]
    fn test_select_preserves_order() {
        let mut outline = outline();
        outline.assign_missing_ids();
        let selected = outline.select(&["TE-9".to_string(), "TE-1".to_string()]);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].id, "TE-1");
    }

    #[test]
    fn test_artifact_hash_round_trip() {
        let artifact = OutlineArtifact::new(outline()).unwrap();
        assert!(artifact.verify().is_ok());
        let restored = OutlineArtifact::from_json(&artifact.to_json().unwrap()).unwrap();
        assert_eq!(restored.content_hash, artifact.content_hash);
    }

    #[test]
    fn test_artifact_detects_tampering() {
        let mut artifact = OutlineArtifact::new(outline()).unwrap();
        artifact.outline.events[0].name = "tampered".into();
        assert!(matches!(
            artifact.verify(),
            Err(ArtifactError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_same_outline_same_hash() {
        let a = OutlineArtifact::new(outline()).unwrap();
        let b = OutlineArtifact::new(outline()).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }
}
