//! Staged retrieval planning.
//!
//! A [`RetrieveConfiguration`] is an ordered list of stages, each selecting a
//! subset of frames to fetch with a given retrieve type. Resolving it against
//! a known frame count yields one [`StagePlan`] per stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A frame position selector
///
/// Integers are absolute indices (negative counts back from the end); floats
/// in `[0, 1]` are positions relative to the frame count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Index(i64),
    Fraction(f64),
}

impl Selector {
    /// Resolve to a frame index, clamped to `[0, frame_count - 1]`.
    ///
    /// Returns `None` only when there are no frames.
    pub fn resolve(&self, frame_count: usize) -> Option<usize> {
        if frame_count == 0 {
            return None;
        }
        let last = frame_count as i64 - 1;
        let index = match *self {
            Selector::Index(value) if value >= 0 => value,
            Selector::Index(value) => frame_count as i64 + value,
            Selector::Fraction(value) => {
                let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
                (value * frame_count as f64).round() as i64
            }
        };
        Some(index.clamp(0, last) as usize)
    }
}

impl From<i64> for Selector {
    fn from(value: i64) -> Self {
        Selector::Index(value)
    }
}

impl From<f64> for Selector {
    fn from(value: f64) -> Self {
        Selector::Fraction(value)
    }
}

/// One step of a retrieval plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveStage {
    pub id: String,
    /// Explicit positions; takes precedence over decimation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<Selector>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimate: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Retrieve type used to look up stage options
    #[serde(
        default,
        alias = "retrieve_type_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub retrieve_type_id: Option<String>,
    /// Exclude this stage's frames from all later stages
    #[serde(default)]
    pub remove: bool,
}

impl RetrieveStage {
    /// A stage targeting every remaining frame.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            positions: None,
            decimate: None,
            offset: None,
            retrieve_type_id: None,
            remove: false,
        }
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = Selector>) -> Self {
        self.positions = Some(positions.into_iter().collect());
        self
    }

    pub fn with_decimate(mut self, decimate: usize, offset: usize) -> Self {
        self.decimate = Some(decimate);
        self.offset = Some(offset);
        self
    }

    pub fn with_retrieve_type(mut self, retrieve_type_id: impl Into<String>) -> Self {
        self.retrieve_type_id = Some(retrieve_type_id.into());
        self
    }

    pub fn removing(mut self) -> Self {
        self.remove = true;
        self
    }

    /// Candidate indices before intersecting with the remaining pool.
    fn candidates(&self, frame_count: usize) -> Vec<usize> {
        if let Some(positions) = &self.positions {
            return positions
                .iter()
                .filter_map(|selector| selector.resolve(frame_count))
                .collect();
        }

        let decimate = match self.decimate.unwrap_or(1) {
            0 => {
                warn!(stage_id = %self.id, "decimate of 0 treated as 1");
                1
            }
            d => d,
        };
        let offset = self.offset.unwrap_or(0);
        (offset..frame_count).step_by(decimate).collect()
    }
}

/// Ordered retrieval stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveConfiguration {
    #[serde(default)]
    pub stages: Vec<RetrieveStage>,
}

impl Default for RetrieveConfiguration {
    fn default() -> Self {
        Self {
            stages: vec![RetrieveStage::new("all")],
        }
    }
}

impl RetrieveConfiguration {
    pub fn new(stages: Vec<RetrieveStage>) -> Self {
        Self { stages }
    }
}

/// A single fetch instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchInstruction {
    pub stage_id: String,
    pub frame_index: usize,
    pub retrieve_type_id: Option<String>,
}

/// The concrete frames selected by one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub stage_id: String,
    pub retrieve_type_id: Option<String>,
    pub remove: bool,
    /// Frame indices in selection order
    pub frames: Vec<usize>,
}

impl StagePlan {
    pub fn instructions(&self) -> impl Iterator<Item = FetchInstruction> + '_ {
        self.frames.iter().map(move |&frame_index| FetchInstruction {
            stage_id: self.stage_id.clone(),
            frame_index,
            retrieve_type_id: self.retrieve_type_id.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Expands retrieve configurations into per-stage plans
pub struct StageResolver;

impl StageResolver {
    /// Resolve every stage against `frame_count`, in configuration order.
    pub fn resolve(configuration: &RetrieveConfiguration, frame_count: usize) -> Vec<StagePlan> {
        let mut pool: BTreeSet<usize> = (0..frame_count).collect();

        configuration
            .stages
            .iter()
            .map(|stage| {
                let mut seen = BTreeSet::new();
                let frames: Vec<usize> = stage
                    .candidates(frame_count)
                    .into_iter()
                    .filter(|index| pool.contains(index) && seen.insert(*index))
                    .collect();

                if stage.remove {
                    for index in &frames {
                        pool.remove(index);
                    }
                }

                debug!(
                    stage_id = %stage.id,
                    frames = frames.len(),
                    remaining = pool.len(),
                    "Resolved retrieve stage"
                );

                StagePlan {
                    stage_id: stage.id.clone(),
                    retrieve_type_id: stage.retrieve_type_id.clone(),
                    remove: stage.remove,
                    frames,
                }
            })
            .collect()
    }

    /// Flattened instruction list across all stages.
    pub fn instructions(
        configuration: &RetrieveConfiguration,
        frame_count: usize,
    ) -> Vec<FetchInstruction> {
        Self::resolve(configuration, frame_count)
            .iter()
            .flat_map(|plan| plan.instructions().collect::<Vec<_>>())
            .collect()
    }
}
