//src/protocol.rs
//! Resolves which execution protocol applies to a set (normal, cluster,
//! rest-pause, drop-set) and turns structured editor input into log patches.
use thiserror::Error;

use crate::history::SetSample;
use crate::log_store::LogStore;
use crate::model::{
    fold_text, parse_training_number, AdvancedConfig, ClusterBlock, ClusterLog, ClusterPlanned,
    DropSetLog, DropStage, Exercise, Method, PlanParams, PlannedSet, RestPauseLog, SetKey, SetLog,
    SetLogPatch, StagePlan,
};

/// Hard cap on blocks produced by the cluster planners.
pub const MAX_CLUSTER_BLOCKS: usize = 50;
/// Pause between rest-pause minis when the plan does not say.
pub const DEFAULT_PAUSE_SECS: u32 = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No blocks found. Check the cluster configuration (total reps, cluster size and rest).")]
    NoBlocks,
    #[error("Fill in the weight of block {0}.")]
    MissingBlockWeight(usize),
    #[error("Fill in the reps of block {0}.")]
    MissingBlockReps(usize),
    #[error("Fill in the weight.")]
    MissingWeight,
    #[error("Fill in the activation reps.")]
    MissingActivationReps,
    #[error("Fill in the reps of mini-set {0}.")]
    MissingMiniReps(usize),
    #[error("A drop-set needs at least 2 stages.")]
    TooFewStages,
    #[error("A drop-set allows at most {0} stages.")]
    TooManyStages(usize),
    #[error("Fill in the weight of stage {0}.")]
    MissingStageWeight(usize),
    #[error("Fill in the reps of stage {0}.")]
    MissingStageReps(usize),
}

/// Phrases recognised in exercise notes when inferring drop-sets.
/// Matched against folded text (see [`fold_text`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropSetKeywords {
    pub trigger: Vec<String>,
    pub all_sets: Vec<String>,
    pub last_set: Vec<String>,
    pub double: Vec<String>,
    pub triple: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

impl Default for DropSetKeywords {
    fn default() -> Self {
        Self {
            trigger: words(&["drop"]),
            all_sets: words(&[
                "in all sets",
                "every set",
                "all sets",
                "em todas",
                "todas as series",
                "todas series",
            ]),
            last_set: words(&["last set", "ultima", "ultim"]),
            double: words(&["double", "duplo", "dupla", "2 drops", "2drop"]),
            triple: words(&["triple", "triplo", "tripla", "3 drops", "3drop"]),
        }
    }
}

impl DropSetKeywords {
    /// Number of drop-set stages the notes ask for on set `set_index` of an
    /// exercise with `set_count` sets. 0 means no drop-set.
    #[must_use]
    pub fn infer_stages(&self, notes: &str, set_index: usize, set_count: usize) -> usize {
        let folded = fold_text(notes);
        let has = |list: &[String]| list.iter().any(|kw| folded.contains(kw.as_str()));
        if folded.is_empty() || !has(&self.trigger) {
            return 0;
        }
        let applies = if has(&self.all_sets) {
            true
        } else {
            has(&self.last_set) && set_index == set_count.saturating_sub(1)
        };
        if !applies {
            return 0;
        }
        if has(&self.triple) {
            4
        } else if has(&self.double) {
            3
        } else {
            2
        }
    }
}

/// The coach's plan for set `set_index`, with drop-set stages injected from
/// the exercise notes when the plan itself has none.
#[must_use]
pub fn planned_set(ex: &Exercise, set_index: usize, keywords: &DropSetKeywords) -> Option<PlannedSet> {
    let detail = ex.set_details.get(set_index);
    if detail
        .and_then(|d| d.advanced_config.as_ref())
        .and_then(AdvancedConfig::stages)
        .is_some()
    {
        return detail.cloned();
    }
    let notes = ex.notes.as_deref().unwrap_or_default();
    let stages = keywords.infer_stages(notes, set_index, ex.set_count());
    if stages == 0 {
        return detail.cloned();
    }
    let mut planned = detail
        .cloned()
        .unwrap_or_else(|| PlannedSet::blank(set_index as u32 + 1));
    planned.advanced_config = Some(AdvancedConfig::Stages(vec![StagePlan::default(); stages]));
    planned.inferred = true;
    Some(planned)
}

/// Explicit cluster / rest-pause parameters of the planned set, if any.
#[must_use]
pub fn plan_config(ex: &Exercise, set_index: usize) -> Option<&PlanParams> {
    ex.set_details
        .get(set_index)
        .and_then(|d| d.advanced_config.as_ref())
        .and_then(AdvancedConfig::params)
}

fn positive_count(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.round().min(f64::from(u32::MAX)) as u32)
}

/// Splits `total_reps` into blocks of `cluster_size`; the last block takes
/// the remainder.
#[must_use]
pub fn blocks_by_size(total_reps: Option<f64>, cluster_size: Option<f64>) -> Vec<u32> {
    let (Some(total), Some(size)) = (positive_count(total_reps), positive_count(cluster_size)) else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    let mut remaining = total;
    while remaining > 0 && blocks.len() < MAX_CLUSTER_BLOCKS {
        let next = size.min(remaining);
        blocks.push(next);
        remaining -= next;
    }
    blocks
}

/// Splits `total_reps` into `count` near-equal blocks, spreading the
/// remainder over the first ones.
#[must_use]
pub fn blocks_by_count(total_reps: Option<f64>, count: Option<f64>) -> Vec<u32> {
    let (Some(total), Some(count)) = (positive_count(total_reps), positive_count(count)) else {
        return Vec::new();
    };
    let count = count.min(MAX_CLUSTER_BLOCKS as u32);
    let base = total / count;
    if base == 0 {
        return Vec::new();
    }
    let remainder = total - base * count;
    (0..count)
        .map(|i| base + u32::from(i < remainder))
        .collect()
}

fn planned_blocks(params: &PlanParams) -> Vec<u32> {
    if params.cluster_size.is_some() {
        blocks_by_size(params.total_reps, params.cluster_size)
    } else {
        blocks_by_count(params.total_reps, params.cluster_blocks_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetProtocol {
    Normal,
    Cluster {
        planned: ClusterPlanned,
        blocks: Vec<u32>,
    },
    RestPause {
        activation_reps: Option<u32>,
        mini_sets: u32,
        pause_secs: u32,
    },
    DropSet {
        stages: Vec<StagePlan>,
        inferred: bool,
    },
}

impl SetProtocol {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Cluster { .. } => "Cluster",
            Self::RestPause { .. } => "Rest-Pause",
            Self::DropSet { .. } => "Drop-set",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSet {
    pub key: SetKey,
    pub planned: Option<PlannedSet>,
    pub protocol: SetProtocol,
}

/// Classifies a set. Drop-set stages win, then cluster (by method or by
/// parameter shape), then rest-pause, else normal.
#[must_use]
pub fn resolve_set(
    ex: &Exercise,
    exercise_index: usize,
    set_index: usize,
    keywords: &DropSetKeywords,
) -> ResolvedSet {
    let key = SetKey::new(exercise_index, set_index);
    let planned = planned_set(ex, set_index, keywords);

    if let Some(stages) = planned
        .as_ref()
        .and_then(|p| p.advanced_config.as_ref())
        .and_then(AdvancedConfig::stages)
    {
        let protocol = SetProtocol::DropSet {
            stages: stages.to_vec(),
            inferred: planned.as_ref().is_some_and(|p| p.inferred),
        };
        return ResolvedSet { key, planned, protocol };
    }

    let params = plan_config(ex, set_index).cloned().unwrap_or_default();
    let protocol = if ex.method == Method::Cluster || params.looks_like_cluster() {
        SetProtocol::Cluster {
            blocks: planned_blocks(&params),
            planned: ClusterPlanned {
                total_reps: params.total_reps,
                cluster_size: params.cluster_size,
                cluster_blocks_count: params.cluster_blocks_count,
                intra_rest_sec: params.intra_rest_sec,
            },
        }
    } else if ex.method == Method::RestPause || params.looks_like_rest_pause() {
        SetProtocol::RestPause {
            activation_reps: positive_count(params.initial_reps),
            mini_sets: positive_count(params.mini_sets).unwrap_or(0),
            pause_secs: positive_count(params.rest_time_sec).unwrap_or(DEFAULT_PAUSE_SECS),
        }
    } else {
        SetProtocol::Normal
    };
    ResolvedSet { key, planned, protocol }
}

/// Weight and reps the athlete actually logged for each set, falling back to
/// the plan for sets not yet logged.
#[must_use]
pub fn current_set_inputs(
    ex: &Exercise,
    exercise_index: usize,
    logs: &LogStore,
    keywords: &DropSetKeywords,
) -> Vec<SetSample> {
    (0..ex.set_count())
        .filter_map(|set| {
            let log = logs.get_log(SetKey::new(exercise_index, set));
            let planned = planned_set(ex, set, keywords);
            let cfg_weight = plan_config(ex, set).and_then(|c| c.weight);
            let weight = log
                .effective_weight()
                .or(cfg_weight)
                .or_else(|| planned_number(planned.as_ref().and_then(|p| p.weight.as_deref())));
            let reps = planned_number(log.reps.as_deref())
                .or_else(|| planned_number(planned.as_ref().and_then(|p| p.reps.as_deref())))
                .or_else(|| planned_number(ex.reps.as_deref()));
            (weight.is_some() || reps.is_some()).then_some(SetSample { weight, reps })
        })
        .collect()
}

/// Weight and reps prescribed by the plan only.
#[must_use]
pub fn planned_set_inputs(ex: &Exercise, keywords: &DropSetKeywords) -> Vec<SetSample> {
    (0..ex.set_count())
        .filter_map(|set| {
            let planned = planned_set(ex, set, keywords);
            let weight = plan_config(ex, set)
                .and_then(|c| c.weight)
                .or_else(|| planned_number(planned.as_ref().and_then(|p| p.weight.as_deref())))
                .or_else(|| planned_number(ex.weight.as_deref()));
            let reps = planned_number(planned.as_ref().and_then(|p| p.reps.as_deref()))
                .or_else(|| planned_number(ex.reps.as_deref()));
            (weight.is_some() || reps.is_some()).then_some(SetSample { weight, reps })
        })
        .collect()
}

fn planned_number(raw: Option<&str>) -> Option<f64> {
    raw.and_then(parse_training_number)
}

fn positive_reps(raw: &str) -> Option<u32> {
    positive_count(parse_training_number(raw))
}

/// One row of a structured editor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockInput {
    pub weight: String,
    pub reps: String,
}

impl BlockInput {
    #[must_use]
    pub fn new(weight: &str, reps: &str) -> Self {
        Self {
            weight: weight.to_string(),
            reps: reps.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterEntry {
    pub blocks: Vec<BlockInput>,
    /// Rest after block `i`; falls back to `intra_rest_sec`.
    pub rests_by_gap: Vec<Option<u32>>,
    pub intra_rest_sec: Option<u32>,
    pub rpe: String,
    pub planned: ClusterPlanned,
    pub planned_blocks: Option<Vec<u32>>,
    pub config: Option<AdvancedConfig>,
}

impl ClusterEntry {
    /// Editor pre-filled from a resolved cluster plan.
    #[must_use]
    pub fn from_plan(resolved: &ResolvedSet, current: &SetLog) -> Option<Self> {
        let SetProtocol::Cluster { planned, blocks } = &resolved.protocol else {
            return None;
        };
        let weight = current.weight.clone().unwrap_or_default();
        let intra = positive_count(planned.intra_rest_sec);
        Some(Self {
            blocks: blocks
                .iter()
                .map(|_| BlockInput::new(&weight, ""))
                .collect(),
            rests_by_gap: vec![intra; blocks.len().saturating_sub(1)],
            intra_rest_sec: intra,
            rpe: current.rpe.clone().unwrap_or_default(),
            planned: planned.clone(),
            planned_blocks: Some(blocks.clone()),
            config: resolved
                .planned
                .as_ref()
                .and_then(|p| p.advanced_config.clone()),
        })
    }
}

fn trimmed_rpe(rpe: &str) -> Option<String> {
    Some(rpe.trim().to_string())
}

/// Validates a cluster entry. Reps become the block total and weight the
/// last block's weight; completion state is preserved.
pub fn cluster_patch(entry: &ClusterEntry, current: &SetLog) -> Result<SetLogPatch, ProtocolError> {
    if entry.blocks.is_empty() {
        return Err(ProtocolError::NoBlocks);
    }
    let last = entry.blocks.len() - 1;
    let mut detailed = Vec::with_capacity(entry.blocks.len());
    for (i, block) in entry.blocks.iter().enumerate() {
        let weight = block.weight.trim();
        if weight.is_empty() {
            return Err(ProtocolError::MissingBlockWeight(i + 1));
        }
        let reps = positive_reps(&block.reps).ok_or(ProtocolError::MissingBlockReps(i + 1))?;
        let rest_sec_after = if i < last {
            entry
                .rests_by_gap
                .get(i)
                .copied()
                .flatten()
                .or(entry.intra_rest_sec)
        } else {
            None
        };
        detailed.push(ClusterBlock {
            weight: weight.to_string(),
            reps,
            rest_sec_after,
        });
    }
    let blocks: Vec<u32> = detailed.iter().map(|b| b.reps).collect();
    let total: u32 = blocks.iter().sum();
    let last_weight = detailed[last].weight.clone();

    Ok(SetLogPatch {
        done: Some(current.is_done()),
        weight: Some(last_weight),
        reps: Some(total.to_string()),
        rpe: trimmed_rpe(&entry.rpe),
        cluster: Some(ClusterLog {
            planned: entry.planned.clone(),
            planned_blocks: entry.planned_blocks.clone(),
            blocks,
            blocks_detailed: detailed,
        }),
        advanced_config: entry
            .config
            .clone()
            .or_else(|| current.advanced_config.clone()),
        ..SetLogPatch::default()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestPauseEntry {
    pub weight: String,
    pub activation_reps: String,
    pub minis: Vec<String>,
    pub pause_secs: Option<u32>,
    pub rpe: String,
}

/// Validates a rest-pause entry. Reps become activation plus all minis.
pub fn rest_pause_patch(
    entry: &RestPauseEntry,
    current: &SetLog,
    config: Option<AdvancedConfig>,
) -> Result<SetLogPatch, ProtocolError> {
    let weight = entry.weight.trim();
    if weight.is_empty() {
        return Err(ProtocolError::MissingWeight);
    }
    let activation =
        positive_reps(&entry.activation_reps).ok_or(ProtocolError::MissingActivationReps)?;
    let mini_reps = entry
        .minis
        .iter()
        .enumerate()
        .map(|(i, raw)| positive_reps(raw).ok_or(ProtocolError::MissingMiniReps(i + 1)))
        .collect::<Result<Vec<_>, _>>()?;
    let total = activation + mini_reps.iter().sum::<u32>();

    Ok(SetLogPatch {
        done: Some(current.is_done()),
        weight: Some(weight.to_string()),
        reps: Some(total.to_string()),
        rpe: trimmed_rpe(&entry.rpe),
        rest_pause: Some(RestPauseLog {
            weight: None,
            activation_reps: activation,
            planned_mini_sets: mini_reps.len(),
            mini_reps,
            rest_time_sec: entry.pause_secs.unwrap_or(DEFAULT_PAUSE_SECS),
        }),
        advanced_config: config.or_else(|| current.advanced_config.clone()),
        ..SetLogPatch::default()
    })
}

/// Validates drop-set stages: between 2 and `stage_limit`, each with a weight
/// and positive reps.
pub fn drop_set_patch(
    stages: &[BlockInput],
    current: &SetLog,
    stage_limit: usize,
) -> Result<SetLogPatch, ProtocolError> {
    if stages.len() < 2 {
        return Err(ProtocolError::TooFewStages);
    }
    if stages.len() > stage_limit {
        return Err(ProtocolError::TooManyStages(stage_limit));
    }
    let parsed = stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let weight = stage.weight.trim();
            if weight.is_empty() {
                return Err(ProtocolError::MissingStageWeight(i + 1));
            }
            let reps = positive_reps(&stage.reps).ok_or(ProtocolError::MissingStageReps(i + 1))?;
            Ok(DropStage {
                weight: weight.to_string(),
                reps,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let total: u32 = parsed.iter().map(|s| s.reps).sum();
    let last_weight = parsed.last().map(|s| s.weight.clone());

    Ok(SetLogPatch {
        done: Some(current.is_done()),
        weight: last_weight,
        reps: Some(total.to_string()),
        drop_set: Some(DropSetLog { stages: parsed }),
        ..SetLogPatch::default()
    })
}
