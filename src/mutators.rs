//src/mutators.rs
//! Structural edits of the live workout: extra sets, exercise edits, extra
//! exercises and the exercise reorder draft.
use thiserror::Error;

use crate::config::SessionLimits;
use crate::log_store::LogStore;
use crate::model::{parse_training_number, Exercise, Method, PlannedSet, Workout};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Exercise index {0} is out of range.")]
    InvalidExercise(usize),
    #[error("Enter the exercise name.")]
    EmptyName,
    #[error("An exercise can have at most {0} sets.")]
    TooManySets(usize),
    #[error("A workout can have at most {0} exercises.")]
    TooManyExercises(usize),
    #[error("Cannot save: workout has no ID.")]
    MissingWorkoutId,
    #[error("A save is already in progress.")]
    SaveInProgress,
    #[error("The reorder editor is not open.")]
    ReorderClosed,
    #[error("Failed to save the order: {0}")]
    SaveFailed(String),
}

fn exercise_mut(workout: &mut Workout, index: usize) -> Result<&mut Exercise, MutationError> {
    workout
        .exercises
        .get_mut(index)
        .ok_or(MutationError::InvalidExercise(index))
}

/// Appends one set shaped like the last planned one (its advanced config is
/// kept, its values cleared). Returns the new set count.
pub fn add_extra_set(
    workout: &mut Workout,
    index: usize,
    limits: &SessionLimits,
) -> Result<usize, MutationError> {
    let ex = exercise_mut(workout, index)?;
    let count = ex.set_count();
    if count >= limits.max_sets_per_exercise {
        return Err(MutationError::TooManySets(limits.max_sets_per_exercise));
    }
    let advanced_config = ex.set_details.last().and_then(|d| d.advanced_config.clone());
    // Pad so every set below the new one has a detail slot.
    while ex.set_details.len() < count {
        let n = ex.set_details.len() as u32 + 1;
        ex.set_details.push(PlannedSet::blank(n));
    }
    ex.set_details.push(PlannedSet {
        advanced_config,
        ..PlannedSet::blank(count as u32 + 1)
    });
    ex.sets = count as u32 + 1;
    Ok(count + 1)
}

/// Editable header of an exercise, as text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExerciseEdit {
    pub name: String,
    pub sets: String,
    pub rest_time: String,
    pub method: Method,
}

impl ExerciseEdit {
    #[must_use]
    pub fn from_exercise(ex: &Exercise, index: usize, limits: &SessionLimits) -> Self {
        Self {
            name: ex.display_name(index),
            sets: ex.set_count().max(1).to_string(),
            rest_time: ex
                .rest_time
                .filter(|r| *r > 0)
                .unwrap_or(limits.default_rest_secs)
                .to_string(),
            method: ex.method,
        }
    }
}

fn parse_rest(raw: &str) -> Option<u32> {
    parse_training_number(raw)
        .filter(|r| *r > 0.0)
        .map(|r| r.round().min(f64::from(u32::MAX)) as u32)
}

fn parse_set_count(raw: &str, fallback: usize) -> usize {
    parse_training_number(raw)
        .filter(|n| *n >= 1.0)
        .map_or(fallback, |n| n.trunc() as usize)
}

/// Applies an edit. The set count is clamped to `[1, max]`; shrinking drops the
/// planned sets and the logs of the removed tail. Returns how many logs were
/// removed.
pub fn edit_exercise(
    workout: &mut Workout,
    logs: &mut LogStore,
    index: usize,
    edit: &ExerciseEdit,
    limits: &SessionLimits,
) -> Result<usize, MutationError> {
    let name = edit.name.trim();
    if name.is_empty() {
        return Err(MutationError::EmptyName);
    }
    let ex = exercise_mut(workout, index)?;
    let desired = parse_set_count(&edit.sets, 1).clamp(1, limits.max_sets_per_exercise);
    let previous = ex.set_count();

    let mut details: Vec<PlannedSet> = ex.set_details.drain(..).take(desired).collect();
    for (i, detail) in details.iter_mut().enumerate() {
        detail.set_number.get_or_insert(i as u32 + 1);
    }
    while details.len() < desired {
        details.push(PlannedSet::blank(details.len() as u32 + 1));
    }

    ex.name = name.to_string();
    ex.method = edit.method;
    ex.sets = desired as u32;
    ex.rest_time = parse_rest(&edit.rest_time);
    ex.set_details = details;

    let removed = if previous > desired {
        logs.remove_sets(index, desired, previous)
    } else {
        0
    };
    Ok(removed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExercise {
    pub name: String,
    pub sets: String,
    pub rest_time: String,
}

impl Default for NewExercise {
    fn default() -> Self {
        Self {
            name: String::new(),
            sets: "3".to_string(),
            rest_time: String::new(),
        }
    }
}

/// Appends a normal exercise with no planned details. Returns its index.
pub fn add_extra_exercise(
    workout: &mut Workout,
    draft: &NewExercise,
    limits: &SessionLimits,
) -> Result<usize, MutationError> {
    if workout.exercises.len() >= limits.max_exercises_per_workout {
        return Err(MutationError::TooManyExercises(limits.max_exercises_per_workout));
    }
    let name = draft.name.trim();
    if name.is_empty() {
        return Err(MutationError::EmptyName);
    }
    let sets = parse_set_count(&draft.sets, 1).clamp(1, limits.max_sets_per_exercise);
    let mut exercise = Exercise::new(name, sets as u32);
    exercise.rest_time = parse_rest(&draft.rest_time);
    workout.exercises.push(exercise);
    Ok(workout.exercises.len() - 1)
}

/// Stable identity of an exercise inside a reorder draft.
#[must_use]
pub fn exercise_sort_key(ex: &Exercise, index: usize) -> String {
    match ex.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("id:{id}"),
        None => format!("idx:{index}:{}", ex.name.trim()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftItem {
    pub key: String,
    pub exercise: Exercise,
}

/// Working copy of the exercise order; the live workout is only touched when
/// the draft is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderDraft {
    items: Vec<DraftItem>,
    base_keys: Vec<String>,
    pub saving: bool,
    pub error: Option<String>,
}

impl ReorderDraft {
    #[must_use]
    pub fn open(exercises: &[Exercise]) -> Self {
        let items: Vec<DraftItem> = exercises
            .iter()
            .enumerate()
            .map(|(i, ex)| DraftItem {
                key: exercise_sort_key(ex, i),
                exercise: ex.clone(),
            })
            .collect();
        let base_keys = items.iter().map(|i| i.key.clone()).collect();
        Self {
            items,
            base_keys,
            saving: false,
            error: None,
        }
    }

    #[must_use]
    pub fn items(&self) -> &[DraftItem] {
        &self.items
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|i| i.key.clone()).collect()
    }

    /// Moves an item; out-of-range or no-op moves return `false`.
    pub fn move_item(&mut self, from: usize, to: usize) -> bool {
        let len = self.items.len();
        if from >= len || to >= len || from == to {
            return false;
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        true
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.keys() != self.base_keys
    }

    /// The draft order applied to `exercises`, as the previous index of each
    /// exercise in its new position. Keys the draft does not know keep their
    /// relative order at the end.
    #[must_use]
    pub fn order_for(&self, exercises: &[Exercise]) -> Vec<usize> {
        let keys: Vec<String> = exercises
            .iter()
            .enumerate()
            .map(|(i, ex)| exercise_sort_key(ex, i))
            .collect();
        let mut used = vec![false; exercises.len()];
        let mut order = Vec::with_capacity(exercises.len());
        for item in &self.items {
            if let Some(pos) = keys
                .iter()
                .enumerate()
                .position(|(i, k)| !used[i] && *k == item.key)
            {
                used[pos] = true;
                order.push(pos);
            }
        }
        order.extend((0..exercises.len()).filter(|i| !used[*i]));
        order
    }

    /// Marks the current order as the saved baseline.
    pub fn mark_saved(&mut self) {
        self.base_keys = self.keys();
        self.saving = false;
        self.error = None;
    }
}

/// Rearranges `workout` and its logs by `new_to_old`.
pub fn apply_order(workout: &mut Workout, logs: &mut LogStore, new_to_old: &[usize]) {
    let previous = std::mem::take(&mut workout.exercises);
    let mut slots: Vec<Option<Exercise>> = previous.into_iter().map(Some).collect();
    workout.exercises = new_to_old
        .iter()
        .filter_map(|old| slots.get_mut(*old).and_then(Option::take))
        .collect();
    logs.reorder_exercises(new_to_old);
}
