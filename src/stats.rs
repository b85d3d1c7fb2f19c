use crate::models::{ImageStats, MergedStats, OptimisticQueue, StatsSnapshot};

/// Folds the optimistic deltas onto a copy of the canonical snapshot.
///
/// Views and downloads are applied as two independent passes; an id missing
/// from the snapshot starts from zero. Neither input is modified, so repeated
/// calls against the same queue give the same result.
pub fn merge_stats(snapshot: &StatsSnapshot, queue: &OptimisticQueue) -> MergedStats {
    let mut merged = snapshot.clone();

    for (image_id, delta) in &queue.views {
        let entry = merged.entry(image_id.clone()).or_insert_with(ImageStats::default);
        entry.views = entry.views.saturating_add(*delta);
    }

    for (image_id, delta) in &queue.downloads {
        let entry = merged.entry(image_id.clone()).or_insert_with(ImageStats::default);
        entry.downloads = entry.downloads.saturating_add(*delta);
    }

    merged
}
