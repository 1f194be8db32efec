//! # MarkerReconciler
//!
//! Keeps the map overlay in step with the places the backend pushes.
//!
//! Every inbound payload is a complete list. Reconciliation compares it with
//! the overlay by id:
//!
//! - ids not on the overlay are **added**
//! - ids on the overlay whose highlight flag or categories changed are
//!   **updated** (icon only)
//! - ids missing from the payload are **removed**
//!
//! Coordinates and names are fixed when a marker is created. A place that
//! moves comes back under a new id, which turns into a remove plus an add.
//! Highlighting follows the local selection and never the payload.

use std::collections::BTreeMap;

use log::debug;

use crate::map::{MapSurface, PlaceMarker, PlaceRecord};

/// Changes needed to bring the map in line with a new state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_add: Vec<PlaceMarker>,
    /// Markers in their new state; only the icon changes on the map
    pub to_update: Vec<PlaceMarker>,
    pub to_remove: Vec<i64>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute the plan that turns `overlay` into `incoming`.
///
/// When a payload repeats an id, the last record wins.
pub fn diff(
    overlay: &BTreeMap<i64, PlaceMarker>,
    incoming: &[PlaceRecord],
    selected: Option<i64>,
) -> ReconcilePlan {
    let latest: BTreeMap<i64, &PlaceRecord> = incoming.iter().map(|r| (r.id, r)).collect();
    let mut plan = ReconcilePlan::default();

    for (&id, record) in &latest {
        let highlighted = selected == Some(id);
        match overlay.get(&id) {
            None => plan.to_add.push(PlaceMarker::from_record(record, highlighted)),
            Some(existing) => {
                if existing.highlighted != highlighted || existing.category != record.category {
                    let mut updated = existing.clone();
                    updated.highlighted = highlighted;
                    updated.category = record.category.clone();
                    plan.to_update.push(updated);
                }
            }
        }
    }

    plan.to_remove = overlay
        .keys()
        .filter(|id| !latest.contains_key(id))
        .copied()
        .collect();

    plan
}

/// Drive the map surface through a plan. Removals go first.
pub fn apply(plan: &ReconcilePlan, surface: &mut dyn MapSurface) {
    for &id in &plan.to_remove {
        surface.remove_marker(id);
    }
    for marker in &plan.to_add {
        surface.add_marker(marker, marker.icon());
    }
    for marker in &plan.to_update {
        surface.update_marker_icon(marker.id, marker.icon());
    }
}

/// Owns the overlay and the session-local selection.
#[derive(Debug, Default)]
pub struct MarkerReconciler {
    overlay: BTreeMap<i64, PlaceMarker>,
    selected: Option<i64>,
}

impl MarkerReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overlay(&self) -> &BTreeMap<i64, PlaceMarker> {
        &self.overlay
    }

    pub fn selected(&self) -> Option<i64> {
        self.selected
    }

    /// Diff against a fresh payload and adopt it as the overlay.
    pub fn reconcile(&mut self, incoming: &[PlaceRecord]) -> ReconcilePlan {
        if let Some(id) = self.selected {
            if !incoming.iter().any(|r| r.id == id) {
                debug!("[MarkerReconciler] Selected marker {} removed", id);
                self.selected = None;
            }
        }

        let plan = diff(&self.overlay, incoming, self.selected);
        self.adopt(&plan);

        debug!(
            "[MarkerReconciler] +{} ~{} -{} ({} on map)",
            plan.to_add.len(),
            plan.to_update.len(),
            plan.to_remove.len(),
            self.overlay.len()
        );
        plan
    }

    /// Change the selection. The returned plan carries the icon updates to
    /// apply right away.
    ///
    /// Selecting an id that is not on the overlay is ignored.
    pub fn select(&mut self, id: Option<i64>) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();
        if id == self.selected {
            return plan;
        }
        if let Some(new) = id {
            if !self.overlay.contains_key(&new) {
                debug!("[MarkerReconciler] Ignoring selection of unknown marker {}", new);
                return plan;
            }
        }

        for (old_or_new, highlighted) in [(self.selected, false), (id, true)] {
            if let Some(marker) = old_or_new.and_then(|i| self.overlay.get(&i)) {
                let mut updated = marker.clone();
                updated.highlighted = highlighted;
                plan.to_update.push(updated);
            }
        }

        self.selected = id;
        self.adopt(&plan);
        plan
    }

    fn adopt(&mut self, plan: &ReconcilePlan) {
        for id in &plan.to_remove {
            self.overlay.remove(id);
        }
        for marker in plan.to_add.iter().chain(&plan.to_update) {
            self.overlay.insert(marker.id, marker.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MarkerIcon;
    use crate::GpsPoint;
    use std::collections::BTreeSet;

    fn record(id: i64, category: &[&str]) -> PlaceRecord {
        PlaceRecord {
            id,
            name: format!("place {}", id),
            latitude: 37.0 + id as f64 * 0.01,
            longitude: 127.0,
            category: category.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn ids(markers: &[PlaceMarker]) -> Vec<i64> {
        markers.iter().map(|m| m.id).collect()
    }

    #[derive(Default)]
    struct RecordingMap {
        calls: Vec<String>,
    }

    impl MapSurface for RecordingMap {
        fn add_marker(&mut self, marker: &PlaceMarker, icon: MarkerIcon) {
            self.calls.push(format!("add {} {:?}", marker.id, icon));
        }
        fn update_marker_icon(&mut self, id: i64, icon: MarkerIcon) {
            self.calls.push(format!("icon {} {:?}", id, icon));
        }
        fn remove_marker(&mut self, id: i64) {
            self.calls.push(format!("remove {}", id));
        }
        fn place_self_marker(&mut self, _at: GpsPoint) {}
        fn move_self_marker(&mut self, _at: GpsPoint) {}
        fn pan_to(&mut self, _at: GpsPoint) {}
    }

    #[test]
    fn test_diff_add_update_remove() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(1, &["a"]), record(2, &["a"]), record(3, &["a"])]);

        let plan = reconciler.reconcile(&[record(2, &["b"]), record(3, &["a"]), record(4, &[])]);
        assert_eq!(ids(&plan.to_add), vec![4]);
        assert_eq!(ids(&plan.to_update), vec![2]);
        assert_eq!(plan.to_remove, vec![1]);
        assert_eq!(
            reconciler.overlay().keys().copied().collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_identical_payload_is_noop() {
        let mut reconciler = MarkerReconciler::new();
        let payload = [record(1, &["a"]), record(2, &[])];
        reconciler.reconcile(&payload);
        assert!(reconciler.reconcile(&payload).is_empty());
    }

    #[test]
    fn test_coordinates_never_revised() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(1, &["a"])]);

        let mut moved = record(1, &["a"]);
        moved.latitude = 10.0;
        moved.name = "renamed".to_string();
        assert!(reconciler.reconcile(&[moved]).is_empty());
        let marker = &reconciler.overlay()[&1];
        assert_eq!(marker.coordinates.latitude, record(1, &[]).latitude);
        assert_eq!(marker.name, "place 1");
    }

    #[test]
    fn test_duplicate_ids_last_wins() {
        let plan = diff(
            &BTreeMap::new(),
            &[record(5, &["first"]), record(5, &["second"])],
            None,
        );
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(
            plan.to_add[0].category,
            BTreeSet::from(["second".to_string()])
        );
    }

    #[test]
    fn test_select_then_map_click_clears() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(7, &["cafe"]), record(8, &[])]);

        let plan = reconciler.select(Some(7));
        assert_eq!(ids(&plan.to_update), vec![7]);
        assert!(plan.to_update[0].highlighted);
        assert_eq!(reconciler.selected(), Some(7));

        let plan = reconciler.select(None);
        assert_eq!(ids(&plan.to_update), vec![7]);
        assert_eq!(plan.to_update[0].icon(), MarkerIcon::Category("cafe".to_string()));
        assert_eq!(reconciler.selected(), None);
        assert!(reconciler.overlay().values().all(|m| !m.highlighted));
    }

    #[test]
    fn test_select_moves_highlight() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(1, &[]), record(2, &[])]);
        reconciler.select(Some(1));

        let plan = reconciler.select(Some(2));
        assert_eq!(ids(&plan.to_update), vec![1, 2]);
        assert!(!plan.to_update[0].highlighted);
        assert!(plan.to_update[1].highlighted);

        // Reselecting and unknown ids change nothing
        assert!(reconciler.select(Some(2)).is_empty());
        assert!(reconciler.select(Some(99)).is_empty());
        assert_eq!(reconciler.selected(), Some(2));
    }

    #[test]
    fn test_selection_survives_payload_and_ignores_payload_highlight() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(1, &[]), record(2, &[])]);
        reconciler.select(Some(2));

        // Selected marker stays highlighted after a new payload
        let plan = reconciler.reconcile(&[record(1, &[]), record(2, &[])]);
        assert!(plan.is_empty());
        assert!(reconciler.overlay()[&2].highlighted);
    }

    #[test]
    fn test_removing_selected_clears_selection() {
        let mut reconciler = MarkerReconciler::new();
        reconciler.reconcile(&[record(1, &[]), record(2, &[])]);
        reconciler.select(Some(2));

        let plan = reconciler.reconcile(&[record(1, &[])]);
        assert_eq!(plan.to_remove, vec![2]);
        assert_eq!(reconciler.selected(), None);

        // Coming back later it is not highlighted
        let plan = reconciler.reconcile(&[record(1, &[]), record(2, &[])]);
        assert!(!plan.to_add[0].highlighted);
    }

    #[test]
    fn test_apply_drives_surface() {
        let mut reconciler = MarkerReconciler::new();
        let mut map = RecordingMap::default();
        apply(&reconciler.reconcile(&[record(1, &["a"]), record(2, &[])]), &mut map);
        apply(&reconciler.reconcile(&[record(2, &["b"]), record(3, &[])]), &mut map);
        apply(&reconciler.select(Some(3)), &mut map);

        assert_eq!(
            map.calls,
            vec![
                "add 1 Category(\"a\")",
                "add 2 Default",
                "remove 1",
                "add 3 Default",
                "icon 2 Category(\"b\")",
                "icon 3 Highlighted",
            ]
        );
    }
}
