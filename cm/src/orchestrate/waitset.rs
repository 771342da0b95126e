//! Wait-set of one orchestration
//!
//! Maps each entity still being waited on to the terminal state it must
//! reach. Entities only ever leave the set; once it is empty the
//! orchestration has converged, and that is reported exactly once.
//!
//! The state an entity was in when the orchestration began is kept too: a
//! failure state left over from an earlier run only counts once this run
//! has moved the entity through a transitional state.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{EntityRef, MonitorRecord, MonitorState, OrchestrationId};

/// What one observed record meant for the orchestration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Last entity reached its expected state
    Converged,
    /// An entity reached its expected state or moved along
    Progress,
    /// An entity ended in a failure state or disappeared
    Failed(String),
    /// Not ours, already done, or a duplicate
    Ignored,
}

#[derive(Debug, Clone)]
pub struct WaitSet {
    id: OrchestrationId,
    expected: BTreeMap<EntityRef, MonitorState>,
    initial: HashMap<EntityRef, MonitorState>,
    last_seen: HashMap<EntityRef, MonitorState>,
    done: Vec<EntityRef>,
    converged: bool,
}

impl WaitSet {
    pub fn new(id: OrchestrationId) -> Self {
        Self {
            id,
            expected: BTreeMap::new(),
            initial: HashMap::new(),
            last_seen: HashMap::new(),
            done: Vec::new(),
            converged: false,
        }
    }

    /// Wait for `entity` to move from `initial` to `expected`
    pub fn insert(&mut self, entity: EntityRef, initial: MonitorState, expected: MonitorState) {
        self.initial.insert(entity.clone(), initial);
        self.expected.insert(entity, expected);
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.expected.contains_key(entity)
    }

    /// Entities still being waited on
    pub fn pending(&self) -> impl Iterator<Item = &EntityRef> {
        self.expected.keys()
    }

    /// Entities that reached their expected state, in arrival order
    pub fn done(&self) -> &[EntityRef] {
        &self.done
    }

    /// Last transitional state seen for an entity
    pub fn last_seen(&self, entity: &EntityRef) -> Option<MonitorState> {
        self.last_seen.get(entity).copied()
    }

    pub fn observe(&mut self, entity: &EntityRef, record: &MonitorRecord) -> Observation {
        let Some(expected) = self.expected.get(entity).copied() else {
            return Observation::Ignored;
        };
        if record.orchestration_id != Some(self.id) {
            return Observation::Ignored;
        }

        if record.state == expected {
            self.expected.remove(entity);
            self.done.push(entity.clone());
            if self.expected.is_empty() && !self.converged {
                self.converged = true;
                return Observation::Converged;
            }
            return Observation::Progress;
        }
        if record.state.is_failure() {
            let stale = self.initial.get(entity) == Some(&record.state) && !self.last_seen.contains_key(entity);
            if stale {
                return Observation::Ignored;
            }
            return Observation::Failed(format!("{} ended in {}", entity, record.state));
        }
        if record.state.is_transitional() {
            self.last_seen.insert(entity.clone(), record.state);
            return Observation::Progress;
        }
        Observation::Ignored
    }

    /// The entity's record was removed while being waited on
    pub fn observe_deleted(&mut self, entity: &EntityRef) -> Observation {
        if !self.expected.contains_key(entity) {
            return Observation::Ignored;
        }
        Observation::Failed(format!("{} was removed", entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LocalExpect, MonitorPatch};

    fn entity(s: &str) -> EntityRef {
        s.parse().unwrap()
    }

    fn record(state: MonitorState, id: OrchestrationId) -> MonitorRecord {
        let mut record = MonitorRecord::new();
        record.apply(&MonitorPatch::new().state(state).local_expect(LocalExpect::Shutdown), id);
        record
    }

    fn wait_set(id: OrchestrationId) -> WaitSet {
        let mut set = WaitSet::new(id);
        for e in ["ns1/svc/e1@n1", "ns1/svc/e2@n1", "ns1/svc/e3@n1"] {
            set.insert(entity(e), MonitorState::Idle, MonitorState::Shutdown);
        }
        set
    }

    #[test]
    fn test_converges_once_in_any_order() {
        let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];
        let names = ["ns1/svc/e1@n1", "ns1/svc/e2@n1", "ns1/svc/e3@n1"];
        for order in orders {
            let id = OrchestrationId::new();
            let mut set = wait_set(id);
            let done = record(MonitorState::Shutdown, id);

            let mut converged = 0;
            for i in order {
                let e = entity(names[i]);
                // Duplicates are harmless
                for _ in 0..2 {
                    if set.observe(&e, &done) == Observation::Converged {
                        converged += 1;
                    }
                }
            }
            assert_eq!(converged, 1);
            assert!(set.is_empty());
            assert_eq!(set.done().len(), 3);
        }
    }

    #[test]
    fn test_transitional_only_tracks() {
        let id = OrchestrationId::new();
        let mut set = wait_set(id);
        let e1 = entity("ns1/svc/e1@n1");
        assert_eq!(
            set.observe(&e1, &record(MonitorState::ShuttingDown, id)),
            Observation::Progress
        );
        assert_eq!(set.last_seen(&e1), Some(MonitorState::ShuttingDown));
        assert!(set.contains(&e1));
    }

    #[test]
    fn test_foreign_orchestration_ignored() {
        let id = OrchestrationId::new();
        let mut set = wait_set(id);
        let e1 = entity("ns1/svc/e1@n1");
        let other = record(MonitorState::Shutdown, OrchestrationId::new());
        assert_eq!(set.observe(&e1, &other), Observation::Ignored);
        assert!(set.contains(&e1));
        assert_eq!(set.observe(&entity("ns1/svc/zz@n1"), &other), Observation::Ignored);
    }

    #[test]
    fn test_failure_state_fails() {
        let id = OrchestrationId::new();
        let mut set = wait_set(id);
        let e2 = entity("ns1/svc/e2@n1");
        assert!(matches!(
            set.observe(&e2, &record(MonitorState::ShutdownFailed, id)),
            Observation::Failed(_)
        ));
        assert!(matches!(set.observe_deleted(&e2), Observation::Failed(_)));
    }

    #[test]
    fn test_leftover_failure_state_waits_for_this_run() {
        let id = OrchestrationId::new();
        let mut set = WaitSet::new(id);
        let e1 = entity("ns1/svc/e1@n1");
        set.insert(e1.clone(), MonitorState::StopFailed, MonitorState::Stopped);

        // The expectation is set but nothing has run yet
        let mut pending = MonitorRecord::new();
        pending.apply(
            &MonitorPatch::new().state(MonitorState::StopFailed).local_expect(LocalExpect::Stop),
            id,
        );
        assert_eq!(set.observe(&e1, &pending), Observation::Ignored);

        assert_eq!(set.observe(&e1, &record(MonitorState::Stopping, id)), Observation::Progress);
        assert!(matches!(
            set.observe(&e1, &record(MonitorState::StopFailed, id)),
            Observation::Failed(_)
        ));
    }

    #[test]
    fn test_different_failure_state_fails_at_once() {
        let id = OrchestrationId::new();
        let mut set = WaitSet::new(id);
        let e1 = entity("ns1/svc/e1@n1");
        set.insert(e1.clone(), MonitorState::StartFailed, MonitorState::Stopped);
        assert!(matches!(
            set.observe(&e1, &record(MonitorState::StopFailed, id)),
            Observation::Failed(_)
        ));
    }

    #[test]
    fn test_removed_entity_never_reenters() {
        let id = OrchestrationId::new();
        let mut set = wait_set(id);
        let e1 = entity("ns1/svc/e1@n1");
        set.observe(&e1, &record(MonitorState::Shutdown, id));
        assert_eq!(
            set.observe(&e1, &record(MonitorState::ShutdownFailed, id)),
            Observation::Ignored
        );
        assert_eq!(set.observe_deleted(&e1), Observation::Ignored);
    }
}
