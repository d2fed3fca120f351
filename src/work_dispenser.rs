use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::trace;

use crate::agent::{Agent, AgentId, WorkItem};

/// Shared cursor over the batch.
///
/// `next_index` only moves forward and an identifier is in `completed` at most once.
#[derive(Debug, Default)]
struct DispatchState {
    next_index: usize,
    completed: HashSet<AgentId>,
    debug_target_issued: bool,
}

/// Hands out the agents of one batch to concurrent sessions, each agent exactly once.
///
/// When a debug target is set only that agent is issued, after which the batch counts as
/// exhausted.
#[derive(Debug)]
pub struct WorkDispenser<G> {
    agents: Vec<Arc<Agent<G>>>,
    debug_target: Option<AgentId>,
    state: Mutex<DispatchState>,
}

impl<G> WorkDispenser<G> {
    pub fn new(agents: &[Arc<Agent<G>>], debug_target: Option<AgentId>) -> Self {
        Self {
            agents: agents.to_vec(),
            debug_target,
            state: Mutex::new(DispatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next agent nobody has been given yet, `None` once the batch is exhausted.
    pub fn next(&self) -> Option<WorkItem<G>> {
        let mut state = self.lock();
        while state.next_index < self.agents.len() {
            let index = state.next_index;
            state.next_index += 1;

            let agent = &self.agents[index];
            if state.completed.contains(&agent.id) {
                continue;
            }
            match self.debug_target {
                Some(target) if target != agent.id => continue,
                Some(_) => {
                    trace!(agent = agent.id, "debug target found, closing the batch");
                    state.next_index = self.agents.len();
                    state.debug_target_issued = true;
                }
                None => {}
            }
            return Some(WorkItem {
                index,
                id: agent.id,
                agent: agent.clone(),
            });
        }
        None
    }

    /// Record that `id` got its fitness. Returns false if it already had.
    pub fn mark_complete(&self, id: AgentId) -> bool {
        self.lock().completed.insert(id)
    }

    /// Number of agents marked complete.
    pub fn completed(&self) -> usize {
        self.lock().completed.len()
    }

    /// Number of agents in the batch.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents that can still be issued, the debug target only in debug mode.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        let remaining = &self.agents[state.next_index.min(self.agents.len())..];
        let count = remaining
            .iter()
            .filter(|agent| !state.completed.contains(&agent.id))
            .filter(|agent| self.debug_target.map_or(true, |target| target == agent.id))
            .count();
        match self.debug_target {
            Some(_) => count.min(1),
            None => count,
        }
    }

    /// True once the debug target has been handed out.
    pub fn debug_target_issued(&self) -> bool {
        self.lock().debug_target_issued
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, thread};

    use super::*;

    fn batch(ids: impl IntoIterator<Item = AgentId>) -> Vec<Arc<Agent<()>>> {
        ids.into_iter().map(|id| Arc::new(Agent::new(id, ()))).collect()
    }

    #[test]
    fn issues_in_order_then_none() {
        let dispenser = WorkDispenser::new(&batch([10, 11, 12]), None);
        assert_eq!(dispenser.pending(), 3);
        let items: Vec<_> = std::iter::from_fn(|| dispenser.next()).collect();
        assert_eq!(
            items.iter().map(|i| (i.index, i.id)).collect::<Vec<_>>(),
            vec![(0, 10), (1, 11), (2, 12)]
        );
        assert!(dispenser.next().is_none());
        assert_eq!(dispenser.pending(), 0);
    }

    #[test]
    fn every_agent_exactly_once_under_contention() {
        for workers in [1, 2, 3, 8] {
            let agents = batch(0..200);
            let dispenser = WorkDispenser::new(&agents, None);
            let seen: Vec<Vec<AgentId>> = thread::scope(|s| {
                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        s.spawn(|| {
                            let mut mine = vec![];
                            while let Some(item) = dispenser.next() {
                                assert!(dispenser.mark_complete(item.id));
                                mine.push(item.id);
                            }
                            mine
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let mut counts: HashMap<AgentId, usize> = HashMap::new();
            for id in seen.into_iter().flatten() {
                *counts.entry(id).or_default() += 1;
            }
            assert_eq!(counts.len(), 200, "{workers} workers");
            assert!(counts.values().all(|&c| c == 1));
            assert_eq!(dispenser.completed(), 200);
            assert!(dispenser.next().is_none());
        }
    }

    #[test]
    fn debug_isolation_issues_only_the_target() {
        let dispenser = WorkDispenser::new(&batch([3, 7, 9, 7]), Some(7));
        assert_eq!(dispenser.pending(), 1);
        let item = dispenser.next().unwrap();
        assert_eq!((item.index, item.id), (1, 7));
        assert!(dispenser.debug_target_issued());
        assert!(dispenser.next().is_none());
        assert_eq!(dispenser.pending(), 0);
    }

    #[test]
    fn missing_debug_target_issues_nothing() {
        let dispenser = WorkDispenser::new(&batch([1, 2]), Some(5));
        assert!(dispenser.next().is_none());
        assert!(!dispenser.debug_target_issued());
    }

    #[test]
    fn completed_agents_are_skipped() {
        let dispenser = WorkDispenser::new(&batch([1, 2, 3]), None);
        assert!(dispenser.mark_complete(2));
        assert!(!dispenser.mark_complete(2));
        let ids: Vec<_> = std::iter::from_fn(|| dispenser.next()).map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
