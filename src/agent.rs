use std::{
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

/// Identifier given to an agent by the optimization engine.
pub type AgentId = i64;

/// One candidate of the population.
///
/// The genome is owned by the optimization engine and only read here. The fitness is the
/// coordinator's single side effect on the engine: it is written once per evaluated batch.
#[derive(Debug)]
pub struct Agent<G> {
    pub id: AgentId,
    pub genome: G,
    fitness: Mutex<Option<f64>>,
}

impl<G> PartialEq for Agent<G> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<G> Eq for Agent<G> {}

impl<G> Hash for Agent<G> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<G> Agent<G> {
    pub fn new(id: AgentId, genome: G) -> Agent<G> {
        Agent {
            id,
            genome,
            fitness: Mutex::new(None),
        }
    }

    /// `None` until a worker reported a fitness for this agent.
    pub fn fitness(&self) -> Option<f64> {
        *self.fitness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fitness(&self, fitness: f64) {
        *self.fitness.lock().unwrap_or_else(PoisonError::into_inner) = Some(fitness);
    }

    pub(crate) fn clear_fitness(&self) {
        *self.fitness.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// An agent handed out by the [`WorkDispenser`](crate::work_dispenser::WorkDispenser).
#[derive(Debug)]
pub struct WorkItem<G> {
    /// Position of the agent in the batch.
    pub index: usize,
    pub id: AgentId,
    pub agent: Arc<Agent<G>>,
}
