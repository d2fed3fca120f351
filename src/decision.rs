//! Traits the optimization engine implements to plug its networks into the coordinator

/// A decision function built from one agent's genome.
///
/// Called once per state or image request received from the worker.
pub trait DecisionFunction {
    /// Feed `inputs` forward and return the output layer.
    ///
    /// # Error
    /// Returned when the network cannot be evaluated (wrong input size, ...). Any error aborts
    /// the batch.
    fn activate(&mut self, inputs: &[f64]) -> anyhow::Result<Vec<f64>>;
}

/// What will be given to the coordinator to build a fresh decision function per agent.
///
/// The factory owns whatever configuration the engine needs to build networks.
pub trait DecisionFactory<G>: Sync {
    /// The concrete network representation.
    type Function: DecisionFunction;

    /// Build a decision function for `genome`.
    fn create(&self, genome: &G) -> anyhow::Result<Self::Function>;
}

impl<F: DecisionFunction + ?Sized> DecisionFunction for Box<F> {
    fn activate(&mut self, inputs: &[f64]) -> anyhow::Result<Vec<f64>> {
        (**self).activate(inputs)
    }
}

/// Index of the highest output, the first one on ties. NaN outputs are never selected.
pub fn argmax(outputs: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &value) in outputs.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i)
}
