//! Batch evaluation.
//!
//! The [`Coordinator`] evaluates a batch of agents on a pool of workers:
//!
//! - every agent's fitness is cleared, then one dispenser is built for the batch
//! - `min(workers, pending agents)` workers are launched and accepted one after the other
//! - each connection is served by its own [`Session`] thread pulling agents from the dispenser
//! - the first failing session cancels all the others and the workers are torn down at once
//!
//! A failed batch is reported as a single [`EvalError`]; fitness values already written are
//! not trusted and the caller is expected to retry the whole batch, see
//! [`Coordinator::evaluate_until_success`].
//!
//! # Debug isolation
//!
//! When [`Configuration::with_debug_agent`] names an agent, only that agent is evaluated and
//! the batch ends with [`BatchOutcome::DebugIsolated`]. This is not an error.

use std::{
    sync::{mpsc, Arc},
    thread,
};

use tracing::{error, info, instrument, trace, warn};

use crate::{
    agent::Agent,
    cancellation::CancellationToken,
    configuration::Configuration,
    decision::DecisionFactory,
    error::EvalError,
    logger::init_logger,
    session::{Connection, Session},
    state_vectorizer::EncodingSchema,
    supervisor::WorkerSupervisor,
    work_dispenser::WorkDispenser,
    worker_process::{EmulatorLauncher, WorkerLauncher},
};

/// How a successful batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every agent of the batch has a fitness.
    Completed,
    /// Only the debug agent was evaluated, the others keep no fitness.
    DebugIsolated,
}

/// Summary of a successful batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: u64,
    /// Agents that received a fitness.
    pub evaluated: usize,
    /// Agents in the batch.
    pub total: usize,
    pub outcome: BatchOutcome,
}

/// Runs batches of agents on workers started by `L`.
pub struct Coordinator<L> {
    config: Configuration,
    launcher: L,
}

impl Coordinator<EmulatorLauncher> {
    /// Coordinator launching emulators as configured.
    ///
    /// # Errors
    /// Fails if the evaluation script path cannot be resolved.
    pub fn with_emulator(config: Configuration) -> anyhow::Result<Self> {
        let launcher = EmulatorLauncher::from_config(&config)?;
        Ok(Self::new(config, launcher))
    }
}

impl<L: WorkerLauncher> Coordinator<L> {
    #[instrument(skip_all)]
    pub fn new(config: Configuration, launcher: L) -> Self {
        if config.log {
            if let Err(e) = init_logger(&config.log_dir) {
                warn!("could not set up file logging: {e:#}");
            }
        }
        trace!(?config);
        Coordinator { config, launcher }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Evaluate every agent of the batch and store its fitness.
    ///
    /// # Errors
    /// Any session failure (closed connection, timeout, protocol or decision error) as well as
    /// a worker that cannot be launched or never connects fails the whole batch. All workers
    /// are terminated before this returns, whatever the result.
    #[instrument(skip_all, fields(batch = batch_id))]
    pub fn evaluate_batch<G, F>(
        &self,
        agents: &[Arc<Agent<G>>],
        factory: &F,
        batch_id: u64,
    ) -> Result<BatchReport, EvalError>
    where
        G: Send + Sync,
        F: DecisionFactory<G>,
    {
        for agent in agents {
            agent.clear_fitness();
        }
        let dispenser = WorkDispenser::new(agents, self.config.debug_agent());
        let workers = self.config.workers().min(dispenser.pending());
        info!(
            batch = batch_id,
            completed = 0,
            total = agents.len(),
            workers,
            "starting batch"
        );

        if workers == 0 {
            return Ok(BatchReport {
                batch_id,
                evaluated: 0,
                total: agents.len(),
                outcome: self.outcome(&dispenser),
            });
        }

        let cancel = CancellationToken::new();
        let mut supervisor = WorkerSupervisor::bind(
            &self.launcher,
            self.config.host,
            self.config.accept_timeout,
            cancel.clone(),
        )?;
        let result = self.run_sessions(
            &mut supervisor,
            &dispenser,
            factory,
            workers,
            batch_id,
            &cancel,
        );
        supervisor.teardown();

        let evaluated = dispenser.completed();
        match result {
            Ok(()) => {
                info!(evaluated, total = agents.len(), "batch evaluated");
                Ok(BatchReport {
                    batch_id,
                    evaluated,
                    total: agents.len(),
                    outcome: self.outcome(&dispenser),
                })
            }
            Err(e) => {
                error!(
                    batch = batch_id,
                    completed = evaluated,
                    total = agents.len(),
                    "batch failed: {e}"
                );
                Err(e)
            }
        }
    }

    /// Debug mode isolates the batch even when the target was never handed out.
    fn outcome<G>(&self, dispenser: &WorkDispenser<G>) -> BatchOutcome {
        let Some(agent) = self.config.debug_agent() else {
            return BatchOutcome::Completed;
        };
        if !dispenser.debug_target_issued() {
            warn!(agent, "debug agent is not part of the batch");
        }
        BatchOutcome::DebugIsolated
    }

    /// [`evaluate_batch`](Self::evaluate_batch) again until it succeeds, at most
    /// `max_attempts` times.
    pub fn evaluate_until_success<G, F>(
        &self,
        agents: &[Arc<Agent<G>>],
        factory: &F,
        batch_id: u64,
    ) -> Result<BatchReport, EvalError>
    where
        G: Send + Sync,
        F: DecisionFactory<G>,
    {
        let mut attempt = 1;
        loop {
            match self.evaluate_batch(agents, factory, batch_id) {
                Ok(report) => return Ok(report),
                Err(e) if attempt < self.config.max_attempts => {
                    warn!(batch = batch_id, attempt, "batch failed, retrying: {e}");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Launch the workers and serve each of them on its own thread until the batch is
    /// exhausted or a session fails.
    fn run_sessions<G, F>(
        &self,
        supervisor: &mut WorkerSupervisor<'_, L>,
        dispenser: &WorkDispenser<G>,
        factory: &F,
        workers: usize,
        batch_id: u64,
        cancel: &CancellationToken,
    ) -> Result<(), EvalError>
    where
        G: Send + Sync,
        F: DecisionFactory<G>,
    {
        let schema = EncodingSchema::v1();
        let actions = self.config.game_mode().actions();
        let mut failure = None;

        thread::scope(|s| {
            let (tx_result, rx_result) = mpsc::channel();

            for index in 0..workers {
                let conn = supervisor.spawn_and_accept(index).and_then(|stream| {
                    Connection::new(stream, index, self.config.recv_timeout, cancel.clone())
                });
                let conn = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        cancel.cancel();
                        record_failure(&mut failure, e);
                        break;
                    }
                };

                let tx_result = tx_result.clone();
                let cancel = cancel.clone();
                s.spawn(move || {
                    let session = Session::new(conn, dispenser, factory, schema, actions, batch_id);
                    let result = session.run();
                    if result.is_err() {
                        cancel.cancel();
                    }
                    // the receiver outlives every session
                    let _ = tx_result.send((index, result));
                });
            }
            drop(tx_result);

            // not all sessions done <=> a sender is alive
            for (index, result) in rx_result {
                match result {
                    Ok(evaluated) => trace!(worker = index, evaluated, "session finished"),
                    Err(e) => {
                        if failure.is_none() {
                            cancel.cancel();
                            supervisor.teardown();
                        }
                        trace!(worker = index, "session failed: {e}");
                        record_failure(&mut failure, e);
                    }
                }
            }
        });

        failure.map_or(Ok(()), Err)
    }
}

/// Keep the first failure, unless it only reported a cancellation caused by a later one.
fn record_failure(failure: &mut Option<EvalError>, error: EvalError) {
    let keep = match failure {
        None => false,
        Some(current) => !current.is_cancellation() || error.is_cancellation(),
    };
    if !keep {
        *failure = Some(error);
    }
}
