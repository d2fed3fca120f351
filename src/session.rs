//! Per-connection evaluation loop.
//!
//! ```text
//! worker                         coordinator
//!   5 READY          ────────▶
//!                    ◀────────   5 READY            (8 FINISHED when no agent is left)
//!   <n> BF_STATE{…}  ────────▶
//!                    ◀────────   <n> { 0.1…, 0.9… }
//!   <n> <png bytes>  ────────▶
//!                    ◀────────   <n> Move2
//!   <n> LOG:text     ────────▶                      (no reply)
//!   <n> FITNESS:12.5 ────────▶                      (back to the handshake)
//! ```

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

use tracing::{debug, info, instrument, trace};

use crate::{
    agent::WorkItem,
    cancellation::CancellationToken,
    decision::{argmax, DecisionFactory, DecisionFunction},
    error::EvalError,
    frame_codec::{self, Frame, FrameDecoder, Tag},
    image_preprocessor,
    state_vectorizer::{render_vector, EncodingSchema},
    work_dispenser::WorkDispenser,
};

/// Framed, cancellable view of one worker socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    worker: usize,
    decoder: FrameDecoder,
    received: VecDeque<Frame>,
    recv_timeout: Duration,
    cancel: CancellationToken,
}

impl Connection {
    /// Blocking reads wake up this often to look at the cancellation token.
    const POLL_INTERVAL: Duration = Duration::from_millis(100);
    const READ_BUFFER: usize = 8192;

    pub fn new(
        stream: TcpStream,
        worker: usize,
        recv_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, EvalError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(
            Self::POLL_INTERVAL
                .min(recv_timeout)
                .max(Duration::from_millis(1)),
        ))?;
        Ok(Self {
            stream,
            worker,
            decoder: FrameDecoder::default(),
            received: VecDeque::new(),
            recv_timeout,
            cancel,
        })
    }

    /// Next frame from the worker, reading the socket only when no decoded frame is queued.
    pub fn recv(&mut self, during: &'static str) -> Result<Frame, EvalError> {
        let deadline = Instant::now() + self.recv_timeout;
        let mut buf = [0; Self::READ_BUFFER];
        loop {
            if let Some(frame) = self.received.pop_front() {
                return Ok(frame);
            }
            if self.cancel.is_cancelled() {
                return Err(EvalError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(EvalError::Timeout {
                    after: self.recv_timeout,
                    during,
                });
            }
            match self.stream.read(&mut buf) {
                // the supervisor shuts connections down once the batch is cancelled
                Ok(0) if self.cancel.is_cancelled() => return Err(EvalError::Cancelled),
                Ok(0) => {
                    return Err(EvalError::ConnectionClosed {
                        worker: self.worker,
                        during,
                    })
                }
                Ok(n) => self.received.extend(self.decoder.push_chunk(&buf[..n])?),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(_) if self.cancel.is_cancelled() => return Err(EvalError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Frame and send `payload`.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), EvalError> {
        match self.stream.write_all(&frame_codec::encode(payload)) {
            Ok(()) => Ok(()),
            Err(_) if self.cancel.is_cancelled() => Err(EvalError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}

/// Evaluates agents pulled from the shared dispenser over one worker connection.
pub struct Session<'a, G, F> {
    conn: Connection,
    dispenser: &'a WorkDispenser<G>,
    factory: &'a F,
    schema: &'a EncodingSchema,
    actions: &'a [&'a str],
    batch_id: u64,
}

impl<'a, G, F: DecisionFactory<G>> Session<'a, G, F> {
    pub fn new(
        conn: Connection,
        dispenser: &'a WorkDispenser<G>,
        factory: &'a F,
        schema: &'a EncodingSchema,
        actions: &'a [&'a str],
        batch_id: u64,
    ) -> Self {
        Self {
            conn,
            dispenser,
            factory,
            schema,
            actions,
            batch_id,
        }
    }

    /// Evaluate agents until the dispenser is exhausted.
    ///
    /// Each ready sentinel of the worker is echoed when an agent is assigned to it, or
    /// answered with the finish sentinel when none is left.
    ///
    /// Returns the number of agents this session evaluated.
    #[instrument(skip_all, fields(batch = self.batch_id, worker = self.conn.worker))]
    pub fn run(mut self) -> Result<usize, EvalError> {
        let mut evaluated = 0;
        loop {
            self.await_handshake()?;

            let Some(item) = self.dispenser.next() else {
                debug!("no agents left for this worker");
                self.conn.send(frame_codec::FINISHED)?;
                return Ok(evaluated);
            };
            self.conn.send(frame_codec::READY)?;
            let position = format!("{}/{}", item.index, self.dispenser.len().saturating_sub(1));
            info!(index = %position, agent = item.id, "evaluating agent");

            let mut function =
                self.factory
                    .create(&item.agent.genome)
                    .map_err(|source| EvalError::Decision {
                        agent: item.id,
                        source,
                    })?;
            let fitness = self.evaluate(&item, &mut function)?;

            item.agent.set_fitness(fitness);
            self.dispenser.mark_complete(item.id);
            evaluated += 1;
            info!(agent = item.id, fitness, "agent evaluated");
        }
    }

    /// Wait for the worker's ready sentinel. It is answered once the next agent is known.
    fn await_handshake(&mut self) -> Result<(), EvalError> {
        loop {
            let frame = self.conn.recv("awaiting handshake")?;
            match frame.tag() {
                Tag::Ready => {
                    trace!("worker is ready");
                    return Ok(());
                }
                Tag::Log => self.forward_log(&frame),
                other => trace!(?other, "ignored before handshake"),
            }
        }
    }

    /// Serve the worker's requests for one agent until it reports a fitness.
    fn evaluate(
        &mut self,
        item: &WorkItem<G>,
        function: &mut F::Function,
    ) -> Result<f64, EvalError> {
        let mut fitness = 0.0;
        loop {
            let frame = self.conn.recv("evaluating")?;
            match frame.tag() {
                Tag::Fitness => {
                    if let Some(reported) = parse_fitness(frame.body())? {
                        fitness = reported;
                    }
                    return Ok(fitness);
                }
                Tag::Log => self.forward_log(&frame),
                Tag::StatePayload => {
                    let inputs = self.schema.vectorize_json(frame.body())?;
                    let outputs = activate(function, item, &inputs)?;
                    self.conn.send(render_vector(&outputs).as_bytes())?;
                }
                Tag::ImagePayload => {
                    let inputs = image_preprocessor::preprocess(frame.body())?;
                    let outputs = activate(function, item, &inputs)?;
                    let action = self.select_action(&outputs)?;
                    trace!(action, "decision");
                    self.conn.send(action.as_bytes())?;
                }
                Tag::Ready | Tag::Finish | Tag::Unknown => {
                    trace!(tag = ?frame.tag(), len = frame.payload().len(), "ignored frame")
                }
            }
        }
    }

    fn select_action(&self, outputs: &[f64]) -> Result<&'a str, EvalError> {
        let best = argmax(outputs)
            .ok_or_else(|| EvalError::protocol("decision function returned no usable output"))?;
        self.actions.get(best).copied().ok_or_else(|| {
            EvalError::protocol(format!(
                "output {best} has no action ({} actions)",
                self.actions.len()
            ))
        })
    }

    fn forward_log(&self, frame: &Frame) {
        debug!(
            worker = self.conn.worker,
            "{}",
            String::from_utf8_lossy(frame.body())
        );
    }
}

fn activate<G, D: DecisionFunction>(
    function: &mut D,
    item: &WorkItem<G>,
    inputs: &[f64],
) -> Result<Vec<f64>, EvalError> {
    function
        .activate(inputs)
        .map_err(|source| EvalError::Decision {
            agent: item.id,
            source,
        })
}

/// `None` for an empty report, which keeps the default fitness.
fn parse_fitness(body: &[u8]) -> Result<Option<f64>, EvalError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| EvalError::protocol("fitness is not valid UTF-8"))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| EvalError::protocol(format!("invalid fitness '{text}'")))
}
