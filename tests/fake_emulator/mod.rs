//! Simulated emulator workers speaking the wire protocol over real TCP sockets.

use std::{
    collections::VecDeque,
    io::{Cursor, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use eval_coordinator::{
    decision::{DecisionFactory, DecisionFunction},
    frame_codec::{self, Frame, FrameDecoder, Tag},
    worker_process::{Worker, WorkerLauncher},
};
use image::{GrayImage, ImageFormat, Luma};

/// What a simulated worker does with each agent it is given.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Behavior {
    /// Request one decision on a state snapshot, optionally one on a screenshot, then report
    /// the sum of the state decision as fitness.
    Play { screenshot: bool },
    /// Report a fitness message without a value.
    EmptyFitness,
    /// Request one decision, then drop the connection.
    CloseMidEvaluation,
    /// Never connect to the coordinator.
    NeverConnect,
    /// Fail to start at all.
    FailLaunch,
}

/// Launches [`FakeWorker`]s. Behaviors are picked by launch order, the last one repeats.
pub struct FakeEmulator {
    behaviors: Vec<Behavior>,
    launched: AtomicUsize,
    pub terminated: Arc<Mutex<Vec<usize>>>,
    pub actions: Arc<Mutex<Vec<String>>>,
}

impl FakeEmulator {
    pub fn new(behaviors: Vec<Behavior>) -> Self {
        assert!(!behaviors.is_empty());
        FakeEmulator {
            behaviors,
            launched: AtomicUsize::new(0),
            terminated: Arc::default(),
            actions: Arc::default(),
        }
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Launch numbers of the terminated workers, sorted.
    pub fn terminated(&self) -> Vec<usize> {
        let mut terminated = self.terminated.lock().unwrap().clone();
        terminated.sort_unstable();
        terminated
    }

    /// Action labels received by every worker.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }
}

impl WorkerLauncher for FakeEmulator {
    type Worker = FakeWorker;

    fn launch(&self, _index: usize, addr: SocketAddr) -> anyhow::Result<FakeWorker> {
        let launch = self.launched.fetch_add(1, Ordering::SeqCst);
        let behavior = *self
            .behaviors
            .get(launch)
            .or(self.behaviors.last())
            .expect("at least one behavior");

        let stop = Arc::new(AtomicBool::new(false));
        let handle = match behavior {
            Behavior::FailLaunch => anyhow::bail!("no emulator for launch {launch}"),
            Behavior::NeverConnect => None,
            _ => {
                let stop = stop.clone();
                let actions = self.actions.clone();
                Some(thread::spawn(move || play(addr, behavior, &stop, &actions)))
            }
        };
        Ok(FakeWorker {
            launch,
            stop,
            handle,
            terminated: self.terminated.clone(),
        })
    }
}

pub struct FakeWorker {
    launch: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    terminated: Arc<Mutex<Vec<usize>>>,
}

impl Worker for FakeWorker {
    fn id(&self) -> u32 {
        self.launch as u32
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("fake worker panicked"))?;
        }
        self.terminated.lock().unwrap().push(self.launch);
        Ok(())
    }
}

struct Wire<'s> {
    stream: TcpStream,
    decoder: FrameDecoder,
    received: VecDeque<Frame>,
    stop: &'s AtomicBool,
}

impl Wire<'_> {
    fn send(&mut self, payload: &[u8]) -> Option<()> {
        self.stream.write_all(&frame_codec::encode(payload)).ok()
    }

    /// `None` once the coordinator hung up or the worker was stopped.
    fn recv(&mut self) -> Option<Frame> {
        let mut buf = [0; 4096];
        loop {
            if let Some(frame) = self.received.pop_front() {
                return Some(frame);
            }
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.received.extend(self.decoder.push_chunk(&buf[..n]).ok()?),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(_) => return None,
            }
        }
    }
}

fn play(addr: SocketAddr, behavior: Behavior, stop: &AtomicBool, actions: &Mutex<Vec<String>>) {
    let Ok(stream) = TcpStream::connect(addr) else {
        return;
    };
    if stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .is_err()
    {
        return;
    }
    let mut wire = Wire {
        stream,
        decoder: FrameDecoder::default(),
        received: VecDeque::new(),
        stop,
    };

    loop {
        if wire.send(frame_codec::READY).is_none() {
            return;
        }
        let Some(reply) = wire.recv() else {
            return;
        };
        if reply.tag() == Tag::Finish {
            return;
        }

        let played = match behavior {
            Behavior::Play { screenshot } => play_agent(&mut wire, screenshot, actions),
            Behavior::EmptyFitness => wire.send(b"FITNESS:"),
            Behavior::CloseMidEvaluation => {
                let _ = state_decision(&mut wire);
                return;
            }
            Behavior::NeverConnect | Behavior::FailLaunch => unreachable!(),
        };
        if played.is_none() {
            return;
        }
    }
}

fn play_agent(wire: &mut Wire, screenshot: bool, actions: &Mutex<Vec<String>>) -> Option<()> {
    wire.send(b"LOG:agent loaded")?;
    let fitness: f64 = state_decision(wire)?.iter().sum();
    if screenshot {
        wire.send(&screenshot_png())?;
        let label = wire.recv()?;
        actions
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(label.payload()).into_owned());
    }
    wire.send(format!("FITNESS:{fitness}").as_bytes())
}

/// Send a snapshot whose only feature is the game state and parse the reply vector.
fn state_decision(wire: &mut Wire) -> Option<Vec<f64>> {
    wire.send(br#"BF_STATE{"State": 1}"#)?;
    let reply = wire.recv()?;
    let text = String::from_utf8(reply.into_payload()).ok()?;
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(|value| value.trim().parse().ok())
        .collect()
}

pub fn screenshot_png() -> Vec<u8> {
    let img = GrayImage::from_fn(8, 8, |x, y| Luma([(x * 30 + y) as u8]));
    let mut bytes = vec![];
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encoding");
    bytes
}

/// Multiplies every input by the genome.
pub struct Scale(f64);

impl DecisionFunction for Scale {
    fn activate(&mut self, inputs: &[f64]) -> anyhow::Result<Vec<f64>> {
        Ok(inputs.iter().map(|x| x * self.0).collect())
    }
}

/// Builds a [`Scale`] per agent, refusing negative genomes.
pub struct ScaleFactory;

impl DecisionFactory<f64> for ScaleFactory {
    type Function = Scale;

    fn create(&self, genome: &f64) -> anyhow::Result<Scale> {
        anyhow::ensure!(*genome >= 0.0, "negative genome {genome}");
        Ok(Scale(*genome))
    }
}
