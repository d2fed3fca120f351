use std::{
    io::ErrorKind,
    net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, instrument, warn};

use crate::{
    cancellation::CancellationToken,
    error::EvalError,
    worker_process::{Worker, WorkerLauncher},
};

/// Owns the listening socket, the launched workers and their connections for one batch.
///
/// Everything is torn down by [`teardown`](Self::teardown) or on drop.
pub struct WorkerSupervisor<'l, L: WorkerLauncher> {
    launcher: &'l L,
    listener: Option<TcpListener>,
    addr: SocketAddr,
    workers: Vec<L::Worker>,
    connections: Vec<TcpStream>,
    spawned: usize,
    accept_timeout: Duration,
    cancel: CancellationToken,
}

impl<'l, L: WorkerLauncher> WorkerSupervisor<'l, L> {
    /// Listen on an ephemeral port of `host`.
    pub fn bind(
        launcher: &'l L,
        host: IpAddr,
        accept_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, EvalError> {
        let listener = TcpListener::bind((host, 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        debug!(%addr, "listening for workers");
        Ok(Self {
            launcher,
            listener: Some(listener),
            addr,
            workers: vec![],
            connections: vec![],
            spawned: 0,
            accept_timeout,
            cancel,
        })
    }

    #[cfg(test)]
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of workers launched so far.
    #[cfg(test)]
    fn spawned(&self) -> usize {
        self.spawned
    }

    /// Launch worker `index` and wait for it to connect.
    ///
    /// The wait is bounded by the accept timeout and ends early when the batch is cancelled.
    #[instrument(skip(self))]
    pub fn spawn_and_accept(&mut self, index: usize) -> Result<TcpStream, EvalError> {
        let Some(listener) = &self.listener else {
            return Err(EvalError::Cancelled);
        };

        let worker = self
            .launcher
            .launch(index, self.addr)
            .map_err(|source| EvalError::Spawn {
                worker: index,
                source,
            })?;
        debug!(pid = worker.id(), "worker launched");
        self.workers.push(worker);
        self.spawned += 1;

        let deadline = Instant::now() + self.accept_timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EvalError::Cancelled);
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected");
                    stream.set_nonblocking(false)?;
                    self.connections.push(stream.try_clone()?);
                    return Ok(stream);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(EvalError::Timeout {
                    after: self.accept_timeout,
                    during: "waiting for a worker to connect",
                });
            }
            // at least 10 tries
            thread::sleep(Duration::from_millis(10).min(self.accept_timeout / 10));
        }
    }

    /// Shut down every connection, terminate every worker and stop listening.
    ///
    /// Calling it again is a no-op.
    pub fn teardown(&mut self) {
        for conn in self.connections.drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }
        for mut worker in self.workers.drain(..) {
            let pid = worker.id();
            match worker.terminate() {
                Ok(()) => debug!(pid, "worker terminated"),
                Err(e) => warn!(pid, "could not terminate worker: {e:#}"),
            }
        }
        if self.listener.take().is_some() {
            debug!(spawned = self.spawned, "stopped listening for workers");
        }
    }
}

impl<L: WorkerLauncher> Drop for WorkerSupervisor<'_, L> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::{Arc, Mutex},
    };

    use super::*;

    /// Records terminations; connects to the supervisor only when asked to.
    struct Recorder {
        connect: bool,
        terminated: Arc<Mutex<Vec<usize>>>,
    }

    struct Stub {
        index: usize,
        stream: Option<TcpStream>,
        terminated: Arc<Mutex<Vec<usize>>>,
    }

    impl Worker for Stub {
        fn id(&self) -> u32 {
            self.index as u32
        }

        fn terminate(&mut self) -> anyhow::Result<()> {
            self.stream = None;
            self.terminated.lock().unwrap().push(self.index);
            Ok(())
        }
    }

    impl WorkerLauncher for Recorder {
        type Worker = Stub;

        fn launch(&self, index: usize, addr: SocketAddr) -> anyhow::Result<Stub> {
            let stream = if self.connect {
                Some(TcpStream::connect(addr)?)
            } else {
                None
            };
            Ok(Stub {
                index,
                stream,
                terminated: self.terminated.clone(),
            })
        }
    }

    fn recorder(connect: bool) -> Recorder {
        Recorder {
            connect,
            terminated: Arc::default(),
        }
    }

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn accepted_workers_are_terminated_once() {
        let launcher = recorder(true);
        let mut supervisor = WorkerSupervisor::bind(
            &launcher,
            LOCALHOST,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();
        assert_ne!(supervisor.local_addr().port(), 0);

        supervisor.spawn_and_accept(0).unwrap();
        supervisor.spawn_and_accept(1).unwrap();
        assert_eq!(supervisor.spawned(), 2);

        supervisor.teardown();
        supervisor.teardown();
        drop(supervisor);
        assert_eq!(*launcher.terminated.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn silent_worker_times_out() {
        let launcher = recorder(false);
        let mut supervisor = WorkerSupervisor::bind(
            &launcher,
            LOCALHOST,
            Duration::from_millis(100),
            CancellationToken::new(),
        )
        .unwrap();

        let err = supervisor.spawn_and_accept(0).unwrap_err();
        assert!(matches!(err, EvalError::Timeout { .. }), "{err}");
        drop(supervisor);
        assert_eq!(*launcher.terminated.lock().unwrap(), vec![0]);
    }

    #[test]
    fn cancelled_supervisor_stops_waiting() {
        let launcher = recorder(false);
        let cancel = CancellationToken::new();
        let mut supervisor =
            WorkerSupervisor::bind(&launcher, LOCALHOST, Duration::from_secs(60), cancel.clone())
                .unwrap();
        cancel.cancel();
        let err = supervisor.spawn_and_accept(0).unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn nothing_is_launched_after_teardown() {
        let launcher = recorder(true);
        let mut supervisor = WorkerSupervisor::bind(
            &launcher,
            LOCALHOST,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();
        supervisor.teardown();
        assert!(supervisor.spawn_and_accept(0).unwrap_err().is_cancellation());
        assert_eq!(supervisor.spawned(), 0);
    }
}
