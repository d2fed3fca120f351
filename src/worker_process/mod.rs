//! Worker processes the coordinator evaluates agents with.
//!
//! The supervisor only knows workers through [`WorkerLauncher`] and [`Worker`]: the production
//! implementation launches emulators ([`EmulatorLauncher`]), tests plug in simulated workers.

mod emulator;

use std::{
    net::SocketAddr,
    path::Path,
    process::{Child, Command, Stdio},
};

use anyhow::Context;

pub use emulator::{EmulatorLauncher, EmulatorProcess};

/// A running worker.
pub trait Worker: Send {
    /// Process (group) identifier, for logs.
    fn id(&self) -> u32;

    /// Stop the worker and everything it started. Calling it again is a no-op.
    fn terminate(&mut self) -> anyhow::Result<()>;
}

/// Starts workers that will connect back to the coordinator.
pub trait WorkerLauncher: Sync {
    type Worker: Worker;

    /// Launch worker number `index`, which must connect to `addr`.
    fn launch(&self, index: usize, addr: SocketAddr) -> anyhow::Result<Self::Worker>;
}

impl<L: WorkerLauncher> WorkerLauncher for &L {
    type Worker = L::Worker;

    fn launch(&self, index: usize, addr: SocketAddr) -> anyhow::Result<Self::Worker> {
        (**self).launch(index, addr)
    }
}

/// Spawn `command` as the leader of a new process group.
fn create_process_group(
    command: &Path,
    args: &[String],
    allow_stderr: bool,
) -> anyhow::Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null());
    if !allow_stderr {
        cmd.stderr(Stdio::null());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
        .with_context(|| format!("command '{}' could not be started", command.display()))
}
