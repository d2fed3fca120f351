use std::{
    net::SocketAddr,
    path::PathBuf,
    process::Child,
    time::{Duration, Instant},
};

use anyhow::Context;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, instrument, warn};

use super::{create_process_group, Worker, WorkerLauncher};
use crate::configuration::Configuration;

/// Launches one emulator per worker, running the evaluation script headless.
#[derive(Debug, Clone)]
pub struct EmulatorLauncher {
    emulator: PathBuf,
    script: PathBuf,
    chromeless: bool,
    allow_stderr: bool,
}

impl EmulatorLauncher {
    pub fn from_config(config: &Configuration) -> anyhow::Result<Self> {
        let script = std::path::absolute(config.eval_script()).with_context(|| {
            format!(
                "could not resolve evaluation script {}",
                config.eval_script().display()
            )
        })?;
        Ok(Self {
            emulator: config.emulator_path.clone(),
            script,
            chromeless: config.chromeless,
            allow_stderr: config.debug_worker_stderr,
        })
    }

    /// Arguments telling the emulator where to connect and which script to run.
    pub fn args(&self, addr: SocketAddr) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if self.chromeless {
            args.push("--chromeless".to_string());
        }
        args.push(format!("--socket_port={}", addr.port()));
        args.push(format!("--socket_ip={}", addr.ip()));
        args.push(format!("--lua={}", self.script.display()));
        args
    }
}

impl WorkerLauncher for EmulatorLauncher {
    type Worker = EmulatorProcess;

    #[instrument(skip(self))]
    fn launch(&self, index: usize, addr: SocketAddr) -> anyhow::Result<EmulatorProcess> {
        let child = create_process_group(&self.emulator, &self.args(addr), self.allow_stderr)
            .context("could not spawn emulator")?;
        debug!(pid = child.id(), "emulator spawned");
        Ok(EmulatorProcess {
            child,
            cleaned_up: false,
        })
    }
}

/// An emulator process group. The whole group is terminated on drop.
#[derive(Debug)]
pub struct EmulatorProcess {
    child: Child,
    cleaned_up: bool,
}

impl EmulatorProcess {
    const GRACE_PERIOD: Duration = Duration::from_secs(2);

    /// SIGTERM the group, wait up to `grace` for the tree to exit, then SIGKILL what is left.
    pub fn try_kill(&mut self, grace: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        let leader = Pid::from_u32(self.child.id());

        // processes that left the group are still in the tree
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut tree = descendants(&sys, leader);
        tree.push(leader);

        signal_group(&mut self.child, GroupSignal::Term);
        for pid in &tree {
            if let Some(process) = sys.process(*pid) {
                process.kill_with(Signal::Term);
            }
        }

        let deadline = Instant::now() + grace;
        let mut alive = tree.clone();
        while !alive.is_empty() && Instant::now() < deadline {
            // reap the leader so it does not linger as a zombie
            let _ = self.child.try_wait();
            sys.refresh_processes(ProcessesToUpdate::Some(&alive[..]), true);
            alive.retain(|pid| is_running(&sys, *pid));
            if !alive.is_empty() {
                std::thread::sleep(Duration::from_millis(10).min(grace / 10));
            }
        }

        if !alive.is_empty() {
            warn!(
                pid = leader.as_u32(),
                survivors = alive.len(),
                "emulator did not exit after SIGTERM, killing"
            );
            signal_group(&mut self.child, GroupSignal::Kill);
            for pid in &alive {
                if let Some(process) = sys.process(*pid) {
                    process.kill();
                }
            }
        }

        self.child.wait().context("could not reap emulator process")?;
        self.cleaned_up = true;
        Ok(())
    }
}

impl Worker for EmulatorProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.try_kill(Self::GRACE_PERIOD)
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(Self::GRACE_PERIOD) {
                warn!("could not terminate emulator {} on drop: {e:#}", self.child.id());
            }
        }
    }
}

/// Every process below `root`, by parent links.
fn descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut found = vec![];
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent) && !found.contains(pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    found
}

fn is_running(sys: &System, pid: Pid) -> bool {
    sys.process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

/// Send `signal` to the process group led by `child`.
#[cfg(unix)]
fn signal_group(child: &mut Child, signal: GroupSignal) {
    let sig = match signal {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // the group id is the leader's pid (spawned with process_group(0))
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    if unsafe { libc::killpg(pgid, sig) } == 0 {
        return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid = child.id(), ?signal, "no process left in group");
    } else {
        warn!(pid = child.id(), ?signal, "could not signal process group: {err}");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: GroupSignal) {
    let _ = child.kill();
}
