//! Config for the coordinator behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set the value to `"true"` to enable one.
//! Unparsable values fall back to the default.
//!
//! - `EVAL_WORKERS` — Number of concurrent emulator workers, `0` for one per logical CPU (default: `5`)
//! - `EVAL_EMULATOR_PATH` — Emulator launch script (default: `../BizHawk-2.9.1-linux-x64/EmuHawkMono.sh`)
//! - `EVAL_GAME_MODE` — `open_world` or `battle_factory` (default: `battle_factory`)
//! - `EVAL_SCRIPT` — Override the game mode's evaluation script
//! - `EVAL_HOST` — Address the listening socket binds to (default: `127.0.0.1`)
//! - `EVAL_ACCEPT_TIMEOUT_SECS` — Bound on waiting for a worker to connect (default: `300`)
//! - `EVAL_RECV_TIMEOUT_SECS` — Bound on waiting for a worker message (default: `300`)
//! - `EVAL_DEBUG_AGENT` — Evaluate only the agent with this identifier (default: unset)
//! - `EVAL_CHROMELESS` — Start emulators without their window chrome (default: `true`)
//! - `EVAL_LOG` — Enable logging to a file (default: `false`)
//! - `EVAL_LOG_DIR` — Directory of the log file (default: `logs`)
//! - `EVAL_DEBUG_WORKER_STDERR` — Forward emulator stderr (default: `false`)
//! - `EVAL_MAX_ATTEMPTS` — Attempts made by `evaluate_until_success` (default: `3`)

use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{agent::AgentId, game_mode::GameMode};

/// Configuration for coordinator behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) workers: usize,
    pub(crate) emulator_path: PathBuf,
    pub(crate) game_mode: GameMode,
    pub(crate) eval_script: Option<PathBuf>,
    pub(crate) host: IpAddr,
    pub(crate) accept_timeout: Duration,
    pub(crate) recv_timeout: Duration,
    pub(crate) debug_agent: Option<AgentId>,
    pub(crate) chromeless: bool,
    pub(crate) log: bool,
    pub(crate) log_dir: PathBuf,
    pub(crate) debug_worker_stderr: bool,
    pub(crate) max_attempts: usize,
}

impl Configuration {
    const DEFAULT_EMULATOR: &'static str = "../BizHawk-2.9.1-linux-x64/EmuHawkMono.sh";

    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Five emulator workers run concurrently.
    /// - The battle factory mode is evaluated.
    /// - Accepts and receives time out after five minutes.
    /// - Every agent of a batch is evaluated (no debug isolation).
    /// - Logging to file is disabled.
    pub fn new() -> Self {
        Self {
            workers: 5,
            emulator_path: PathBuf::from(Self::DEFAULT_EMULATOR),
            game_mode: GameMode::BattleFactory,
            eval_script: None,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_timeout: Duration::from_secs(300),
            recv_timeout: Duration::from_secs(300),
            debug_agent: None,
            chromeless: true,
            log: false,
            log_dir: PathBuf::from("logs"),
            debug_worker_stderr: false,
            max_attempts: 3,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Any variable that is unset
    /// or cannot be parsed leaves the default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_parsed<T: FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.trim().parse().ok()
        }

        let mut config = Self::new();
        if let Some(workers) = get_env_parsed::<usize>("EVAL_WORKERS") {
            config = config.with_workers(workers);
        }
        if let Ok(path) = std::env::var("EVAL_EMULATOR_PATH") {
            config.emulator_path = PathBuf::from(path);
        }
        if let Some(mode) = get_env_parsed::<GameMode>("EVAL_GAME_MODE") {
            config.game_mode = mode;
        }
        if let Ok(script) = std::env::var("EVAL_SCRIPT") {
            config.eval_script = Some(PathBuf::from(script));
        }
        if let Some(host) = get_env_parsed::<IpAddr>("EVAL_HOST") {
            config.host = host;
        }
        if let Some(secs) = get_env_parsed::<u64>("EVAL_ACCEPT_TIMEOUT_SECS") {
            config.accept_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = get_env_parsed::<u64>("EVAL_RECV_TIMEOUT_SECS") {
            config.recv_timeout = Duration::from_secs(secs);
        }
        if let Some(id) = get_env_parsed::<AgentId>("EVAL_DEBUG_AGENT") {
            config = config.with_debug_agent(Some(id));
        }
        config.chromeless = get_env_flag("EVAL_CHROMELESS", config.chromeless);
        config.log = get_env_flag("EVAL_LOG", config.log);
        if let Ok(dir) = std::env::var("EVAL_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.debug_worker_stderr =
            get_env_flag("EVAL_DEBUG_WORKER_STDERR", config.debug_worker_stderr);
        if let Some(attempts) = get_env_parsed::<usize>("EVAL_MAX_ATTEMPTS") {
            config = config.with_max_attempts(attempts);
        }
        config
    }

    /// Number of workers evaluating agents concurrently.
    ///
    /// `0` means one worker per logical CPU.
    pub fn with_workers(mut self, value: usize) -> Self {
        self.workers = if value == 0 { num_cpus::get() } else { value };
        self
    }

    /// Path of the emulator launch script.
    pub fn with_emulator_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.emulator_path = value.into();
        self
    }

    pub fn with_game_mode(mut self, value: GameMode) -> Self {
        self.game_mode = value;
        self
    }

    /// Use another evaluation script than the game mode's default one.
    pub fn with_eval_script(mut self, value: impl Into<PathBuf>) -> Self {
        self.eval_script = Some(value.into());
        self
    }

    pub fn with_host(mut self, value: IpAddr) -> Self {
        self.host = value;
        self
    }

    /// Bound on waiting for a spawned worker to connect.
    pub fn with_accept_timeout(mut self, value: Duration) -> Self {
        self.accept_timeout = value;
        self
    }

    /// Bound on waiting for the next message of a connected worker.
    pub fn with_recv_timeout(mut self, value: Duration) -> Self {
        self.recv_timeout = value;
        self
    }

    /// Only evaluate the agent with the given identifier, then treat the batch as exhausted.
    ///
    /// Negative identifiers disable debug isolation.
    pub fn with_debug_agent(mut self, value: Option<AgentId>) -> Self {
        self.debug_agent = value.filter(|id| *id >= 0);
        self
    }

    pub fn with_chromeless(mut self, value: bool) -> Self {
        self.chromeless = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    pub fn with_log_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.log_dir = value.into();
        self
    }

    /// Enable or disable emulator stderr output (debug purposes only).
    pub fn with_debug_worker_stderr(mut self, value: bool) -> Self {
        self.debug_worker_stderr = value;
        self
    }

    /// Attempts made by [`evaluate_until_success`](crate::server::Coordinator::evaluate_until_success), at least one.
    pub fn with_max_attempts(mut self, value: usize) -> Self {
        self.max_attempts = value.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn game_mode(&self) -> GameMode {
        self.game_mode
    }

    pub fn debug_agent(&self) -> Option<AgentId> {
        self.debug_agent
    }

    /// The evaluation script given to workers.
    pub fn eval_script(&self) -> &Path {
        self.eval_script
            .as_deref()
            .unwrap_or_else(|| self.game_mode.eval_script())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
