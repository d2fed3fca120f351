use std::{fmt::Display, path::Path, str::FromStr};

use anyhow::bail;

/// Which emulator scenario the agents are trained on.
///
/// The mode selects the evaluation script the worker runs and the discrete actions an
/// image request can be answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameMode {
    OpenWorld,
    BattleFactory,
}

impl GameMode {
    const OPEN_WORLD_ACTIONS: [&'static str; 9] =
        ["B", "A", "Y", "X", "Up", "Down", "Left", "Right", "Null"];
    const BATTLE_FACTORY_ACTIONS: [&'static str; 10] = [
        "Move1", "Move2", "Move3", "Move4", "Poke1", "Poke2", "Poke3", "Poke4", "Poke5", "Poke6",
    ];

    /// Default evaluation script, relative to the working directory.
    pub fn eval_script(&self) -> &'static Path {
        match self {
            GameMode::OpenWorld => Path::new("./src/eval_openworld.lua"),
            GameMode::BattleFactory => Path::new("./src/eval_battlefactory.lua"),
        }
    }

    /// Labels in network output order.
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            GameMode::OpenWorld => &Self::OPEN_WORLD_ACTIONS,
            GameMode::BattleFactory => &Self::BATTLE_FACTORY_ACTIONS,
        }
    }
}

impl FromStr for GameMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open_world" | "openworld" => Ok(GameMode::OpenWorld),
            "battle_factory" | "battlefactory" => Ok(GameMode::BattleFactory),
            other => bail!("unknown game mode '{other}'"),
        }
    }
}

impl Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameMode::OpenWorld => write!(f, "open_world"),
            GameMode::BattleFactory => write!(f, "battle_factory"),
        }
    }
}
