use crate::cli::Cli;
use anyhow::{anyhow, Result};
use std::sync::OnceLock;

static INSTANCE: OnceLock<Config> = OnceLock::new();

#[derive(Debug)]
pub struct Config {
    pub pid: i32,
    pub agent_path: String,
}

impl Config {
    pub fn init(cli: &Cli) -> Result<()> {
        let config = Self::from_cli(cli);

        INSTANCE
            .set(config)
            .map_err(|_| anyhow!("config already initialized"))?;

        Ok(())
    }

    pub fn instance() -> &'static Self {
        INSTANCE.get().expect("config not initialized")
    }

    fn from_cli(cli: &Cli) -> Self {
        Self {
            pid: cli.pid,
            agent_path: cli.agent_path.clone(),
        }
    }
}
