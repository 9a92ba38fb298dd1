use std::sync::Arc;

use anyhow::Context;

use super::arbiter::Arbiter;
use super::config::Config;
use super::logging;
use super::sys;

/// Program entry: daemonize if asked, bring up logging, run the master.
/// Only returns on startup failure; a running master exits the process
/// itself.
pub fn run(cfg: Config) -> anyhow::Result<()> {
    if cfg.daemon {
        sys::daemonize().context("daemonize")?;
    }

    logging::init(&cfg.logging)?;

    Arbiter::new(Arc::new(cfg)).run()
}
