pub mod app;
pub mod arbiter;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod pidfile;
pub mod pipe;
pub mod route;
pub mod scripts;
pub mod server;
pub mod sys;
pub mod tls;
pub mod worker;

pub use config::{Config, ConfigError, Options};

pub fn run(cfg: Config) -> anyhow::Result<()> {
    app::run(cfg)
}
