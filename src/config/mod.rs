//! Daemon configuration.
//!
//! `Config::load()` reads `modeld/config.toml` under the XDG config directory;
//! `--config` points somewhere else. Every section is optional. Leaving
//! `[store] root` unset keeps artifacts under `$XDG_DATA_HOME/modeld/models`.
//!
//! ```no_run
//! use modeld::config::Config;
//! use std::path::Path;
//!
//! # fn main() -> modeld::Result<()> {
//! let config = Config::load_from(Path::new("config/default.toml"))?;
//! let root = config.store_root()?;
//! println!("Serving {} on {}", root.display(), config.server.bind);
//! # Ok(())
//! # }
//! ```

pub mod schema;

pub use schema::Config;
