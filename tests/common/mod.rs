//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code ...
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g., `chaintable=debug,chaintable::table::resize=trace`)
//! - `CHAINTABLE_LOG_DIR`: log directory; set to enable JSON file logging
//! - `CHAINTABLE_LOG_CONSOLE`: set to "0" to disable console output

#![allow(dead_code)]

use std::env;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with console and optional file logging.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Create an EnvFilter from RUST_LOG or use the default level.
fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

fn setup_tracing() {
    let console_enabled = !env::var("CHAINTABLE_LOG_CONSOLE").is_ok_and(|v| v == "0");

    let console_layer = if console_enabled {
        Some(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(true)
                .compact()
                .with_filter(make_filter(Level::INFO)),
        )
    } else {
        None
    };

    // NDJSON file layer, enabled by CHAINTABLE_LOG_DIR.
    let file_layer = env::var("CHAINTABLE_LOG_DIR").ok().map(|dir| {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir).expect("failed to create log directory");
        let file = File::create(dir.join("chaintable.json")).expect("failed to create log file");
        let file: &'static Mutex<File> = Box::leak(Box::new(Mutex::new(file)));

        tracing_subscriber::fmt::layer()
            .with_writer(move || {
                struct Guarded(&'static Mutex<File>);
                impl std::io::Write for Guarded {
                    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                        self.0.lock().unwrap().write(buf)
                    }
                    fn flush(&mut self) -> std::io::Result<()> {
                        self.0.lock().unwrap().flush()
                    }
                }
                Guarded(file)
            })
            .with_thread_ids(true)
            .with_target(true)
            .json()
            .with_filter(make_filter(Level::TRACE))
    });

    // try_init: don't panic if the crate under test already set one.
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

// ============================================================================
//  Shared table configuration
// ============================================================================

use chaintable::{Lookup, TableConfig};

/// Top bit marks a value dead; the rest is an identity-hashed key.
pub const DEAD_MARK: u64 = 1 << 63;

/// Identity-hash configuration over `u64` test values.
pub struct U64Config;

impl TableConfig for U64Config {
    type Value = u64;

    fn hash(value: &u64, is_dead: &mut bool) -> usize {
        if value & DEAD_MARK != 0 {
            *is_dead = true;
        }
        (value & !DEAD_MARK) as usize
    }

    fn notfound() -> u64 {
        u64::MAX
    }
}

/// Probe for an exact live key.
pub struct KeyLookup(pub u64);

impl Lookup<u64> for KeyLookup {
    fn hash(&self) -> usize {
        (self.0 & !DEAD_MARK) as usize
    }

    fn equals(&self, value: &u64, is_dead: &mut bool) -> bool {
        if value & DEAD_MARK != 0 {
            *is_dead = true;
            return false;
        }
        *value == self.0
    }
}
