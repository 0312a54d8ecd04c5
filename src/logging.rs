//! Log output setup
//! Records go to stderr as `<RFC 3339 local time> [LEVEL] target: message`.

use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Installs the global logger at `level`. `RUST_LOG` still overrides it.
/// Calling it again is harmless.
pub fn init(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    match result {
        Ok(()) => log::info!("Logging initialized at {}", level),
        Err(e) => log::debug!("Logger already installed: {}", e),
    }
}
