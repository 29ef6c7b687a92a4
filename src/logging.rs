// Log output for the binary
//
// The library logs through the `log` facade. The binary installs a
// tracing-subscriber fmt layer on stderr; its log bridge picks those records up.

use tracing_subscriber::EnvFilter;

/// Level for our own crates from the -v / -q flags
pub fn level_for(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the stderr subscriber. RUST_LOG, when set, replaces the flag-derived filter.
pub fn init(verbose: u8, quiet: bool) {
    let level = level_for(verbose, quiet);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,photo_migrator_lib={0},photo_migrator={0}", level))
    });

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 0)
        .try_init();
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
}
