//! Tracing setup for embedding front ends.
//!
//! The engine itself only emits through `tracing`; where the output goes
//! (stderr, files, syslog) is the embedder's concern. This is the one-call
//! default for binaries that do not bring their own subscriber.

use tracing_subscriber::EnvFilter;

use crate::errors::ReplicationError;

/// Install a formatted stderr subscriber.
///
/// `RUST_LOG` overrides the level; otherwise `verbose` selects debug over
/// info. Fails instead of panicking when a global subscriber is already
/// installed.
pub fn init(verbose: bool) -> Result<(), ReplicationError> {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| {
            ReplicationError::operation(format!("cannot install tracing subscriber: {err}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_reports_instead_of_panicking() {
        let _ = init(true);
        assert!(init(false).is_err());
    }
}
