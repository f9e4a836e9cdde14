//! Diskstore.
//!
//! Diskstore is a file system backed key/value store with per-entry expiry.
//! Values are JSON trees that may carry raw byte payloads; large payloads are
//! split into separate files next to the record. This binary exposes the
//! store for scripting and diagnostics, the actual implementation lives in
//! the `diskstore-service` crate.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
