//! Panic Handler - routes panics through `tracing`
//!
//! Validation never panics on untrusted input; a panic here means a bug in
//! the engine itself. The hook makes sure it reaches the structured logs with
//! its location instead of only stderr.
//!
//! # Example
//! ```no_run
//! use vss_engine::panic_handler;
//!
//! fn main() {
//!     panic_handler::install_panic_hook();
//!     // ... rest of application
//! }
//! ```

use std::panic::{self, PanicInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, warn};

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Install the logging panic hook. Idempotent.
pub fn install_panic_hook() {
    if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        warn!("Panic hook already installed, skipping");
        return;
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        handle_panic(panic_info);
        previous(panic_info);
    }));

    tracing::info!("Panic hook installed");
}

fn panic_location(panic_info: &PanicInfo) -> String {
    panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown location".to_string())
}

fn panic_message(panic_info: &PanicInfo) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic message".to_string()
    }
}

fn handle_panic(panic_info: &PanicInfo) {
    PANIC_COUNT.fetch_add(1, Ordering::Relaxed);

    error!(
        location = %panic_location(panic_info),
        message = %panic_message(panic_info),
        thread = std::thread::current().name().unwrap_or("unnamed"),
        "Panic in validation engine"
    );

    if std::env::var("RUST_BACKTRACE").is_err() {
        warn!("Backtrace not available - set RUST_BACKTRACE=1 for detailed traces");
    }
}

pub fn is_panic_hook_installed() -> bool {
    PANIC_HOOK_INSTALLED.load(Ordering::SeqCst)
}

/// Panics observed since the hook was installed.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}
