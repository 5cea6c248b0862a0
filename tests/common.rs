//! Shared integration-test init helper (§10 "Configuration"): loads a
//! `.env` file if one is present, then defers to the crate's own tracing
//! init helper so tests see the same `DFT_CORE_LOG`-driven setup an
//! embedding binary would.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        dotenvy::dotenv().ok();
        dft_core::config::init_tracing();
    });
}
