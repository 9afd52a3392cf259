//! Helpers for testing code that talks to devices. They are part of the regular (non-#[cfg(test)])
//!  code so applications can use them in their own tests.

pub mod fake_transport;
