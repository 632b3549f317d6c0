//! Core abstractions for sealed-prefs: the preference map contract the encryption layer wraps.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod prefs;
