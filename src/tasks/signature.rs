//! Deterministic error signatures for doom-loop detection.
//!
//! A signature is a short stable hash over normalized failure text:
//! lowercased, digit runs and hex addresses collapsed, whitespace squeezed.
//! The same failure mode produces the same signature across runs and
//! processes, which is what makes repetition detectable.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Number of consecutive identical failure signatures that flips a task to
/// BLOCKED.
pub const DOOM_LOOP_THRESHOLD: usize = 3;

/// Compute the short error signature for a failure text.
pub fn error_signature(text: &str) -> String {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    static HEX: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let hex = HEX.get_or_init(|| Regex::new(r"0x[0-9a-f]+").unwrap());
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap());
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").unwrap());

    let lowered = text.to_lowercase();
    let no_hex = hex.replace_all(&lowered, "#");
    let no_digits = digits.replace_all(&no_hex, "#");
    let normalized = space.replace_all(no_digits.trim(), " ");

    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Whether the last `threshold` failure texts share one signature.
///
/// `failures` is expected newest-last; fewer entries than the threshold can
/// never trigger.
pub fn is_doom_loop(failures: &[String], threshold: usize) -> Option<String> {
    if threshold == 0 || failures.len() < threshold {
        return None;
    }
    let tail = &failures[failures.len() - threshold..];
    let signature = error_signature(&tail[0]);
    if tail.iter().all(|t| error_signature(t) == signature) {
        Some(signature)
    } else {
        None
    }
}
