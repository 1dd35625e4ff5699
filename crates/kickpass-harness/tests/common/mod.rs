#![allow(dead_code)]

use anyhow::Result;
use kickpass_harness::KpSession;

/// Message used wherever a payload with punctuation and an apostrophe is needed
pub const TURTLES: &str =
    "Watch out for turtles. They'll bite you if you put your fingers in their mouths.";

/// Fresh, initialised session configured from the environment
pub fn session() -> Result<KpSession> {
    Ok(KpSession::new()?)
}
