//! `kickpass agent` lifecycle against the real binary

mod common;

use anyhow::Result;
use common::session;

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn agent_announces_socket_binding() -> Result<()> {
    let mut kp = session()?;

    let binding = kp.start_agent()?;
    assert_eq!(binding.key(), "KP_AGENT_SOCK");
    assert!(!binding.value().is_empty());
    assert_ne!(
        std::env::var(binding.key()).ok().as_deref(),
        Some(binding.value()),
        "binding leaked into the harness environment"
    );

    kp.stop_agent()?;
    Ok(())
}

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn stopping_agent_twice_is_harmless() -> Result<()> {
    let mut kp = session()?;

    kp.start_agent()?;
    kp.stop_agent()?;
    kp.stop_agent()?;

    assert!(kp.agent().binding().is_none());
    Ok(())
}

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn agent_can_be_restarted() -> Result<()> {
    let mut kp = session()?;

    let first = kp.start_agent()?;
    kp.stop_agent()?;
    let second = kp.start_agent()?;
    kp.stop_agent()?;

    assert_eq!(first.key(), second.key());
    Ok(())
}
