//! `kickpass open` scenarios, caching safes in the agent

mod common;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use common::{session, TURTLES};
use kickpass_harness::{EditorStub, Prompts};

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn open_timeout_removes_password_from_agent() -> Result<()> {
    let mut kp = session()?;
    kp.editor(EditorStub::Env, Some(TURTLES));

    kp.with_agent(|kp| {
        kp.create("test")?;
        kp.open_with("test", &["-t", "1"], Prompts::default())?;

        thread::sleep(Duration::from_secs(2));
        // Expired from the agent: cat has to ask for the master password
        kp.cat("test")?;

        kp.assert_stdout_equals(&[TURTLES]);
        Ok(())
    })?;
    Ok(())
}

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn opened_safe_is_served_by_agent() -> Result<()> {
    let mut kp = session()?;
    kp.editor(EditorStub::Env, Some(TURTLES));

    kp.with_agent(|kp| {
        kp.create("test")?;
        kp.open("test")?;

        kp.cat_with("test", &[], Prompts::default().master(None))?;

        kp.assert_no_password_prompt();
        kp.assert_stdout_equals(&[TURTLES]);
        Ok(())
    })?;
    Ok(())
}

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn cached_safe_is_unreachable_once_agent_stops() -> Result<()> {
    let mut kp = session()?;
    kp.editor(EditorStub::Env, Some(TURTLES));
    kp.create("test")?;

    kp.with_agent(|kp| kp.open("test").map(|_| ()))?;

    // No binding any more, so the CLI prompts on its own
    kp.cat("test")?;
    kp.assert_stdout_equals(&[TURTLES]);
    Ok(())
}
