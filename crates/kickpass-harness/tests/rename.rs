//! `kickpass rename` scenarios

mod common;

use anyhow::Result;
use common::session;
use kickpass_harness::EditorStub;

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn rename_is_successful() -> Result<()> {
    let mut kp = session()?;
    kp.editor(EditorStub::Date, None);
    kp.create("old")?;

    kp.rename("old", "new")?;

    kp.assert_safe_doesnt_exist("old");
    kp.assert_safe_exists("new");
    kp.assert_safe_is_big_enough("new");
    Ok(())
}

#[test]
#[cfg_attr(not(feature = "functional"), ignore = "needs a kickpass binary (KP)")]
fn rename_into_nonexistent_directory_is_successful() -> Result<()> {
    let mut kp = session()?;
    kp.editor(EditorStub::Date, None);
    kp.create("old")?;

    kp.rename("old", "nonexistent/new")?;

    kp.assert_safe_doesnt_exist("old");
    kp.assert_ws_exists(Some("nonexistent"));
    kp.assert_safe_exists("nonexistent/new");
    kp.assert_safe_is_big_enough("nonexistent/new");
    Ok(())
}
