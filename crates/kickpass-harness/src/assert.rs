//! Output assertion helpers
//!
//! All helpers panic with the full output on failure, like `assert!` does,
//! so a failing scenario shows what kickpass actually printed.

use std::collections::HashMap;

use crate::driver::CommandResult;
use crate::prompt::PASSWORD_CUE;

/// Assert the non-blank output lines are exactly `expected`, in order.
pub fn assert_lines_equal(result: &CommandResult, expected: &[&str]) {
    let lines = result.lines();
    assert_eq!(
        lines, expected,
        "Output lines differ.\nFull output:\n{}",
        result.output
    );
}

/// Assert the non-blank output lines are `expected` in any order, with the
/// same multiplicity.
pub fn assert_lines_unordered(result: &CommandResult, expected: &[&str]) {
    let actual = count(result.lines());
    let wanted = count(expected.iter().copied());
    assert_eq!(
        actual, wanted,
        "Output lines differ (ignoring order).\nFull output:\n{}",
        result.output
    );
}

/// Assert the output contains `text` anywhere.
pub fn assert_output_contains(result: &CommandResult, text: &str) {
    assert!(
        result.output.contains(text),
        "Expected output to contain {:?}, but it was not found.\nFull output:\n{}",
        text,
        result.output
    );
}

/// Assert no password cue was seen during the whole run, e.g. when the agent
/// is expected to answer from its cache.
pub fn assert_no_password_prompt(result: &CommandResult) {
    assert!(
        !result.transcript.contains(PASSWORD_CUE),
        "Expected no {:?} prompt, but one was printed.\nTranscript:\n{}",
        PASSWORD_CUE,
        result.transcript
    );
}

fn count<'a>(lines: impl IntoIterator<Item = &'a str>) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for line in lines {
        *counts.entry(line).or_insert(0) += 1;
    }
    counts
}
