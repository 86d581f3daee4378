//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the core and daemon MUST NOT call sleep
//! methods. Waiting is done on I/O, `tokio::time::interval`,
//! `tokio::time::timeout` or a cancellation token.
//! **Exceptions**: test code

use architectural_enforcement::{calls_sleep, find_violations};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_violations(calls_sleep);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE waiting:");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Deadlines using tokio::time::timeout()");
        eprintln!("  - Cancellation via CancelToken::cancelled()");
        eprintln!("  - Test code (#[cfg(test)] modules, tests/ directories)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
