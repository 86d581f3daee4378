//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: Production code MUST propagate errors with `?` or handle them.
//! `unwrap()` and `expect()` are only allowed in tests.

use architectural_enforcement::{calls_unwrap, find_violations};

/// Test that production code does not unwrap
#[test]
fn test_no_unwrap_in_production_code() {
    let violations = find_violations(calls_unwrap);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: unwrap()/expect() found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ REQUIRED:");
        eprintln!("  - Propagate with `?` into the module's error type");
        eprintln!("  - Or fall back explicitly (unwrap_or, unwrap_or_else, let-else)");

        panic!(
            "\nFound {} unwrap violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
