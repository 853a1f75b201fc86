//! Enforce architectural rules on the workspace's production sources

use architectural_enforcement::{
    production_roots, scan_dir, Rule, NO_BLOCKING_SLEEP, NO_PANICKING_UNWRAP,
};

fn assert_clean(rule: Rule) {
    let mut violations = Vec::new();
    for root in production_roots() {
        assert!(root.is_dir(), "missing source root {}", root.display());
        violations.extend(scan_dir(&root, &[rule]).unwrap());
    }

    assert!(
        violations.is_empty(),
        "{} violation(s):\n{}",
        violations.len(),
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

#[test]
fn no_blocking_sleep_in_production_code() {
    assert_clean(NO_BLOCKING_SLEEP);
}

#[test]
fn no_unwrap_in_production_code() {
    assert_clean(NO_PANICKING_UNWRAP);
}
