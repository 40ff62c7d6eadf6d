// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;

#[test]
fn matches_default_pattern_variants() {
    let detector = PatternRateLimitDetector::new(PatternRateLimitDetector::default_pattern()).unwrap();
    assert!(detector.detect("You have hit a rate limit, try again later."));
    assert!(detector.detect("Usage limit reached for this session."));
    assert!(!detector.detect("Everything is running smoothly."));
}
