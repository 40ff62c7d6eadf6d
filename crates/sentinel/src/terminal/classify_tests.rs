// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::panic)]

use super::*;

fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[test]
fn empty_input_area_after_prompt_glyph_and_whitespace_stripped() {
    let captured = lines(&[
        "some history",
        "────────────────────────────────",
        "❯  ",
        "────────────────────────────────",
        "footer hint",
    ]);
    assert_eq!(classify_input_area(&captured), InputAreaState::Empty);
}

#[test]
fn has_content_when_non_whitespace_remains() {
    let captured = lines(&[
        "history",
        "────────────────────────────────",
        "❯ still typing",
        "────────────────────────────────",
    ]);
    match classify_input_area(&captured) {
        InputAreaState::HasContent { text } => assert!(text.contains("still typing")),
        other => panic!("expected HasContent, got {other:?}"),
    }
}

#[test]
fn indeterminate_when_fewer_than_two_rule_lines() {
    let captured = lines(&["just some output", "no rules here"]);
    match classify_input_area(&captured) {
        InputAreaState::Indeterminate { raw_capture } => {
            assert!(raw_capture.contains("just some output"));
        }
        other => panic!("expected Indeterminate, got {other:?}"),
    }
}

#[test]
fn uses_the_last_two_rule_lines_not_the_first_two() {
    let captured = lines(&[
        "────────────────────────────────",
        "stale content between an earlier pair of rules",
        "────────────────────────────────",
        "history after that",
        "────────────────────────────────",
        "❯",
        "────────────────────────────────",
    ]);
    assert_eq!(classify_input_area(&captured), InputAreaState::Empty);
}

#[test]
fn rule_line_detection_accepts_mixed_box_drawing_characters() {
    assert!(is_rule_line("━━━━━━━━"));
    assert!(is_rule_line("════════"));
    assert!(!is_rule_line("plain text"));
    assert!(!is_rule_line(""));
}
