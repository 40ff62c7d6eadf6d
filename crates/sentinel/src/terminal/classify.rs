// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Classification of the agent's rendered input area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAreaState {
    /// Nothing but the prompt glyph and whitespace remains: submission succeeded.
    Empty,
    /// Non-whitespace content remains: the submit keystroke needs retrying.
    HasContent { text: String },
    /// Fewer than two rule lines are visible; treated as provisional success.
    Indeterminate { raw_capture: String },
}

/// A line made up entirely of box-drawing rule characters
/// (separator lines the agent's UI uses to frame its input box).
fn is_rule_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| matches!(c, '─' | '╌' | '━' | '═' | '│' | '┃' | '┄' | '┈'))
}

/// The prompt glyph the agent renders at the start of its input line.
const PROMPT_GLYPH: char = '\u{276f}'; // ❯

/// Strip the prompt glyph and all Unicode whitespace/formatting characters.
fn strip_decoration(text: &str) -> String {
    text.chars()
        .filter(|c| *c != PROMPT_GLYPH && !c.is_whitespace() && !c.is_control())
        .collect()
}

/// Extract the text between the *last two* rule lines in `lines` and
/// classify it.
///
/// `lines` is the full captured pane, top to bottom.
pub fn classify_input_area(lines: &[String]) -> InputAreaState {
    let rule_indices: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_rule_line(line))
        .map(|(i, _)| i)
        .collect();

    if rule_indices.len() < 2 {
        return InputAreaState::Indeterminate {
            raw_capture: lines.join("\n"),
        };
    }

    let last = rule_indices[rule_indices.len() - 1];
    let second_last = rule_indices[rule_indices.len() - 2];
    let between = &lines[second_last + 1..last];
    let joined = between.join("\n");
    let stripped = strip_decoration(&joined);

    if stripped.is_empty() {
        InputAreaState::Empty
    } else {
        InputAreaState::HasContent { text: joined }
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
