//! Unified text diffs of the field changes an action carries.

use similar::TextDiff;

use crate::payload::FieldChange;
use crate::reconcile::{Action, ActionKind};

/// Rendered diff for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDiff {
    pub label: String,
    pub unified_diff: String,
}

fn render_side(changes: &[FieldChange], after: bool) -> String {
    let mut out = String::new();
    for change in changes {
        let value = if after { &change.after } else { &change.before };
        if let Some(value) = value {
            out.push_str(&change.field);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}

fn label(action: &Action) -> String {
    match (&action.source_id, &action.destination_id) {
        (Some(s), Some(d)) => format!("{s} -> {d}"),
        (Some(s), None) => s.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => action.name.clone().unwrap_or_default(),
    }
}

/// Unified diff of one action's changes, or `None` when it has none.
pub fn diff_action(action: &Action) -> Option<ActionDiff> {
    if action.diff.is_empty() {
        return None;
    }
    let before = render_side(&action.diff, false);
    let after = render_side(&action.diff, true);
    let label = label(action);
    let unified = TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .context_radius(3)
        .to_string();
    Some(ActionDiff {
        label,
        unified_diff: unified,
    })
}

/// Diffs for every action of the given kinds, in log order.
pub fn diff_actions<'a>(
    actions: impl IntoIterator<Item = &'a Action>,
    kinds: &[ActionKind],
) -> Vec<ActionDiff> {
    actions
        .into_iter()
        .filter(|a| kinds.contains(&a.kind))
        .filter_map(diff_action)
        .collect()
}
