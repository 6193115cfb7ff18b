//! Autopatch plan documents.
//!
//! A match that carries no automatic instructions still produces a concrete
//! fix plan. It is rendered as a markdown document under
//! [`PLAN_DIR`] in the repository so the team picking up the escalation
//! starts from goal, target files, steps, validation and rollout instead of
//! the raw ticket.

use chrono::{DateTime, Utc};
use remedy_common::patterns::slugify;
use remedy_common::plan::ResolutionAction;
use remedy_common::ticket::Ticket;
use serde_json::Value;

/// Repository-relative directory that holds plan documents
pub const PLAN_DIR: &str = "docs/autopatches";

const DEFAULT_GOAL: &str = "Provide an automated repair for this failure.";

/// Strings under the first of `keys` that holds an array
fn strings(payload: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn text<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Name of the fix: payload `fix_name`, else the summary
pub fn fix_name<'a>(action: &'a ResolutionAction, summary: &'a str) -> &'a str {
    text(&action.payload, &["fix_name", "fixName"]).unwrap_or(summary)
}

/// `docs/autopatches/ticket-<id>-<fix>.md`
pub fn plan_path(ticket: &Ticket, action: &ResolutionAction, summary: &str) -> String {
    let name = slugify(fix_name(action, summary), &slugify(&ticket.id, "ticket"));
    format!("{}/{}.md", PLAN_DIR, name.trim_end_matches('-'))
}

fn numbered(lines: &mut Vec<String>, items: &[String], placeholder: &str) {
    if items.is_empty() {
        lines.push(format!("1. {}", placeholder));
        return;
    }
    for (i, item) in items.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, item));
    }
}

/// Markdown body of one plan
pub fn render(ticket: &Ticket, action: &ResolutionAction, summary: &str, now: DateTime<Utc>) -> String {
    let payload = &action.payload;
    let target_files = strings(payload, &["target_files", "targetFiles", "filePaths"]);
    let steps = strings(payload, &["steps"]);
    let validation = strings(payload, &["validation", "tests"]);
    let rollout = strings(payload, &["rollout"]);

    let mut lines = vec![
        format!("# Autopatch plan: {}", fix_name(action, summary)),
        String::new(),
        format!("- Ticket: `{}`", ticket.id),
        format!("- Created: {}", now.to_rfc3339()),
    ];
    if let Some(locale) = ticket.locale() {
        lines.push(format!("- Locale: {}", locale));
    }

    let description = if ticket.description.trim().is_empty() {
        "(no description on the ticket)"
    } else {
        ticket.description.trim()
    };
    lines.extend([
        String::new(),
        "## Context".to_string(),
        summary.to_string(),
        String::new(),
        "### Reported".to_string(),
        description.to_string(),
        String::new(),
        "## Goal".to_string(),
        text(payload, &["goal"]).unwrap_or(DEFAULT_GOAL).to_string(),
        String::new(),
        "## Target files".to_string(),
    ]);
    if target_files.is_empty() {
        lines.push("- (not yet known)".to_string());
    }
    lines.extend(target_files.iter().map(|f| format!("- {}", f)));

    lines.extend([String::new(), "## Steps".to_string()]);
    numbered(&mut lines, &steps, "Ask the autopatch agent for concrete steps.");

    lines.extend([String::new(), "## Validation".to_string()]);
    numbered(&mut lines, &validation, "Define tests (unit, end-to-end or manual QA).");

    lines.extend([String::new(), "## Rollout".to_string()]);
    numbered(&mut lines, &rollout, "Deploy after review and watch the error rate.");

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_common::plan::ActionKind;
    use serde_json::json;

    fn action(payload: Value) -> ResolutionAction {
        ResolutionAction::new(ActionKind::AutopatchPlan, "guard").with_payload(payload)
    }

    #[test]
    fn test_plan_path_is_slugged_under_plan_dir() {
        let ticket = Ticket::new("T 42", "Upload", "broken");
        let path = plan_path(&ticket, &action(json!({"fix_name": "frontend-null-guard"})), "x");
        assert_eq!(path, "docs/autopatches/ticket-t-42-frontend-null-guard.md");

        // Summary stands in for a missing fix name
        let path = plan_path(&ticket, &action(Value::Null), "Null access on upload");
        assert_eq!(path, "docs/autopatches/ticket-t-42-null-access-on-upload.md");
    }

    #[test]
    fn test_render_lists_plan_sections() {
        let mut ticket = Ticket::new("t-1", "Upload", "Cannot read properties of null");
        ticket.source_metadata = json!({"locale": "de"});
        let doc = render(
            &ticket,
            &action(json!({
                "fix_name": "frontend-null-guard",
                "goal": "Guard the upload handler",
                "targetFiles": ["src/upload.tsx"],
                "steps": ["add optional chaining", "add fallback"],
                "validation": ["npm test"],
            })),
            "Null access in upload",
            Utc::now(),
        );
        assert!(doc.starts_with("# Autopatch plan: frontend-null-guard\n"));
        assert!(doc.contains("- Locale: de"));
        assert!(doc.contains("## Goal\nGuard the upload handler"));
        assert!(doc.contains("- src/upload.tsx"));
        assert!(doc.contains("1. add optional chaining\n2. add fallback"));
        assert!(doc.contains("## Validation\n1. npm test"));
        assert!(doc.contains("## Rollout\n1. Deploy after review"));
    }

    #[test]
    fn test_render_fills_placeholders() {
        let ticket = Ticket::new("t-1", "Upload", "");
        let doc = render(&ticket, &action(Value::Null), "Summary", Utc::now());
        assert!(doc.contains(DEFAULT_GOAL));
        assert!(doc.contains("(no description on the ticket)"));
        assert!(doc.contains("- (not yet known)"));
        assert!(!doc.contains("Locale"));
    }
}
