//! Command implementations for remedyctl

use crate::client::RemedydClient;
use anyhow::Result;
use owo_colors::OwoColorize;
use remedy_common::{is_command_allowed, PatternMatcher, Ticket};
use serde_json::Value;

const SEPARATOR: &str = "------------------------------------------------------------";

fn pct(value: &Value) -> String {
    match value.as_f64() {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Daemon commands
// ============================================================================

pub async fn status(client: &RemedydClient) -> Result<()> {
    let report = client.health().await?;
    let status = text(&report["status"]);
    let badge = match status.as_str() {
        "healthy" => "[OK]".bright_green().to_string(),
        "degraded" => "[DEGRADED]".yellow().to_string(),
        _ => "[UNHEALTHY]".bright_red().to_string(),
    };

    println!("{}  remedyd v{}", badge, text(&report["version"]));
    println!("{}", SEPARATOR);
    println!("  Uptime:          {}s", text(&report["uptime_secs"]));
    println!(
        "  Change stream:   {} ({} reconnects)",
        text(&report["channel_status"]),
        text(&report["reconnects"])
    );
    println!("  Processed:       {}", text(&report["tickets_processed"]));
    println!("  Autopatch rate:  {}", pct(&report["autopatch_success_rate"]));
    println!("  Error rate:      {}", pct(&report["error_rate"]));

    if let Some(checks) = report["checks"].as_array() {
        println!();
        println!("[CHECKS]");
        for check in checks {
            let mark = if check["ok"].as_bool() == Some(true) {
                "ok".green().to_string()
            } else if check["critical"].as_bool() == Some(true) {
                "FAIL".bright_red().to_string()
            } else {
                "warn".yellow().to_string()
            };
            println!("  {:<20} {:<5} {}", text(&check["name"]), mark, text(&check["detail"]));
        }
    }
    Ok(())
}

pub async fn metrics(client: &RemedydClient, json: bool, prometheus: bool) -> Result<()> {
    if prometheus {
        print!("{}", client.metrics_text().await?);
        return Ok(());
    }

    let snapshot = client.metrics().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("{}", "Remediation metrics".bold());
    println!("{}", SEPARATOR);
    println!("  Tickets processed:    {}", text(&snapshot["tickets_processed"]));
    println!(
        "  Autopatch:            {} ok / {} failed ({})",
        text(&snapshot["autopatch_success"]),
        text(&snapshot["autopatch_failed"]),
        pct(&snapshot["autopatch_success_rate"])
    );
    println!(
        "  Errors:               {} ({})",
        text(&snapshot["error_count"]),
        pct(&snapshot["error_rate"])
    );
    println!(
        "  Avg insert latency:   {:.0} ms",
        snapshot["average_insert_latency_ms"].as_f64().unwrap_or(0.0)
    );
    println!(
        "  Avg autofix duration: {:.0} ms",
        snapshot["average_autofix_duration_ms"].as_f64().unwrap_or(0.0)
    );

    if let Some(errors) = snapshot["recent_errors"].as_array().filter(|e| !e.is_empty()) {
        println!();
        println!("[RECENT ERRORS]");
        for error in errors {
            println!(
                "  {} {} {}",
                text(&error["at"]).dimmed(),
                text(&error["component"]).cyan(),
                text(&error["message"])
            );
        }
    }
    Ok(())
}

pub async fn funnel(client: &RemedydClient, days: i64, json: bool) -> Result<()> {
    let funnel = client.funnel(days).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&funnel)?);
        return Ok(());
    }

    println!("{} (last {} days)", "Diagnosis funnel".bold(), days);
    println!("{}", SEPARATOR);
    println!("  Tickets:              {}", text(&funnel["total_tickets"]));
    println!("  Problem detection:    {}", pct(&funnel["problem_detection_rate"]));
    println!("  Fix generation:       {}", pct(&funnel["fix_generation_rate"]));
    println!("  Fix success:          {}", pct(&funnel["fix_success_rate"]));
    println!("  False positives:      {}", pct(&funnel["false_positive_rate"]));
    println!("  Fix not applied:      {}", pct(&funnel["unapplied_fix_rate"]));
    println!("  False negatives:      {}", pct(&funnel["false_negative_rate"]));
    println!(
        "  Avg processing time:  {:.0} ms",
        funnel["average_processing_time_ms"].as_f64().unwrap_or(0.0)
    );
    Ok(())
}

pub async fn approve(
    client: &RemedydClient,
    ticket_id: &str,
    request_id: &str,
    deny: bool,
    decided_by: Option<&str>,
) -> Result<()> {
    let decision = client.decide(ticket_id, request_id, !deny, decided_by).await?;
    let verdict = if deny {
        "denied".bright_red().to_string()
    } else {
        "approved".bright_green().to_string()
    };
    println!("Request {} on ticket {} {}", request_id, ticket_id, verdict);
    if let Some(command) = decision["command"].as_str() {
        println!("  Command: {}", command.cyan());
    }
    Ok(())
}

// ============================================================================
// Offline commands
// ============================================================================

/// Whitelist check without a daemon; exit code 1 when rejected
pub fn check_command(command: &str) -> Result<bool> {
    let check = is_command_allowed(command);
    if check.allowed {
        println!("{} {}", "[ALLOWED]".bright_green(), command);
        if let Some(entry) = &check.command {
            println!("  {}", entry.description);
        }
    } else {
        println!("{} {}", "[REJECTED]".bright_red(), command);
        if let Some(reason) = &check.reason {
            println!("  {}", reason);
        }
    }
    Ok(check.allowed)
}

/// Run the signature matcher on an ad-hoc ticket
pub fn match_ticket(title: &str, description: &str, json: bool) -> Result<()> {
    let ticket = Ticket::new("cli", title, description);
    let matched = PatternMatcher::default().match_ticket(&ticket);

    if json {
        println!("{}", serde_json::to_string_pretty(&matched)?);
        return Ok(());
    }

    let Some(matched) = matched else {
        println!("{} no known failure signature; would go to the LLM planner", "[NO MATCH]".yellow());
        return Ok(());
    };

    println!("{} {}", "[MATCH]".bright_green(), matched.pattern_id.bold());
    println!("  {}", matched.summary);
    if matched.instructions.is_empty() {
        println!("  No automatic instructions; would be escalated");
    }
    for instruction in &matched.instructions {
        let gate = if instruction.command().is_some() {
            " (needs approval)".yellow().to_string()
        } else {
            String::new()
        };
        println!("  * {}{}", instruction.describe(), gate);
    }
    Ok(())
}
