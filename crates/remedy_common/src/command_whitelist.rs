//! Command Whitelist
//!
//! Defines the ONLY remote commands the executor may ever run.
//!
//! - The table is compiled into the binary; nothing at runtime extends it
//! - Every entry is an exact `(binary, subcommand)` pair
//! - Targets (process, service, container) come from an explicit per-entry list
//! - Anything not matched exactly is rejected with a readable reason
//!
//! There is no deny list: unknown input is rejected by construction.

use serde::Serialize;

// ============================================================================
// Whitelist table
// ============================================================================

/// Tool family of a whitelisted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Pm2,
    Caddy,
    Systemctl,
    Docker,
}

/// Whether a command changes remote state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandEffect {
    /// Inspects state only (logs, status, validate)
    ReadOnly,
    /// Restarts, reloads or otherwise mutates the host
    Mutating,
}

/// Which positional target a whitelisted command accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "targets")]
pub enum TargetRule {
    /// No positional argument accepted
    NoTarget,
    /// Target may be omitted; if present it must be listed
    Optional(&'static [&'static str]),
    /// Target must be present and listed
    Required(&'static [&'static str]),
}

/// One exact whitelist entry
#[derive(Debug, Clone, Serialize)]
pub struct AllowedCommand {
    pub binary: &'static str,
    pub subcommand: &'static str,
    pub description: &'static str,
    pub category: CommandCategory,
    pub effect: CommandEffect,
    pub targets: TargetRule,
    /// `--flags` accepted after the subcommand
    pub flags: &'static [&'static str],
}

const PM2_APPS: &[&str] = &["whatsapp-bot-builder", "support-mcp-server", "all"];
const PM2_LOG_APPS: &[&str] = &["whatsapp-bot-builder", "support-mcp-server"];
const SYSTEMD_SERVICES: &[&str] = &["caddy", "docker", "n8n"];
const DOCKER_CONTAINERS: &[&str] = &["whatsapp-bot-builder", "n8n", "mcp-afrika-container"];
const PM2_FLAGS: &[&str] = &["--update-env"];

macro_rules! entry {
    ($bin:expr, $sub:expr, $cat:ident, $effect:ident, $targets:expr, $flags:expr, $desc:expr) => {
        AllowedCommand {
            binary: $bin,
            subcommand: $sub,
            description: $desc,
            category: CommandCategory::$cat,
            effect: CommandEffect::$effect,
            targets: $targets,
            flags: $flags,
        }
    };
}

static WHITELIST: &[AllowedCommand] = &[
    // pm2
    entry!("pm2", "restart", Pm2, Mutating, TargetRule::Optional(PM2_APPS), PM2_FLAGS, "Restart PM2 process"),
    entry!("pm2", "stop", Pm2, Mutating, TargetRule::Optional(PM2_APPS), PM2_FLAGS, "Stop PM2 process"),
    entry!("pm2", "start", Pm2, Mutating, TargetRule::Optional(PM2_APPS), PM2_FLAGS, "Start PM2 process"),
    entry!("pm2", "reload", Pm2, Mutating, TargetRule::Optional(PM2_APPS), PM2_FLAGS, "Reload PM2 process"),
    entry!("pm2", "logs", Pm2, ReadOnly, TargetRule::Optional(PM2_LOG_APPS), &[], "Show PM2 logs"),
    entry!("pm2", "save", Pm2, Mutating, TargetRule::NoTarget, &[], "Save PM2 process list"),
    entry!("pm2", "list", Pm2, ReadOnly, TargetRule::NoTarget, &[], "List PM2 processes"),
    // caddy
    entry!("caddy", "reload", Caddy, Mutating, TargetRule::NoTarget, &[], "Reload Caddy configuration"),
    entry!("caddy", "validate", Caddy, ReadOnly, TargetRule::NoTarget, &[], "Validate Caddy configuration"),
    // systemctl
    entry!("systemctl", "restart", Systemctl, Mutating, TargetRule::Required(SYSTEMD_SERVICES), &[], "Restart systemd service"),
    entry!("systemctl", "reload", Systemctl, Mutating, TargetRule::Required(SYSTEMD_SERVICES), &[], "Reload systemd service"),
    entry!("systemctl", "status", Systemctl, ReadOnly, TargetRule::Required(SYSTEMD_SERVICES), &[], "Show systemd service status"),
    // docker
    entry!("docker", "restart", Docker, Mutating, TargetRule::Required(DOCKER_CONTAINERS), &[], "Restart Docker container"),
    entry!("docker", "stop", Docker, Mutating, TargetRule::Required(DOCKER_CONTAINERS), &[], "Stop Docker container"),
    entry!("docker", "start", Docker, Mutating, TargetRule::Required(DOCKER_CONTAINERS), &[], "Start Docker container"),
    entry!("docker", "logs", Docker, ReadOnly, TargetRule::Required(DOCKER_CONTAINERS), &[], "Show Docker container logs"),
];

/// Shell metacharacters that are never accepted anywhere in a command
const FORBIDDEN_CHARS: &[char] = &[';', '|', '&', '$', '`', '>', '<', '(', ')', '\\', '"', '\'', '\n', '*', '?'];

/// All whitelist entries (for listing and diagnostics)
pub fn allowed_commands() -> &'static [AllowedCommand] {
    WHITELIST
}

// ============================================================================
// Parsing and checking
// ============================================================================

/// A command split into its whitelist-relevant parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    pub binary: String,
    pub subcommand: Option<String>,
    pub target: Option<String>,
    pub flags: Vec<String>,
    /// Positional arguments beyond the target (always a rejection)
    pub extra: Vec<String>,
}

impl ParsedCommand {
    pub fn parse(command: &str) -> Option<Self> {
        let mut tokens = command.split_whitespace();
        let binary = tokens.next()?.to_string();
        let mut subcommand = None;
        let mut target = None;
        let mut flags = Vec::new();
        let mut extra = Vec::new();

        for token in tokens {
            if token.starts_with('-') {
                flags.push(token.to_string());
            } else if subcommand.is_none() {
                subcommand = Some(token.to_string());
            } else if target.is_none() {
                target = Some(token.to_string());
            } else {
                extra.push(token.to_string());
            }
        }

        Some(Self {
            binary,
            subcommand,
            target,
            flags,
            extra,
        })
    }
}

/// Result of a whitelist check
#[derive(Debug, Clone, Serialize)]
pub struct CommandCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub command: Option<AllowedCommand>,
}

impl CommandCheck {
    fn allow(entry: &AllowedCommand) -> Self {
        Self {
            allowed: true,
            reason: None,
            command: Some(entry.clone()),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            command: None,
        }
    }
}

/// Check a command string against the whitelist
pub fn is_command_allowed(command: &str) -> CommandCheck {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return CommandCheck::reject("empty command");
    }

    if let Some(c) = trimmed.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return CommandCheck::reject(format!("forbidden character {:?} in command", c));
    }

    let parsed = match ParsedCommand::parse(trimmed) {
        Some(p) => p,
        None => return CommandCheck::reject("empty command"),
    };

    if !WHITELIST.iter().any(|e| e.binary == parsed.binary) {
        return CommandCheck::reject(format!("binary not whitelisted: {}", parsed.binary));
    }

    let subcommand = match &parsed.subcommand {
        Some(s) => s.as_str(),
        None => return CommandCheck::reject(format!("missing subcommand for {}", parsed.binary)),
    };

    let entry = match WHITELIST
        .iter()
        .find(|e| e.binary == parsed.binary && e.subcommand == subcommand)
    {
        Some(e) => e,
        None => {
            return CommandCheck::reject(format!(
                "subcommand not whitelisted: {} {}",
                parsed.binary, subcommand
            ))
        }
    };

    if let Some(flag) = parsed.flags.iter().find(|f| !entry.flags.contains(&f.as_str())) {
        return CommandCheck::reject(format!(
            "flag not allowed for {} {}: {}",
            entry.binary, entry.subcommand, flag
        ));
    }

    if !parsed.extra.is_empty() {
        return CommandCheck::reject(format!(
            "unexpected arguments for {} {}: {}",
            entry.binary,
            entry.subcommand,
            parsed.extra.join(" ")
        ));
    }

    match (entry.targets, parsed.target.as_deref()) {
        (TargetRule::NoTarget, None) => CommandCheck::allow(entry),
        (TargetRule::NoTarget, Some(t)) => CommandCheck::reject(format!(
            "{} {} takes no target, got: {}",
            entry.binary, entry.subcommand, t
        )),
        (TargetRule::Optional(_), None) => CommandCheck::allow(entry),
        (TargetRule::Optional(list) | TargetRule::Required(list), Some(t)) => {
            if list.contains(&t) {
                CommandCheck::allow(entry)
            } else {
                CommandCheck::reject(format!(
                    "target not allowed for {} {}: {}",
                    entry.binary, entry.subcommand, t
                ))
            }
        }
        (TargetRule::Required(_), None) => CommandCheck::reject(format!(
            "{} {} requires a target",
            entry.binary, entry.subcommand
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pm2_restart_known_app_allowed() {
        let check = is_command_allowed("pm2 restart whatsapp-bot-builder");
        assert!(check.allowed);
        assert_eq!(check.command.unwrap().category, CommandCategory::Pm2);
    }

    #[test]
    fn test_pm2_manages_the_support_server() {
        assert!(is_command_allowed("pm2 restart support-mcp-server").allowed);
        assert!(is_command_allowed("pm2 logs support-mcp-server").allowed);
        assert!(!is_command_allowed("docker restart support-mcp-server").allowed);
    }

    #[test]
    fn test_pm2_restart_unknown_app_rejected() {
        let check = is_command_allowed("pm2 restart untrusted-app");
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("untrusted-app"));
    }

    #[test]
    fn test_pm2_update_env_flag() {
        assert!(is_command_allowed("pm2 restart whatsapp-bot-builder --update-env").allowed);
        assert!(is_command_allowed("pm2 restart all").allowed);
        assert!(is_command_allowed("pm2 restart").allowed);
        assert!(!is_command_allowed("pm2 restart whatsapp-bot-builder --force").allowed);
        assert!(!is_command_allowed("pm2 list --update-env").allowed);
    }

    #[test]
    fn test_unknown_binary_rejected() {
        let check = is_command_allowed("rm -rf /");
        assert!(!check.allowed);
        assert_eq!(check.reason.as_deref(), Some("binary not whitelisted: rm"));
        assert!(!is_command_allowed("bash").allowed);
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        let check = is_command_allowed("docker exec n8n sh");
        assert!(!check.allowed);
        assert!(check.reason.unwrap().starts_with("subcommand not whitelisted"));
        assert!(!is_command_allowed("pm2").allowed);
    }

    #[test]
    fn test_systemctl_requires_listed_service() {
        assert!(is_command_allowed("systemctl restart caddy").allowed);
        assert!(is_command_allowed("systemctl status n8n").allowed);
        assert!(!is_command_allowed("systemctl restart sshd").allowed);
        assert!(!is_command_allowed("systemctl restart").allowed);
    }

    #[test]
    fn test_docker_requires_listed_container() {
        assert!(is_command_allowed("docker restart mcp-afrika-container").allowed);
        assert!(!is_command_allowed("docker restart postgres").allowed);
        assert!(!is_command_allowed("docker logs").allowed);
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        assert!(!is_command_allowed("pm2 restart all; rm -rf /").allowed);
        assert!(!is_command_allowed("pm2 restart all && curl evil").allowed);
        assert!(!is_command_allowed("docker logs n8n > /tmp/x").allowed);
        assert!(!is_command_allowed("pm2 restart $(whoami)").allowed);
    }

    #[test]
    fn test_extra_arguments_rejected() {
        assert!(!is_command_allowed("systemctl restart caddy docker").allowed);
        assert!(!is_command_allowed("caddy reload now").allowed);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert_eq!(is_command_allowed("   ").reason.as_deref(), Some("empty command"));
    }

    #[test]
    fn test_every_entry_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for entry in allowed_commands() {
            assert!(seen.insert((entry.binary, entry.subcommand)));
        }
    }
}
