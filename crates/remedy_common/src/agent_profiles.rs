//! Agent profiles - the closed set of automated support agents.
//!
//! Each agent has a tier and a fixed capability set. Permission questions
//! are answered with [`AgentProfile::can_perform`] instead of string lookups.

use crate::plan::{ActionKind, PlanStatus, ResolutionPlan};
use crate::ticket::Ticket;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    /// Technical error handling, no customer contact
    Tier0,
    /// First-line support, answers customers
    Tier1,
    /// Specialists, run diagnostics and fixes
    Tier2,
}

impl AgentTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier0 => "tier0",
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
        }
    }
}

/// Something an agent may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ErrorRetry,
    AnswerCustomer,
    UxUpdate,
    SupabaseQuery,
    RemoteCommand,
    Autopatch,
    Escalate,
    ManualFollowup,
}

impl Capability {
    /// Capability needed to carry out a plan action of `kind`
    pub fn for_action(kind: ActionKind) -> Self {
        match kind {
            ActionKind::AnswerCustomer => Self::AnswerCustomer,
            ActionKind::SupabaseQuery => Self::SupabaseQuery,
            ActionKind::RemoteCommand => Self::RemoteCommand,
            ActionKind::UxUpdate => Self::UxUpdate,
            ActionKind::ManualFollowup => Self::ManualFollowup,
            ActionKind::AutopatchPlan => Self::Autopatch,
        }
    }
}

/// Agent identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentProfile {
    ErrorHandlerAgent,
    SupportAgent,
    UiDebugAgent,
    EscalationAgent,
    SupabaseAnalystAgent,
    HetznerOpsAgent,
    FrontendDiagnosticsAgent,
    AutopatchArchitectAgent,
}

pub const ALL_AGENTS: &[AgentProfile] = &[
    AgentProfile::ErrorHandlerAgent,
    AgentProfile::SupportAgent,
    AgentProfile::UiDebugAgent,
    AgentProfile::EscalationAgent,
    AgentProfile::SupabaseAnalystAgent,
    AgentProfile::HetznerOpsAgent,
    AgentProfile::FrontendDiagnosticsAgent,
    AgentProfile::AutopatchArchitectAgent,
];

impl AgentProfile {
    pub fn id(&self) -> &'static str {
        match self {
            Self::ErrorHandlerAgent => "error-handler-agent",
            Self::SupportAgent => "support-agent",
            Self::UiDebugAgent => "ui-debug-agent",
            Self::EscalationAgent => "escalation-agent",
            Self::SupabaseAnalystAgent => "supabase-analyst-agent",
            Self::HetznerOpsAgent => "hetzner-ops-agent",
            Self::FrontendDiagnosticsAgent => "frontend-diagnostics-agent",
            Self::AutopatchArchitectAgent => "autopatch-architect-agent",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        ALL_AGENTS.iter().copied().find(|a| a.id() == id)
    }

    pub fn tier(&self) -> AgentTier {
        match self {
            Self::ErrorHandlerAgent => AgentTier::Tier0,
            Self::SupportAgent | Self::UiDebugAgent | Self::EscalationAgent => AgentTier::Tier1,
            Self::SupabaseAnalystAgent
            | Self::HetznerOpsAgent
            | Self::FrontendDiagnosticsAgent
            | Self::AutopatchArchitectAgent => AgentTier::Tier2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ErrorHandlerAgent => "Error Handler",
            Self::SupportAgent => "Support Agent",
            Self::UiDebugAgent => "UI Debug Agent",
            Self::EscalationAgent => "Escalation Agent",
            Self::SupabaseAnalystAgent => "Supabase Analyst",
            Self::HetznerOpsAgent => "Hetzner Ops",
            Self::FrontendDiagnosticsAgent => "Frontend Diagnostics",
            Self::AutopatchArchitectAgent => "Autopatch Architect",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ErrorHandlerAgent => "Catches technical failures and retries them before they reach a customer.",
            Self::SupportAgent => "Answers customer tickets using the documentation and knowledge base.",
            Self::UiDebugAgent => "Diagnoses user interface problems reported by customers.",
            Self::EscalationAgent => "Takes over tickets that automation could not resolve.",
            Self::SupabaseAnalystAgent => "Investigates authentication, database and policy problems.",
            Self::HetznerOpsAgent => "Operates the application servers and their processes.",
            Self::FrontendDiagnosticsAgent => "Investigates build, rendering and asset delivery problems.",
            Self::AutopatchArchitectAgent => "Plans source-level fixes for recurring failure signatures.",
        }
    }

    pub fn goals(&self) -> &'static [&'static str] {
        match self {
            Self::ErrorHandlerAgent => &[
                "Detect transient technical failures",
                "Retry safely before involving a human",
            ],
            Self::SupportAgent => &[
                "Understand the customer's problem precisely",
                "Answer with concrete steps from the documentation",
                "Ask only for data that is actually missing",
            ],
            Self::UiDebugAgent => &[
                "Reproduce the reported UI behaviour",
                "Identify the affected component",
                "Propose a minimal UI fix",
            ],
            Self::EscalationAgent => &[
                "Summarise what automation already tried",
                "Hand the ticket to a human with full context",
            ],
            Self::SupabaseAnalystAgent => &[
                "Verify auth sessions and profiles",
                "Check policies and triggers",
                "Reproduce database errors",
            ],
            Self::HetznerOpsAgent => &[
                "Check resources and process state",
                "Read service logs",
                "Restart services only through whitelisted commands",
            ],
            Self::FrontendDiagnosticsAgent => &[
                "Run build, lint and tests",
                "Check asset delivery and CSP",
                "Validate fixes with a live check",
            ],
            Self::AutopatchArchitectAgent => &[
                "Turn recurring failures into concrete patch plans",
                "Name target files, steps, validation and rollout",
            ],
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Self::ErrorHandlerAgent => &[ErrorRetry, Escalate],
            Self::SupportAgent => &[AnswerCustomer, ManualFollowup, Escalate],
            Self::UiDebugAgent => &[AnswerCustomer, UxUpdate, ManualFollowup, Escalate],
            Self::EscalationAgent => &[AnswerCustomer, ManualFollowup, Escalate],
            Self::SupabaseAnalystAgent => &[SupabaseQuery, ManualFollowup, Escalate],
            Self::HetznerOpsAgent => &[RemoteCommand, ManualFollowup, Escalate],
            Self::FrontendDiagnosticsAgent => &[UxUpdate, Autopatch, ManualFollowup],
            Self::AutopatchArchitectAgent => &[Autopatch, UxUpdate, ManualFollowup],
        }
    }

    pub fn can_perform(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn can_perform_action(&self, kind: ActionKind) -> bool {
        self.can_perform(Capability::for_action(kind))
    }

    /// First-line agent for a ticket, by category and text
    pub fn primary_for(ticket: &Ticket) -> Self {
        let category = ticket.category.as_deref().unwrap_or("").to_lowercase();
        let text = format!("{} {}", ticket.title, ticket.description).to_lowercase();
        let mentions_ui = text.split(|c: char| !c.is_alphanumeric()).any(|w| w == "ui");

        if category.contains("ui") || mentions_ui {
            Self::UiDebugAgent
        } else if category.contains("escalation") {
            Self::EscalationAgent
        } else {
            Self::SupportAgent
        }
    }

    /// Specialists a plan should be routed to
    pub fn tier2_for_plan(ticket: &Ticket, plan: &ResolutionPlan) -> Vec<Self> {
        let text = format!("{} {}", ticket.title, ticket.description).to_lowercase();
        let has = |kind: ActionKind| plan.actions.iter().any(|a| a.kind == kind);
        let mut agents = Vec::new();

        if text.contains("supabase")
            || text.contains("auth")
            || has(ActionKind::SupabaseQuery)
            || plan.status == PlanStatus::WaitingCustomer
        {
            agents.push(Self::SupabaseAnalystAgent);
        }
        if text.contains("server") || text.contains("pm2") || has(ActionKind::RemoteCommand) {
            agents.push(Self::HetznerOpsAgent);
        }
        if text.contains("frontend") || has(ActionKind::UxUpdate) {
            agents.push(Self::FrontendDiagnosticsAgent);
        }
        if has(ActionKind::AutopatchPlan) {
            agents.push(Self::AutopatchArchitectAgent);
        }
        agents
    }
}

impl std::fmt::Display for AgentProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ResolutionAction;

    #[test]
    fn test_ids_roundtrip_and_tiers() {
        for agent in ALL_AGENTS {
            assert_eq!(AgentProfile::parse(agent.id()), Some(*agent));
            assert!(!agent.goals().is_empty());
        }
        assert_eq!(AgentProfile::ErrorHandlerAgent.tier(), AgentTier::Tier0);
        assert_eq!(AgentProfile::SupportAgent.tier(), AgentTier::Tier1);
        assert_eq!(AgentProfile::SupabaseAnalystAgent.tier(), AgentTier::Tier2);
    }

    #[test]
    fn test_capabilities() {
        assert!(AgentProfile::ErrorHandlerAgent.can_perform(Capability::ErrorRetry));
        assert!(AgentProfile::HetznerOpsAgent.can_perform_action(ActionKind::RemoteCommand));
        assert!(!AgentProfile::SupportAgent.can_perform_action(ActionKind::RemoteCommand));
    }

    #[test]
    fn test_customer_answers_only_for_customer_facing_agents() {
        assert!(AgentProfile::SupportAgent.can_perform_action(ActionKind::AnswerCustomer));
        assert!(AgentProfile::EscalationAgent.can_perform_action(ActionKind::AnswerCustomer));
        assert!(!AgentProfile::HetznerOpsAgent.can_perform_action(ActionKind::AnswerCustomer));
        assert!(!AgentProfile::ErrorHandlerAgent.can_perform_action(ActionKind::AnswerCustomer));
    }

    #[test]
    fn test_primary_agent_selection() {
        let mut t = Ticket::new("t", "Button misaligned", "the UI looks broken");
        assert_eq!(AgentProfile::primary_for(&t), AgentProfile::UiDebugAgent);

        t = Ticket::new("t", "Guidance", "how do I build a bot");
        assert_eq!(AgentProfile::primary_for(&t), AgentProfile::SupportAgent);

        t.category = Some("escalation".into());
        assert_eq!(AgentProfile::primary_for(&t), AgentProfile::EscalationAgent);
    }

    #[test]
    fn test_tier2_routing() {
        let t = Ticket::new("t", "pm2 down", "server restarts");
        let plan = ResolutionPlan {
            status: PlanStatus::Resolved,
            summary: "ok".into(),
            actions: vec![ResolutionAction::new(ActionKind::AutopatchPlan, "patch")],
            fallback: false,
        };
        let agents = AgentProfile::tier2_for_plan(&t, &plan);
        assert_eq!(
            agents,
            vec![AgentProfile::HetznerOpsAgent, AgentProfile::AutopatchArchitectAgent]
        );
    }
}
