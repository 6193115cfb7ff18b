//! Plan generation for tickets no signature could handle.
//!
//! The LLM is optional. Unconfigured, failing or timing out, it degrades to
//! a deterministic `waiting_customer` plan so the router never blocks on it.

use remedy_common::agent_profiles::AgentProfile;
use remedy_common::config_index::KnowledgeDocument;
use remedy_common::llm_client::{LlmClient, LlmError};
use remedy_common::plan::{extract_json_object, ResolutionPlan};
use remedy_common::retry::RetryPolicy;
use remedy_common::ticket::Ticket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Characters of each knowledge document included in the prompt
const SNIPPET_CHARS: usize = 800;

const SYSTEM_PROMPT: &str = "You are an automated support agent. Answer only with a JSON object \
of the form {\"status\": \"resolved\" | \"waiting_customer\", \"summary\": string, \"actions\": \
[{\"type\": \"supabase_query\" | \"remote_command\" | \"ux_update\" | \"manual_followup\", \
\"description\": string, \"payload\": object}]}.";

pub struct PlanGenerator {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl PlanGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { llm, retry, timeout }
    }

    /// Plan for `ticket` as seen by `agent`; never fails
    pub async fn generate(
        &self,
        agent: AgentProfile,
        ticket: &Ticket,
        knowledge: &[&KnowledgeDocument],
    ) -> ResolutionPlan {
        if !self.llm.is_available() {
            warn!("[PLAN] LLM not configured, using fallback plan for {}", ticket.id);
            return ResolutionPlan::fallback();
        }

        let prompt = build_prompt(agent, ticket, knowledge);
        let started = Instant::now();
        info!(
            "[PLAN] Asking LLM as {} for ticket {} ({} knowledge docs)",
            agent.id(),
            ticket.id,
            knowledge.len()
        );

        let result = self
            .retry
            .retry("llm plan", || async {
                match tokio::time::timeout(self.timeout, self.llm.call_json(SYSTEM_PROMPT, &prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(self.timeout.as_secs())),
                }
            })
            .await;

        match result.and_then(|value| decode_plan(&value)) {
            Ok(plan) => {
                let plan = restrict_to_agent(plan, agent);
                info!(
                    "[PLAN] Plan for {} ready in {} ms: {} ({} actions)",
                    ticket.id,
                    started.elapsed().as_millis(),
                    plan.status.as_str(),
                    plan.actions.len()
                );
                plan
            }
            Err(e) => {
                warn!("[PLAN] LLM analysis for {} failed: {}", ticket.id, e);
                ResolutionPlan::failed_analysis(&e.to_string())
            }
        }
    }
}

fn decode_plan(value: &serde_json::Value) -> Result<ResolutionPlan, LlmError> {
    let object = match value {
        serde_json::Value::String(raw) => extract_json_object(raw)
            .ok_or_else(|| LlmError::InvalidJson("no JSON object in answer".to_string()))?,
        other => other.clone(),
    };
    ResolutionPlan::from_llm_value(&object)
        .ok_or_else(|| LlmError::InvalidJson("answer is not a plan object".to_string()))
}

/// Drop actions the agent has no capability for
fn restrict_to_agent(mut plan: ResolutionPlan, agent: AgentProfile) -> ResolutionPlan {
    let before = plan.actions.len();
    plan.actions.retain(|a| agent.can_perform_action(a.kind));
    if plan.actions.len() < before {
        warn!(
            "[PLAN] Dropped {} action(s) outside the capabilities of {}",
            before - plan.actions.len(),
            agent.id()
        );
    }
    plan
}

fn build_prompt(agent: AgentProfile, ticket: &Ticket, knowledge: &[&KnowledgeDocument]) -> String {
    let goals = agent
        .goals()
        .iter()
        .enumerate()
        .map(|(i, g)| format!("{}. {}", i + 1, g))
        .collect::<Vec<_>>()
        .join("\n");

    let allowed = agent
        .capabilities()
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .filter_map(|v| v.as_str().map(|s| format!("- {}", s)))
        .collect::<Vec<_>>()
        .join("\n");

    let snippets = if knowledge.is_empty() {
        "- no additional sources found -".to_string()
    } else {
        knowledge
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let snippet: String = doc.content.chars().take(SNIPPET_CHARS).collect();
                format!("### Source {}: {}\nPath: {}\n---\n{}", i + 1, doc.title, doc.id, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "You are {label} ({tier}).\n{description}\n\n\
         Rules:\n\
         - Use the knowledge base sources below first and cite them.\n\
         - Stay within the allowed actions.\n\
         - Ask the customer only for data that is actually missing.\n\n\
         Goals:\n{goals}\n\n\
         Allowed actions:\n{allowed}\n\n\
         Ticket:\n\
         - ID: {id}\n\
         - Title: {title}\n\
         - Category: {category}\n\
         - Priority: {priority}\n\
         - Description: {body}\n\
         - Metadata: {metadata}\n\n\
         Knowledge base:\n{snippets}\n\n\
         Keep technical details in \"actions\"; the summary is shown to the customer.",
        label = agent.label(),
        tier = agent.tier().as_str(),
        description = agent.description(),
        goals = goals,
        allowed = allowed,
        id = ticket.id,
        title = ticket.title,
        category = ticket.category.as_deref().unwrap_or("unknown"),
        priority = ticket.priority.as_str(),
        body = ticket.combined_text(),
        metadata = ticket.source_metadata,
        snippets = snippets,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_common::llm_client::FakeLlmClient;
    use remedy_common::plan::{ActionKind, PlanStatus};

    fn generator(llm: FakeLlmClient) -> (PlanGenerator, Arc<FakeLlmClient>) {
        let llm = Arc::new(llm);
        let generator = PlanGenerator::new(llm.clone(), RetryPolicy::new(2, 10, 50), Duration::from_secs(5));
        (generator, llm)
    }

    #[tokio::test]
    async fn test_unconfigured_llm_yields_fallback() {
        let (generator, llm) = generator(FakeLlmClient::unavailable());
        let ticket = Ticket::new("t-1", "Question", "How do I export my bot?");
        let plan = generator.generate(AgentProfile::SupportAgent, &ticket, &[]).await;
        assert!(plan.fallback);
        assert_eq!(plan.status, PlanStatus::WaitingCustomer);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::ManualFollowup);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_llm_degrades_after_retries() {
        let (generator, llm) = generator(FakeLlmClient::always_error(LlmError::HttpError("502".into())));
        let ticket = Ticket::new("t-1", "Question", "x");
        let plan = generator.generate(AgentProfile::SupportAgent, &ticket, &[]).await;
        assert!(plan.fallback);
        assert_eq!(plan.actions[0].description, "LLM analysis failed.");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_llm_plan_is_restricted_to_agent_capabilities() {
        let answer = serde_json::json!({
            "status": "resolved",
            "summary": "Export is under Settings.",
            "actions": [
                {"type": "manual_followup", "description": "confirm"},
                {"type": "hetzner_command", "description": "pm2 restart"}
            ]
        });
        let (generator, llm) = generator(FakeLlmClient::always_valid(answer));
        let ticket = Ticket::new("t-1", "Export", "How do I export my bot?");
        let kb = KnowledgeDocument {
            id: "docs/export.md".into(),
            title: "Export".into(),
            path: "docs/export.md".into(),
            content: "Settings > Export".into(),
        };
        let plan = generator.generate(AgentProfile::SupportAgent, &ticket, &[&kb]).await;
        assert!(!plan.fallback);
        assert_eq!(plan.status, PlanStatus::Resolved);
        assert_eq!(plan.actions.len(), 1);

        let prompt = llm.prompts().pop().unwrap();
        assert!(prompt.contains("Settings > Export"));
        assert!(prompt.contains("### Source 1: Export"));
        assert!(prompt.contains("- answer_customer"));
    }

    #[tokio::test]
    async fn test_customer_answer_survives_support_agent_restriction() {
        let answer = serde_json::json!({
            "status": "resolved",
            "summary": "Invoices are under Billing.",
            "actions": [
                {"type": "answer_customer", "description": "Point to the billing page"},
                {"type": "hetzner_command", "description": "restart"}
            ]
        });
        let (generator, _) = generator(FakeLlmClient::always_valid(answer));
        let ticket = Ticket::new("t-1", "Rechnung", "Wo finde ich meine Rechnung?");
        let plan = generator.generate(AgentProfile::SupportAgent, &ticket, &[]).await;
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::AnswerCustomer);
    }
}
