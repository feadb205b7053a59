//! Chat-model backed planner and synthesizer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::RoundSummary;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::tools::ToolInfo;

use super::{CapabilityError, Planner, Synthesizer, Verdict};

const PLANNER_SYSTEM_PROMPT: &str = r##"Given a user query, create a plan to solve it with the utmost parallelizability.
Each plan entry is one action on its own line, numbered from 1 in order:

N. tool_name(arg1, key=arg2, ...)

Rules:
- Arguments are Python-style literals: "strings", numbers, True/False/None, [lists], or key=value.
- Use $K (or ${K} inside a string) to pass the output of an earlier action K. Never reference a later action.
- You may add "# depends on $1, $2" at the end of a line to order actions that share no arguments.
- Independent actions must not reference each other so they can run in parallel.
- You may write a "Thought: ..." line before an action to explain it.
- The last entry must be N. join() and nothing may follow it.
- Only use the tools listed below. Do not write anything else.

Available tools:
"##;

const JOINER_SYSTEM_PROMPT: &str = r#"You analyze the results of executing a plan and decide whether to:
1. Replan with feedback if the results are not enough to answer the question
2. Give the final answer if they are

Respond with a single JSON object and nothing else:
{"thought": "...", "should_replan": true|false, "feedback": "what to fix, if replanning", "answer": "the final answer, if not replanning"}"#;

const SYNTHESIZER_SYSTEM_PROMPT: &str = "Answer the user's question using only the task results provided. Be concrete and concise. If results are missing, say what could not be determined.";

fn tool_catalogue(tools: &[ToolInfo]) -> String {
    let mut catalogue = String::new();
    for (i, tool) in tools.iter().enumerate() {
        catalogue.push_str(&format!("{}. {}: {}\n", i + 1, tool.name, tool.description));
    }
    catalogue.push_str(&format!(
        "{}. join(): collects the results of every previous action. Always last.\n",
        tools.len() + 1
    ));
    catalogue
}

async fn complete(
    client: &dyn LlmClient,
    model: &str,
    messages: &[ChatMessage],
) -> Result<String, CapabilityError> {
    let options = ChatOptions {
        temperature: Some(0.0),
        max_tokens: None,
    };
    let response = client
        .chat_completion(model, messages, options)
        .await
        .map_err(|e| CapabilityError::Llm(e.to_string()))?;

    response
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| CapabilityError::InvalidResponse("empty completion".to_string()))
}

/// Planner that prompts a chat model with the plan grammar and tool list.
pub struct LlmPlanner {
    client: Arc<dyn LlmClient>,
    model: String,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, tools: &[ToolInfo]) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: format!("{}{}", PLANNER_SYSTEM_PROMPT, tool_catalogue(tools)),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, goal: &str, context: &str) -> Result<String, CapabilityError> {
        let mut user = format!("Question: {}", goal);
        if !context.trim().is_empty() {
            user.push_str("\n\nPrevious attempts:\n");
            user.push_str(context);
            user.push_str("\n\nWrite a new plan that builds on what already succeeded.");
        }

        let messages = [
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(user),
        ];
        complete(self.client.as_ref(), &self.model, &messages).await
    }
}

/// Structured joiner reply.
#[derive(Debug, Deserialize)]
struct JoinVerdict {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    should_replan: bool,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// Synthesizer that asks a chat model for answers and replan verdicts.
pub struct LlmSynthesizer {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl LlmSynthesizer {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, goal: &str, summary: &RoundSummary) -> Result<String, CapabilityError> {
        let messages = [
            ChatMessage::system(SYNTHESIZER_SYSTEM_PROMPT),
            ChatMessage::user(format!("Question: {}\n\n{}", goal, summary.render(None))),
        ];
        complete(self.client.as_ref(), &self.model, &messages).await
    }

    async fn assess(&self, goal: &str, summary: &RoundSummary) -> Result<Verdict, CapabilityError> {
        let messages = [
            ChatMessage::system(JOINER_SYSTEM_PROMPT),
            ChatMessage::user(format!("Question: {}\n\n{}", goal, summary.render(None))),
        ];
        let reply = complete(self.client.as_ref(), &self.model, &messages).await?;
        let verdict = parse_verdict(&reply)?;

        if let Some(thought) = &verdict.thought {
            tracing::debug!("Joiner thought: {}", thought);
        }

        if verdict.should_replan {
            Ok(Verdict::Replan {
                feedback: verdict.feedback.filter(|f| !f.trim().is_empty()),
            })
        } else {
            Ok(Verdict::Finish {
                answer: verdict.answer.filter(|a| !a.trim().is_empty()),
            })
        }
    }
}

/// Parse the verdict, tolerating a surrounding markdown code fence.
fn parse_verdict(reply: &str) -> Result<JoinVerdict, CapabilityError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| CapabilityError::InvalidResponse(format!("joiner verdict is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, Role};
    use std::sync::Mutex;

    struct CannedClient {
        reply: String,
        seen: Mutex<Vec<ChatMessage>>,
    }

    impl CannedClient {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            self.seen.lock().unwrap().extend_from_slice(messages);
            Ok(ChatResponse {
                content: Some(self.reply.clone()),
                finish_reason: Some("stop".to_string()),
                usage: None,
                model: None,
            })
        }
    }

    #[test]
    fn test_parse_verdict_with_code_fence() {
        let verdict = parse_verdict("```json\n{\"should_replan\": true, \"feedback\": \"search failed\"}\n```").unwrap();
        assert!(verdict.should_replan);
        assert_eq!(verdict.feedback.as_deref(), Some("search failed"));

        assert!(parse_verdict("sure, here you go").is_err());
    }

    #[test]
    fn test_catalogue_lists_join_last() {
        let tools = vec![ToolInfo {
            name: "web_search".to_string(),
            description: "search".to_string(),
        }];
        let catalogue = tool_catalogue(&tools);
        assert!(catalogue.starts_with("1. web_search: search"));
        assert!(catalogue.contains("2. join()"));
    }

    #[tokio::test]
    async fn test_planner_includes_context_and_tools() {
        let client = CannedClient::new("1. web_search(\"x\")\n2. join()");
        let tools = vec![ToolInfo {
            name: "web_search".to_string(),
            description: "search".to_string(),
        }];
        let planner = LlmPlanner::new(client.clone(), "test-model", &tools);

        let text = planner.plan("goal", "Context from last attempt: retry").await.unwrap();
        assert!(text.contains("join()"));

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].role, Role::System);
        assert!(seen[0].content.contains("web_search"));
        assert!(seen[0].content.contains("\"# depends on $1, $2\" at the end of a line"));
        assert!(seen[0].content.contains("Only use the tools listed below."));
        assert!(seen[0].content.trim_end().ends_with("2. join(): collects the results of every previous action. Always last."));
        assert!(seen[1].content.contains("Context from last attempt: retry"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_invalid() {
        let planner = LlmPlanner::new(CannedClient::new("   "), "m", &[]);
        assert!(matches!(
            planner.plan("goal", "").await,
            Err(CapabilityError::InvalidResponse(_))
        ));
    }
}
