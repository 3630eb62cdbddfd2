use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{
    api::{
        AssistantMessage, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, EmbeddingData,
        EmbeddingInput, EmbeddingUsage, EmbeddingsRequest, EmbeddingsResponse, ToolCall,
        ToolChoice, ToolFunction, Usage,
    },
    catalog,
};

/// Fixed pool of canned replies the synthesizer picks from.
pub static MOCK_REPLIES: &[&str] = &[
    "Hello! I'm a mock OpenAI server. How can I help you today?",
    "I'm here to assist with your testing needs. This is a simulated response.",
    "This is a mock response from the OpenAI-compatible server. Everything is working correctly!",
    "Greetings! I'm a test server simulating OpenAI's API. Feel free to experiment!",
    "Mock response generated successfully. Your API integration is working!",
];

/// Rough approximation: ~4 characters per token. Never a real tokenizer.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn hex_id(prefix: &str, len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..len])
}

/// Builds mock chat completions and embeddings. All randomized decisions
/// (canned reply pick, unsolicited tool calls, embedding values) flow through
/// one seedable RNG so tests can pin the outcome.
pub struct Synthesizer {
    rng: Mutex<StdRng>,
}

impl Synthesizer {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pick_reply(&self) -> &'static str {
        let i = self.rng().random_range(0..MOCK_REPLIES.len());
        MOCK_REPLIES[i]
    }

    /// Tool-call policy: `required`/`auto` force a call when tools are
    /// present, a forced function names the call, `none` (or any other mode)
    /// suppresses it, and an unset choice calls a tool with 30% probability.
    /// Callers that need a deterministic tool invocation must pass an
    /// explicit `tool_choice`.
    fn tool_call_target<'a>(&self, req: &'a ChatCompletionRequest) -> Option<&'a str> {
        let tools = req.tools.as_deref().filter(|tools| !tools.is_empty())?;
        match &req.tool_choice {
            Some(ToolChoice::Mode(mode)) if mode == "required" || mode == "auto" => {
                Some(tools[0].function.name.as_str())
            }
            Some(ToolChoice::Mode(_)) => None,
            Some(ToolChoice::Function { function, .. }) => Some(function.name.as_str()),
            None => {
                if self.rng().random_bool(0.3) {
                    Some(tools[0].function.name.as_str())
                } else {
                    None
                }
            }
        }
    }

    pub fn synthesize(&self, req: &ChatCompletionRequest) -> ChatCompletionResponse {
        let (message, finish_reason) = match self.tool_call_target(req) {
            Some(name) => (
                AssistantMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(vec![ToolCall {
                        id: hex_id("call_", 8),
                        kind: "function".to_string(),
                        function: ToolFunction {
                            name: name.to_string(),
                            arguments: r#"{"mock": "arguments"}"#.to_string(),
                        },
                    }]),
                },
                "tool_calls",
            ),
            None => (
                AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some(self.pick_reply().to_string()),
                    tool_calls: None,
                },
                "stop",
            ),
        };

        // Prompt accounting is computed once over all input messages; the
        // completion estimate is multiplied by the number of choices.
        let prompt_tokens: u32 = req.messages.iter().map(|m| estimate_tokens(&m.text())).sum();
        let completion_tokens = estimate_tokens(message.content.as_deref().unwrap_or_default());
        let n = req.n.filter(|&n| n >= 1).unwrap_or(1);

        let choices: SmallVec<[ChatChoice; 1]> = (0..n)
            .map(|index| ChatChoice {
                index,
                message: message.clone(),
                finish_reason: finish_reason.to_string(),
            })
            .collect();

        ChatCompletionResponse {
            id: hex_id("chatcmpl-", 24),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: req.model.clone(),
            choices,
            usage: Usage {
                prompt_tokens,
                completion_tokens: completion_tokens * n,
                total_tokens: prompt_tokens + completion_tokens * n,
            },
            system_fingerprint: hex_id("fp_", 12),
        }
    }

    pub fn embed(&self, req: &EmbeddingsRequest, input: &EmbeddingInput) -> EmbeddingsResponse {
        let dimensions = catalog::embedding_dimensions(&req.model, req.dimensions);
        let mut prompt_tokens = 0;
        let data = input
            .texts()
            .iter()
            .enumerate()
            .map(|(index, text)| {
                prompt_tokens += estimate_tokens(text);
                EmbeddingData {
                    object: "embedding".to_string(),
                    embedding: self.random_unit_vector(dimensions),
                    index,
                }
            })
            .collect();

        EmbeddingsResponse {
            object: "list".to_string(),
            data,
            model: req.model.clone(),
            usage: EmbeddingUsage {
                prompt_tokens,
                total_tokens: prompt_tokens,
            },
        }
    }

    fn random_unit_vector(&self, dimensions: usize) -> Vec<f64> {
        let mut rng = self.rng();
        let mut vector: Vec<f64> = (0..dimensions)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatMessage, FunctionName, MessageContent, Tool, ToolFunctionDef};

    fn request(content: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(MessageContent::Text(content.to_string())),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            }],
            ..Default::default()
        }
    }

    fn weather_tool() -> Tool {
        Tool {
            kind: "function".to_string(),
            function: ToolFunctionDef {
                name: "get_weather".to_string(),
                description: Some("Get the current weather".to_string()),
                parameters: Some(serde_json::json!({"type": "object"})),
            },
        }
    }

    #[test]
    fn prose_reply_comes_from_the_pool() {
        let synth = Synthesizer::with_seed(7);
        let res = synth.synthesize(&request("Hello!"));
        let content = res.choices[0].message.content.as_deref().unwrap();
        assert!(MOCK_REPLIES.contains(&content));
        assert_eq!(res.choices[0].finish_reason, "stop");
        assert_eq!(res.object, "chat.completion");
        assert!(res.id.starts_with("chatcmpl-"));
        assert!(res.system_fingerprint.starts_with("fp_"));
    }

    #[test]
    fn required_tool_choice_always_calls() {
        let synth = Synthesizer::with_seed(1);
        for _ in 0..16 {
            let mut req = request("weather in Paris?");
            req.tools = Some(vec![weather_tool()]);
            req.tool_choice = Some(ToolChoice::Mode("required".to_string()));
            let res = synth.synthesize(&req);
            let choice = &res.choices[0];
            assert_eq!(choice.finish_reason, "tool_calls");
            let calls = choice.message.tool_calls.as_ref().unwrap();
            assert_eq!(calls[0].function.name, "get_weather");
            assert!(calls[0].id.starts_with("call_"));
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap();
        }
    }

    #[test]
    fn auto_forces_like_required() {
        let synth = Synthesizer::with_seed(1);
        let mut req = request("x");
        req.tools = Some(vec![weather_tool()]);
        req.tool_choice = Some(ToolChoice::Mode("auto".to_string()));
        assert_eq!(synth.synthesize(&req).choices[0].finish_reason, "tool_calls");
    }

    #[test]
    fn none_suppresses_tool_calls() {
        let synth = Synthesizer::with_seed(1);
        for _ in 0..16 {
            let mut req = request("x");
            req.tools = Some(vec![weather_tool()]);
            req.tool_choice = Some(ToolChoice::Mode("none".to_string()));
            assert_eq!(synth.synthesize(&req).choices[0].finish_reason, "stop");
        }
    }

    #[test]
    fn forced_function_names_the_call() {
        let synth = Synthesizer::with_seed(1);
        let mut req = request("x");
        req.tools = Some(vec![weather_tool()]);
        req.tool_choice = Some(ToolChoice::Function {
            kind: "function".to_string(),
            function: FunctionName {
                name: "get_weather".to_string(),
            },
        });
        let res = synth.synthesize(&req);
        let calls = res.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
    }

    #[test]
    fn unset_choice_calls_tools_sometimes() {
        let synth = Synthesizer::with_seed(42);
        let mut with_tool = 0;
        let mut without = 0;
        for _ in 0..200 {
            let mut req = request("x");
            req.tools = Some(vec![weather_tool()]);
            match synth.synthesize(&req).choices[0].finish_reason.as_str() {
                "tool_calls" => with_tool += 1,
                _ => without += 1,
            }
        }
        // 30% probability: both outcomes must occur over 200 draws.
        assert!(with_tool > 0);
        assert!(without > 0);
        assert!(with_tool < without);
    }

    #[test]
    fn n_replicates_choices_and_scales_usage() {
        let synth = Synthesizer::with_seed(3);
        let mut req = request("Hello there, mock server!");
        req.n = Some(3);
        let res = synth.synthesize(&req);
        assert_eq!(res.choices.len(), 3);
        for (i, choice) in res.choices.iter().enumerate() {
            assert_eq!(choice.index, i as u32);
            assert_eq!(choice.message, res.choices[0].message);
        }
        let single = estimate_tokens(res.choices[0].message.content.as_deref().unwrap());
        let prompt = estimate_tokens("Hello there, mock server!");
        assert_eq!(res.usage.prompt_tokens, prompt);
        assert_eq!(res.usage.completion_tokens, 3 * single);
        assert_eq!(res.usage.total_tokens, prompt + 3 * single);
    }

    #[test]
    fn zero_n_is_coerced_to_one() {
        let synth = Synthesizer::with_seed(3);
        let mut req = request("x");
        req.n = Some(0);
        assert_eq!(synth.synthesize(&req).choices.len(), 1);
    }

    #[test]
    fn embeddings_have_declared_dimension_and_unit_norm() {
        let synth = Synthesizer::with_seed(9);
        let req = EmbeddingsRequest {
            model: "text-embedding-3-large".to_string(),
            input: Some(EmbeddingInput::Many(vec![
                "first".to_string(),
                "second input".to_string(),
            ])),
            encoding_format: None,
            dimensions: None,
            user: None,
        };
        let input = req.input.clone().unwrap();
        let res = synth.embed(&req, &input);
        assert_eq!(res.data.len(), 2);
        for (i, item) in res.data.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.embedding.len(), 3072);
            let norm = item.embedding.iter().map(|x| x * x).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-9, "norm was {norm}");
        }
        let expected = estimate_tokens("first") + estimate_tokens("second input");
        assert_eq!(res.usage.prompt_tokens, expected);
        assert_eq!(res.usage.total_tokens, expected);
    }

    #[test]
    fn custom_dimensions_honored_for_v3_models() {
        let synth = Synthesizer::with_seed(9);
        let req = EmbeddingsRequest {
            model: "text-embedding-3-small".to_string(),
            input: Some(EmbeddingInput::One("hello".to_string())),
            encoding_format: None,
            dimensions: Some(64),
            user: None,
        };
        let input = req.input.clone().unwrap();
        let res = synth.embed(&req, &input);
        assert_eq!(res.data[0].embedding.len(), 64);
    }

    #[test]
    fn multipart_content_counts_toward_prompt_tokens() {
        let synth = Synthesizer::with_seed(5);
        let mut req = request("ignored");
        req.messages[0].content = Some(MessageContent::Parts(vec![
            crate::api::ContentPart::Text {
                text: "What is".to_string(),
            },
            crate::api::ContentPart::Text {
                text: "this?".to_string(),
            },
        ]));
        let res = synth.synthesize(&req);
        assert_eq!(res.usage.prompt_tokens, estimate_tokens("What is this?"));
    }
}
