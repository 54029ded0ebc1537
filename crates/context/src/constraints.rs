//! Provider-constraint enforcement.
//!
//! Checked against the model descriptor immediately before a request is
//! handed to the gateway. Violations carry a machine-readable kind so
//! the orchestrator can decide recovery per kind.

use hearth_domain::catalog::ModelDescriptor;
use hearth_domain::error::{ConstraintKind, Error, Result};
use hearth_providers::ChatRequest;

pub fn check_request(
    descriptor: &ModelDescriptor,
    request: &ChatRequest,
    input_tokens: u64,
) -> Result<()> {
    let limit = descriptor.effective_context_length();
    if input_tokens > limit {
        return Err(Error::Constraint {
            kind: ConstraintKind::ContextLength,
            message: format!("input is {input_tokens} tokens, model allows {limit}"),
        });
    }

    if request.tools.len() > descriptor.max_tools_per_request {
        return Err(Error::Constraint {
            kind: ConstraintKind::MaxTools,
            message: format!(
                "{} tool definitions attached, model allows {}",
                request.tools.len(),
                descriptor.max_tools_per_request
            ),
        });
    }

    let images: usize = request
        .messages
        .iter()
        .map(|m| m.content.image_count())
        .sum();
    if images > descriptor.max_images_per_request {
        return Err(Error::Constraint {
            kind: ConstraintKind::MaxImages,
            message: format!(
                "{images} inline images attached, model allows {}",
                descriptor.max_images_per_request
            ),
        });
    }

    if let Some(max_output) = request.max_output {
        let allowed = descriptor.effective_max_completion();
        if max_output > allowed {
            return Err(Error::Constraint {
                kind: ConstraintKind::MaxOutput,
                message: format!("requested {max_output} output tokens, model allows {allowed}"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_providers::ChatMessage;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "m1".into(),
            provider: "openai".into(),
            context_length: 1000,
            tokenizer: "cl100k".into(),
            max_completion_tokens: 200,
            max_tools_per_request: 2,
            max_parallel_tool_calls: 4,
            max_images_per_request: 1,
            pricing_input_per_million: 1.0,
            pricing_output_per_million: 2.0,
            supports_streaming: true,
            supports_tools: true,
            supports_caching: false,
            provider_overrides: Default::default(),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model_id: "m1".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![],
            max_output: Some(100),
            cache_control: false,
        }
    }

    #[test]
    fn within_limits_passes() {
        assert!(check_request(&descriptor(), &request(), 500).is_ok());
    }

    #[test]
    fn context_overflow_by_one_token_is_flagged() {
        let err = check_request(&descriptor(), &request(), 1001).unwrap_err();
        assert!(matches!(
            err,
            Error::Constraint {
                kind: ConstraintKind::ContextLength,
                ..
            }
        ));
    }

    #[test]
    fn too_many_tools() {
        let mut req = request();
        for i in 0..3 {
            req.tools.push(hearth_domain::tool::ToolDefinition {
                name: format!("t{i}"),
                description: String::new(),
                parameters: serde_json::json!({}),
                capability: Default::default(),
                critical: false,
            });
        }
        let err = check_request(&descriptor(), &req, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Constraint {
                kind: ConstraintKind::MaxTools,
                ..
            }
        ));
    }

    #[test]
    fn output_cap_respects_overrides() {
        let mut desc = descriptor();
        desc.provider_overrides.insert(
            "openai".into(),
            hearth_domain::catalog::ProviderOverrides {
                context_length: None,
                max_completion_tokens: Some(50),
            },
        );
        let err = check_request(&desc, &request(), 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Constraint {
                kind: ConstraintKind::MaxOutput,
                ..
            }
        ));
    }
}
