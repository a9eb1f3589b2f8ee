//! JSON pipeline stage: structural validation.

use async_trait::async_trait;

use super::{Flow, Middleware, PipelineContext};

/// Parses the payload once so malformed JSON is reported on the page and
/// handled as plain text instead of reaching the JSON splitter.
pub struct JsonValidate;

#[async_trait]
impl Middleware for JsonValidate {
    fn name(&self) -> &'static str {
        "json-validate"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&ctx.text) {
            ctx.errors.push(format!("invalid JSON: {}", err));
            ctx.content_type = "text/plain".to_string();
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::Fetched;
    use crate::pipeline::PipelineOptions;
    use url::Url;

    fn ctx_for(body: &str) -> PipelineContext {
        let url = Url::parse("https://api.example.com/schema.json").unwrap();
        let fetched = Fetched {
            bytes: body.as_bytes().to_vec(),
            content_type: "application/json".to_string(),
            etag: None,
            last_modified: None,
            final_url: url.clone(),
            status: 200,
        };
        PipelineContext::new(url, &fetched, PipelineOptions::default())
    }

    #[tokio::test]
    async fn valid_json_passes() {
        let mut ctx = ctx_for(r#"{"name": "docstash"}"#);
        let flow = JsonValidate.run(&mut ctx).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(ctx.errors.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_demoted_to_text() {
        let mut ctx = ctx_for("{ nope");
        let flow = JsonValidate.run(&mut ctx).await.unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.content_type, "text/plain");
    }
}
