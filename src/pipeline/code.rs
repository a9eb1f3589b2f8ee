//! Source-code pipeline stage: language detection.

use async_trait::async_trait;

use super::{Flow, Middleware, PipelineContext};

/// Derives the source language from the MIME subtype or the URL extension.
pub struct DetectLanguage;

#[async_trait]
impl Middleware for DetectLanguage {
    fn name(&self) -> &'static str {
        "detect-language"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        ctx.language = language_for(&ctx.content_type, ctx.source.path());
        Ok(Flow::Continue)
    }
}

pub fn language_for(content_type: &str, path: &str) -> Option<String> {
    let main = content_type.split(';').next().unwrap_or("").trim();
    if let Some(lang) = main.strip_prefix("text/x-") {
        return Some(lang.to_string());
    }

    let extension = path.rsplit('.').next()?.to_ascii_lowercase();
    let lang = match extension.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "c++",
        "rb" => "ruby",
        "sh" | "bash" => "shellscript",
        _ => return None,
    };
    Some(lang.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_subtype_wins() {
        assert_eq!(language_for("text/x-rust", "/lib.weird").as_deref(), Some("rust"));
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(language_for("text/plain", "/src/app.py").as_deref(), Some("python"));
        assert_eq!(language_for("text/plain", "/notes.org"), None);
    }
}
