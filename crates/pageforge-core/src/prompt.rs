//! Prompt construction and the static placeholder page

use crate::types::{truncate_chars, GenerationRequest};

/// Instruction block placed before the user content
pub const SYSTEM_INSTRUCTION: &str = "Create a modern, self-contained website from the provided content. \
Return ONLY the complete HTML document, with styling and any scripts embedded, and no explanations \
or markdown fences before or after it. The page must be responsive, use semantic HTML and render \
directly in a browser.";

/// Characters of the input shown in the placeholder preview
const PLACEHOLDER_PREVIEW_CHARS: usize = 2_000;

/// Full prompt: instructions, content, then optional format instructions
pub fn build_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "{}\n\nHere is the content to transform into a website:\n\n{}",
        SYSTEM_INSTRUCTION, request.content
    );
    if let Some(format) = &request.format_instructions {
        prompt.push_str("\n\n");
        prompt.push_str(format);
    }
    prompt
}

/// Short prompt over a prefix of the content, without format instructions
pub fn simplified_prompt(request: &GenerationRequest, max_chars: usize) -> String {
    format!(
        "Create a simple, clean HTML page presenting the following content. \
Return only the HTML document.\n\n{}",
        truncate_chars(&request.content, max_chars)
    )
}

/// Escape text for inclusion in HTML element content or attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Static page returned when every upstream strategy failed
pub fn placeholder_page(content: &str) -> String {
    let preview = escape_html(truncate_chars(content, PLACEHOLDER_PREVIEW_CHARS));
    format!(
        r#"<!DOCTYPE html>
<html lang="en" data-fallback="true">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Content preview</title>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; color: #222; }}
.notice {{ background: #fff4e5; border: 1px solid #f0b429; padding: 0.75rem 1rem; border-radius: 0.5rem; }}
pre {{ white-space: pre-wrap; word-wrap: break-word; background: #f6f8fa; padding: 1rem; border-radius: 0.5rem; }}
</style>
</head>
<body>
<p class="notice">The page generator is temporarily unavailable. Showing a preview of your content instead.</p>
<pre>{}</pre>
</body>
</html>
"#,
        preview
    )
}
