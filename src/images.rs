use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Matches `![...](data:image/<subtype>;base64,<payload>)` image
    /// markdown embedded in assistant history.
    static ref IMAGE_MARKDOWN_RE: Regex = Regex::new(
        r"!\[[^\]]*\]\(data:image/([a-zA-Z0-9+.-]+);base64,([A-Za-z0-9+/=]+)\)"
    )
    .expect("image markdown pattern compiles");
}

/// Pulls embedded base64 images out of an assistant message, returning the
/// text with `[Image N]` placeholders plus backend inline-data parts ready
/// for re-injection into a later turn.
pub fn extract_inline_images(content: &str) -> (String, Vec<serde_json::Value>) {
    let mut parts = Vec::new();
    let cleaned = IMAGE_MARKDOWN_RE
        .replace_all(content, |caps: &regex::Captures| {
            parts.push(serde_json::json!({
                "inlineData": {
                    "mimeType": format!("image/{}", &caps[1]),
                    "data": caps[2].to_string(),
                }
            }));
            format!("[Image {}]", parts.len())
        })
        .into_owned();
    (cleaned, parts)
}

/// Base64 payloads truncated by the backend lose their trailing padding;
/// decode then fails on the client. Strips stray whitespace and pads back to
/// a multiple of 4.
pub fn fix_base64_padding(data: &str) -> String {
    let mut cleaned: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let remainder = cleaned.len() % 4;
    if remainder != 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - remainder));
    }
    cleaned
}

/// True when the message body embeds at least one base64 image.
pub fn has_inline_image(content: &str) -> bool {
    content.contains("data:image/") && content.contains(";base64,")
}
