// URL and label extraction from process output
//
// Dev servers announce themselves in free-form text ("listening on
// http://localhost:3000", "[web] ready at http://127.0.0.1:5173"). The proxy
// needs the URL and a human label for the mapping; the log store needs the
// `url` tag. Label candidates are tried in a fixed priority order.

use std::sync::OnceLock;

use regex::Regex;

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).unwrap())
}

fn bracketed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([A-Za-z0-9 ._-]{1,32})\]").unwrap())
}

fn colon_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 ._-]{0,31}):\s").unwrap())
}

fn ready_at_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([a-z][a-z-]{2,24})\s+(?:at|on)\s+https?://").unwrap())
}

fn service_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(server|frontend|backend|api|web|app|client|preview|storybook)\b")
            .unwrap()
    })
}

/// All URLs present in a line, in order of appearance. Trailing punctuation
/// that commonly follows URLs in prose is trimmed.
pub fn extract_urls(line: &str) -> Vec<String> {
    url_re()
        .find_iter(line)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .collect()
}

/// Extract a human label for a URL-bearing line.
///
/// Priority: bracketed tag, colon prefix, "<verb> at/on <url>" phrasing,
/// service keyword. An empty extraction, or one equal to the process name,
/// falls back to the process name.
pub fn extract_label(line: &str, process_name: &str) -> String {
    let candidate = bracketed(line)
        .or_else(|| colon_prefix(line))
        .or_else(|| ready_at(line))
        .or_else(|| service_keyword(line));

    match candidate {
        Some(label) if !label.is_empty() && label != process_name => label,
        _ => process_name.to_string(),
    }
}

fn bracketed(line: &str) -> Option<String> {
    bracketed_re()
        .captures(line)
        .map(|c| c[1].trim().to_string())
}

fn colon_prefix(line: &str) -> Option<String> {
    colon_prefix_re()
        .captures(line)
        .map(|c| c[1].trim().to_string())
}

fn ready_at(line: &str) -> Option<String> {
    ready_at_re()
        .captures(line)
        .map(|c| c[1].to_ascii_lowercase())
}

fn service_keyword(line: &str) -> Option<String> {
    service_keyword_re()
        .captures(line)
        .map(|c| c[1].to_ascii_lowercase())
}
