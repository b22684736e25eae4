// Scripts library - metadata-annotated JavaScript snippets
//
// User scripts live as .ts files in the scripts directory. Each file opens
// with a front-matter block between `/***` and `***/` holding a JSON object
// (at least a description); the rest is the JavaScript body. The library
// validates names, caches parse results briefly, and can generate a single
// bundle exposing every script under window.__brummer.scripts.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

const FRONT_MATTER_OPEN: &str = "/***";
const FRONT_MATTER_CLOSE: &str = "***/";

/// Default parse-cache lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

fn name_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap())
}

/// One parsed script.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryScript {
    pub name: String,
    pub description: String,
    /// Remaining front-matter fields, passed through to the bundle
    pub metadata: serde_json::Map<String, Value>,
    /// Sanitized JavaScript body
    pub body: String,
}

pub struct ScriptsLibrary {
    dir: PathBuf,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<LibraryScript>)>>,
}

impl ScriptsLibrary {
    pub fn new(dir: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            dir,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Default scripts directory under the platform data dir.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("brummer")
            .join("scripts")
    }

    /// All valid scripts in the directory, cached for the configured TTL.
    /// Invalid files are skipped with a warning.
    pub fn load(&self) -> Vec<LibraryScript> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((at, scripts)) = cache.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return scripts.clone();
                }
            }
        }

        let scripts = self.scan();
        *self.cache.lock().unwrap() = Some((Instant::now(), scripts.clone()));
        scripts
    }

    fn scan(&self) -> Vec<LibraryScript> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut scripts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ts") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|contents| parse_script(stem, &contents))
            {
                Ok(script) => scripts.push(script),
                Err(e) => {
                    tracing::warn!(file = %path.display(), "skipping invalid script: {e:#}");
                }
            }
        }
        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        scripts
    }

    /// Fetch one script by name. Names are validated before touching the
    /// filesystem, so traversal attempts never reach a path join.
    pub fn get(&self, name: &str) -> Result<LibraryScript> {
        validate_name(name)?;
        self.load()
            .into_iter()
            .find(|s| s.name == name)
            .with_context(|| format!("no script named '{name}'"))
    }

    /// Generate one JavaScript bundle exposing all scripts under the
    /// well-known global.
    pub fn bundle(&self) -> String {
        let mut out = String::from(
            "(function () {\n  window.__brummer = window.__brummer || {};\n  window.__brummer.scripts = {\n",
        );
        for script in self.load() {
            out.push_str(&format!(
                "    {}: {{\n      description: {},\n      source: `{}`,\n      run: function () {{ return eval(this.source); }}\n    }},\n",
                serde_json::to_string(&script.name).unwrap_or_default(),
                serde_json::to_string(&script.description).unwrap_or_default(),
                script.body,
            ));
        }
        out.push_str("  };\n})();\n");
        out
    }
}

/// Reject anything that is not a bare, pattern-conforming name.
fn validate_name(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("script name '{name}' contains path segments");
    }
    if !name_re().is_match(name) {
        bail!("script name '{name}' must match [A-Za-z0-9_-]{{1,64}}");
    }
    Ok(())
}

/// Parse one annotated script file: front matter first, body after.
fn parse_script(name: &str, contents: &str) -> Result<LibraryScript> {
    validate_name(name)?;

    let open = contents
        .find(FRONT_MATTER_OPEN)
        .context("missing front-matter block")?;
    let after_open = open + FRONT_MATTER_OPEN.len();
    let close_rel = contents[after_open..]
        .find(FRONT_MATTER_CLOSE)
        .context("unterminated front-matter block")?;
    let raw_meta = &contents[after_open..after_open + close_rel];
    let body = &contents[after_open + close_rel + FRONT_MATTER_CLOSE.len()..];

    let meta: Value =
        serde_json::from_str(raw_meta.trim()).context("front matter is not valid JSON")?;
    let mut metadata = meta
        .as_object()
        .cloned()
        .context("front matter must be a JSON object")?;
    let description = metadata
        .remove("description")
        .and_then(|v| v.as_str().map(String::from))
        .context("front matter requires a description")?;

    Ok(LibraryScript {
        name: name.to_string(),
        description,
        metadata,
        body: sanitize_body(body.trim()),
    })
}

/// Light sanitation before bundling: script tags out, backticks escaped,
/// HTML comments out.
fn sanitize_body(body: &str) -> String {
    static SCRIPT_TAG: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    static HTML_COMMENT: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let script_tag =
        SCRIPT_TAG.get_or_init(|| Regex::new(r"(?is)</?script[^>]*>").unwrap());
    let html_comment = HTML_COMMENT.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

    let without_tags = script_tag.replace_all(body, "");
    let without_comments = html_comment.replace_all(&without_tags, "");
    without_comments.replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"/***
{ "description": "Highlight every link", "tags": ["dom"] }
***/
document.querySelectorAll('a').forEach(a => a.style.outline = '1px solid red');
"#;

    fn library(dir: &std::path::Path) -> ScriptsLibrary {
        ScriptsLibrary::new(dir.to_path_buf(), Duration::ZERO)
    }

    #[test]
    fn test_parse_sample() {
        let script = parse_script("highlight-links", SAMPLE).unwrap();
        assert_eq!(script.description, "Highlight every link");
        assert_eq!(script.metadata["tags"][0], "dom");
        assert!(script.body.contains("querySelectorAll"));
    }

    #[test]
    fn test_missing_description_rejected() {
        let contents = "/*** {\"author\": \"me\"} ***/\n1+1;";
        assert!(parse_script("x", contents).is_err());
    }

    #[test]
    fn test_missing_front_matter_rejected() {
        assert!(parse_script("x", "console.log('hi')").is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("ok_name-123").is_ok());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
        assert!(validate_name("spaces no").is_err());
    }

    #[test]
    fn test_sanitize_strips_script_tags_and_comments() {
        let body = "<script>alert(1)</script>let x = `tpl`; <!-- note -->x;";
        let clean = sanitize_body(body);
        assert!(!clean.contains("<script>"));
        assert!(!clean.contains("<!--"));
        assert!(clean.contains("\\`tpl\\`"));
        assert!(clean.contains("alert(1)"));
    }

    #[test]
    fn test_load_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.ts"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("ignored.js"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("broken.ts"), "no front matter").unwrap();

        let scripts = library(dir.path()).load();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "one");
    }

    #[test]
    fn test_cache_serves_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.ts"), SAMPLE).unwrap();
        let library = ScriptsLibrary::new(dir.path().to_path_buf(), Duration::from_secs(60));

        assert_eq!(library.load().len(), 1);
        std::fs::write(dir.path().join("two.ts"), SAMPLE).unwrap();
        // Still the cached view
        assert_eq!(library.load().len(), 1);
    }

    #[test]
    fn test_get_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        assert!(library.get("../../etc/passwd").is_err());
    }

    #[test]
    fn test_bundle_exposes_global() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.ts"), SAMPLE).unwrap();
        let bundle = library(dir.path()).bundle();
        assert!(bundle.contains("window.__brummer.scripts"));
        assert!(bundle.contains("\"one\""));
        assert!(bundle.contains("Highlight every link"));
    }
}
