// HTML response injection
//
// For text/html responses the proxy buffers the body, transparently decodes
// gzip, inserts the monitoring script exactly once immediately before the
// first </body> (or at the end of the document when absent), and re-encodes.
// The marker comment is written alongside the script and checked first, so a
// response that already carries it is never injected twice.

use std::io::{Read, Write};

use axum::http::HeaderMap;
use thiserror::Error;

/// Idempotency marker written next to the injected script.
pub const INJECTION_MARKER: &str = "<!-- Brummer Monitoring Script -->";

/// Browser-side instrumentation. Collects load metrics, console and error
/// counters, batches them to `/api/telemetry` on the serving origin, and
/// polls `/api/repl/poll` for code to evaluate.
pub const MONITORING_SCRIPT: &str = r#"(function () {
  if (window.__brummer) return;
  var sessionId = Date.now().toString(36) + '-' + Math.random().toString(36).slice(2, 10);
  var queue = [];
  var counters = { log: 0, warn: 0, error: 0 };

  function push(type, data) {
    var event = { type: type, timestamp: Date.now() };
    for (var key in data) event[key] = data[key];
    queue.push(event);
    if (queue.length >= 20) flush();
  }

  function flush() {
    if (!queue.length) return;
    var batch = { sessionId: sessionId, url: location.href, events: queue.splice(0) };
    if (window.performance && performance.getEntriesByType) {
      var nav = performance.getEntriesByType('navigation')[0];
      if (nav) batch.metrics = { domContentLoaded: nav.domContentLoadedEventEnd, load: nav.loadEventEnd };
      var paint = performance.getEntriesByType('paint');
      for (var i = 0; i < paint.length; i++) {
        batch.metrics = batch.metrics || {};
        batch.metrics[paint[i].name] = paint[i].startTime;
      }
    }
    if (performance && performance.memory) {
      batch.memory = { usedJSHeapSize: performance.memory.usedJSHeapSize };
    }
    try {
      navigator.sendBeacon('/api/telemetry', JSON.stringify(batch));
    } catch (e) { /* page is going away */ }
  }

  ['log', 'warn', 'error'].forEach(function (level) {
    var original = console[level];
    console[level] = function () {
      counters[level]++;
      push('console', { level: level });
      return original.apply(console, arguments);
    };
  });

  window.addEventListener('error', function (e) {
    push('error', { message: String(e.message), source: e.filename, line: e.lineno });
  });
  window.addEventListener('unhandledrejection', function (e) {
    push('error', { message: 'unhandledrejection: ' + String(e.reason) });
  });
  document.addEventListener('click', function () { push('interaction', { kind: 'click' }); }, true);
  window.addEventListener('load', function () { push('page-load', { url: location.href }); flush(); });
  window.addEventListener('beforeunload', flush);
  setInterval(flush, 5000);

  function pollRepl() {
    fetch('/api/repl/poll?sessionId=' + sessionId)
      .then(function (r) { return r.ok ? r.json() : null; })
      .then(function (cmd) {
        if (cmd && cmd.id) {
          var result;
          try {
            result = { id: cmd.id, ok: true, value: String(eval(cmd.code)) };
          } catch (e) {
            result = { id: cmd.id, ok: false, value: String(e) };
          }
          return fetch('/api/repl/result', {
            method: 'POST',
            headers: { 'Content-Type': 'application/json' },
            body: JSON.stringify(result)
          });
        }
      })
      .catch(function () { /* endpoint gone, retry */ })
      .then(function () { setTimeout(pollRepl, 250); });
  }
  pollRepl();

  window.__brummer = { sessionId: sessionId, flush: flush };
})();"#;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("gzip decode failed: {0}")]
    Decode(std::io::Error),
    #[error("gzip re-encode failed: {0}")]
    Encode(std::io::Error),
}

/// Result of an injection attempt.
pub struct Injected {
    pub body: Vec<u8>,
    /// False when the document already carried the marker
    pub injected: bool,
}

/// Whether this request wants a full document. Background/data requests are
/// never injected.
pub fn wants_injection(request_headers: &HeaderMap) -> bool {
    let header = |name: &str| {
        request_headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase)
    };

    if header("x-requested-with").as_deref() == Some("xmlhttprequest") {
        return false;
    }
    if let Some(mode) = header("sec-fetch-mode") {
        if mode != "navigate" {
            return false;
        }
    }
    if let Some(dest) = header("sec-fetch-dest") {
        if dest != "document" {
            return false;
        }
    }
    if let Some(accept) = header("accept") {
        if accept.contains("application/json")
            || accept.contains("application/xml")
            || accept.contains("text/xml")
        {
            return false;
        }
    }
    true
}

/// Inject the monitoring script into an HTML body, handling gzip
/// transparently. Returns the (re-encoded) body and whether a script was
/// actually added.
pub fn inject_html(body: &[u8], gzipped: bool, script_src: &str) -> Result<Injected, InjectError> {
    let decoded: Vec<u8> = if gzipped {
        let mut out = Vec::with_capacity(body.len() * 4);
        flate2::read::GzDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(InjectError::Decode)?;
        out
    } else {
        body.to_vec()
    };

    let html = String::from_utf8_lossy(&decoded);
    if html.contains(INJECTION_MARKER) {
        return Ok(Injected {
            body: body.to_vec(),
            injected: false,
        });
    }

    let block = format!("{}\n<script>{}</script>\n", INJECTION_MARKER, script_src);
    let injected_html = match find_body_close(&html) {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + block.len());
            out.push_str(&html[..pos]);
            out.push_str(&block);
            out.push_str(&html[pos..]);
            out
        }
        None => {
            let mut out = html.into_owned();
            out.push_str(&block);
            out
        }
    };

    let body = if gzipped {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(injected_html.as_bytes())
            .map_err(InjectError::Encode)?;
        encoder.finish().map_err(InjectError::Encode)?
    } else {
        injected_html.into_bytes()
    };

    Ok(Injected {
        body,
        injected: true,
    })
}

/// Byte offset of the first `</body>`, case-insensitive.
fn find_body_close(html: &str) -> Option<usize> {
    let lower = html.to_ascii_lowercase();
    lower.find("</body>")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_markers(body: &[u8]) -> usize {
        String::from_utf8_lossy(body).matches(INJECTION_MARKER).count()
    }

    #[test]
    fn test_injects_before_body_close() {
        let result = inject_html(b"<html><body>x</body></html>", false, "1+1").unwrap();
        assert!(result.injected);
        let html = String::from_utf8(result.body).unwrap();
        assert_eq!(count_markers(html.as_bytes()), 1);
        let marker_pos = html.find(INJECTION_MARKER).unwrap();
        let close_pos = html.find("</body>").unwrap();
        assert!(marker_pos < close_pos);
        assert!(html.contains("<script>1+1</script>"));
    }

    #[test]
    fn test_injection_is_idempotent() {
        let first = inject_html(b"<html><body>x</body></html>", false, "1+1").unwrap();
        let second = inject_html(&first.body, false, "1+1").unwrap();
        assert!(!second.injected);
        assert_eq!(count_markers(&second.body), 1);
    }

    #[test]
    fn test_no_body_tag_appends_at_end() {
        let result = inject_html(b"<p>fragment</p>", false, "1+1").unwrap();
        assert!(result.injected);
        let html = String::from_utf8(result.body).unwrap();
        assert!(html.starts_with("<p>fragment</p>"));
        assert_eq!(count_markers(html.as_bytes()), 1);
    }

    #[test]
    fn test_case_insensitive_body_close() {
        let result = inject_html(b"<HTML><BODY>x</BODY></HTML>", false, "1+1").unwrap();
        let html = String::from_utf8(result.body).unwrap();
        assert!(html.find(INJECTION_MARKER).unwrap() < html.find("</BODY>").unwrap());
    }

    #[test]
    fn test_gzip_roundtrip_adds_one_script_block() {
        let original = b"<html><body>hello</body></html>";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(original).unwrap();
        let gzipped = encoder.finish().unwrap();

        let result = inject_html(&gzipped, true, "1+1").unwrap();
        assert!(result.injected);

        // Client-side decode reproduces the original document plus exactly
        // one script block
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(result.body.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        let html = String::from_utf8(decoded).unwrap();
        assert_eq!(count_markers(html.as_bytes()), 1);
        assert!(html.contains("hello"));
        assert!(html.ends_with("</html>"));
    }

    #[test]
    fn test_corrupt_gzip_is_an_error() {
        let result = inject_html(b"not gzip at all", true, "1+1");
        assert!(matches!(result, Err(InjectError::Decode(_))));
    }

    #[test]
    fn test_suppression_xhr() {
        let mut headers = HeaderMap::new();
        headers.insert("x-requested-with", "XMLHttpRequest".parse().unwrap());
        assert!(!wants_injection(&headers));
    }

    #[test]
    fn test_suppression_fetch_mode() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-mode", "cors".parse().unwrap());
        assert!(!wants_injection(&headers));

        let mut navigate = HeaderMap::new();
        navigate.insert("sec-fetch-mode", "navigate".parse().unwrap());
        assert!(wants_injection(&navigate));
    }

    #[test]
    fn test_suppression_fetch_dest() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-dest", "image".parse().unwrap());
        assert!(!wants_injection(&headers));
    }

    #[test]
    fn test_suppression_accept_json() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/json".parse().unwrap());
        assert!(!wants_injection(&headers));
    }

    #[test]
    fn test_plain_document_request_injects() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html,application/xhtml+xml".parse().unwrap());
        assert!(wants_injection(&headers));
    }
}
