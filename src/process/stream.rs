// Line-oriented stream consumption for child process pipes
//
// Child stdout/stderr are consumed through a buffered reader with a maximum
// line length. A line exactly at the limit is preserved intact; anything
// longer is split, with a continuation marker appended to every part except
// the last so consumers can tell a split from a real line break.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Maximum accepted line length before splitting (1 MiB).
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

/// Appended to each part of an oversize line except the last.
pub const CONTINUATION_MARKER: &str = " \\";

/// Read `reader` to EOF, invoking `on_line` for every complete line.
///
/// Lines are `\n`-terminated; a trailing `\r` is stripped. Content beyond
/// `max_line` bytes without a newline is flushed as a marked part and
/// accumulation restarts. Invalid UTF-8 is replaced lossily.
pub async fn pump_lines<R, F>(reader: R, max_line: usize, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF: flush whatever is left as a final line
            if !pending.is_empty() {
                on_line(finish_line(&mut pending));
            }
            return Ok(());
        }

        // A line that reached the limit at the previous buffer boundary is
        // decided here: its own newline keeps it intact, anything else
        // splits it.
        if pending.len() >= max_line && available[0] != b'\n' {
            on_line(split_part(&mut pending));
        }

        let mut consumed = 0;
        for &byte in available {
            consumed += 1;
            if byte == b'\n' {
                on_line(finish_line(&mut pending));
            } else {
                pending.push(byte);
                if pending.len() >= max_line {
                    // Check the next byte before splitting: a line exactly
                    // at the limit followed by its newline stays intact. At
                    // the end of the buffer the decision waits for the next
                    // fill.
                    match available.get(consumed) {
                        Some(&b'\n') => continue,
                        Some(_) => on_line(split_part(&mut pending)),
                        None => break,
                    }
                }
            }
        }
        reader.consume(consumed);
    }
}

fn split_part(pending: &mut Vec<u8>) -> String {
    let mut part = String::from_utf8_lossy(pending).into_owned();
    part.push_str(CONTINUATION_MARKER);
    pending.clear();
    part
}

fn finish_line(pending: &mut Vec<u8>) -> String {
    if pending.last() == Some(&b'\r') {
        pending.pop();
    }
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    line
}
