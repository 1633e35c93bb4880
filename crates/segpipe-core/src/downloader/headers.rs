//! Parse collected response header lines.

/// Status code from the most recent `HTTP/` status line.
pub(crate) fn parse_http_status(lines: &[String]) -> Option<u32> {
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("HTTP/"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u32>().ok())
}

/// `Content-Length` of the current response, if present and numeric.
pub(crate) fn parse_content_length(lines: &[String]) -> Option<u64> {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.trim().parse::<u64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}
