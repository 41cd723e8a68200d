//! Embedded front-end assets. The terminal emulator itself is a thin
//! placeholder; the server only promises an `open(path) -> bytes` surface.

const INDEX_HTML: &str = include_str!("../static/index.html");
const WEBTTY_JS: &str = include_str!("../static/js/webtty.js");
const FAVICON_PNG: &[u8] = include_bytes!("../static/favicon.png");

/// Look up an embedded asset by its route-relative path.
pub fn open(path: &str) -> Option<(&'static [u8], &'static str)> {
    match path {
        "index.html" => Some((INDEX_HTML.as_bytes(), "text/html; charset=utf-8")),
        "js/webtty.js" => Some((WEBTTY_JS.as_bytes(), "application/javascript")),
        "favicon.png" => Some((FAVICON_PNG, "image/png")),
        _ => None,
    }
}
