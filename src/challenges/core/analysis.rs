//! Response inspection helpers shared by the detectors and the session layer.

use url::Url;

/// Build origin header value from URL (`scheme://host[:port]`).
pub fn origin_from_url(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Registrable ("apex") part of a host name: the last two labels.
///
/// IP addresses and single-label hosts are returned unchanged.
pub fn apex_domain(host: &str) -> String {
    let host = host.trim_start_matches('.').to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').filter(|label| !label.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[labels.len() - 2..].join(".")
}

/// Every cookie scope a page on `host` can write to: the bare host, the apex
/// domain and the wildcard `.apex` subdomain scope.
pub fn cookie_scopes(host: &str) -> Vec<String> {
    let host = host.to_ascii_lowercase();
    let apex = apex_domain(&host);
    let mut scopes = vec![host.clone()];
    if apex != host {
        scopes.push(apex.clone());
    }
    scopes.push(format!(".{apex}"));
    scopes
}

const DOCUMENT_TAGS: [&str; 8] = [
    "<!doctype", "<html", "<head", "<body", "<div", "<script", "<title", "<meta",
];

/// Longest partial line [`MarkupSniffer`] carries between chunks.
const PARTIAL_LINE_LIMIT: usize = 4 * 1024;
/// Most markup [`MarkupSniffer`] collects once a document started.
const MARKUP_WINDOW: usize = 64 * 1024;

/// Cheap check for text that is an HTML document or fragment rather than
/// stream data.
pub fn looks_like_markup(text: &str) -> bool {
    let head: String = text.trim_start().chars().take(16).collect();
    let head = head.to_ascii_lowercase();
    DOCUMENT_TAGS.iter().any(|tag| head.starts_with(tag))
}

/// Byte offset of the first line in `text` that opens an HTML document.
/// Stream lines carry a record prefix, so markup can only start a line when
/// the upstream switched to serving a page.
pub fn markup_offset(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if looks_like_markup(line) {
            return Some(offset + line.len() - line.trim_start().len());
        }
        offset += line.len();
    }
    None
}

/// Watches decoded stream text for an HTML document and collects it once
/// one starts, whether it follows ordinary lines in the same chunk or is
/// split across chunks.
#[derive(Debug, Default)]
pub struct MarkupSniffer {
    partial: String,
    markup: Option<String>,
}

impl MarkupSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next piece of text. Returns the markup seen so far once a
    /// document has started.
    pub fn observe(&mut self, text: &str) -> Option<&str> {
        match self.markup.as_mut() {
            Some(markup) => {
                if markup.len() < MARKUP_WINDOW {
                    markup.push_str(text);
                }
            }
            None => {
                let mut candidate = std::mem::take(&mut self.partial);
                candidate.push_str(text);
                match markup_offset(&candidate) {
                    Some(offset) => self.markup = Some(candidate.split_off(offset)),
                    None => {
                        let partial = candidate.rsplit('\n').next().unwrap_or_default();
                        if partial.len() <= PARTIAL_LINE_LIMIT {
                            self.partial = partial.to_string();
                        }
                        return None;
                    }
                }
            }
        }
        self.markup.as_deref()
    }
}

/// Incremental UTF-8 decoder that keeps incomplete multi-byte sequences
/// until the next chunk arrives.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    carry: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, prefixed by any bytes held back from the previous call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.carry);

        match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                self.carry = bytes[valid..].to_vec();
                String::from_utf8_lossy(&bytes[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    /// Flushes whatever is left, replacing an unfinished sequence.
    pub fn finish(&mut self) -> String {
        let bytes = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Splits streamed text into complete lines, holding back a trailing partial
/// line until more data arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the non-empty complete lines contained in `text`.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let remainder = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, remainder);
        complete
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Returns the final unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches(['\r', '\n']);
        (!rest.trim().is_empty()).then(|| rest.to_string())
    }
}
