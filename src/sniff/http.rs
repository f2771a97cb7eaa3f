//! HTTP `Host` header sniffing
//!
//! Extracts the `Host` header from a plaintext HTTP/1.x request head.
//! Ports are stripped from the value; bracketed IPv6 hosts are ignored
//! since a literal address adds nothing over the flow's destination.

/// Quick check whether `data` starts with a known HTTP method
#[must_use]
pub fn looks_like_http(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    matches!(
        &data[..4],
        b"GET " | b"POST" | b"PUT " | b"HEAD" | b"DELE" | b"OPTI" | b"PATC" | b"CONN" | b"TRAC"
    )
}

/// Extract the `Host` header value from a request head
#[must_use]
pub fn sniff_http_host(data: &[u8]) -> Option<String> {
    if !looks_like_http(data) {
        return None;
    }
    let text = std::str::from_utf8(data).ok()?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.to_ascii_uppercase().contains("HTTP/1") {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            // end of headers
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let value = value.trim();
        if value.is_empty() || value.starts_with('[') {
            return None;
        }
        let host = value.split(':').next().unwrap_or(value);
        if host.is_empty() || host.parse::<std::net::Ipv4Addr>().is_ok() {
            return None;
        }
        return Some(host.to_ascii_lowercase());
    }

    None
}
