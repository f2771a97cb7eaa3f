//! TLS `ClientHello` SNI sniffing
//!
//! Walks a plaintext TLS handshake record to the `server_name`
//! extension and returns the hostname. Parsing is bounds-checked at
//! every step and bails with `None` on anything that does not look
//! like a well-formed `ClientHello`.

/// TLS `ContentType` for handshake records
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// `HandshakeType` for `ClientHello`
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// SNI extension type
const EXTENSION_SERVER_NAME: u16 = 0x0000;
/// SNI name type for a hostname entry
const SNI_TYPE_HOSTNAME: u8 = 0x00;
/// Record header: type + version + length
const RECORD_HEADER_LEN: usize = 5;
/// RFC 5246 record payload ceiling
const MAX_RECORD_LEN: usize = 16384;

/// Bytes needed to classify a stream head and size the full peek
pub const RECORD_PROBE_LEN: usize = RECORD_HEADER_LEN + 1;

/// Quick check whether `data` starts like a TLS `ClientHello`
#[must_use]
pub fn looks_like_tls(data: &[u8]) -> bool {
    if data.len() < RECORD_HEADER_LEN {
        return false;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return false;
    }
    let version = u16::from_be_bytes([data[1], data[2]]);
    (0x0300..=0x0304).contains(&version)
}

/// How many bytes a full parse of this record needs
///
/// `None` when the data cannot be a TLS handshake record at all.
#[must_use]
pub fn required_len(data: &[u8]) -> Option<usize> {
    if !looks_like_tls(data) {
        return None;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return None;
    }
    Some(RECORD_HEADER_LEN + record_len)
}

/// Extract the SNI hostname from a TLS `ClientHello`
#[must_use]
pub fn sniff_tls_sni(data: &[u8]) -> Option<String> {
    let total = required_len(data)?;
    let hs = &data[RECORD_HEADER_LEN..data.len().min(total)];

    if hs.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return None;
    }

    // handshake type (1) + length (3) + version (2) + random (32)
    let mut pos = 38usize;

    // session id
    let session_len = *hs.get(pos)? as usize;
    pos += 1 + session_len;

    // cipher suites
    let suites_len = be16(hs, pos)? as usize;
    pos += 2 + suites_len;

    // compression methods
    let compression_len = *hs.get(pos)? as usize;
    pos += 1 + compression_len;

    // extensions
    let extensions_len = be16(hs, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(hs.len());

    while pos + 4 <= extensions_end {
        let ext_type = be16(hs, pos)?;
        let ext_len = be16(hs, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > hs.len() {
            return None;
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(&hs[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

/// Walk the `server_name` list for the first hostname entry
fn parse_server_name(data: &[u8]) -> Option<String> {
    let list_len = be16(data, 0)? as usize;
    let end = (2 + list_len).min(data.len());
    let mut pos = 2usize;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = be16(data, pos + 1)? as usize;
        pos += 3;
        if pos + name_len > data.len() {
            return None;
        }
        if name_type == SNI_TYPE_HOSTNAME {
            let name = &data[pos..pos + name_len];
            if is_valid_hostname(name) {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        pos += name_len;
    }

    None
}

fn be16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *data.get(pos)?,
        *data.get(pos + 1)?,
    ]))
}

fn is_valid_hostname(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal `ClientHello` carrying `sni`
    pub(crate) fn client_hello(sni: &str) -> Vec<u8> {
        let mut sni_entry = vec![SNI_TYPE_HOSTNAME];
        sni_entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(sni.as_bytes());

        let mut sni_ext = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_ext.extend_from_slice(&sni_entry);

        let mut extensions = EXTENSION_SERVER_NAME.to_be_bytes().to_vec();
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut body = vec![0x03, 0x03]; // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_sniff_sni() {
        let data = client_hello("example.com");
        assert_eq!(sniff_tls_sni(&data), Some("example.com".to_string()));

        let data = client_hello("deep.sub.domain.example.org");
        assert_eq!(
            sniff_tls_sni(&data),
            Some("deep.sub.domain.example.org".to_string())
        );
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(sniff_tls_sni(b"GET / HTTP/1.1\r\n"), None);
        assert!(!looks_like_tls(b"GET / HTTP/1.1\r\n"));
        assert_eq!(sniff_tls_sni(&[0x16, 0x03]), None);
    }

    #[test]
    fn test_wrong_handshake_type() {
        let mut data = client_hello("example.com");
        data[5] = 0x02; // ServerHello
        assert_eq!(sniff_tls_sni(&data), None);
    }

    #[test]
    fn test_required_len() {
        let data = client_hello("example.com");
        assert_eq!(required_len(&data), Some(data.len()));
        assert_eq!(required_len(b"bogus"), None);
    }

    #[test]
    fn test_truncated_record_is_safe() {
        let data = client_hello("example.com");
        for cut in 0..data.len() - 1 {
            // no panic, no partial hostname from a truncated extension walk
            let _ = sniff_tls_sni(&data[..cut]);
        }
    }
}
