use sha2::{Digest, Sha256};

/// DTLS certificate fingerprint (`a=fingerprint:` attribute) of an SDP blob.
pub fn dtls_fingerprint(sdp: &str) -> Option<String> {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("a=fingerprint:"))
        .map(|fp| fp.trim().to_ascii_lowercase())
}

/// 48-bit short authentication string shared by both ends of a connection.
///
/// Both sides sort the two fingerprints before hashing, so caller and callee
/// compute the same value.
pub fn safety_number(local_sdp: &str, remote_sdp: &str) -> Option<String> {
    let mut fps = [dtls_fingerprint(local_sdp)?, dtls_fingerprint(remote_sdp)?];
    fps.sort();

    let mut hasher = Sha256::new();
    hasher.update(fps[0].as_bytes());
    hasher.update(b"\n");
    hasher.update(fps[1].as_bytes());
    let digest = hasher.finalize();
    Some(hex::encode(&digest[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLER: &str = "v=0\r\na=group:BUNDLE 0\r\na=fingerprint:sha-256 AB:CD:EF\r\n";
    const CALLEE: &str = "v=0\r\na=fingerprint:sha-256 12:34:56\r\n";

    #[test]
    fn extracts_fingerprint_line() {
        assert_eq!(dtls_fingerprint(CALLER).as_deref(), Some("sha-256 ab:cd:ef"));
        assert_eq!(dtls_fingerprint("v=0\r\n"), None);
    }

    #[test]
    fn both_sides_agree() {
        let caller_view = safety_number(CALLER, CALLEE).unwrap();
        let callee_view = safety_number(CALLEE, CALLER).unwrap();
        assert_eq!(caller_view, callee_view);
        assert_eq!(caller_view.len(), 12);
    }

    #[test]
    fn missing_fingerprint_yields_none() {
        assert!(safety_number(CALLER, "v=0").is_none());
    }
}
