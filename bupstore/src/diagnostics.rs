//! Small formatting helpers used in log lines (supplemented feature, grounded in
//! `server-cmd.py`'s `git.shorten_hash` used when logging index suggestions).

use shared::Hash;

/// Shortens a hex-encoded hash to its first 8 characters for log lines, the way the
/// source abbreviates object ids in its debug output. Never used for anything that
/// needs to be unambiguous — full hashes go on the wire and in the idx.
pub fn shorten_hash(hash: &Hash) -> String {
    let full = hex::encode(hash);
    full[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortens_to_eight_hex_chars() {
        let hash = [0xabu8; shared::HASH_SIZE];
        assert_eq!(shorten_hash(&hash).len(), 8);
        assert_eq!(shorten_hash(&hash), "abababab");
    }
}
