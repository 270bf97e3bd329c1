/// Marker that prefixes every photo token in `TagTable.photo_id_list`.
pub const PHOTO_TOKEN_MARKER: &str = "thumb";
const PHOTO_TOKEN_DIGITS: usize = 16;

/// Decodes a stored `photo_id_list` such as
/// `thumb0000000000000003,thumb000000000000001a,`.
///
/// Tokens without the photo marker (video sources) or with non-hex digits
/// are skipped.
pub fn decode_photo_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(decode_photo_token)
        .collect()
}

pub fn decode_photo_token(token: &str) -> Option<i64> {
    let digits = token.strip_prefix(PHOTO_TOKEN_MARKER)?;
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    i64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
pub fn encode_photo_id_list(ids: &[i64]) -> String {
    let mut encoded = String::new();
    for id in ids {
        encoded.push_str(&format!(
            "{PHOTO_TOKEN_MARKER}{id:0width$x},",
            width = PHOTO_TOKEN_DIGITS
        ));
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_zero_padded_hex_tokens() {
        let ids = decode_photo_id_list("thumb0000000000000003,thumb000000000000001a,");
        assert_eq!(ids, vec![3, 26]);
    }

    #[test]
    fn skips_foreign_and_malformed_tokens() {
        let ids = decode_photo_id_list(
            "video-0000000000000004, thumb00000000000000ff ,thumbzz,thumb,,",
        );
        assert_eq!(ids, vec![255]);
    }

    #[test]
    fn empty_list_decodes_to_nothing() {
        assert!(decode_photo_id_list("").is_empty());
    }

    #[test]
    fn encoding_matches_stored_layout() {
        let encoded = encode_photo_id_list(&[3, 26]);
        assert_eq!(encoded, "thumb0000000000000003,thumb000000000000001a,");
        assert_eq!(decode_photo_id_list(&encoded), vec![3, 26]);
    }
}
