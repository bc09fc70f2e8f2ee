use instill_security::sha256_hex;

/// Descriptor value asking for a generated component GUID.
pub const AUTO_GUID: &str = "*";

/// Derives a component GUID from stable descriptor inputs.
///
/// The same component id, owning directory and key path identity always
/// produce the same GUID, so rebuilding an unchanged descriptor never changes
/// component identity. The digest is shaped as a name-based (version 5 style)
/// GUID.
pub fn derive_component_guid(component_id: &str, directory_id: &str, key_path: &str) -> String {
    let digest = sha256_hex(
        format!("instill-component\u{0}{component_id}\u{0}{directory_id}\u{0}{key_path}")
            .as_bytes(),
    );
    let mut hex = digest[..32].to_ascii_uppercase().into_bytes();
    hex[12] = b'5';
    let variant = u8::from_str_radix(&digest[16..17], 16).unwrap_or(0);
    hex[16] = b"89AB"[usize::from(variant & 0x3)];

    let hex = String::from_utf8_lossy(&hex).into_owned();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Canonical uppercase form of a GUID, with optional braces stripped.
/// Returns `None` when the input is not `8-4-4-4-12` hex.
pub fn normalize_guid(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let bare = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed);
    if bare.len() != 36 {
        return None;
    }

    for (index, ch) in bare.chars().enumerate() {
        let expect_hyphen = matches!(index, 8 | 13 | 18 | 23);
        if expect_hyphen != (ch == '-') {
            return None;
        }
        if !expect_hyphen && !ch.is_ascii_hexdigit() {
            return None;
        }
    }

    Some(bare.to_ascii_uppercase())
}

pub fn is_valid_guid(input: &str) -> bool {
    normalize_guid(input).is_some()
}
