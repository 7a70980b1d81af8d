//! Opaque token and user-code generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::RngCore;

/// User-code alphabet: no O/0, no I/1, so codes survive bad displays and
/// hurried typing.
pub const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// High-entropy opaque token (device codes, device access tokens, session
/// ids, OAuth state). 32 random bytes, base64url without padding.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Human-enterable code: two groups of four, e.g. `ABCD-EFGH`.
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut chars: Vec<char> = Vec::with_capacity(8);
    for _ in 0..8 {
        chars.push(*USER_CODE_ALPHABET.choose(&mut rng).unwrap() as char);
    }
    format!(
        "{}-{}",
        chars[..4].iter().collect::<String>(),
        chars[4..].iter().collect::<String>()
    )
}

/// Normalize what a human typed into the canonical `XXXX-XXXX` form.
/// Accepts lowercase, stray spaces, and a missing or misplaced hyphen.
/// Returns `None` when the result is not eight alphabet characters.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.len() != 8 {
        return None;
    }
    if !cleaned.bytes().all(|b| USER_CODE_ALPHABET.contains(&b)) {
        return None;
    }
    Some(format!("{}-{}", &cleaned[..4], &cleaned[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_tokens_are_long_and_unique() {
        let a = generate_opaque_token();
        let b = generate_opaque_token();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
        assert!(!a.contains('='));
    }

    #[test]
    fn user_codes_use_the_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_user_code();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            for c in code.chars().filter(|c| *c != '-') {
                assert!(
                    USER_CODE_ALPHABET.contains(&(c as u8)),
                    "unexpected char {c} in {code}"
                );
                assert!(!"O0I1".contains(c));
            }
        }
    }

    #[test]
    fn normalization_accepts_human_variants() {
        assert_eq!(normalize_user_code("abcd-efgh").as_deref(), Some("ABCD-EFGH"));
        assert_eq!(normalize_user_code("ABCDEFGH").as_deref(), Some("ABCD-EFGH"));
        assert_eq!(normalize_user_code(" ab cd ef gh ").as_deref(), Some("ABCD-EFGH"));
    }

    #[test]
    fn normalization_rejects_bad_input() {
        assert_eq!(normalize_user_code("ABC-DEFG"), None); // 7 chars
        assert_eq!(normalize_user_code("ABCD-EFG0"), None); // ambiguous 0
        assert_eq!(normalize_user_code(""), None);
        assert_eq!(normalize_user_code("ABCD-EFGH-JKLM"), None);
    }
}
