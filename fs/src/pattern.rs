//! Six-bit filename compilation with trailing `*` wildcards and mask
//! matching.

use os8_err::{Result, UsageError};

use crate::directory::model::{split_name_ext, validate_field, Word};

const SIXBIT_FULL_MASK: u8 = 0x3F;

/// A compiled pattern: four six-bit `match` words and four six-bit `mask`
/// words. Matching is `match_i ≡ name_i (mod mask_i)` per word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    match_words: [Word; 4],
    mask_words: [Word; 4],
}

impl Pattern {
    pub fn compile(input: &str) -> Result<Self> {
        let (name, extension) = split_name_ext(input)?;
        validate_field(&name, 1, 6, true, input)?;
        validate_field(&extension, 0, 2, false, input)?;

        let (name_chars, name_masks) = compile_field(&name, 6);
        let (ext_chars, ext_masks) = compile_field(&extension, 2);

        let match_words = [
            pack_bytes(name_chars[0], name_chars[1]),
            pack_bytes(name_chars[2], name_chars[3]),
            pack_bytes(name_chars[4], name_chars[5]),
            pack_bytes(ext_chars[0], ext_chars[1]),
        ];
        let mask_words = [
            pack_bytes(name_masks[0], name_masks[1]),
            pack_bytes(name_masks[2], name_masks[3]),
            pack_bytes(name_masks[4], name_masks[5]),
            pack_bytes(ext_masks[0], ext_masks[1]),
        ];
        Ok(Pattern {
            match_words,
            mask_words,
        })
    }

    pub fn matches(&self, name_words: &[Word; 4]) -> bool {
        self.match_words
            .iter()
            .zip(self.mask_words.iter())
            .zip(name_words.iter())
            .all(|((m, mask), n)| (n.get() & mask.get()) == (m.get() & mask.get()))
    }
}

fn sixbit_encode_char(c: u8) -> u8 {
    let c = c.to_ascii_uppercase();
    if (0x40..=0x7F).contains(&c) {
        c - 0x40
    } else {
        c & 0x3F
    }
}

fn pack_bytes(b1: u8, b2: u8) -> Word {
    Word::new(((b1 as u16) << 6) | b2 as u16)
}

/// Compiles one field (name or extension) into parallel `chars`/`masks`
/// arrays of `max_len` six-bit values. Explicit characters (including
/// implicit space padding when no trailing `*` is given) get a full mask; a
/// trailing `*` zeroes the mask for every remaining slot in the field.
fn compile_field(field: &str, max_len: usize) -> (Vec<u8>, Vec<u8>) {
    let (literal, wildcard) = match field.strip_suffix('*') {
        Some(stripped) => (stripped, true),
        None => (field, false),
    };
    let explicit: Vec<u8> = literal.bytes().take(max_len).collect();
    let wildcard_from = if wildcard { Some(explicit.len()) } else { None };

    let mut chars = Vec::with_capacity(max_len);
    let mut masks = Vec::with_capacity(max_len);
    for i in 0..max_len {
        let c = *explicit.get(i).unwrap_or(&b' ');
        let in_wildcard_tail = wildcard_from.is_some_and(|from| i >= from);
        chars.push(sixbit_encode_char(c));
        masks.push(if in_wildcard_tail { 0 } else { SIXBIT_FULL_MASK });
    }
    (chars, masks)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::model::SixBitName;

    fn name_words(s: &str) -> [Word; 4] {
        SixBitName::parse(s).unwrap().to_words()
    }

    #[test]
    fn exact_match_requires_space_padding() {
        let pattern = Pattern::compile("AB.PA").unwrap();
        assert!(pattern.matches(&name_words("AB.PA")));
        assert!(!pattern.matches(&name_words("ABC.PA")));
    }

    #[test]
    fn star_truncates_name_field_only() {
        let pattern = Pattern::compile("FOO*.PA").unwrap();
        assert!(pattern.matches(&name_words("FOOBAR.PA")));
        assert!(pattern.matches(&name_words("FOO.PA")));
        assert!(!pattern.matches(&name_words("FOOBAR.BN")));
    }

    #[test]
    fn star_on_extension_matches_any_extension() {
        let pattern = Pattern::compile("FOO.*").unwrap();
        assert!(pattern.matches(&name_words("FOO.PA")));
        assert!(pattern.matches(&name_words("FOO.BN")));
        assert!(!pattern.matches(&name_words("FOOBAR.PA")));
    }

    #[test]
    fn case_is_folded() {
        let pattern = Pattern::compile("foo.pa").unwrap();
        assert!(pattern.matches(&name_words("FOO.PA")));
    }

    #[test]
    fn rejects_name_not_starting_with_alpha() {
        assert!(Pattern::compile("1FOO.PA").is_err());
    }
}
