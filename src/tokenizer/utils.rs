use std::collections::{HashMap, HashSet};

use super::StringPair;

/// Splits text into contraction suffixes, letter runs, digit runs and symbol runs.
/// Letters and symbols may carry one leading space; other whitespace is never matched.
pub const PRE_TOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?[A-Za-zÀ-ÿ]+|\d+| ?[^ \r\n\tA-Za-z0-9À-ÿ]+";

/// Byte-alphabet stand-in for a space, marks the start of a word.
pub const WORD_BOUNDARY_MARKER: char = '\u{0120}';

/// Byte-alphabet stand-in for `\n`.
pub const NEWLINE_MARKER: char = '\u{010A}';

/// Offset added to bytes without a printable stand-in of their own.
const SHIFTED_BYTE_OFFSET: u32 = 256;

/// Bytes that are already printable, non-whitespace characters in Latin-1.
fn is_printable_byte(byte: u8) -> bool {
    matches!(byte, 33..=126 | 161..=172 | 174..=255)
}

/// Reversible mapping between the 256 byte values and 256 printable characters.
///
/// Printable Latin-1 bytes map to themselves; every other byte `b` maps to
/// `U+0100 + b`. Both directions are total over their domains, so any UTF-8
/// string can be carried through BPE as characters and recovered byte for byte.
#[derive(Debug, Clone)]
pub struct ByteTable {
    encoder: [char; 256],
    decoder: HashMap<char, u8>,
}

impl ByteTable {
    pub fn new() -> Self {
        let mut encoder = ['\0'; 256];
        let mut decoder = HashMap::with_capacity(256);

        for byte in 0..=u8::MAX {
            let code_point = if is_printable_byte(byte) {
                u32::from(byte)
            } else {
                SHIFTED_BYTE_OFFSET + u32::from(byte)
            };
            // every value here is below the surrogate range
            let c = char::from_u32(code_point).unwrap_or(char::REPLACEMENT_CHARACTER);

            encoder[usize::from(byte)] = c;
            decoder.insert(c, byte);
        }

        Self { encoder, decoder }
    }

    pub fn encode_byte(&self, byte: u8) -> char {
        self.encoder[usize::from(byte)]
    }

    pub fn decode_char(&self, c: char) -> Option<u8> {
        self.decoder.get(&c).copied()
    }
}

impl Default for ByteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects every adjacent pair of symbols in a word.
pub fn get_pairs(word: &[String]) -> HashSet<StringPair> {
    word.windows(2)
        .map(|window| (window[0].clone(), window[1].clone()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn byte_table_is_a_bijection() {
        let table = ByteTable::new();

        let mut seen = HashSet::new();
        for byte in 0..=u8::MAX {
            let c = table.encode_byte(byte);
            assert_eq!(Some(byte), table.decode_char(c));
            assert!(seen.insert(c), "duplicate character for byte {byte}");
        }
        assert_eq!(256, seen.len());
    }

    #[test]
    pub fn printable_bytes_map_to_themselves() {
        let table = ByteTable::new();

        assert_eq!('a', table.encode_byte(b'a'));
        assert_eq!('~', table.encode_byte(b'~'));
        assert_eq!('\u{00FF}', table.encode_byte(0xFF));
    }

    #[test]
    pub fn whitespace_bytes_map_to_markers() {
        let table = ByteTable::new();

        assert_eq!(WORD_BOUNDARY_MARKER, table.encode_byte(b' '));
        assert_eq!(NEWLINE_MARKER, table.encode_byte(b'\n'));
        assert_eq!('\u{01AD}', table.encode_byte(173));
    }

    #[test]
    pub fn unknown_characters_do_not_decode() {
        let table = ByteTable::new();

        assert_eq!(None, table.decode_char('\u{4E2D}'));
    }

    #[test]
    pub fn pairs_of_short_words() {
        assert!(get_pairs(&[]).is_empty());
        assert!(get_pairs(&["a".to_string()]).is_empty());

        let word: Vec<String> = ["a", "b", "a", "b"].iter().map(|s| s.to_string()).collect();
        let pairs = get_pairs(&word);
        assert_eq!(2, pairs.len());
        assert!(pairs.contains(&("a".to_string(), "b".to_string())));
        assert!(pairs.contains(&("b".to_string(), "a".to_string())));
    }
}
