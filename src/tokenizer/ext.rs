use extend::ext;

use super::{ByteTable, NEWLINE_MARKER, WORD_BOUNDARY_MARKER};

#[ext(name = ByteAlphabetExt)]
pub impl str {
    /// Maps every UTF-8 byte of the string to its byte-alphabet character.
    fn to_byte_alphabet(&self, table: &ByteTable) -> String {
        self.bytes().map(|byte| table.encode_byte(byte)).collect()
    }

    /// Recovers raw bytes from byte-alphabet text.
    /// Characters outside the alphabet contribute their own UTF-8 encoding.
    fn to_raw_bytes(&self, table: &ByteTable) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        let mut buffer = [0u8; 4];

        for c in self.chars() {
            match table.decode_char(c) {
                Some(byte) => bytes.push(byte),
                None => bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes()),
            }
        }

        bytes
    }

    /// Turns any leftover boundary and newline markers into literal whitespace.
    fn replace_markers(&self) -> String {
        self.replace(WORD_BOUNDARY_MARKER, " ")
            .replace(NEWLINE_MARKER, "\n")
    }
}
