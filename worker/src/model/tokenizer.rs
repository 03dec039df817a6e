/// Turns text rows into token ids and back.
pub trait Tokenizer: Send + Sync {
    fn vocab_size(&self) -> usize;

    /// Token prepended to every row.
    fn bos(&self) -> u32;

    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, tokens: &[u32]) -> String;
}

/// One token per byte, plus a beginning-of-sequence token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    const BOS: u32 = 256;
}

impl Tokenizer for ByteTokenizer {
    fn vocab_size(&self) -> usize {
        257
    }

    fn bos(&self) -> u32 {
        Self::BOS
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| u8::try_from(t).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_and_bos_is_dropped() {
        let tok = ByteTokenizer;
        let mut ids = vec![tok.bos()];
        ids.extend(tok.encode("héllo"));

        assert_eq!(ids.len(), 7);
        assert_eq!(tok.decode(&ids), "héllo");
    }
}
