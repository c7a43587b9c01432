use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::byte_level::{bytes_to_unicode, unicode_to_bytes};
use crate::error::{Result, TokenizerError};
use crate::vocab::Vocab;

/// Marker closing every training example and terminating generation.
pub const END_OF_TEXT: &str = "<|endoftext|>";

// GPT-2 pre-tokenization pattern without the `\s+(?!\S)` lookahead, which the
// regex crate does not support. `pretokenize` restores that behaviour.
const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// Byte-level BPE tokenizer compatible with GPT-2 `vocab.json` / `merges.txt`.
#[derive(Clone)]
pub struct BPE {
    pub vocab: Vocab,
    pub merges: HashMap<(String, String), u32>,
    special_tokens: Vec<String>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    regex: Regex,
}

impl std::fmt::Debug for BPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPE")
         .field("vocab_size", &self.vocab.len())
         .field("merges_count", &self.merges.len())
         .field("special_tokens", &self.special_tokens)
         .finish()
    }
}

impl BPE {
    pub fn new(vocab: Vocab, merges: HashMap<(String, String), u32>) -> Result<Self> {
        let byte_encoder = bytes_to_unicode();
        let special_tokens = if vocab.contains(END_OF_TEXT) {
            vec![END_OF_TEXT.to_string()]
        } else {
            Vec::new()
        };

        Ok(Self {
            vocab,
            merges,
            special_tokens,
            byte_decoder: unicode_to_bytes(&byte_encoder),
            byte_encoder,
            regex: Regex::new(PRETOKENIZE_PATTERN)?,
        })
    }

    /// A tokenizer with one token per byte, `<|endoftext|>` and the given extra
    /// special tokens, and no merges. Useful when no pretrained vocabulary is
    /// around.
    pub fn byte_level(extra_special_tokens: &[&str]) -> Result<Self> {
        let mut vocab = Vocab::new();
        for c in bytes_to_unicode() {
            vocab.insert(c.to_string(), vocab.len() as u32);
        }
        vocab.insert(END_OF_TEXT.to_string(), vocab.len() as u32);
        for token in extra_special_tokens {
            vocab.insert(token.to_string(), vocab.len() as u32);
        }

        let mut bpe = Self::new(vocab, HashMap::new())?;
        for token in extra_special_tokens {
            bpe.add_special_token(token)?;
        }
        Ok(bpe)
    }

    pub fn from_files<P: AsRef<Path>>(vocab_path: P, merges_path: P) -> Result<Self> {
        let vocab = Vocab::load(vocab_path)?;

        let file = File::open(merges_path)?;
        let reader = BufReader::new(file);
        let mut merges = HashMap::new();

        for (i, line_res) in reader.lines().enumerate() {
            let line = line_res?;
            // Skips the `#version` header as well
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() == 2 {
                merges.insert((parts[0].to_string(), parts[1].to_string()), i as u32);
            }
        }

        Self::new(vocab, merges)
    }

    /// Loads `vocab.json` and `merges.txt` from a pretrained model directory.
    pub fn from_pretrained_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Self::from_files(dir.join("vocab.json"), dir.join("merges.txt"))
    }

    /// Registers a vocab entry that must be matched verbatim instead of being
    /// split by the pre-tokenizer.
    pub fn add_special_token(&mut self, token: &str) -> Result<()> {
        if !self.vocab.contains(token) {
            return Err(TokenizerError::TokenNotFound(token.to_string()));
        }
        if !self.special_tokens.iter().any(|t| t == token) {
            self.special_tokens.push(token.to_string());
        }
        Ok(())
    }

    pub fn special_tokens(&self) -> &[String] {
        &self.special_tokens
    }

    pub fn eos_token_id(&self) -> Result<u32> {
        self.vocab
            .get_id(END_OF_TEXT)
            .ok_or_else(|| TokenizerError::TokenNotFound(END_OF_TEXT.to_string()))
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        let mut pairs = HashSet::new();
        if word.len() < 2 {
            return pairs;
        }
        for i in 0..word.len() - 1 {
            pairs.insert((word[i].clone(), word[i + 1].clone()));
        }
        pairs
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        loop {
            let pairs = Self::get_pairs(&word);
            if pairs.is_empty() {
                break;
            }

            let mut best_pair: Option<(String, String)> = None;
            let mut min_rank = u32::MAX;

            for pair in &pairs {
                if let Some(&rank) = self.merges.get(pair) {
                    if rank < min_rank {
                        min_rank = rank;
                        best_pair = Some(pair.clone());
                    }
                }
            }

            let Some((first, second)) = best_pair else {
                break;
            };

            let mut new_word = Vec::with_capacity(word.len());
            let mut i = 0;

            while i < word.len() {
                if i < word.len() - 1 && word[i] == first && word[i + 1] == second {
                    new_word.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }

            word = new_word;
            if word.len() == 1 {
                break;
            }
        }

        word
    }

    /// Splits `text` into pieces that are merged independently. A run of
    /// whitespace followed by a word leaves its last character to the word,
    /// so `"a  b"` yields `["a", " ", " b"]`.
    fn pretokenize<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut pieces = Vec::new();
        let mut pos = 0;

        while let Some(mat) = self.regex.find_at(text, pos) {
            let piece = mat.as_str();
            let mut end = mat.end();

            if end < text.len() && piece.chars().all(char::is_whitespace) {
                if let Some((last, _)) = piece.char_indices().last() {
                    if last > 0 {
                        end = mat.start() + last;
                    }
                }
            }

            pieces.push(&text[mat.start()..end]);
            pos = end;
        }

        pieces
    }

    /// Cuts `text` around occurrences of registered special tokens. The flag
    /// marks special segments.
    fn split_special<'t>(&self, text: &'t str) -> Vec<(&'t str, bool)> {
        let mut segments = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            let next = self
                .special_tokens
                .iter()
                .filter_map(|token| rest.find(token.as_str()).map(|at| (at, token.len())))
                .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

            match next {
                Some((at, len)) => {
                    if at > 0 {
                        segments.push((&rest[..at], false));
                    }
                    segments.push((&rest[at..at + len], true));
                    rest = &rest[at + len..];
                }
                None => {
                    segments.push((rest, false));
                    break;
                }
            }
        }

        segments
    }

    fn encode_ordinary(&self, text: &str, ids: &mut Vec<u32>) {
        for piece in self.pretokenize(text) {
            let mapped: String = piece
                .bytes()
                .map(|b| self.byte_encoder[b as usize])
                .collect();

            for token in self.bpe(&mapped) {
                if let Some(id) = self.vocab.get_id(&token) {
                    ids.push(id);
                } else {
                    // Byte-level vocabularies always hold the single characters
                    ids.extend(
                        token
                            .chars()
                            .filter_map(|c| self.vocab.get_id(c.encode_utf8(&mut [0; 4]))),
                    );
                }
            }
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for (segment, special) in self.split_special(text) {
            if special {
                if let Some(id) = self.vocab.get_id(segment) {
                    ids.push(id);
                }
            } else {
                self.encode_ordinary(segment, &mut ids);
            }
        }
        ids
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            let Some(token) = self.vocab.get_token(*id) else {
                continue;
            };
            if self.special_tokens.contains(token) {
                bytes.extend_from_slice(token.as_bytes());
            } else {
                bytes.extend(token.chars().filter_map(|c| self.byte_decoder.get(&c)));
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pretrained(dir: &Path) {
        let vocab = serde_json::json!({
            "h": 0, "e": 1, "l": 2, "o": 3, "Ġ": 4, "w": 5, "r": 6, "d": 7,
            "he": 8, "ll": 9, "hell": 10, "hello": 11, "Ġw": 12, "<|endoftext|>": 13
        });
        std::fs::write(dir.join("vocab.json"), vocab.to_string()).unwrap();

        let mut merges = File::create(dir.join("merges.txt")).unwrap();
        writeln!(merges, "#version: 0.2").unwrap();
        writeln!(merges, "h e").unwrap();
        writeln!(merges, "l l").unwrap();
        writeln!(merges, "he ll").unwrap();
        writeln!(merges, "hell o").unwrap();
        writeln!(merges, "Ġ w").unwrap();
    }

    #[test]
    fn merges_follow_rank_order() {
        let dir = tempfile::tempdir().unwrap();
        write_pretrained(dir.path());
        let bpe = BPE::from_pretrained_dir(dir.path()).unwrap();

        assert_eq!(bpe.encode("hello world"), vec![11, 12, 3, 6, 2, 7]);
        assert_eq!(bpe.decode(&[11, 12, 3, 6, 2, 7]), "hello world");
    }

    #[test]
    fn end_of_text_is_a_single_token() {
        let dir = tempfile::tempdir().unwrap();
        write_pretrained(dir.path());
        let bpe = BPE::from_pretrained_dir(dir.path()).unwrap();

        assert_eq!(bpe.eos_token_id().unwrap(), 13);
        assert_eq!(bpe.encode("hello<|endoftext|>"), vec![11, 13]);
        assert_eq!(bpe.decode(&[11, 13]), "hello<|endoftext|>");
    }

    #[test]
    fn byte_level_round_trips_arbitrary_text() {
        let bpe = BPE::byte_level(&["<|sentence|>"]).unwrap();
        let text = "<|sentence|>Fish  swim, café!\n<|endoftext|>";

        let ids = bpe.encode(text);
        assert_eq!(ids[0], 257);
        assert_eq!(*ids.last().unwrap(), bpe.eos_token_id().unwrap());
        assert_eq!(bpe.decode(&ids), text);
    }

    #[test]
    fn whitespace_run_leaves_last_space_to_next_word() {
        let bpe = BPE::byte_level(&[]).unwrap();
        assert_eq!(bpe.pretokenize("a  b"), vec!["a", " ", " b"]);
        assert_eq!(bpe.pretokenize("it's  "), vec!["it", "'s", "  "]);
    }

    #[test]
    fn unknown_special_token_is_rejected() {
        let mut bpe = BPE::byte_level(&[]).unwrap();
        assert!(matches!(
            bpe.add_special_token("<|missing|>"),
            Err(TokenizerError::TokenNotFound(_))
        ));
    }
}
