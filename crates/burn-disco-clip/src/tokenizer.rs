//! Prompt tokenizer
//!
//! Splits cleaned prompt text with the CLIP pre-tokenization pattern, maps
//! each piece through the CLIP byte-to-unicode table and, when merges are
//! loaded, applies byte pair encoding. Without merges every piece is split
//! into byte-level symbols.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

const CLIP_PATTERN: &str = r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

pub struct PromptTokenizer {
    byte_encoder: HashMap<u8, char>,
    bpe_ranks: HashMap<(String, String), usize>,
    cache: RefCell<HashMap<String, Vec<String>>>,
    pat: Regex,
}

impl PromptTokenizer {
    /// Tokenizer without merges (byte-level pieces)
    pub fn new() -> Result<Self, TokenizerError> {
        Self::from_merges("")
    }

    /// Load BPE merges from a file
    pub fn from_file<P: AsRef<Path>>(merges_path: P) -> Result<Self, TokenizerError> {
        let content = fs::read_to_string(merges_path)?;
        Self::from_merges(&content)
    }

    /// Build from BPE merges text, one `left right` pair per line
    pub fn from_merges(merges: &str) -> Result<Self, TokenizerError> {
        let bpe_ranks = merges
            .lines()
            .filter(|l| !l.starts_with("#version"))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => Some((a.to_string(), b.to_string())),
                    _ => None,
                }
            })
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        Ok(Self {
            byte_encoder: bytes_to_unicode(),
            bpe_ranks,
            cache: RefCell::new(HashMap::new()),
            pat: Regex::new(CLIP_PATTERN)?,
        })
    }

    /// Collapse whitespace and lowercase
    pub fn clean(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Tokenize prompt text into BPE pieces
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let text = Self::clean(text);
        let mut tokens = Vec::new();
        for mat in self.pat.find_iter(&text) {
            let byte_encoded: String = mat
                .as_str()
                .bytes()
                .filter_map(|b| self.byte_encoder.get(&b).copied())
                .collect();
            tokens.extend(self.bpe(&byte_encoded));
        }
        tokens
    }

    pub fn num_merges(&self) -> usize {
        self.bpe_ranks.len()
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        if let Some(cached) = self.cache.borrow().get(token) {
            return cached.clone();
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if let Some(last) = word.last_mut() {
            last.push_str("</w>");
        }

        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|w| {
                    self.bpe_ranks
                        .get(&(w[0].clone(), w[1].clone()))
                        .map(|&rank| (rank, w[0].clone(), w[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);

            let Some((_, left, right)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == left && word[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        self.cache
            .borrow_mut()
            .insert(token.to_string(), word.clone());
        word
    }
}

/// CLIP byte-to-unicode table
///
/// Printable bytes map to themselves, the rest to code points from 256 up.
fn bytes_to_unicode() -> HashMap<u8, char> {
    let mut bs: Vec<u8> = Vec::new();
    bs.extend(b'!'..=b'~');
    bs.extend(b'\xa1'..=b'\xac');
    bs.extend(b'\xae'..=b'\xff');

    let mut cs: Vec<char> = bs.iter().map(|&b| b as char).collect();

    let mut n = 0u32;
    for b in 0u8..=255 {
        if !bs.contains(&b) {
            bs.push(b);
            cs.push(char::from_u32(256 + n).unwrap_or(char::REPLACEMENT_CHARACTER));
            n += 1;
        }
    }

    bs.into_iter().zip(cs).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_unicode() {
        let mapping = bytes_to_unicode();
        assert_eq!(mapping.len(), 256);
        assert_eq!(mapping.get(&b'a'), Some(&'a'));
        assert_eq!(mapping.get(&b' '), Some(&'\u{120}'));
    }

    #[test]
    fn test_clean() {
        assert_eq!(
            PromptTokenizer::clean("  A   Lighthouse\tat\nDusk "),
            "a lighthouse at dusk"
        );
    }

    #[test]
    fn test_tokenize_without_merges() {
        let tok = PromptTokenizer::new().unwrap();
        assert_eq!(tok.num_merges(), 0);
        assert_eq!(tok.tokenize("Hi!"), vec!["h", "i</w>", "!</w>"]);
    }

    #[test]
    fn test_tokenize_with_merges() {
        let tok = PromptTokenizer::from_merges("#version: 0.2\nh i</w>\nr e\nre d</w>\n").unwrap();
        assert_eq!(tok.num_merges(), 3);
        assert_eq!(tok.tokenize("hi red"), vec!["hi</w>", "red</w>"]);
        assert_eq!(tok.tokenize("it's"), vec!["i", "t</w>", "'", "s</w>"]);
    }
}
