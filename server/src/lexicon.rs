//! Word list queries used for letter draws and scoring.
//!
//! The session only ever talks to the [`Lexicon`] trait, so tests can hand it
//! a handful of words instead of the full dictionary.

use log::{error, info};
use shared::TOP_MATCH_COUNT;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;

pub trait Lexicon: Send + Sync {
    fn is_valid(&self, word: &str) -> bool;

    /// Words that start with `prefix` and end with `suffix`.
    fn count(&self, prefix: &str, suffix: &str) -> usize;

    /// The longest matching words, at most [`TOP_MATCH_COUNT`] of them.
    fn top_matches(&self, prefix: &str, suffix: &str) -> Vec<String>;

    /// A valid word of length n is worth n - 2 points, anything else nothing.
    fn score(&self, word: &str) -> u32 {
        if self.is_valid(word) {
            (word.chars().count() as u32).saturating_sub(2)
        } else {
            0
        }
    }
}

/// In-memory word set, bucketed by first letter so prefix queries only walk
/// the words that can match.
#[derive(Debug, Default)]
pub struct WordList {
    words: HashSet<String>,
    by_initial: HashMap<char, Vec<String>>,
}

impl WordList {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for word in words {
            let word = word.as_ref().trim().to_lowercase();
            let Some(initial) = word.chars().next() else {
                continue;
            };
            if list.words.insert(word.clone()) {
                list.by_initial.entry(initial).or_default().push(word);
            }
        }
        list
    }

    /// Reads a newline separated word file.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::from_words(contents.lines()))
    }

    /// Loads the word file, or falls back to an empty list that rejects every
    /// word. The server keeps running either way.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(list) => {
                info!("Loaded {} words from {}", list.len(), path.display());
                list
            }
            Err(e) => {
                error!(
                    "Failed to read word list {}: {}; every word will score 0",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn matching<'a>(
        &'a self,
        prefix: &'a str,
        suffix: &'a str,
    ) -> Box<dyn Iterator<Item = &'a String> + 'a> {
        let candidates: Box<dyn Iterator<Item = &'a String> + 'a> = match prefix.chars().next() {
            Some(initial) => match self.by_initial.get(&initial) {
                Some(bucket) => Box::new(bucket.iter()),
                None => Box::new(std::iter::empty()),
            },
            None => Box::new(self.words.iter()),
        };
        Box::new(candidates.filter(move |word| word.starts_with(prefix) && word.ends_with(suffix)))
    }
}

impl Lexicon for WordList {
    fn is_valid(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    fn count(&self, prefix: &str, suffix: &str) -> usize {
        self.matching(prefix, suffix).count()
    }

    fn top_matches(&self, prefix: &str, suffix: &str) -> Vec<String> {
        let mut matches: Vec<&String> = self.matching(prefix, suffix).collect();
        // Longest first, alphabetical among equals so results are stable
        matches.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        matches
            .into_iter()
            .take(TOP_MATCH_COUNT)
            .cloned()
            .collect()
    }
}
