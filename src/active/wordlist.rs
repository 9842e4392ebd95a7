//! Wordlist loading for the bruteforce engine.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::intern::intern;

const LARGE_WORDLIST_THRESHOLD: u64 = 10 * 1024 * 1024;

static DEFAULT_WORDLIST: &str = include_str!("wordlists/default.txt");

/// Returns the embedded default wordlist, interned and sorted.
pub fn default_wordlist() -> Vec<Arc<str>> {
    read_words(DEFAULT_WORDLIST.as_bytes()).unwrap_or_default()
}

/// Reads a wordlist from disk: one word per line, whitespace trimmed,
/// empties dropped, entries interned. Files of 10 MiB or more are
/// memory-mapped; smaller files stream through a buffered reader. The
/// result is stably sorted by ascending length then lexicographically so
/// short, high-probability labels dispatch first.
pub fn load_wordlist(path: &Path) -> Result<Vec<Arc<str>>> {
    let file = File::open(path).with_context(|| format!("opening wordlist {}", path.display()))?;
    let metadata = file
        .metadata()
        .with_context(|| format!("stat wordlist {}", path.display()))?;

    if metadata.is_file() && metadata.len() >= LARGE_WORDLIST_THRESHOLD {
        // Safety: the mapping is read-only and dropped before return.
        if let Ok(mapped) = unsafe { memmap2::Mmap::map(&file) } {
            return read_words(&mapped[..]);
        }
        // mmap failure falls back to the streaming reader
    }

    read_words(BufReader::new(file))
}

fn read_words(reader: impl Read) -> Result<Vec<Arc<str>>> {
    let reader = BufReader::with_capacity(64 * 1024, reader);
    let mut words = Vec::new();

    for line in reader.lines() {
        let line = line.context("reading wordlist")?;
        let word = line.trim();
        if word.is_empty() {
            continue;
        }
        words.push(intern(word));
    }

    words.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    Ok(words)
}
