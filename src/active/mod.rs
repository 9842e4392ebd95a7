//! Active enumeration: wordlist bruteforce and zone transfer attempts.

pub mod bruteforce;
mod wordlist;
pub mod zonetransfer;

pub use wordlist::{default_wordlist, load_wordlist};
