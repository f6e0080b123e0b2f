use sha1::{Digest, Sha1};
use std::{
    fmt,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, info};

pub mod git;

/// The number of hex characters in a SHA1 hash.
pub const SHA1_HEX_LENGTH: usize = 40;

const SHA1_BYTE_LENGTH: usize = 20;

/// The prefix used when none is given on the command line.
pub const DEFAULT_PREFIX: &str = "0000000";

/// Errors raised before any hashing work begins.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum InvalidInputError {
    #[error(
        "Invalid input provided: {0:?}. (If an input is provided, it must be a lowercase hex \
        string of 1 to 40 characters.)"
    )]
    Prefix(String),

    #[error("the commit object is empty or does not end with a newline")]
    MissingTerminator,
}

/// Defines a desired target prefix for a commit hash.
///
/// For example, the hash prefix "deadbeef123" corresponds to the
/// following structure:
///   HashPrefix { data: [0xde, 0xad, 0xbe, 0xef, 0x12, 0x30, 0, ...],
///                mask: [0xff, 0xff, 0xff, 0xff, 0xff, 0xf0, 0, ...] }
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HashPrefix {
    /// The original hex text.
    text: String,
    /// The prefix as raw hash bytes. All bits beyond the length of the prefix are set to 0.
    data: [u8; SHA1_BYTE_LENGTH],
    /// Mask containing bits set to 1 if the bit at that position is specified
    /// in the prefix, and 0 otherwise.
    mask: [u8; SHA1_BYTE_LENGTH],
}

impl HashPrefix {
    /// Creates a new hash prefix from a lowercase hex string of 1 to 40 characters.
    pub fn new(prefix: &str) -> Result<Self, InvalidInputError> {
        let is_valid = !prefix.is_empty()
            && prefix.len() <= SHA1_HEX_LENGTH
            && prefix
                .bytes()
                .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));

        if !is_valid {
            return Err(InvalidInputError::Prefix(prefix.to_owned()));
        }

        let mut data = [0u8; SHA1_BYTE_LENGTH];
        let mut mask = [0u8; SHA1_BYTE_LENGTH];

        for (index, nibble) in prefix.bytes().map(hex_digit_value).enumerate() {
            let shift = if index % 2 == 0 { 4 } else { 0 };
            data[index / 2] |= nibble << shift;
            mask[index / 2] |= 0x0f << shift;
        }

        Ok(Self {
            text: prefix.to_owned(),
            data,
            mask,
        })
    }

    #[inline(always)]
    pub fn matches(&self, hash: &[u8; SHA1_BYTE_LENGTH]) -> bool {
        hash.iter()
            .zip(&self.mask)
            .map(|(&hash_byte, &mask_byte)| hash_byte & mask_byte)
            .zip(&self.data)
            .all(|(masked_hash_byte, &desired_byte)| masked_hash_byte == desired_byte)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The expected number of attempts before a match, 16 to the power of the prefix length.
    pub fn estimated_attempts(&self) -> u64 {
        16u64.saturating_pow(self.text.len() as u32)
    }
}

impl Default for HashPrefix {
    fn default() -> Self {
        HashPrefix::new(DEFAULT_PREFIX).unwrap()
    }
}

impl fmt::Display for HashPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn hex_digit_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        _ => digit - b'a' + 10,
    }
}

/// The result of a successful padding search
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaddingMatch {
    /// The whitespace appended before the commit's final newline
    pub padding: String,

    /// The hash of the padded commit, as a hex string
    pub hash: String,

    /// The padded commit body, without git's object header
    pub commit: Vec<u8>,

    /// The counter that produced the padding, which is also the number of attempts made
    pub attempts: u64,
}

/// Returns the padding derived from a counter: its binary digits, most significant first,
/// with each `0` written as a space and each `1` as a tab.
pub fn padding_for(counter: u64) -> String {
    let mut padding = Vec::new();
    write_padding(counter, &mut padding);
    // Only ASCII spaces and tabs are written.
    padding.into_iter().map(char::from).collect()
}

fn write_padding(counter: u64, padding: &mut Vec<u8>) {
    let digit_count = (u64::BITS - counter.leading_zeros()) as usize;
    padding.clear();
    padding.extend((0..digit_count).rev().map(|bit| {
        if counter >> bit & 1 == 0 {
            b' '
        } else {
            b'\t'
        }
    }));
}

// The data that gets hashed for a candidate is the concatenation of:
// |--- GIT COMMIT HEADER ---
// | * The ASCII string "commit "
// | * The byte-length of the commit body below, represented as base-10 ASCII digits
// | * A null byte (0x0)
// |--- COMMIT BODY ---
// | * The "stem": the original commit object without its final newline
// | * The padding, some combination of ASCII space and tab characters
// | * A single newline
//
// The header and the stem only change when the padding gets longer, which happens each time the
// counter reaches a power of two. So the SHA1 state after consuming them is cached, and each
// attempt only feeds the padding and the newline into a copy of that state.
#[derive(Debug, Clone)]
struct CandidateCommit<'a> {
    stem: &'a [u8],
    padding: Vec<u8>,
    stem_hasher: Sha1,
}

impl<'a> CandidateCommit<'a> {
    fn new(commit_object: &'a [u8]) -> Result<Self, InvalidInputError> {
        let stem = match commit_object.split_last() {
            Some((&b'\n', stem)) => stem,
            _ => return Err(InvalidInputError::MissingTerminator),
        };

        Ok(Self {
            stem,
            padding: Vec::new(),
            stem_hasher: Self::hash_stem(stem, 0),
        })
    }

    fn hash_stem(stem: &[u8], padding_length: usize) -> Sha1 {
        let mut hasher = Sha1::new();
        hasher.update(envelope_header(stem.len() + padding_length + 1));
        hasher.update(stem);
        hasher
    }

    #[inline(always)]
    fn set_padding(&mut self, counter: u64) {
        let previous_length = self.padding.len();
        write_padding(counter, &mut self.padding);
        if self.padding.len() != previous_length {
            self.stem_hasher = Self::hash_stem(self.stem, self.padding.len());
        }
    }

    #[inline(always)]
    fn current_hash(&self) -> [u8; SHA1_BYTE_LENGTH] {
        let mut hasher = self.stem_hasher.clone();
        hasher.update(&self.padding);
        hasher.update(b"\n");
        let mut hash = [0; SHA1_BYTE_LENGTH];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }

    /// The commit body for the current padding.
    fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.stem.len() + self.padding.len() + 1);
        body.extend_from_slice(self.stem);
        body.extend_from_slice(&self.padding);
        body.push(b'\n');
        body
    }

    /// The full bytes that git hashes for the current padding, header included.
    #[cfg(test)]
    fn hashed_bytes(&self) -> Vec<u8> {
        let body = self.body();
        let mut data = envelope_header(body.len());
        data.extend(body);
        data
    }

    fn try_counter(&mut self, counter: u64, desired_prefix: &HashPrefix) -> Option<PaddingMatch> {
        self.set_padding(counter);
        let hash = self.current_hash();
        if !desired_prefix.matches(&hash) {
            return None;
        }

        let found = PaddingMatch {
            padding: self.padding.iter().copied().map(char::from).collect(),
            hash: hex::encode(hash),
            commit: self.body(),
            attempts: counter,
        };
        info!(attempts = found.attempts, hash = %found.hash, "found matching padding");
        Some(found)
    }
}

fn envelope_header(body_length: usize) -> Vec<u8> {
    format!("commit {}\0", body_length).into_bytes()
}

/// Hashes a commit object using git's object encoding, without adding padding or anything else
pub fn hash_git_commit(commit: &[u8]) -> String {
    hex::encode(
        Sha1::new()
            .chain(envelope_header(commit.len()))
            .chain(commit)
            .finalize(),
    )
}

/// Finds the first whitespace padding that gives `commit_object` a hash starting with
/// `desired_prefix`, trying counters 1, 2, 3, ... with no upper bound.
pub fn search(
    commit_object: &[u8],
    desired_prefix: &str,
) -> Result<PaddingMatch, InvalidInputError> {
    search_for_prefix(commit_object, &HashPrefix::new(desired_prefix)?)
}

/// Like `search`, for a prefix that has already been parsed.
pub fn search_for_prefix(
    commit_object: &[u8],
    desired_prefix: &HashPrefix,
) -> Result<PaddingMatch, InvalidInputError> {
    let mut candidate = CandidateCommit::new(commit_object)?;

    let mut counter = 0u64;
    loop {
        counter += 1;
        if let Some(found) = candidate.try_counter(counter, desired_prefix) {
            return Ok(found);
        }
    }
}

/// A search over a bounded, cancellable range of counters for a padding that matches a specific
/// hash prefix.
#[derive(Debug)]
pub struct PaddingSearch<'a> {
    candidate: CandidateCommit<'a>,
    desired_prefix: HashPrefix,
    search_space: RangeInclusive<u64>,
    cancel_signal: Option<Arc<AtomicBool>>,
}

impl<'a> PaddingSearch<'a> {
    /// Creates a search for a specific commit and prefix over every positive counter.
    pub fn new(commit_object: &'a [u8], desired_prefix: HashPrefix) -> Result<Self, InvalidInputError> {
        Ok(Self {
            candidate: CandidateCommit::new(commit_object)?,
            desired_prefix,
            search_space: 1..=u64::MAX,
            cancel_signal: None,
        })
    }

    /// Caps the search to the counters `1..=attempts`.
    pub fn with_capped_search_space(mut self, attempts: u64) -> Self {
        self.search_space =
            *self.search_space.start()..=Ord::min(*self.search_space.end(), attempts);
        self
    }

    /// Stops the search once `signal` is set. The signal is checked before every attempt.
    pub fn with_cancel_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.cancel_signal = Some(signal);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_signal
            .as_ref()
            .map_or(false, |signal| signal.load(Ordering::Relaxed))
    }

    /// Runs the search. Returns early with the first match, or `None` once the search space
    /// is exhausted or the search is cancelled.
    #[inline(never)]
    pub fn search(mut self) -> Option<PaddingMatch> {
        let search_space = self.search_space.clone();
        for counter in search_space {
            if self.is_cancelled() {
                debug!(attempts = counter - 1, "search cancelled");
                return None;
            }

            if let Some(found) = self.candidate.try_counter(counter, &self.desired_prefix) {
                return Some(found);
            }
        }

        debug!(prefix = %self.desired_prefix, "search space exhausted");
        None
    }
}
