//! Hierarchical topic strings and their Bloom filter encoding.
//!
//! A topic is a non-empty string of segments separated by any of the
//! configured separator characters (default `/` and `.`). Subscription
//! patterns may use `+` for exactly one segment and `#` (final segment
//! only) for any suffix; publication topics are always literal.
//!
//! Matching reduces to a subset test: a publication inserts tokens for
//! every literal prefix, for every `+`-anchored infix, and for the
//! terminal segment; a subscription inserts exactly the tokens a
//! matching publication is guaranteed to carry. The Bloom filter may
//! produce false positives (routing then over-forwards), never false
//! negatives; delivery decisions use the exact string match.

use smallvec::SmallVec;

use crate::bitvec::BitVector;
use crate::error::{Error, Result};

/// Single-segment wildcard.
pub const WILDCARD_ONE: &str = "+";

/// Suffix wildcard, only valid as the final segment.
pub const WILDCARD_ANY: &str = "#";

/// Token inserted by publications and required by all-wildcard patterns
/// so that an interest of pure wildcards still unions into forwarding
/// state.
const WILDCARD_MARKER: &[u8] = b"#";

/// Byte appended to the final-segment tokens so patterns can pin the
/// segment count.
const TERMINAL: u8 = b'$';

/// How a topic participates in filter construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    /// Literal topics attached to a publication.
    Publisher,
    /// Patterns (possibly with wildcards) attached to a subscription.
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment<'a> {
    /// Separator character preceding this segment; `None` for the first.
    sep: Option<char>,
    text: &'a str,
}

impl Segment<'_> {
    fn is_wildcard(&self) -> bool {
        self.text == WILDCARD_ONE || self.text == WILDCARD_ANY
    }
}

type Segments<'a> = SmallVec<[Segment<'a>; 8]>;

fn split<'a>(topic: &'a str, separators: &str) -> Result<Segments<'a>> {
    if topic.is_empty() {
        return Err(Error::InvalidArgs);
    }
    let mut segments = Segments::new();
    let mut sep = None;
    let mut start = 0;
    for (pos, ch) in topic.char_indices() {
        if separators.contains(ch) {
            if pos == start {
                return Err(Error::InvalidArgs);
            }
            segments.push(Segment {
                sep,
                text: &topic[start..pos],
            });
            sep = Some(ch);
            start = pos + ch.len_utf8();
        }
    }
    if start == topic.len() {
        // Trailing separator
        return Err(Error::InvalidArgs);
    }
    segments.push(Segment {
        sep,
        text: &topic[start..],
    });
    Ok(segments)
}

fn push_sep(token: &mut Vec<u8>, sep: Option<char>) {
    if let Some(ch) = sep {
        let mut buf = [0u8; 4];
        token.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }
}

/// The tokens a publication over `segments` inserts.
fn pub_tokens(segments: &Segments<'_>) -> Vec<Vec<u8>> {
    let mut tokens = Vec::with_capacity(2 * segments.len() + 2);
    let mut prefix: Vec<u8> = Vec::new();
    for segment in segments {
        push_sep(&mut prefix, segment.sep);
        prefix.extend_from_slice(segment.text.as_bytes());
        tokens.push(prefix.clone());
        if segment.sep.is_some() {
            let mut infix: Vec<u8> = WILDCARD_ONE.as_bytes().to_vec();
            push_sep(&mut infix, segment.sep);
            infix.extend_from_slice(segment.text.as_bytes());
            tokens.push(infix);
        }
    }
    // Terminal markers pin the segment count for both anchored and
    // wildcard-prefixed patterns
    let mut terminal = prefix;
    terminal.push(TERMINAL);
    tokens.push(terminal);
    if let Some(last) = segments.last() {
        if last.sep.is_some() {
            let mut infix: Vec<u8> = WILDCARD_ONE.as_bytes().to_vec();
            push_sep(&mut infix, last.sep);
            infix.extend_from_slice(last.text.as_bytes());
            infix.push(TERMINAL);
            tokens.push(infix);
        }
    }
    tokens.push(WILDCARD_MARKER.to_vec());
    tokens
}

/// The tokens every publication matching `segments` must carry.
fn sub_tokens(segments: &Segments<'_>) -> Vec<Vec<u8>> {
    let mut tokens = Vec::new();
    let mut prefix: Vec<u8> = Vec::new();
    let mut literal_prefix_len = 0;
    for segment in segments {
        if segment.is_wildcard() {
            break;
        }
        push_sep(&mut prefix, segment.sep);
        prefix.extend_from_slice(segment.text.as_bytes());
        literal_prefix_len += 1;
    }
    if literal_prefix_len > 0 {
        tokens.push(prefix.clone());
    }
    if literal_prefix_len == segments.len() {
        // Fully literal pattern: pin the exact topic
        prefix.push(TERMINAL);
        tokens.push(prefix);
        return tokens;
    }
    for (index, segment) in segments.iter().enumerate().skip(literal_prefix_len) {
        if segment.is_wildcard() {
            continue;
        }
        let mut infix: Vec<u8> = WILDCARD_ONE.as_bytes().to_vec();
        push_sep(&mut infix, segment.sep);
        infix.extend_from_slice(segment.text.as_bytes());
        if index + 1 == segments.len() {
            let mut terminal = infix.clone();
            terminal.push(TERMINAL);
            tokens.push(terminal);
        }
        tokens.push(infix);
    }
    if tokens.is_empty() {
        // Pure-wildcard pattern matches on the marker alone
        tokens.push(WILDCARD_MARKER.to_vec());
    }
    tokens
}

fn validate(segments: &Segments<'_>, role: TopicRole) -> Result<()> {
    for (index, segment) in segments.iter().enumerate() {
        match role {
            TopicRole::Publisher => {
                if segment.is_wildcard() {
                    return Err(Error::InvalidArgs);
                }
            }
            TopicRole::Subscriber => {
                if segment.text == WILDCARD_ANY && index + 1 != segments.len() {
                    return Err(Error::InvalidArgs);
                }
            }
        }
    }
    Ok(())
}

/// Insert the hash tokens for `topic` into `bv`.
pub fn add_topic(
    bv: &mut BitVector,
    topic: &str,
    separators: &str,
    role: TopicRole,
    num_hashes: u8,
) -> Result<()> {
    let segments = split(topic, separators)?;
    validate(&segments, role)?;
    let tokens = match role {
        TopicRole::Publisher => pub_tokens(&segments),
        TopicRole::Subscriber => sub_tokens(&segments),
    };
    for token in &tokens {
        bv.bloom_insert(token, num_hashes);
    }
    Ok(())
}

/// Test whether a publication filter can match `pattern`: true iff every
/// token `pattern` requires is present in `bv`. Subject to Bloom false
/// positives.
pub fn match_topic(
    bv: &BitVector,
    pattern: &str,
    separators: &str,
    num_hashes: u8,
) -> Result<bool> {
    let segments = split(pattern, separators)?;
    validate(&segments, TopicRole::Subscriber)?;
    Ok(sub_tokens(&segments)
        .iter()
        .all(|token| bv.bloom_test(token, num_hashes)))
}

/// Literal wildcard match between one publication topic and one
/// subscription pattern. Segment counts must agree unless the pattern
/// ends in `#`; separators are structural and always compared.
pub fn match_exact(topic: &str, pattern: &str, separators: &str) -> Result<bool> {
    let topic_segments = split(topic, separators)?;
    let pattern_segments = split(pattern, separators)?;
    validate(&topic_segments, TopicRole::Publisher)?;
    validate(&pattern_segments, TopicRole::Subscriber)?;

    let mut topics = topic_segments.iter();
    for (index, pat) in pattern_segments.iter().enumerate() {
        if pat.text == WILDCARD_ANY {
            // Matches any suffix, including the empty one
            return Ok(true);
        }
        let Some(seg) = topics.next() else {
            return Ok(false);
        };
        if index > 0 && seg.sep != pat.sep {
            return Ok(false);
        }
        if pat.text != WILDCARD_ONE && seg.text != pat.text {
            return Ok(false);
        }
    }
    Ok(topics.next().is_none())
}

/// True when any of `patterns` matches any of `topics` exactly.
pub fn match_any(topics: &[String], patterns: &[String], separators: &str) -> Result<bool> {
    for pattern in patterns {
        for topic in topics {
            if match_exact(topic, pattern, separators)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEPS: &str = "/.";
    const K: u8 = 4;

    fn pub_bloom(topic: &str) -> BitVector {
        let mut bv = BitVector::new(8192);
        add_topic(&mut bv, topic, SEPS, TopicRole::Publisher, K).unwrap();
        bv
    }

    fn sub_bloom(pattern: &str) -> BitVector {
        let mut bv = BitVector::new(8192);
        add_topic(&mut bv, pattern, SEPS, TopicRole::Subscriber, K).unwrap();
        bv
    }

    #[test]
    fn literal_match() {
        let bv = pub_bloom("foo/bar");
        assert!(match_topic(&bv, "foo/bar", SEPS, K).unwrap());
        assert!(!match_topic(&bv, "foo/baz", SEPS, K).unwrap());
        assert!(match_exact("foo/bar", "foo/bar", SEPS).unwrap());
        assert!(!match_exact("foo/bar", "foo/bar/baz", SEPS).unwrap());
        assert!(!match_exact("foo/bar/baz", "foo/bar", SEPS).unwrap());
    }

    #[test]
    fn single_level_wildcard() {
        let bv = pub_bloom("foo/baz/gorn");
        assert!(match_topic(&bv, "foo/+/gorn", SEPS, K).unwrap());
        assert!(match_exact("foo/baz/gorn", "foo/+/gorn", SEPS).unwrap());

        // One extra segment changes the terminal token
        let bv = pub_bloom("foo/baz/gorn.x");
        assert!(!match_exact("foo/baz/gorn.x", "foo/+/gorn", SEPS).unwrap());
        assert!(match_exact("foo/baz/gorn.x", "foo/+/+.x", SEPS).unwrap());
        assert!(match_topic(&bv, "foo/+/+.x", SEPS, K).unwrap());
    }

    #[test]
    fn suffix_wildcard() {
        assert!(match_exact("a/b/c", "a/#", SEPS).unwrap());
        assert!(match_exact("a", "a/#", SEPS).unwrap());
        assert!(!match_exact("b/a", "a/#", SEPS).unwrap());
        let bv = pub_bloom("a/b/c");
        assert!(match_topic(&bv, "a/#", SEPS, K).unwrap());
        assert!(match_topic(&bv, "#", SEPS, K).unwrap());
    }

    #[test]
    fn separators_are_structural() {
        assert!(!match_exact("a/b", "a.b", SEPS).unwrap());
        assert!(!match_exact("x/y.z", "x/+/z", SEPS).unwrap());
        assert!(match_exact("x/y.z", "x/+.z", SEPS).unwrap());
    }

    #[test]
    fn pub_bloom_covers_matching_sub_bloom() {
        // Forwarding unions subscription filters; any matching pattern's
        // filter must be a subset of the publication's
        let cases = [
            ("foo/bar", "foo/bar"),
            ("foo/baz/gorn", "foo/+/gorn"),
            ("foo/baz/gorn.x", "foo/+/+.x"),
            ("a/b/c/d", "a/#"),
            ("a/b", "+/b"),
            ("a", "#"),
            ("a/b", "+/+"),
        ];
        for (topic, pattern) in cases {
            assert!(match_exact(topic, pattern, SEPS).unwrap(), "{topic} {pattern}");
            let p = pub_bloom(topic);
            let s = sub_bloom(pattern);
            assert!(p.includes(&s), "{topic} should include {pattern}");
        }
    }

    #[test]
    fn wildcard_validation() {
        let mut bv = BitVector::new(256);
        assert_eq!(
            add_topic(&mut bv, "a/+/b", SEPS, TopicRole::Publisher, K),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            add_topic(&mut bv, "a/#/b", SEPS, TopicRole::Subscriber, K),
            Err(Error::InvalidArgs)
        );
        assert!(add_topic(&mut bv, "a/#", SEPS, TopicRole::Subscriber, K).is_ok());
    }

    #[test]
    fn malformed_topics_are_rejected() {
        for bad in ["", "/a", "a/", "a//b", "."] {
            assert_eq!(split(bad, SEPS).unwrap_err(), Error::InvalidArgs, "{bad:?}");
        }
    }

    #[test]
    fn match_any_over_lists() {
        let topics = vec!["sensor/1/temp".to_string()];
        let patterns = vec!["sensor/+/temp".to_string(), "other".to_string()];
        assert!(match_any(&topics, &patterns, SEPS).unwrap());
        assert!(!match_any(&topics, &["other".to_string()], SEPS).unwrap());
    }
}
