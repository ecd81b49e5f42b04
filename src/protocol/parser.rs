//! Command-line tokenization and numeric argument parsing.
//!
//! Tokens are borrowed subslices of the command line, valid for the handler
//! call only. The tokenizer stops after [`MAX_TOKENS`] - 1 tokens and records
//! the first unprocessed byte so multi-key `get` can resume where it left
//! off.

pub const MAX_TOKENS: usize = 8;
pub const MAX_KEY_LEN: usize = 255;

/// One tokenized command line.
#[derive(Debug, Clone, Copy)]
pub struct CommandLine<'a> {
    tokens: [&'a [u8]; MAX_TOKENS - 1],
    count: usize,
    rest: Option<&'a [u8]>,
}

impl<'a> CommandLine<'a> {
    /// Split on single ASCII spaces, collapsing runs, up to the token limit.
    pub fn tokenize(line: &'a [u8]) -> CommandLine<'a> {
        let mut tokens = [&line[..0]; MAX_TOKENS - 1];
        let mut count = 0;
        let mut s = 0;
        let mut e = 0;
        while count < MAX_TOKENS - 1 {
            if e == line.len() {
                if s != e {
                    tokens[count] = &line[s..e];
                    count += 1;
                }
                return CommandLine {
                    tokens,
                    count,
                    rest: None,
                };
            }
            if line[e] == b' ' {
                if s != e {
                    tokens[count] = &line[s..e];
                    count += 1;
                }
                s = e + 1;
            }
            e += 1;
        }
        let rest = if e < line.len() {
            Some(&line[e..])
        } else {
            None
        };
        CommandLine {
            tokens,
            count,
            rest,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Token count including the terminal sentinel; the arity table is
    /// written in these terms.
    pub fn ntokens(&self) -> usize {
        self.count + 1
    }

    pub fn token(&self, idx: usize) -> &'a [u8] {
        self.tokens[idx]
    }

    pub fn tokens(&self) -> &[&'a [u8]] {
        &self.tokens[..self.count]
    }

    /// First unprocessed byte when the token limit cut the line short.
    pub fn rest(&self) -> Option<&'a [u8]> {
        self.rest
    }
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub fn parse_u32(bytes: &[u8]) -> Option<u32> {
    parse_ascii(bytes)
}

pub fn parse_u64(bytes: &[u8]) -> Option<u64> {
    parse_ascii(bytes)
}

pub fn parse_i32(bytes: &[u8]) -> Option<i32> {
    parse_ascii(bytes)
}

pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    parse_ascii(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        let cl = CommandLine::tokenize(b"set key 0 42 5");
        assert_eq!(cl.count(), 5);
        assert_eq!(cl.ntokens(), 6);
        assert_eq!(cl.token(0), b"set");
        assert_eq!(cl.token(1), b"key");
        assert_eq!(cl.token(4), b"5");
        assert!(cl.rest().is_none());
    }

    #[test]
    fn test_tokenize_collapses_space_runs() {
        let cl = CommandLine::tokenize(b"get   a  b ");
        assert_eq!(cl.count(), 3);
        assert_eq!(cl.tokens(), &[b"get" as &[u8], b"a", b"b"]);
        assert!(cl.rest().is_none());
    }

    #[test]
    fn test_tokenize_empty_line() {
        let cl = CommandLine::tokenize(b"");
        assert_eq!(cl.count(), 0);
        assert_eq!(cl.ntokens(), 1);
        assert!(cl.rest().is_none());
    }

    #[test]
    fn test_tokenize_token_limit_keeps_rest() {
        let cl = CommandLine::tokenize(b"get k1 k2 k3 k4 k5 k6 k7 k8 k9");
        assert_eq!(cl.count(), MAX_TOKENS - 1);
        assert_eq!(cl.token(0), b"get");
        assert_eq!(cl.token(6), b"k6");
        let rest = cl.rest().unwrap();
        assert_eq!(rest, b"k7 k8 k9");

        let cont = CommandLine::tokenize(rest);
        assert_eq!(cont.tokens(), &[b"k7" as &[u8], b"k8", b"k9"]);
        assert!(cont.rest().is_none());
    }

    #[test]
    fn test_tokenize_limit_at_line_end() {
        let cl = CommandLine::tokenize(b"get k1 k2 k3 k4 k5 k6");
        assert_eq!(cl.count(), 7);
        assert!(cl.rest().is_none());
    }

    #[test]
    fn test_numeric_parsing_rejects_garbage() {
        assert_eq!(parse_u64(b"184"), Some(184));
        assert_eq!(parse_u64(b"12abc"), None);
        assert_eq!(parse_u64(b"-1"), None);
        assert_eq!(parse_u64(b""), None);
        assert_eq!(parse_i32(b"-5"), Some(-5));
        assert_eq!(parse_u64(b"99999999999999999999999"), None);
    }
}
