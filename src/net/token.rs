//! Command-line splitting: single-space delimiters, with `\` escaping the
//! byte after it (the escaped byte is never treated as a delimiter; both
//! bytes stay in the token).

pub const MAX_TOKENS: usize = 7;

/// Marker for the sentinel token when the line was consumed cleanly.
pub const TAIL_NONE: usize = usize::MAX;

/// A token is a range into the tokenised line. The final token returned is
/// always a sentinel of length 0: its `pos` is [`TAIL_NONE`] when the line
/// ended cleanly, or the index of the first unconsumed byte otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct Token {
    pub pos: usize,
    pub len: usize,
}

impl Token {
    /// The token's bytes within `line`.
    pub fn bytes<'a>(&self, line: &'a [u8]) -> &'a [u8] {
        &line[self.pos..self.pos + self.len]
    }
}

/// Split `line` into at most `tokens.len() - 1` real tokens plus the
/// sentinel. Returns the total token count, sentinel included.
pub fn tokenize(line: &[u8], tokens: &mut [Token]) -> usize {
    let mtokens = tokens.len();
    let mut ntokens = 0;

    let mut s = 0;
    let mut e = 0;
    let mut esc = false;

    while ntokens < mtokens - 1 {
        if e >= line.len() {
            if s != e {
                tokens[ntokens] = Token { pos: s, len: e - s };
                ntokens += 1;
            }
            break;
        }

        if esc {
            esc = false;
            e += 1;
            continue;
        }

        match line[e] {
            b' ' => {
                if s != e {
                    tokens[ntokens] = Token { pos: s, len: e - s };
                    ntokens += 1;
                }
                s = e + 1;
            }
            b'\\' => esc = true,
            _ => {}
        }
        e += 1;
    }

    tokens[ntokens] = Token {
        pos: if e >= line.len() { TAIL_NONE } else { e },
        len: 0,
    };
    ntokens += 1;

    ntokens
}

#[cfg(test)]
mod tests {
    use super::{tokenize, Token, MAX_TOKENS, TAIL_NONE};

    fn split(line: &[u8]) -> (Vec<Vec<u8>>, Token) {
        let mut tokens = [Token::default(); MAX_TOKENS];
        let n = tokenize(line, &mut tokens);
        let real = tokens[..n - 1]
            .iter()
            .map(|t| t.bytes(line).to_vec())
            .collect();
        (real, tokens[n - 1])
    }

    #[test]
    fn splits_on_single_spaces() {
        let (toks, tail) = split(b"set key 7 0 5");
        assert_eq!(toks, vec![b"set".to_vec(), b"key".to_vec(), b"7".to_vec(),
                              b"0".to_vec(), b"5".to_vec()]);
        assert_eq!(tail.pos, TAIL_NONE);
    }

    #[test]
    fn collapses_repeated_spaces() {
        let (toks, _) = split(b"get   key");
        assert_eq!(toks, vec![b"get".to_vec(), b"key".to_vec()]);
    }

    #[test]
    fn backslash_escapes_a_space() {
        let (toks, _) = split(br"get a\ b");
        assert_eq!(toks, vec![b"get".to_vec(), br"a\ b".to_vec()]);
    }

    #[test]
    fn sentinel_points_at_overflow() {
        // Six real tokens fit; the seventh slot is the sentinel and must
        // point at the unconsumed tail.
        let line = b"a b c d e f g";
        let mut tokens = [Token::default(); MAX_TOKENS];
        let n = tokenize(line, &mut tokens);
        assert_eq!(n, MAX_TOKENS);
        assert_ne!(tokens[n - 1].pos, TAIL_NONE);
        assert_eq!(&line[tokens[n - 1].pos..], b"g");
    }

    #[test]
    fn empty_line_yields_only_the_sentinel() {
        let (toks, tail) = split(b"");
        assert!(toks.is_empty());
        assert_eq!(tail.pos, TAIL_NONE);
    }
}
