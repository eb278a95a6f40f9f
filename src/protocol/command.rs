//! Parsed commands and the arity-based dispatch table.

use super::tokenizer::{tokenize, Token};
use bytes::Bytes;

pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        keys: Vec<Bytes>,
    },
    Set {
        key: Bytes,
        flag: u32,
        ver: i64,
        len: i32,
        noreply: bool,
    },
    Append {
        key: Bytes,
        flag: u32,
        ver: i64,
        len: i32,
        noreply: bool,
    },
    Incr {
        key: Bytes,
        delta: i64,
        noreply: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Stats {
        reset: bool,
    },
    FlushAll {
        limit: Option<u64>,
        tree: Option<u32>,
        noreply: bool,
    },
    OptimizeStat,
    Verbosity {
        level: i64,
    },
    Version,
    Quit,
    StopMe,
}

/// A recognized command shape that still requires reading a value body
/// (`set`/`append`) before it can be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCommandKind {
    Set,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Maps to `CLIENT_ERROR <msg>\r\n`; connection stays open.
    ClientError(&'static str),
    /// Unrecognized command shape: `ERROR\r\n`.
    Unknown,
}

impl ParseError {
    pub fn message(&self) -> String {
        match self {
            ParseError::ClientError(msg) => format!("CLIENT_ERROR {msg}\r\n"),
            ParseError::Unknown => "ERROR\r\n".to_string(),
        }
    }
}

const BAD_FORMAT: ParseError = ParseError::ClientError("bad command line format");

/// Parses one complete line (without the trailing CRLF) into a `Command`.
///
/// `set`/`append` parse only the header here; the caller is responsible for
/// transitioning to `nread` to read the value body, then calling
/// `Command::Set`/`Command::Append`'s stored `len` against the bytes that
/// follow.
pub fn parse(line: &[u8]) -> Result<Command, ParseError> {
    let tokens = tokenize(line);
    let ntokens = tokens.len();
    if ntokens < 2 {
        return Err(ParseError::Unknown);
    }
    let cmd = tokens[0].slice(line);

    match cmd {
        b"get" => parse_get(line, &tokens),
        b"set" => parse_storage(line, &tokens, DataCommandKind::Set),
        b"append" => parse_storage(line, &tokens, DataCommandKind::Append),
        b"incr" => parse_incr(line, &tokens),
        b"delete" => parse_delete(line, &tokens),
        b"stats" => parse_stats(line, &tokens),
        b"flush_all" => parse_flush_all(line, &tokens),
        b"optimize_stat" if ntokens == 2 => Ok(Command::OptimizeStat),
        b"verbosity" => parse_verbosity(line, &tokens),
        b"version" if ntokens == 2 => Ok(Command::Version),
        b"quit" if ntokens == 2 => Ok(Command::Quit),
        b"stopme" if ntokens == 2 => Ok(Command::StopMe),
        _ => Err(ParseError::Unknown),
    }
}

/// `noreply` is the literal second-to-last non-terminal token.
fn has_noreply(line: &[u8], tokens: &[Token]) -> bool {
    let ntokens = tokens.len();
    if ntokens < 3 {
        return false;
    }
    tokens[ntokens - 2].slice(line) == b"noreply"
}

fn check_key_len(key: &[u8]) -> Result<(), ParseError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        Err(BAD_FORMAT)
    } else {
        Ok(())
    }
}

fn parse_get(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    if tokens.len() < 3 {
        return Err(BAD_FORMAT);
    }
    let mut keys = Vec::new();
    for tok in &tokens[1..tokens.len() - 1] {
        let key = tok.slice(line);
        check_key_len(key)?;
        keys.push(Bytes::copy_from_slice(key));
    }
    // The tokenizer caps at MAX_TOKENS; a `get` with more keys than that
    // continues tokenizing the remainder pointed at by the terminator.
    let terminator = tokens.last().unwrap();
    if terminator.offset < line.len() {
        let rest = &line[terminator.offset..];
        if let Command::Get { keys: more } = parse_get_rest(rest)? {
            keys.extend(more);
        }
    }
    if keys.is_empty() {
        return Err(BAD_FORMAT);
    }
    Ok(Command::Get { keys })
}

fn parse_get_rest(rest: &[u8]) -> Result<Command, ParseError> {
    let tokens = tokenize(rest);
    let mut keys = Vec::new();
    for tok in &tokens[..tokens.len().saturating_sub(1)] {
        let key = tok.slice(rest);
        check_key_len(key)?;
        keys.push(Bytes::copy_from_slice(key));
    }
    let terminator = tokens.last().unwrap();
    if terminator.offset < rest.len() {
        if let Command::Get { keys: more } = parse_get_rest(&rest[terminator.offset..])? {
            keys.extend(more);
        }
    }
    Ok(Command::Get { keys })
}

fn parse_storage(
    line: &[u8],
    tokens: &[Token],
    kind: DataCommandKind,
) -> Result<Command, ParseError> {
    let ntokens = tokens.len();
    if ntokens != 6 && ntokens != 7 {
        return Err(BAD_FORMAT);
    }
    let key = tokens[1].slice(line);
    check_key_len(key)?;
    let flag: u32 = parse_num(tokens[2].slice(line))?;
    let ver: i64 = parse_num(tokens[3].slice(line))?;
    let len: i32 = parse_num(tokens[4].slice(line))?;
    if len < 0 {
        return Err(BAD_FORMAT);
    }
    let noreply = ntokens == 7 && has_noreply(line, tokens);
    if ntokens == 7 && !noreply {
        return Err(BAD_FORMAT);
    }
    let key = Bytes::copy_from_slice(key);
    Ok(match kind {
        DataCommandKind::Set => Command::Set {
            key,
            flag,
            ver,
            len,
            noreply,
        },
        DataCommandKind::Append => Command::Append {
            key,
            flag,
            ver,
            len,
            noreply,
        },
    })
}

fn parse_incr(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    let ntokens = tokens.len();
    if ntokens != 4 && ntokens != 5 {
        return Err(BAD_FORMAT);
    }
    let key = tokens[1].slice(line);
    check_key_len(key)?;
    let delta: i64 = parse_num(tokens[2].slice(line))?;
    let noreply = ntokens == 5 && has_noreply(line, tokens);
    if ntokens == 5 && !noreply {
        return Err(BAD_FORMAT);
    }
    Ok(Command::Incr {
        key: Bytes::copy_from_slice(key),
        delta,
        noreply,
    })
}

fn parse_delete(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    let ntokens = tokens.len();
    if ntokens != 3 && ntokens != 4 {
        return Err(BAD_FORMAT);
    }
    let key = tokens[1].slice(line);
    check_key_len(key)?;
    let noreply = ntokens == 4 && has_noreply(line, tokens);
    if ntokens == 4 && !noreply {
        return Err(BAD_FORMAT);
    }
    Ok(Command::Delete {
        key: Bytes::copy_from_slice(key),
        noreply,
    })
}

fn parse_stats(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    let ntokens = tokens.len();
    if ntokens != 2 && ntokens != 3 {
        return Err(BAD_FORMAT);
    }
    let reset = ntokens == 3 && tokens[1].slice(line) == b"reset";
    if ntokens == 3 && !reset {
        return Err(BAD_FORMAT);
    }
    Ok(Command::Stats { reset })
}

/// `flush_all [LIMIT [TREE]] [noreply]`: `LIMIT` and `TREE` feed directly
/// into `hs_optimize(store, limit, tree)` — `LIMIT` bounds how much the
/// merge is allowed to do, `TREE` picks which bucket to merge rather than
/// letting the server sweep to the next one on its own.
fn parse_flush_all(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    let ntokens = tokens.len();
    if !(2..=4).contains(&ntokens) {
        return Err(BAD_FORMAT);
    }
    let noreply = ntokens >= 3 && has_noreply(line, tokens);
    let mut limit = None;
    let mut tree = None;
    if ntokens == 3 && !noreply {
        limit = Some(parse_num(tokens[1].slice(line))?);
    } else if ntokens == 4 {
        limit = Some(parse_num(tokens[1].slice(line))?);
        if !noreply {
            tree = Some(parse_num(tokens[2].slice(line))?);
        }
    }
    Ok(Command::FlushAll { limit, tree, noreply })
}

fn parse_verbosity(line: &[u8], tokens: &[Token]) -> Result<Command, ParseError> {
    if tokens.len() != 3 {
        return Err(BAD_FORMAT);
    }
    let level: i64 = parse_num(tokens[1].slice(line))?;
    Ok(Command::Verbosity { level })
}

fn parse_num<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, ParseError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or(BAD_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version() {
        assert_eq!(parse(b"version").unwrap(), Command::Version);
    }

    #[test]
    fn parses_simple_get() {
        let cmd = parse(b"get foo").unwrap();
        match cmd {
            Command::Get { keys } => assert_eq!(keys, vec![Bytes::from_static(b"foo")]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_multi_key_get() {
        let cmd = parse(b"get a b c").unwrap();
        match cmd {
            Command::Get { keys } => assert_eq!(keys.len(), 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_set_header_with_noreply() {
        let cmd = parse(b"set foo 7 0 5 noreply").unwrap();
        match cmd {
            Command::Set {
                key,
                flag,
                len,
                noreply,
                ..
            } => {
                assert_eq!(&key[..], b"foo");
                assert_eq!(flag, 7);
                assert_eq!(len, 5);
                assert!(noreply);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn negative_length_is_client_error() {
        assert_eq!(parse(b"set k 0 0 -1"), Err(BAD_FORMAT));
    }

    #[test]
    fn oversized_key_is_client_error() {
        let key = "k".repeat(300);
        let line = format!("set {key} 0 0 1");
        assert_eq!(parse(line.as_bytes()), Err(BAD_FORMAT));
    }

    #[test]
    fn unrecognized_command_is_unknown() {
        assert_eq!(parse(b"bogus foo bar"), Err(ParseError::Unknown));
    }

    #[test]
    fn delete_noreply_round_trips() {
        let cmd = parse(b"delete missing noreply").unwrap();
        match cmd {
            Command::Delete { key, noreply } => {
                assert_eq!(&key[..], b"missing");
                assert!(noreply);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn stats_reset_is_recognized() {
        assert_eq!(parse(b"stats reset").unwrap(), Command::Stats { reset: true });
    }

    #[test]
    fn flush_all_with_no_args_has_no_limit_or_tree() {
        assert_eq!(
            parse(b"flush_all").unwrap(),
            Command::FlushAll {
                limit: None,
                tree: None,
                noreply: false
            }
        );
    }

    #[test]
    fn flush_all_parses_limit_and_tree() {
        assert_eq!(
            parse(b"flush_all 100 3").unwrap(),
            Command::FlushAll {
                limit: Some(100),
                tree: Some(3),
                noreply: false
            }
        );
    }

    #[test]
    fn flush_all_parses_limit_with_noreply() {
        assert_eq!(
            parse(b"flush_all 100 noreply").unwrap(),
            Command::FlushAll {
                limit: Some(100),
                tree: None,
                noreply: true
            }
        );
    }

    #[test]
    fn flush_all_bare_noreply_has_no_limit() {
        assert_eq!(
            parse(b"flush_all noreply").unwrap(),
            Command::FlushAll {
                limit: None,
                tree: None,
                noreply: true
            }
        );
    }

    #[test]
    fn flush_all_rejects_non_numeric_limit() {
        assert_eq!(parse(b"flush_all abc"), Err(BAD_FORMAT));
    }
}
