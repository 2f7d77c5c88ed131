//! C9: the wire protocol (spec.md §4.8).
//!
//! A line-oriented control channel with embedded length-prefixed binary payloads,
//! transport-neutral over stdio pipes and a demultiplexed TCP stream (spec.md §4.8,
//! last paragraph). [`frame`] has the low-level framing primitives; [`session`] is the
//! server-side dispatch loop (Design Notes item 3: an explicit per-connection session
//! object, not module globals); [`client`] is the matching driver-side encoder used by
//! [`crate::repo::RemoteRepository`].

pub mod client;
pub mod frame;
pub mod session;

pub use session::ServerSession;

/// One parsed control command (spec.md §4.8, plus the supplemented `list-refs` and
/// `rev-parse` entries from the source's `server-cmd.py`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    InitDir(String),
    SetDir(String),
    ListIndexes,
    SendIndex(String),
    ReceiveObjectsV2,
    ReadRef(String),
    UpdateRef { name: String, new_hex: String, old_hex: String },
    Cat(String),
    QuietMode(bool),
    ListRefs(Option<String>),
    RevParse(String),
}

/// Every command name the dispatch table recognizes, in the order `help` lists them.
pub const COMMAND_NAMES: &[&str] = &[
    "help",
    "quit",
    "init-dir",
    "set-dir",
    "list-indexes",
    "send-index",
    "receive-objects-v2",
    "read-ref",
    "update-ref",
    "cat",
    "quiet-mode",
    "list-refs",
    "rev-parse",
];

/// Splits a control line into shell-style words: whitespace-separated, with
/// single/double-quoted spans kept as one word (so a graft rule or path containing a
/// space can be passed as `init-dir "/a path/"`). There is no escape character; a
/// quote closes on the next matching quote.
pub fn split_args(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Parses a control-channel line (with `args` already following `read_line` for
/// multi-line commands like `update-ref`) into a [`Command`]. Returns `Ok(None)` for a
/// blank line (a no-op, as the source's server loop tolerates).
pub fn parse_command(words: &[String], extra_lines: &[String]) -> Result<Command, String> {
    let Some(name) = words.first() else { return Err("empty command".into()) };

    match name.as_str() {
        "help" => Ok(Command::Help),
        "quit" => Ok(Command::Quit),
        "init-dir" => words.get(1).cloned().map(Command::InitDir).ok_or_else(|| "init-dir requires a path".into()),
        "set-dir" => words.get(1).cloned().map(Command::SetDir).ok_or_else(|| "set-dir requires a path".into()),
        "list-indexes" => Ok(Command::ListIndexes),
        "send-index" => words.get(1).cloned().map(Command::SendIndex).ok_or_else(|| "send-index requires a name".into()),
        "receive-objects-v2" => Ok(Command::ReceiveObjectsV2),
        "read-ref" => words.get(1).cloned().map(Command::ReadRef).ok_or_else(|| "read-ref requires a name".into()),
        "update-ref" => {
            let ref_name = words.get(1).cloned().ok_or("update-ref requires a name")?;
            let new_hex = extra_lines.first().cloned().ok_or("update-ref requires a new-hex line")?;
            let old_hex = extra_lines.get(1).cloned().ok_or("update-ref requires an old-hex line")?;
            Ok(Command::UpdateRef { name: ref_name, new_hex, old_hex })
        }
        "cat" => words.get(1).cloned().map(Command::Cat).ok_or_else(|| "cat requires an id".into()),
        "quiet-mode" => match words.get(1).map(String::as_str) {
            Some("on") => Ok(Command::QuietMode(true)),
            Some("off") => Ok(Command::QuietMode(false)),
            _ => Err("quiet-mode requires on|off".into()),
        },
        "list-refs" => Ok(Command::ListRefs(words.get(1).cloned())),
        "rev-parse" => words.get(1).cloned().map(Command::RevParse).ok_or_else(|| "rev-parse requires an argument".into()),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Commands whose parsing needs two additional lines beyond the first, read eagerly by
/// the session loop before calling [`parse_command`].
pub fn extra_line_count(first_word: &str) -> usize {
    match first_word {
        "update-ref" => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_spans_as_one_word() {
        let words = split_args(r#"init-dir "/a path/with spaces""#);
        assert_eq!(words, vec!["init-dir", "/a path/with spaces"]);
    }

    #[test]
    fn parses_update_ref_with_extra_lines() {
        let words = split_args("update-ref x");
        let extra = vec!["a".repeat(40), "b".repeat(40)];
        let cmd = parse_command(&words, &extra).unwrap();
        assert_eq!(
            cmd,
            Command::UpdateRef { name: "x".into(), new_hex: "a".repeat(40), old_hex: "b".repeat(40) }
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_command(&split_args("frobnicate"), &[]).is_err());
    }
}
