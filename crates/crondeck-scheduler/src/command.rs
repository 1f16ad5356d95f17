//! Split a command string into an argument vector the way a POSIX shell
//! would, without invoking one: no globbing, no variable expansion.

use crate::error::{Result, SchedulerError};

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Tokenize `line` into arguments.
///
/// Supports single quotes (literal), double quotes (with `\"`, `\\`, `\$`
/// and `` \` `` escapes) and backslash escapes outside quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    // distinguishes `''` (an empty argument) from no argument at all
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some('\n') => {}
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    in_word = true;
                    match chars.next() {
                        Some('\n') => {}
                        Some(next) => current.push(next),
                        None => {
                            return Err(SchedulerError::Command(format!(
                                "trailing backslash in {line:?}"
                            )))
                        }
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(SchedulerError::Command(format!(
            "unterminated quote in {line:?}"
        )));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}
