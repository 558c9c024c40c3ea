//! Command-line preparation for process execution.
//!
//! Commands containing shell operators are handed to `sh -c` verbatim;
//! anything else is tokenised here with quote handling so we don't pay for a
//! shell (or inherit its signal semantics) on the common path.

use crate::error::{Error, Result};

/// Operators that force the command through `sh -c`.
const SHELL_OPERATORS: &[&str] = &["&&", "|", ">", "<", ";", "$"];

/// Whether the command needs a shell to interpret it.
pub fn needs_shell(command: &str) -> bool {
    SHELL_OPERATORS.iter().any(|op| command.contains(op))
}

/// The program and arguments to spawn for a command line.
///
/// Shell-operator commands become `["sh", "-c", command]`; everything else is
/// split by [`split_command`].
pub fn prepare(command: &str) -> Result<Vec<String>> {
    if command.trim().is_empty() {
        return Err(Error::invalid_argument("command must not be empty"));
    }
    if needs_shell(command) {
        return Ok(vec!["sh".into(), "-c".into(), command.into()]);
    }
    let argv = split_command(command)?;
    if argv.is_empty() {
        return Err(Error::invalid_argument("command must not be empty"));
    }
    Ok(argv)
}

/// Split a command line into arguments, respecting single and double quotes.
///
/// Quoted sections are literal (no escape processing); unquoted whitespace
/// separates arguments.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;

    for ch in command.chars() {
        match quote {
            Quote::None => match ch {
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        argv.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
            Quote::Single => match ch {
                '\'' => quote = Quote::None,
                c => current.push(c),
            },
            Quote::Double => match ch {
                '"' => quote = Quote::None,
                c => current.push(c),
            },
        }
    }

    if quote != Quote::None {
        return Err(Error::invalid_argument(format!(
            "unterminated quote in command: {command}"
        )));
    }
    if in_token {
        argv.push(current);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;

    #[test_case("ls -la && echo done"; "and chain")]
    #[test_case("cat foo | grep bar"; "pipe")]
    #[test_case("echo hi > out.txt"; "redirect out")]
    #[test_case("wc -l < in.txt"; "redirect in")]
    #[test_case("true; false"; "sequence")]
    #[test_case("echo $HOME"; "variable")]
    #[test]
    fn shell_operators_are_detected(command: &str) {
        assert!(needs_shell(command));
    }

    #[test]
    fn plain_commands_do_not_need_shell() {
        assert!(!needs_shell("echo hello world"));
        assert!(!needs_shell("python3 -m http.server 8080"));
        // A lone ampersand is not one of the recognised operators.
        assert!(!needs_shell("magick a.png b&w.png"));
    }

    #[test]
    fn prepare_wraps_shell_commands() {
        let argv = prepare("echo a && echo b").expect("prepare");
        assert_eq!(argv, vec!["sh", "-c", "echo a && echo b"]);
    }

    #[test]
    fn prepare_rejects_empty_commands() {
        assert!(prepare("").is_err());
        assert!(prepare("   ").is_err());
    }

    #[test]
    fn split_respects_quotes() {
        let argv = split_command(r#"echo "hello world" 'single  spaced' plain"#).expect("split");
        assert_eq!(argv, vec!["echo", "hello world", "single  spaced", "plain"]);
    }

    #[test]
    fn split_treats_quoted_sections_as_literal() {
        let argv = split_command(r#"printf '%s\n' "a'b""#).expect("split");
        assert_eq!(argv, vec!["printf", r"%s\n", "a'b"]);
    }

    #[test]
    fn split_joins_adjacent_quoted_segments() {
        let argv = split_command(r#"echo fo"o b"ar"#).expect("split");
        assert_eq!(argv, vec!["echo", "foo bar"]);
    }

    #[test]
    fn split_rejects_unterminated_quotes() {
        assert!(split_command(r#"echo "oops"#).is_err());
        assert!(split_command("echo 'oops").is_err());
    }

    #[test]
    fn split_handles_empty_quoted_argument() {
        let argv = split_command(r#"run "" next"#).expect("split");
        assert_eq!(argv, vec!["run", "", "next"]);
    }
}
