use core::fmt::{self, Display, Formatter};

use postern_common::envelope::is_valid_mailbox;
use thiserror::Error;

/// A command line that could not be turned into a [`Command`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Answered with `500`.
    #[error("command not recognised")]
    Unrecognised(String),

    /// Answered with `501`.
    #[error("{0}")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// An empty sender is the null reverse-path, `MAIL FROM:<>`.
    MailFrom {
        sender: String,
        size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(id) => write!(fmt, "HELO {id}"),
            Self::Ehlo(id) => write!(fmt, "EHLO {id}"),
            Self::MailFrom { sender, size: None } => write!(fmt, "MAIL FROM:<{sender}>"),
            Self::MailFrom {
                sender,
                size: Some(size),
            } => write!(fmt, "MAIL FROM:<{sender}> SIZE={size}"),
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
        }
    }
}

/// Strip a case-insensitive `prefix` from the start of `line`.
fn strip_verb<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &line[prefix.len()..])
}

/// Split `<path> params` (angle brackets optional) into the mailbox and the
/// remaining parameter string.
fn parse_path(argument: &str) -> Result<(&str, &str), CommandError> {
    let argument = argument.trim_start();

    if let Some(inner) = argument.strip_prefix('<') {
        let (path, rest) = inner
            .split_once('>')
            .ok_or_else(|| CommandError::Syntax("unterminated path".to_string()))?;
        return Ok((path.trim(), rest.trim()));
    }

    Ok(argument
        .split_once(char::is_whitespace)
        .map_or((argument.trim(), ""), |(path, rest)| (path, rest.trim())))
}

/// `MAIL FROM` parameters. Only `SIZE` is interpreted; others such as
/// `BODY=8BITMIME` are accepted and ignored.
fn parse_size(params: &str) -> Result<Option<usize>, CommandError> {
    let mut size = None;

    for param in params.split_whitespace() {
        let Some(value) = strip_verb(param, "SIZE=") else {
            continue;
        };

        if size.is_some() {
            return Err(CommandError::Syntax("duplicate SIZE parameter".to_string()));
        }

        size = Some(
            value
                .parse::<usize>()
                .ok()
                .filter(|&size| size > 0)
                .ok_or_else(|| CommandError::Syntax(format!("invalid SIZE value {value:?}")))?,
        );
    }

    Ok(size)
}

fn hostname(verb: &str, argument: &str) -> Result<String, CommandError> {
    let host = argument.trim();
    if host.is_empty() {
        Err(CommandError::Syntax(format!("{verb} requires a domain")))
    } else {
        Ok(host.to_string())
    }
}

fn no_argument(command: Command, argument: &str) -> Result<Command, CommandError> {
    if argument.trim().is_empty() {
        Ok(command)
    } else {
        Err(CommandError::Syntax(format!("{command} takes no arguments")))
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();

        if let Some(argument) = strip_verb(line, "MAIL FROM:") {
            let (sender, params) = parse_path(argument)?;
            if !sender.is_empty() && !is_valid_mailbox(sender) {
                return Err(CommandError::Syntax(format!("bad sender address {sender:?}")));
            }

            return Ok(Self::MailFrom {
                sender: sender.to_string(),
                size: parse_size(params)?,
            });
        }

        if let Some(argument) = strip_verb(line, "RCPT TO:") {
            let (recipient, _) = parse_path(argument)?;
            if !is_valid_mailbox(recipient) {
                return Err(CommandError::Syntax(format!(
                    "bad recipient address {recipient:?}"
                )));
            }

            return Ok(Self::RcptTo(recipient.to_string()));
        }

        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => hostname("HELO", argument).map(Self::Helo),
            "EHLO" => hostname("EHLO", argument).map(Self::Ehlo),
            "DATA" => no_argument(Self::Data, argument),
            "RSET" => no_argument(Self::Rset, argument),
            "QUIT" => no_argument(Self::Quit, argument),
            "STARTTLS" => no_argument(Self::StartTls, argument),
            "NOOP" => Ok(Self::Noop),
            "MAIL" | "RCPT" => Err(CommandError::Syntax(format!(
                "expected {}",
                if verb.eq_ignore_ascii_case("MAIL") {
                    "MAIL FROM:<address>"
                } else {
                    "RCPT TO:<address>"
                }
            ))),
            _ => Err(CommandError::Unrecognised(line.to_string())),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = CommandError;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(line).map_or_else(
            |_| Err(CommandError::Syntax("command is not valid UTF-8".to_string())),
            Self::try_from,
        )
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Command, CommandError};

    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    #[test]
    fn mail_from_command() {
        assert_eq!(
            Command::try_from("MAIL FROM:<test@gmail.com>"),
            Ok(Command::MailFrom {
                sender: "test@gmail.com".to_string(),
                size: None
            })
        );
        assert_eq!(
            Command::try_from("Mail From: test@gmail.com"),
            Ok(Command::MailFrom {
                sender: "test@gmail.com".to_string(),
                size: None
            })
        );
        assert_eq!(
            Command::try_from("MAIL FROM:<>"),
            Ok(Command::MailFrom {
                sender: String::new(),
                size: None
            })
        );
        assert_eq!(
            Command::try_from("MAIL FROM:<a@b.test> size=1000 BODY=8BITMIME"),
            Ok(Command::MailFrom {
                sender: "a@b.test".to_string(),
                size: Some(1000)
            })
        );

        for comm in string_casing("mail from") {
            assert!(matches!(
                Command::try_from(format!("{comm}:<test@gmail.com>").as_str()),
                Ok(Command::MailFrom { .. })
            ));
        }
    }

    #[test]
    fn mail_from_errors() {
        for line in [
            "MAIL FROM:dasdas",
            "MAIL FROM:<a@b.test",
            "MAIL FROM:<a@b.test> SIZE=0",
            "MAIL FROM:<a@b.test> SIZE=abc",
            "MAIL FROM:<a@b.test> SIZE=1 SIZE=2",
            "MAIL dasdas",
        ] {
            assert!(
                matches!(Command::try_from(line), Err(CommandError::Syntax(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn rcpt_to_command() {
        assert_eq!(
            Command::try_from("RCPT TO:<test@gmail.com> NOTIFY=NEVER"),
            Ok(Command::RcptTo("test@gmail.com".to_string()))
        );

        assert!(Command::try_from("Rcpt To:").is_err());
        assert!(Command::try_from("RCPT TO:<>").is_err());
        assert!(Command::try_from("RCPT TO:dasdsa").is_err());

        for comm in string_casing("rcpt to") {
            assert!(matches!(
                Command::try_from(format!("{comm}: test@gmail.com").as_str()),
                Ok(Command::RcptTo(_))
            ));
        }
    }

    #[test]
    fn simple_commands() {
        assert_eq!(
            Command::try_from("ehlo client.test"),
            Ok(Command::Ehlo("client.test".to_string()))
        );
        assert_eq!(
            Command::try_from("HELO client.test"),
            Ok(Command::Helo("client.test".to_string()))
        );
        assert!(matches!(Command::try_from("EHLO"), Err(CommandError::Syntax(_))));

        assert_eq!(Command::try_from("data"), Ok(Command::Data));
        assert_eq!(Command::try_from("RSET"), Ok(Command::Rset));
        assert_eq!(Command::try_from("NOOP anything"), Ok(Command::Noop));
        assert_eq!(Command::try_from("QUIT"), Ok(Command::Quit));
        assert_eq!(Command::try_from("StartTLS"), Ok(Command::StartTls));
        assert!(matches!(Command::try_from("DATA now"), Err(CommandError::Syntax(_))));

        assert!(matches!(
            Command::try_from("VRFY someone"),
            Err(CommandError::Unrecognised(_))
        ));
        assert!(matches!(
            Command::try_from(&b"\xff\xfe"[..]),
            Err(CommandError::Syntax(_))
        ));
    }
}
