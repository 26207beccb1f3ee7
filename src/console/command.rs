//! Line commands understood by the phone console.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneCommand {
    Call(String),
    Accept,
    Reject,
    Hangup,
    Mute,
    Unmute,
    /// `None` flips the current route.
    Speaker(Option<bool>),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("usage: call <peer-id>")]
    MissingPeer,

    #[error("usage: speaker [on|off]")]
    BadSpeaker,
}

impl PhoneCommand {
    /// Parse one input line. Blank lines give `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "call" | "dial" => PhoneCommand::Call(arg.ok_or(ParseError::MissingPeer)?.to_string()),
            "accept" | "answer" | "a" => PhoneCommand::Accept,
            "reject" | "decline" | "r" => PhoneCommand::Reject,
            "hangup" | "end" | "h" => PhoneCommand::Hangup,
            "mute" | "m" => PhoneCommand::Mute,
            "unmute" | "u" => PhoneCommand::Unmute,
            "speaker" | "s" => match arg {
                None => PhoneCommand::Speaker(None),
                Some("on") => PhoneCommand::Speaker(Some(true)),
                Some("off") => PhoneCommand::Speaker(Some(false)),
                Some(_) => return Err(ParseError::BadSpeaker),
            },
            "status" => PhoneCommand::Status,
            "help" | "?" => PhoneCommand::Help,
            "quit" | "exit" | "q" => PhoneCommand::Quit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(Some(cmd))
    }
}

pub const HELP: &str = "\
Commands:
  call <peer>       place a call
  accept | reject   answer or decline the ringing call
  hangup            end the current call
  mute | unmute     microphone
  speaker [on|off]  audio route (no argument toggles)
  status            show the current call
  quit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        assert_eq!(
            PhoneCommand::parse("call bob").unwrap(),
            Some(PhoneCommand::Call("bob".into()))
        );
        assert_eq!(
            PhoneCommand::parse("  DIAL  alice ").unwrap(),
            Some(PhoneCommand::Call("alice".into()))
        );
        assert_eq!(PhoneCommand::parse("call"), Err(ParseError::MissingPeer));
    }

    #[test]
    fn test_parse_blank_and_unknown() {
        assert_eq!(PhoneCommand::parse("").unwrap(), None);
        assert_eq!(PhoneCommand::parse("   ").unwrap(), None);
        assert_eq!(
            PhoneCommand::parse("ring"),
            Err(ParseError::Unknown("ring".into()))
        );
    }

    #[test]
    fn test_parse_speaker() {
        assert_eq!(
            PhoneCommand::parse("speaker").unwrap(),
            Some(PhoneCommand::Speaker(None))
        );
        assert_eq!(
            PhoneCommand::parse("speaker on").unwrap(),
            Some(PhoneCommand::Speaker(Some(true)))
        );
        assert_eq!(
            PhoneCommand::parse("s off").unwrap(),
            Some(PhoneCommand::Speaker(Some(false)))
        );
        assert_eq!(PhoneCommand::parse("speaker loud"), Err(ParseError::BadSpeaker));
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!(PhoneCommand::parse("a").unwrap(), Some(PhoneCommand::Accept));
        assert_eq!(PhoneCommand::parse("r").unwrap(), Some(PhoneCommand::Reject));
        assert_eq!(PhoneCommand::parse("h").unwrap(), Some(PhoneCommand::Hangup));
        assert_eq!(PhoneCommand::parse("q").unwrap(), Some(PhoneCommand::Quit));
    }
}
