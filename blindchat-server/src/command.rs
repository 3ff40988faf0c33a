/// Command parsing for slash commands sent in a private chat
use std::fmt;

/// A parsed chat command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// First contact, shows the welcome notice
    Start,
    /// Start searching for a partner
    Chat,
    /// Leave the current chat
    Exit,
    /// Leave the current chat and immediately search again
    NewChat,
    /// Usage statistics, admin only
    Stats,
    /// Any other slash command
    Unknown(String),
}

impl fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatCommand::Start => write!(f, "/start"),
            ChatCommand::Chat => write!(f, "/chat"),
            ChatCommand::Exit => write!(f, "/exit"),
            ChatCommand::NewChat => write!(f, "/newchat"),
            ChatCommand::Stats => write!(f, "/stats"),
            ChatCommand::Unknown(name) => write!(f, "/{}", name),
        }
    }
}

/// Result of parsing a message for commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// The message is a command
    Command(ChatCommand),
    /// The message is ordinary content and should be relayed
    NotCommand,
}

/// Parse a message text for a slash command.
///
/// Only the first word counts. A `/name@bot` suffix is accepted when it names
/// this bot (case-insensitive); a command addressed to another bot is treated
/// as ordinary text.
pub fn parse_message(text: &str, bot_username: Option<&str>) -> ParseResult {
    let Some(first_word) = text.split_whitespace().next() else {
        return ParseResult::NotCommand;
    };
    let Some(command) = first_word.strip_prefix('/') else {
        return ParseResult::NotCommand;
    };

    let (name, addressee) = match command.split_once('@') {
        Some((name, addressee)) => (name, Some(addressee)),
        None => (command, None),
    };

    if let (Some(addressee), Some(username)) = (addressee, bot_username) {
        if !addressee.eq_ignore_ascii_case(username) {
            return ParseResult::NotCommand;
        }
    }

    if name.is_empty() {
        return ParseResult::NotCommand;
    }

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => ChatCommand::Start,
        "chat" => ChatCommand::Chat,
        "exit" => ChatCommand::Exit,
        "newchat" => ChatCommand::NewChat,
        "stats" => ChatCommand::Stats,
        _ => ChatCommand::Unknown(name.to_string()),
    };
    ParseResult::Command(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(
            parse_message("/chat", None),
            ParseResult::Command(ChatCommand::Chat)
        );
        assert_eq!(
            parse_message("/exit", None),
            ParseResult::Command(ChatCommand::Exit)
        );
        assert_eq!(
            parse_message("/newchat", None),
            ParseResult::Command(ChatCommand::NewChat)
        );
        assert_eq!(
            parse_message("/stats", None),
            ParseResult::Command(ChatCommand::Stats)
        );
        assert_eq!(
            parse_message("/start", None),
            ParseResult::Command(ChatCommand::Start)
        );
    }

    #[test]
    fn test_parse_is_case_insensitive_and_trims() {
        assert_eq!(
            parse_message("  /CHAT please", None),
            ParseResult::Command(ChatCommand::Chat)
        );
    }

    #[test]
    fn test_parse_with_bot_suffix() {
        assert_eq!(
            parse_message("/exit@BlindChatBot", Some("blindchatbot")),
            ParseResult::Command(ChatCommand::Exit)
        );
        assert_eq!(
            parse_message("/exit@SomeOtherBot", Some("blindchatbot")),
            ParseResult::NotCommand
        );
        // Without a known username any addressee is accepted.
        assert_eq!(
            parse_message("/exit@SomeOtherBot", None),
            ParseResult::Command(ChatCommand::Exit)
        );
    }

    #[test]
    fn test_parse_plain_text() {
        assert_eq!(parse_message("hello", None), ParseResult::NotCommand);
        assert_eq!(parse_message("", None), ParseResult::NotCommand);
        assert_eq!(parse_message("   ", None), ParseResult::NotCommand);
        assert_eq!(parse_message("let's chat /chat", None), ParseResult::NotCommand);
        assert_eq!(parse_message("/", None), ParseResult::NotCommand);
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            parse_message("/help", None),
            ParseResult::Command(ChatCommand::Unknown("help".to_string()))
        );
    }

    #[test]
    fn test_display_round_trips_known_commands() {
        for command in [
            ChatCommand::Start,
            ChatCommand::Chat,
            ChatCommand::Exit,
            ChatCommand::NewChat,
            ChatCommand::Stats,
        ] {
            assert_eq!(
                parse_message(&command.to_string(), None),
                ParseResult::Command(command)
            );
        }
    }
}
