//! Parsing of inbound message bodies into commands or free-form input.

/// Parses message content into a [`Submission`].
pub struct SubmissionParser;

impl SubmissionParser {
    pub fn parse(content: &str) -> Submission {
        let trimmed = content.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Submission::user_input(content);
        };

        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        // Telegram group chats address commands as `/cmd@BotName`.
        let command = head.split('@').next().unwrap_or(head).to_lowercase();

        match command.as_str() {
            "register" | "name" => Submission::Register {
                name: args.to_string(),
            },
            "whoami" => Submission::WhoAmI,
            "reset" | "clear" => Submission::Reset,
            "help" | "start" | "?" => Submission::Help,
            _ => Submission::user_input(content),
        }
    }
}

/// What a message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Text for the answering assistant.
    UserInput { content: String },

    /// Store a display name. `name` may be empty, which is a usage error.
    Register { name: String },

    /// Report the registered display name.
    WhoAmI,

    /// Forget the conversation state.
    Reset,

    /// List the commands.
    Help,
}

impl Submission {
    pub fn user_input(content: impl Into<String>) -> Self {
        Self::UserInput {
            content: content.into(),
        }
    }

    /// Whether this submission goes to the answering assistant.
    pub fn is_user_input(&self) -> bool {
        matches!(self, Self::UserInput { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_user_input() {
        let submission = SubmissionParser::parse("Hello, how are you?");
        assert!(submission.is_user_input());
        assert!(
            matches!(submission, Submission::UserInput { content } if content == "Hello, how are you?")
        );
    }

    #[test]
    fn test_parser_register() {
        assert_eq!(
            SubmissionParser::parse("/register Maria"),
            Submission::Register {
                name: "Maria".into()
            }
        );
        assert_eq!(
            SubmissionParser::parse("  /NAME   Maria Lopez  "),
            Submission::Register {
                name: "Maria Lopez".into()
            }
        );
    }

    #[test]
    fn test_parser_register_without_name() {
        assert_eq!(
            SubmissionParser::parse("/register"),
            Submission::Register { name: String::new() }
        );
    }

    #[test]
    fn test_parser_bot_suffix() {
        assert_eq!(
            SubmissionParser::parse("/whoami@relay_bot"),
            Submission::WhoAmI
        );
        assert_eq!(
            SubmissionParser::parse("/register@relay_bot Ana"),
            Submission::Register { name: "Ana".into() }
        );
    }

    #[test]
    fn test_parser_simple_commands() {
        assert_eq!(SubmissionParser::parse("/reset"), Submission::Reset);
        assert_eq!(SubmissionParser::parse("/clear"), Submission::Reset);
        assert_eq!(SubmissionParser::parse("/help"), Submission::Help);
        assert_eq!(SubmissionParser::parse("/start"), Submission::Help);
    }

    #[test]
    fn test_parser_unknown_command_is_input() {
        let submission = SubmissionParser::parse("/weather tomorrow");
        assert!(submission.is_user_input());
    }

    #[test]
    fn test_parser_slash_inside_text_is_input() {
        assert!(SubmissionParser::parse("either/or").is_user_input());
    }
}
