/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Submit(String),
    Delete(String),
    /// `kind:id` of the context to switch to, optionally followed by a display name.
    Join(String),
    Quit,
    Help,
    Empty,
}

pub const HELP: &str = "type a message and press enter; /delete <entry-id> removes one of your messages; /join <room|post>:<id> [name] switches rooms; /quit leaves";

impl InputCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }

        match trimmed.split_once(char::is_whitespace) {
            Some(("/delete", rest)) => Self::Delete(rest.trim().to_string()),
            None if trimmed == "/delete" => Self::Delete(String::new()),
            Some(("/join", rest)) => Self::Join(rest.trim().to_string()),
            None if trimmed == "/join" => Self::Join(String::new()),
            None if trimmed == "/quit" || trimmed == "/exit" => Self::Quit,
            None if trimmed == "/help" => Self::Help,
            _ => Self::Submit(line.to_string()),
        }
    }
}
