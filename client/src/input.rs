//! Command line parsing for the interactive prompt

use shared::world::Direction;
use shared::{is_valid_message, is_valid_name, MAX_MSG_LENGTH};

pub const COMMANDS: [&str; 6] = ["login", "move", "attack", "speak", "logout", "map"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Move(Direction),
    Attack(String),
    Speak(String),
    Logout,
    /// Prints the grid with every known player
    Map,
}

/// Why a line was rejected. Nothing is sent for a rejected line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    InvalidCommand(String),
    InvalidName(String),
    InvalidMessage,
    InvalidSyntax,
    InvalidDirection(String),
}

/// Parses one line typed at the prompt.
///
/// The first word names the command and the second its argument. `speak`
/// takes the rest of the line verbatim.
pub fn parse_command(line: &str) -> Result<Command, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Err(InputError::InvalidCommand(line.to_string()));
    };
    let argument = words.next();

    match name {
        "logout" => Ok(Command::Logout),
        "map" => Ok(Command::Map),
        "speak" => {
            let text = line
                .trim_start()
                .strip_prefix("speak")
                .and_then(|rest| rest.strip_prefix(' '))
                .unwrap_or_default();
            if text.len() > MAX_MSG_LENGTH || !is_valid_message(text) {
                return Err(InputError::InvalidMessage);
            }
            Ok(Command::Speak(text.to_string()))
        }
        "login" | "move" | "attack" => {
            let argument = argument.ok_or(InputError::InvalidSyntax)?;
            match name {
                "move" => Direction::parse(argument)
                    .map(Command::Move)
                    .ok_or_else(|| InputError::InvalidDirection(argument.to_string())),
                _ if !is_valid_name(argument) => {
                    Err(InputError::InvalidName(argument.to_string()))
                }
                "login" => Ok(Command::Login(argument.to_string())),
                _ => Ok(Command::Attack(argument.to_string())),
            }
        }
        other => Err(InputError::InvalidCommand(other.to_string())),
    }
}
