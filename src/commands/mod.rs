pub mod del;
pub mod executable;
pub mod exists;
pub mod get;
pub mod hdel;
pub mod hget;
pub mod hgetall;
pub mod hset;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use strum_macros::IntoStaticStr;
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

use del::Del;
use exists::Exists;
use get::Get;
use hdel::Hdel;
use hget::Hget;
use hgetall::Hgetall;
use hset::Hset;
use ping::Ping;
use set::Set;

/// Commands that change the database. Only these are appended to the AOF.
pub const WRITE_COMMANDS: [&str; 4] = ["SET", "DEL", "HSET", "HDEL"];

#[derive(Debug, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Del(Del),
    Exists(Exists),
    Get(Get),
    Hdel(Hdel),
    Hget(Hget),
    Hgetall(Hgetall),
    Hset(Hset),
    Ping(Ping),
    Set(Set),
}

impl Command {
    /// The upper-cased command name, e.g. `HGETALL`.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn is_write(&self) -> bool {
        WRITE_COMMANDS.contains(&self.name())
    }
}

impl Executable for Command {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        match self {
            Command::Del(cmd) => cmd.exec(store),
            Command::Exists(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Hdel(cmd) => cmd.exec(store),
            Command::Hget(cmd) => cmd.exec(store),
            Command::Hgetall(cmd) => cmd.exec(store),
            Command::Hset(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandParserError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => {
                return Err(CommandParserError::InvalidFrame {
                    expected: "array".to_string(),
                    actual: frame,
                })
            }
        };

        let parser = &mut CommandParser {
            parts: frames.into_iter(),
        };

        let command_name = parser.parse_command_name()?;

        let command = match &command_name[..] {
            "del" => Del::try_from(parser).map(Command::Del),
            "exists" => Exists::try_from(parser).map(Command::Exists),
            "get" => Get::try_from(parser).map(Command::Get),
            "hdel" => Hdel::try_from(parser).map(Command::Hdel),
            "hget" => Hget::try_from(parser).map(Command::Hget),
            "hgetall" => Hgetall::try_from(parser).map(Command::Hgetall),
            "hset" => Hset::try_from(parser).map(Command::Hset),
            "ping" => Ping::try_from(parser).map(Command::Ping),
            "set" => Set::try_from(parser).map(Command::Set),
            _ => {
                return Err(CommandParserError::UnknownCommand {
                    command: command_name.to_uppercase(),
                })
            }
        };

        // Running out of arguments, or having some left over, is an arity problem of this
        // particular command.
        command.map_err(|err| match err {
            CommandParserError::EndOfStream | CommandParserError::TrailingArguments => {
                CommandParserError::WrongNumberOfArguments {
                    command: command_name,
                }
            }
            err => err,
        })
    }
}

pub struct CommandParser {
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    fn parse_command_name(&mut self) -> Result<String, CommandParserError> {
        let command_name = self
            .parts
            .next()
            .ok_or(CommandParserError::EmptyCommand)?;

        match command_name {
            Frame::Simple(s) => Ok(s.to_lowercase()),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_lowercase())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_string(&mut self) -> Result<String, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or(CommandParserError::EndOfStream)?;

        match frame {
            // Both `Simple` and `Bulk` representation may be strings. Strings are parsed to UTF-8.
            // While errors are stored as strings, they are considered separate types.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_string())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or(CommandParserError::EndOfStream)?;

        match frame {
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    /// Collects the remaining arguments as strings, requiring at least one.
    fn remaining_strings(&mut self) -> Result<Vec<String>, CommandParserError> {
        let mut strings = vec![];

        loop {
            match self.next_string() {
                Ok(string) => strings.push(string),
                Err(CommandParserError::EndOfStream) if !strings.is_empty() => break,
                Err(err) => return Err(err),
            }
        }

        Ok(strings)
    }

    /// Fails if any argument was left unconsumed.
    fn finish(&mut self) -> Result<(), CommandParserError> {
        if self.parts.len() > 0 {
            return Err(CommandParserError::TrailingArguments);
        }
        Ok(())
    }
}

/// Problems with a client request. None of them close the connection, they are sent back to the
/// client as an error reply.
#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("ERR protocol error; invalid frame, expected {expected}, got {actual}")]
    InvalidFrame { expected: String, actual: Frame },
    #[error("ERR protocol error; empty command")]
    EmptyCommand,
    #[error("ERR unknown command '{command}'")]
    UnknownCommand { command: String },
    #[error("ERR wrong number of arguments for '{command}' command")]
    WrongNumberOfArguments { command: String },
    #[error("ERR invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("ERR attempting to extract a value failed due to the frame being fully consumed")]
    EndOfStream,
    #[error("ERR unexpected trailing arguments")]
    TrailingArguments,
}

impl From<CommandParserError> for Frame {
    fn from(err: CommandParserError) -> Self {
        Frame::Error(err.to_string())
    }
}
