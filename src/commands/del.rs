use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

// https://redis.io/commands/del
#[derive(Debug, PartialEq)]
pub struct Del {
    pub keys: Vec<String>,
}

impl Executable for Del {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let count = self
            .keys
            .iter()
            .filter(|key| store.strings.remove(key))
            .count();

        Ok(Frame::Integer(count as i64))
    }
}

impl TryFrom<&mut CommandParser> for Del {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let keys = parser.remaining_strings()?;

        Ok(Self { keys })
    }
}
