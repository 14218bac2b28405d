use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Removes the given fields from the hash stored at `key` and returns how many were removed. The
/// hash itself goes away together with its last field.
///
/// Ref: <https://redis.io/docs/latest/commands/hdel/>
#[derive(Debug, PartialEq)]
pub struct Hdel {
    pub key: String,
    pub fields: Vec<String>,
}

impl Executable for Hdel {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let count = self
            .fields
            .iter()
            .filter(|field| store.hashes.remove(&self.key, field))
            .count();

        Ok(Frame::Integer(count as i64))
    }
}

impl TryFrom<&mut CommandParser> for Hdel {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let fields = parser.remaining_strings()?;

        Ok(Self { key, fields })
    }
}
