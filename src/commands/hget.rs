use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Returns the value of `field` in the hash stored at `key`, or nil.
///
/// Ref: <https://redis.io/docs/latest/commands/hget/>
#[derive(Debug, PartialEq)]
pub struct Hget {
    pub key: String,
    pub field: String,
}

impl Executable for Hget {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let value = store.hashes.get(&self.key, &self.field);

        Ok(value.map_or(Frame::Null, Frame::Bulk))
    }
}

impl TryFrom<&mut CommandParser> for Hget {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let field = parser.next_string()?;
        parser.finish()?;

        Ok(Self { key, field })
    }
}
