use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Sets `field` in the hash stored at `key` to `value`, creating the hash if needed.
///
/// Unlike Redis, which replies with the number of fields added, this replies `OK`.
#[derive(Debug, PartialEq)]
pub struct Hset {
    pub key: String,
    pub field: String,
    pub value: Bytes,
}

impl Executable for Hset {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        store.hashes.set(self.key, self.field, self.value);

        Ok(Frame::Simple("OK".to_string()))
    }
}

impl TryFrom<&mut CommandParser> for Hset {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let field = parser.next_string()?;
        let value = parser.next_bytes()?;
        parser.finish()?;

        Ok(Self { key, field, value })
    }
}
