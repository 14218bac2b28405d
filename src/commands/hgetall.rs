use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Returns all fields and values of the hash stored at `key` as a flat array of
/// `[field, value, field, value, ...]`. The order of the pairs is unspecified. A missing hash
/// yields an empty array.
///
/// Ref: <https://redis.io/docs/latest/commands/hgetall/>
#[derive(Debug, PartialEq)]
pub struct Hgetall {
    pub key: String,
}

impl Executable for Hgetall {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let fields = store.hashes.get_all(&self.key).unwrap_or_default();

        let res = fields
            .into_iter()
            .flat_map(|(field, value)| [Frame::Bulk(Bytes::from(field)), Frame::Bulk(value)])
            .collect();

        Ok(Frame::Array(res))
    }
}

impl TryFrom<&mut CommandParser> for Hgetall {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        parser.finish()?;

        Ok(Self { key })
    }
}
