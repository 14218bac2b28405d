use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Returns how many of the given keys exist. A key mentioned several times is counted several
/// times.
///
/// Ref: <https://redis.io/docs/latest/commands/exists/>
#[derive(Debug, PartialEq)]
pub struct Exists {
    pub keys: Vec<String>,
}

impl Executable for Exists {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let count = self
            .keys
            .iter()
            .filter(|key| store.strings.exists(key))
            .count();

        Ok(Frame::Integer(count as i64))
    }
}

impl TryFrom<&mut CommandParser> for Exists {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let keys = parser.remaining_strings()?;

        Ok(Self { keys })
    }
}
