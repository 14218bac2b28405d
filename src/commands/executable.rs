use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Runs a parsed command against the database and produces the reply for the client.
pub trait Executable {
    fn exec(self, store: Store) -> Result<Frame, Error>;
}
