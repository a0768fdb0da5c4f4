mod locator;
mod manager;
mod sqlite_store;
mod store;

pub use locator::{
    LocatorError, LocatorFilter, LocatorResult, NewLocator, StreamState, VideoStreamLocator,
};
pub use manager::{StreamError, StreamManager, StreamResult, FULL_STREAM_DIR};
pub use sqlite_store::{SqliteLocatorStore, SqliteLocatorStoreBuilder};
pub use store::{InMemoryLocatorStore, LocatorStore};
