pub mod block_key;
pub mod error;
pub mod object_id;

pub use block_key::{BlockKey, FileId};
pub use error::{NimbusError, Result};
pub use object_id::ObjectId;
