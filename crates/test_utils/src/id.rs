//! Test utilities associated with ids.

use bytes::Bytes;
use ferry_api::{id::Id, ContentId};

use crate::random_bytes;

/// Create a random id.
pub fn random_id() -> Id {
    Id(Bytes::from(random_bytes(32)))
}

/// Create a random content id.
pub fn random_content_id() -> ContentId {
    ContentId(random_id())
}
