//! Opaque resource IDs.
//!
//! Message and claim IDs are ULIDs rendered as UUIDs: lexically sortable by
//! creation time, which keeps the backend's primary-key index from
//! fragmenting the way random UUIDv4 insertion would.

use ulid::Ulid;
use uuid::Uuid;

pub fn new_message_id() -> String {
    Uuid::from(Ulid::new()).to_string()
}

pub fn new_claim_id() -> String {
    Uuid::from(Ulid::new()).to_string()
}

pub fn new_pool_id() -> String {
    Uuid::from(Ulid::new()).to_string()
}
