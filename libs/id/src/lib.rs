//! # sam-id
//!
//! Typed identifiers for the orchestration core.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `ws_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix makes a task id impossible to pass where a node id is expected,
//! and the ULID keeps ids time-ordered. Actor instances are keyed by these
//! strings, so parsing is strict: a malformed id never reaches an actor.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;

/// Splits `{prefix}_{ulid}` and validates both halves.
pub fn parse_prefixed(expected: &'static str, raw: &str) -> Result<Ulid, IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }

    let (prefix, body) = raw.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    body.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
