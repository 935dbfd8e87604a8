//! # hyde-id
//!
//! Typed identifiers for the records the deployment engine persists.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `dep_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a deployment
//! - `infra_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for an infrastructure
//! - `sec_01HV4Z4NYPLTRS0JTUA8XDME5F` for a stored secret
//!
//! The prefix keeps a deployment id from being passed where an
//! infrastructure id is expected, and the ULID keeps ids sortable by
//! creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
