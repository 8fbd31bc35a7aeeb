//! Engine for rebuilding the writable layer of a split `/etc`.
//!
//! Image-based systems ship a read-only `/etc` with an overlay on top for
//! administrator changes. When the read-only layer is replaced by an update,
//! the overlay has to be rebuilt against it: customized files are carried
//! over, the identity databases (`passwd`, `group`, `shadow`, `gshadow`,
//! `shells`) are merged with uid/gid conflict resolution, file ownership in
//! the new lower layer is renumbered accordingly, and overlay entries that
//! became identical to the lower layer are dropped.
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod handlers;
pub use self::handlers::*;
pub mod nameservice;
mod overlay;
pub use self::overlay::*;
mod ownership;
pub use self::ownership::*;
mod prune;
pub use self::prune::*;
mod treecopy;
pub use self::treecopy::*;
