#![deny(unsafe_code)]

//! Optimistic entry reconciliation for one chat room or comment thread.
//!
//! [`Reconciler`] is the synchronous merge core; [`Room`] drives it from a single dispatcher
//! task that owns all list mutation and fans backend calls out to spawned tasks.
pub mod config;
/// Entry model and provisional identifiers.
pub mod entry;
pub mod error;
pub mod list;
pub mod profiles;
/// Wire payload for the best-effort push side channel.
pub mod push;
pub mod reconciler;
pub mod room;

pub use config::{Placement, SyncSettings};
pub use entry::{CurrentUser, Entry, EntryKey, EntryStatus, LocalId, LocalIdSource, Profile};
pub use error::{PushError, RoomError, RoomResult};
pub use list::EntryList;
pub use profiles::ProfileResolver;
pub use push::{PushedEntry, PushedProfile};
pub use reconciler::{BackfillScope, MergeOutcome, PendingSubmission, Reconciler};
pub use room::{ConnectionStatus, Room, RoomNotice, RoomSnapshot};
