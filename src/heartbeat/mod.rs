//! Worker liveness reporting.
//!
//! Two halves: the [`HeartbeatSender`] runs on or near the worker and posts
//! a signed batch of task ids on a fixed interval; the receiver side
//! ([`process_heartbeat`]) bumps `last_heartbeat` for each live task and
//! reports partial failure instead of throwing. Zombie detection is the
//! store's `find_zombie_tasks` read path; reconciling a zombie is an
//! external consumer of that query, not done here.

pub mod receiver;
pub mod sender;

pub use receiver::{process_heartbeat, HeartbeatFailure, HeartbeatReport};
pub use sender::{HeartbeatSender, HeartbeatTransport, HttpHeartbeatTransport, HEADER_HEARTBEAT_SIGNATURE};
