//! Progress reporting: message types, the publish/subscribe broker, and the
//! per-session broadcast hub that multiplexes one job's updates to many
//! subscribers.

mod broker;
mod hub;
mod queue;
mod types;

pub use broker::{BrokerError, DbBroker, LocalBroker, ProgressBroker};
pub use hub::{HubConfig, HubError, HubStats, ProgressHub, RecvOutcome, Subscription};
pub use types::{CHANNEL_PREFIX, ChannelMessage, ProgressEvent, ProgressUpdate, channel_name};
