//! Progress tracking and delivery
//!
//! [`ProgressBroadcaster`] keeps per-job progress snapshots and fans
//! events out to registered listeners (per-job, per-session, global).
//! The transport layer picks between a push channel and a fallback
//! stream with independent reconnect backoff curves.

mod broadcaster;
mod relay;
mod transport;

pub use broadcaster::{
    ListenerId, ProgressBroadcaster, ProgressEvent, ProgressSnapshot, SessionProgress,
};
pub use relay::{relay_events, WebhookChannel};
pub use transport::{
    ChannelState, FallbackStream, PushChannel, TransportError, TransportManager, TransportPolicy,
};
