//! Client-side synchronization for chatwire.
//!
//! Everything a connected chat frontend needs between the wire and the
//! screen:
//!
//! - **Transport**: one WebSocket session with supervised reconnection
//! - **Subscriptions**: reference-counted channel memberships, restored
//!   after every reconnect
//! - **Store**: optimistic conversation state reconciled against server
//!   confirmations and realtime events
//! - **Api**: the typed REST client the store persists through
//! - **Presence**: a roster mirror fed by the event stream
//!
//! The usual wiring is [`HttpConversationApi`] plus a [`Transport`]
//! handed to [`ChatStore::new`], then [`Transport::connect`]; the store
//! spawns its own pumps and exposes snapshots plus a change signal for
//! rendering.

pub mod api;
pub mod presence;
pub mod reconnect;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use api::{ConversationApi, ConversationApiService, HttpConversationApi};
pub use presence::PresenceTracker;
pub use reconnect::ReconnectPolicy;
pub use store::{ChatSnapshot, ChatStore, ConversationSnapshot, LocalState, MessageView};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use transport::{ConnectionEvent, Transport};
