//! Business logic services.

pub mod conversation;
pub mod event_publisher;
pub mod notifier;
pub mod presence;

pub use conversation::{ConversationService, CreateConversationInput, SendMessageInput};
pub use event_publisher::{EventPublisher, EventPublisherService, NoOpEventPublisher};
pub use notifier::{NoOpNotificationSink, NotificationSink, NotificationSinkService};
pub use presence::{NoOpPresenceProvider, PresenceProvider, PresenceService};
