pub mod config;
pub mod events;
pub mod subscriber;

pub use config::ShroudEventsConfig;
pub use events::{ChannelKey, ResultEvent, ResultPayload};
pub use subscriber::{
    await_result, ResultEventSubscriber, ResultListeners, SubscriberError, Subscription,
};
