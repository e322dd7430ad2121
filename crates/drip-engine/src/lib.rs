mod adapter;
mod error;
mod events;
mod resolver;
mod retry;
mod scheduler;

pub use adapter::{
    ChannelAdapter, EmailAdapter, LogProvider, MockProvider, ProviderClient, PushAdapter,
    SmsAdapter,
};
pub use error::EngineError;
pub use events::EngineEvent;
pub use resolver::AudienceResolver;
pub use retry::RetryPolicy;
pub use scheduler::{DeliveryScheduler, SchedulerConfig, SubmitReceipt};
