pub mod error;
pub mod traits;
pub mod types;

pub use error::EngineError;
pub use traits::Component;
pub use types::{
    CronEventPartial, CronSeed, CronTriggerDefinition, DeliverableEvent, EventClass, EventHeader,
    EventStatus, HeaderConf, HeaderValueSource, Invocation, OneOffEvent, RetryConf,
    TriggerCatalog, TriggerStats, WebhookConf,
};
