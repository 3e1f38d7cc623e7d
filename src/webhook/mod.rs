pub mod extract;
pub mod guard;
pub mod handler;

pub use extract::{ExtractionPlan, Extractor, Payload};
pub use guard::{
    Admission, Dispatch, GuardChecks, GuardDecision, GuardMode, Rejection, WebhookDelivery,
    WebhookGuard,
};
pub use handler::{LoggingHandler, WebhookHandler, WebhookKind};
