//! Signed completion-callback delivery and verification.

pub mod delivery;
pub mod pending;
pub mod signature;

pub use delivery::{
    DeliveryTransport, HttpDeliveryTransport, RetrySweepReport, WebhookDelivery, WebhookError,
    WebhookSender, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
pub use pending::{PendingQueue, PendingWebhook, PENDING_TTL_HOURS};
pub use signature::{
    sign_body, sign_with_timestamp, verify_body, verify_with_timestamp, SignatureError,
    REPLAY_WINDOW_SECS,
};
