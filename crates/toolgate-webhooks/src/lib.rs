//! Webhook Delivery (C11): signs and delivers gateway events to registered
//! subscriber URLs, retrying on failure with exponential backoff.

pub mod delivery;
pub mod signing;
pub mod subscription;

pub use delivery::{DeliveryStatus, RetryPolicy, WebhookDelivery, WebhookDispatcher, WebhookStore};
pub use signing::sign_payload;
pub use subscription::WebhookSubscription;
