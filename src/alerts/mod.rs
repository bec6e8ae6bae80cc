//! Alert service: lifecycle, push dispatch, and the token store
//!
//! Turns rule actions into tracked alert records, owns the
//! active/resolved transition machine, and fans created alerts out to
//! push providers for clients without a live transport.

pub mod dispatch;
pub mod providers;
pub mod service;
pub mod tokens;

pub use dispatch::{dispatch_alert, DispatchOutcome, ProviderResolver};
pub use providers::{ProviderSet, PushPayload, PushProvider, PushSendError};
pub use service::{AlertHandle, AlertService, AlertServiceError, NotificationEvent};
pub use tokens::{Platform, PushTokenStore, StoreError, TokenRecord};
