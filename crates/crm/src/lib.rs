pub mod client;
pub mod events;
pub mod tokens;

pub use client::{
    CrmApiError, CrmClient, CrmSendAck, CrmSendMessage, CrmTransport, HttpCrmTransport,
};
pub use events::{decode_crm_event, CrmDecodeError, CrmEvent, CrmOutboundMessage};
pub use tokens::{
    HttpTokenEndpoint, RefreshOutcome, TokenEndpoint, TokenError, TokenGrant, TokenRefresher,
};
