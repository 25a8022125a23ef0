pub mod client;
pub mod events;
pub mod signature;

pub use client::{
    HttpMethod, HttpWaTransport, WaApiError, WaClient, WaHttpResponse, WaOperation, WaSendAck,
    WaTransport,
};
pub use events::{ConnectionSignal, WaDecodeError, WaEvent, WaInboundMessage};
pub use signature::{verify, SignatureVerdict};
