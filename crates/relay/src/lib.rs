pub mod gateways;
pub mod inbound;
pub mod outbound;
pub mod poller;
pub mod registry;
pub mod resolver;
pub mod retry;

pub use gateways::{CrmClientGateway, CrmGateway, WaClientGateway, WaGateway};
pub use inbound::{InboundOutcome, InboundRelay};
pub use outbound::{OutboundOutcome, OutboundRelay};
pub use poller::{start_session, SessionDeps};
pub use registry::{InstanceRegistry, SessionHandle};
pub use resolver::ConversationResolver;
pub use retry::run_with_retry;
