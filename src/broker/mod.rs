pub mod gateway;
pub mod replay;
#[cfg(feature = "tws")]
pub mod tws;

pub use gateway::{is_notice_code, EventReceiver, EventSender, Gateway, GatewayEvent};
pub use replay::{RecordedRequest, ReplayGateway, ScriptedTick};
#[cfg(feature = "tws")]
pub use tws::TwsGateway;
