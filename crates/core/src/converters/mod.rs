//! Converters for the layers the bridge knows how to carry.

mod agent;
mod cbr;
mod common;
mod mac;
mod routing;

use std::time::Duration;

pub use agent::{AgentConverter, AgentFields};
pub use cbr::{CbrConverter, CbrFields};
pub use common::{CommonConverter, CommonFields};
pub use mac::{MacConverter, MacFields, MAC_SUBTYPE_BITS, MAC_TYPE_BITS};
pub use routing::{RoutingConverter, RoutingFields};

fn time_to_wire(t: Duration) -> u64 {
    t.as_millis() as u64
}

fn time_from_wire(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
