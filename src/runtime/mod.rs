//! Shared networking runtime.
//!
//! - `transport`: the non-blocking send/receive/close capability both the
//!   client pumps and the server multiplexers are written against
//! - `socket`: listener and endpoint construction

pub mod socket;
mod transport;

pub(crate) use transport::{IoStatus, Transport};

use crate::config::{Config, Role, RuntimeType, TransportType};
use crate::{client, server};

/// Run the configured role over the configured transport.
pub fn run(config: &Config) -> std::io::Result<()> {
    match (config.role, config.transport) {
        (Role::Server, TransportType::Tcp) => server::tcp::run(config),
        (Role::Server, TransportType::Udp) => server::udp::run(config),
        (Role::Client, transport) => match (config.runtime, transport) {
            (RuntimeType::Mio, TransportType::Tcp) => client::pump::run_tcp(config),
            (RuntimeType::Mio, TransportType::Udp) => client::pump::run_udp(config),
            (RuntimeType::Tokio, _) => client::tasks::run(config),
        },
    }
}
