mod config;
mod error;
mod store;

pub use config::{NamespaceRange, load, parse, parse_port_range};
pub use error::{ConfigError, InvalidRange, RangeParseError, StoreError};
pub use store::{NODE_PORT_MAX, NODE_PORT_MIN, Port, PortRange, Store};
