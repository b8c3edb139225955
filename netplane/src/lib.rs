//! Cross-platform network control plane for tunnel clients
//!
//! This crate reconfigures host networking around a tunnel interface and
//! puts it back the way it found it.
//!
//! # Features
//!
//! - **Discovery**: Capture the default routes once per process
//! - **DNS**: Redirect resolvers (systemd-resolved on Linux, `networksetup` on macOS)
//! - **Routing**: Split-default routes through the tunnel, keeping the control
//!   connection on the original gateway
//! - **Packet Filter**: nftables security groups, port forwarding and traffic
//!   forwarding with rule deduplication and reference counting (Linux)
//! - **Teardown**: Every change is registered with its [`NetworkContext`] and
//!   reverted by [`NetworkContext::clear`]
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN`
//! - `nf_tables` and systemd-resolved (`resolvectl`) for the filter and DNS
//!
//! ## macOS
//! - Root privileges; `route`, `ifconfig` and `networksetup`
//!
//! ## Windows
//! - Discovery only reports an empty state; changes are refused
//!
//! # Example
//!
//! ```ignore
//! use netplane::{default_driver, Discovery, NetworkContext};
//!
//! #[tokio::main]
//! async fn main() -> netplane::Result<()> {
//!     let discovery = Discovery::spawn(default_driver());
//!     let ctx = NetworkContext::new(&discovery).await?;
//!
//!     let routes = ctx.new_route_manager().await?;
//!     let wg0 = routes.new_routable_interface("wg0", "10.8.0.2/24").await?;
//!     wg0.make_default_route().await?;
//!
//!     let dns = ctx.new_dns_manager().await?;
//!     dns.add_dns_servers(&["10.8.0.1".to_string()]).await?;
//!
//!     // ...
//!     ctx.clear().await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dns;
pub mod driver;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod route;
pub mod routing;

pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use config::{Config, TunnelConfig};
pub use context::{ContextOptions, InterfaceRegistry, NetworkContext};
pub use discovery::Discovery;
pub use dns::DnsManager;
pub use driver::{default_driver, PlatformNetworkDriver};
pub use error::{Error, Result};
pub use filter::{
    FilterRouter, PacketFilter, PortForward, PortGroup, Protocol, SecurityGroup, TrafficForward,
};
pub use kernel::KernelNetwork;
pub use route::{AddressFamily, Link, NetworkState, Route, Scope};
pub use routing::{RoutableInterface, RouteManager};
