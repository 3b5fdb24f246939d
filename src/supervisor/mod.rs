//! Proxy core supervision
//!
//! # Architecture
//!
//! ```text
//! +--------------------+          +----------------------+
//! |  ProxySupervisor   |          |  proxy core process  |
//! |                    |  spawn   |  run -c config.json  |
//! |  +--------------+  |--------->|  +----------------+  |
//! |  | Runner task  |  |          |  | SOCKS5 :10808  |  |
//! |  +------+-------+  |          |  +-------^--------+  |
//! |         |          |          +----------|-----------+
//! |         v          |                     |
//! |  SupervisorState   |          port poll + echo request
//! +---------+----------+
//!           | ready
//!           v
//!    RoutingDecider
//! ```
//!
//! # Components
//!
//! - `ProxySupervisor`: start/stop/destroy, owns the controlling task
//! - `ProxyProcess`: one launch of the core, output draining, two-phase stop
//! - `SupervisorState`: generation-tagged state shared with readers
//! - `ConnectivityCheck`: end-to-end request through the local port

mod connectivity;
mod manager;
mod process;
mod state;

pub use connectivity::{ConnectivityCheck, EchoCheck};
pub use manager::{ProxySupervisor, SupervisorConfig};
pub use process::{check_executable, resolve_executable, ProxyProcess, READER_JOIN_TIMEOUT};
pub use state::{Phase, SupervisorSnapshot, SupervisorState};
