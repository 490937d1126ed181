//! HTTP front end: router, login endpoints and upstream forwarding

mod handlers;
mod proxy;
mod router;
mod server;

pub use proxy::{MAX_BODY_BYTES, Upstream, UpstreamProxy};
pub use router::{AppState, create_router};
pub use server::Gateway;
