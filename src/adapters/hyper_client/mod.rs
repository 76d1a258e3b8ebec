mod exchange;
mod tunnel;

pub use exchange::{send, HttpResponse};
pub use tunnel::HyperTunnel;
