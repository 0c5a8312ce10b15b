//! HTTP + WebSocket gateway: socket layer, event fan-out, auth gate,
//! reverse proxy, tunnel controller, and static serving.

pub mod assets;
pub mod auth;
pub mod broadcast;
pub mod logs;
pub mod methods;
pub mod portscan;
pub mod proxy;
pub mod server;
pub mod state;
pub mod tunnel;
pub mod ws;
