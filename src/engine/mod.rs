//! Engine subprocess lifecycle: port allocation, config rendering, and the
//! launcher that spawns, polls, and tears down the xray/v2ray process behind
//! each bridge.

pub mod config_render;
pub mod launcher;
pub mod port_allocator;
pub mod spawner;
