//! Network subsystem for UDP discovery and control traffic

pub mod udp;

pub use udp::{
    bind_discovery_socket, bind_ephemeral, bind_port_in_range, create_announce_socket,
    create_socket, is_idle_error, send_to,
};
