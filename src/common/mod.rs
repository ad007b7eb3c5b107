use std::net::{SocketAddr, SocketAddrV4};

pub mod address;
pub mod bypass;
pub mod cipher;
pub mod dialers;
pub mod dns;
pub mod http;
pub mod metadata;

// map v6 socket addr into v4 if possible
pub fn try_map_v4_addr(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = addr {
        if let Some(v4a) = v6.ip().to_ipv4_mapped() {
            SocketAddr::V4(SocketAddrV4::new(v4a, v6.port()))
        } else {
            addr
        }
    } else {
        addr
    }
}
