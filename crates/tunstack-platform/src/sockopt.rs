//! Interface-bound socket options

use socket2::Socket;
use std::io;
use std::sync::Arc;
use tunstack_core::bind::OutboundBinder;
use tunstack_core::{Family, Interface, Registry};

/// Pin `socket` to `iface` for traffic of `family` (`SO_BINDTODEVICE`)
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn bind_socket_to_interface(socket: &Socket, iface: &Interface, _family: Family) -> io::Result<()> {
    socket.bind_device(Some(iface.name.as_bytes()))
}

/// Pin `socket` to `iface` for traffic of `family` (`IP_BOUND_IF` /
/// `IPV6_BOUND_IF`)
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn bind_socket_to_interface(socket: &Socket, iface: &Interface, family: Family) -> io::Result<()> {
    let index = std::num::NonZeroU32::new(iface.index);
    match family {
        Family::V4 => socket.bind_device_by_index_v4(index),
        Family::V6 => socket.bind_device_by_index_v6(index),
    }
}

/// Pin `socket` to `iface` for traffic of `family` (`IP_UNICAST_IF` /
/// `IPV6_UNICAST_IF`)
#[cfg(windows)]
pub fn bind_socket_to_interface(socket: &Socket, iface: &Interface, family: Family) -> io::Result<()> {
    use std::os::windows::io::AsRawSocket;
    use winapi::shared::ws2def::{IPPROTO_IP, IPPROTO_IPV6};
    use winapi::um::winsock2::{setsockopt, SOCKET, SOCKET_ERROR};

    const IP_UNICAST_IF: i32 = 31;
    const IPV6_UNICAST_IF: i32 = 31;

    // IPv4 takes the index in network byte order, IPv6 in host order.
    let (level, name, value) = match family {
        Family::V4 => (IPPROTO_IP as i32, IP_UNICAST_IF, iface.index.to_be()),
        Family::V6 => (IPPROTO_IPV6 as i32, IPV6_UNICAST_IF, iface.index),
    };

    // SAFETY: `value` outlives the call and the length matches its size.
    let rc = unsafe {
        setsockopt(
            socket.as_raw_socket() as SOCKET,
            level,
            name,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<u32>() as i32,
        )
    };
    if rc == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Binding strategy for this OS.
///
/// Platforms with an interface-bound socket option get
/// [`SocketOptionBinder`](tunstack_core::bind::SocketOptionBinder); the rest
/// bind an interface-owned source address.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios", windows))]
pub fn binder(registry: Arc<Registry>) -> Box<dyn OutboundBinder> {
    Box::new(tunstack_core::bind::SocketOptionBinder::new(
        registry,
        bind_socket_to_interface,
    ))
}

/// Binding strategy for this OS.
///
/// No interface-bound socket option here; sockets bind an interface-owned
/// source address instead.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios", windows)))]
pub fn binder(registry: Arc<Registry>) -> Box<dyn OutboundBinder> {
    Box::new(tunstack_core::bind::ManualSourceBinder::new(registry))
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    #[test]
    fn test_unknown_device_rejected() {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let iface = Interface::new("tunstack-none", 999, Vec::new(), None);
        // ENODEV without privileges is EPERM; either way the call fails.
        assert!(bind_socket_to_interface(&socket, &iface, Family::V4).is_err());
    }
}
