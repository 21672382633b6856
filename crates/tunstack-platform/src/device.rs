//! TUN device creation

use crate::error::{PlatformError, Result};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument};
use tun::AsyncDevice;
use tunstack_core::stack::VirtualDevice;
use tunstack_core::TunConfig;

/// An open TUN device
pub struct TunDevice {
    name: String,
    inner: AsyncDevice,
}

impl VirtualDevice for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Create the device described by `config`. Must be called within a Tokio
/// runtime.
///
/// Addresses are not assigned here; the routing layer owns them so that
/// they are removed again on close.
#[instrument(skip_all, fields(device = %config.name))]
pub fn open_device(config: &TunConfig) -> Result<TunDevice> {
    let mtu = i32::try_from(config.effective_mtu())
        .map_err(|_| PlatformError::Device(format!("MTU {} out of range", config.mtu)))?;

    let mut tun_config = tun::Configuration::default();
    tun_config.name(&config.name).mtu(mtu).up();

    #[cfg(target_os = "linux")]
    tun_config.platform(|platform| {
        platform.packet_information(false);
    });

    let inner = tun::create_as_async(&tun_config)
        .map_err(|e| PlatformError::Device(format!("{}: {e}", config.name)))?;
    debug!(mtu, "TUN device created");

    Ok(TunDevice {
        name: config.name.clone(),
        inner,
    })
}

impl AsyncRead for TunDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunDevice {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
