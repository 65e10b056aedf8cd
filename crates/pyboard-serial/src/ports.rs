//! Host serial port enumeration.

use std::io;

use async_trait::async_trait;
use pyboard_core::{DeviceError, PortLister};

/// Lists ports through the operating system.
#[derive(Debug, Clone, Default)]
pub struct SystemPortLister;

#[async_trait]
impl PortLister for SystemPortLister {
    async fn list_ports(&self) -> Result<Vec<String>, DeviceError> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(io::Error::other)?
            .map_err(io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}
