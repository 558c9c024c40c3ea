//! Userspace WireGuard device lifetime.
//!
//! boringtun creates the TUN interface and runs the data plane on its own
//! threads; we talk to it through the UAPI socket it listens on under
//! `/var/run/wireguard`. Closing the device tears the TUN interface down
//! with it.

use boringtun::device::{DeviceConfig, DeviceHandle};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::{debug, instrument, warn};

use crate::{
    error::{Error, Result},
    tunnel::uapi,
};

const UAPI_SOCKET_DIR: &str = "/var/run/wireguard";

pub struct WireguardDevice {
    name: String,
    handle: Option<DeviceHandle>,
}

impl WireguardDevice {
    /// Create the TUN interface and start the device threads.
    #[instrument]
    pub async fn create(name: &str) -> Result<Self> {
        let device_name = name.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            DeviceHandle::new(&device_name, DeviceConfig::default())
        })
        .await
        .map_err(|err| Error::resource(format!("device task failed: {err}")))?
        .map_err(|err| Error::resource(format!("create wireguard device {name}: {err:?}")))?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Send a `set=1` request over the device's UAPI socket.
    #[instrument(skip(self, request))]
    pub async fn configure(&self, request: &str) -> Result<()> {
        let path = format!("{UAPI_SOCKET_DIR}/{}.sock", self.name);
        let mut socket = UnixStream::connect(&path)
            .await
            .map_err(|err| Error::resource(format!("connect device socket {path}: {err}")))?;
        socket
            .write_all(request.as_bytes())
            .await
            .map_err(|err| Error::resource(format!("write device config: {err}")))?;

        let mut response = String::new();
        socket
            .read_to_string(&mut response)
            .await
            .map_err(|err| Error::resource(format!("read device response: {err}")))?;
        match uapi::response_errno(&response) {
            Some(0) => {
                debug!(device = %self.name, "tunnel.device.configured");
                Ok(())
            }
            Some(errno) => Err(Error::resource(format!(
                "device rejected configuration: errno={errno}"
            ))),
            None => Err(Error::resource(format!(
                "unparseable device response: {response:?}"
            ))),
        }
    }

    /// Stop the device threads and remove the interface and UAPI socket.
    pub async fn shutdown(mut self) {
        let name = self.name.clone();
        if let Some(mut handle) = self.handle.take() {
            let result = tokio::task::spawn_blocking(move || {
                handle.trigger_exit();
                handle.clean();
            })
            .await;
            if let Err(err) = result {
                warn!(device = %name, ?err, "tunnel.device.shutdown_failed");
            }
        }
    }
}
