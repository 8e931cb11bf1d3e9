//! Raw USB transport using `rusb`.
//!
//! WCH bootloaders expose a vendor interface with bulk endpoints 0x02/0x82;
//! the STC8H USB bootloader is a HID device whose interrupt endpoints are
//! discovered from the active configuration descriptor. When a HID device
//! has no interrupt OUT endpoint, reports go out as `SET_REPORT` control
//! transfers.

use {
    crate::{
        error::{Error, Result},
        port::{Port, UsbFilter},
    },
    log::{debug, trace},
    rusb::UsbContext,
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// HID class request `SET_REPORT`.
const HID_SET_REPORT: u8 = 0x09;
/// Report type "output" in the high byte of `wValue`.
const HID_REPORT_OUTPUT: u16 = 0x02 << 8;

/// USB transfer type used for the data pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbTransfer {
    /// Bulk endpoints (WCH).
    Bulk,
    /// Interrupt endpoints of a HID interface (STC).
    Interrupt,
}

/// How to find and drive a USB bootloader.
#[derive(Debug, Clone)]
pub struct UsbConfig {
    /// Default VID/PID pairs of the bootloader.
    pub ids: Vec<(u16, u16)>,
    /// User filter; when set it replaces the default pairs.
    pub filter: UsbFilter,
    /// Interface number to claim.
    pub interface: u8,
    /// Transfer type of the data endpoints.
    pub transfer: UsbTransfer,
    /// OUT endpoint, discovered when `None`.
    pub endpoint_out: Option<u8>,
    /// IN endpoint, discovered when `None`.
    pub endpoint_in: Option<u8>,
    /// Maximum packet size of the IN endpoint.
    pub packet_size: usize,
    /// Transfer timeout.
    pub timeout: Duration,
}

impl UsbConfig {
    /// Bulk configuration with fixed endpoints.
    pub fn bulk(ids: &[(u16, u16)], endpoint_out: u8, endpoint_in: u8) -> Self {
        Self {
            ids: ids.to_vec(),
            filter: UsbFilter::default(),
            interface: 0,
            transfer: UsbTransfer::Bulk,
            endpoint_out: Some(endpoint_out),
            endpoint_in: Some(endpoint_in),
            packet_size: 64,
            timeout: Duration::from_millis(5000),
        }
    }

    /// HID configuration with endpoints taken from the descriptor.
    pub fn hid(ids: &[(u16, u16)]) -> Self {
        Self {
            ids: ids.to_vec(),
            filter: UsbFilter::default(),
            interface: 0,
            transfer: UsbTransfer::Interrupt,
            endpoint_out: None,
            endpoint_in: None,
            packet_size: 64,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Restrict the search with a user VID/PID filter.
    #[must_use]
    pub fn with_filter(mut self, filter: UsbFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the transfer timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a device with these ids should be opened.
    pub fn accepts(&self, vid: u16, pid: u16) -> bool {
        if self
            .filter
            .is_any()
        {
            self.ids
                .contains(&(vid, pid))
        } else {
            self.filter
                .matches(vid, pid)
        }
    }
}

/// An opened USB bootloader interface.
pub struct UsbPort {
    handle: Option<rusb::DeviceHandle<rusb::Context>>,
    name: String,
    interface: u8,
    transfer: UsbTransfer,
    endpoint_out: Option<u8>,
    endpoint_in: u8,
    packet_size: usize,
    timeout: Duration,
    pending: Vec<u8>,
}

impl UsbPort {
    /// Open the first device accepted by `config`.
    pub fn open(config: &UsbConfig) -> Result<Self> {
        let context = rusb::Context::new()?;
        for device in context
            .devices()?
            .iter()
        {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let (vid, pid) = (desc.vendor_id(), desc.product_id());
            if !config.accepts(vid, pid) {
                continue;
            }
            debug!(
                "Found USB bootloader {vid:04x}:{pid:04x} on bus {} address {}",
                device.bus_number(),
                device.address()
            );
            return Self::open_device(&device, config, vid, pid);
        }
        Err(Error::DeviceNotFound)
    }

    fn open_device(
        device: &rusb::Device<rusb::Context>,
        config: &UsbConfig,
        vid: u16,
        pid: u16,
    ) -> Result<Self> {
        let (mut endpoint_out, mut endpoint_in) = (config.endpoint_out, config.endpoint_in);
        let mut packet_size = config.packet_size;

        if endpoint_in.is_none() || endpoint_out.is_none() {
            let wanted = match config.transfer {
                UsbTransfer::Bulk => rusb::TransferType::Bulk,
                UsbTransfer::Interrupt => rusb::TransferType::Interrupt,
            };
            let descriptor = device.active_config_descriptor()?;
            for interface in descriptor.interfaces() {
                for alt in interface.descriptors() {
                    if alt.interface_number() != config.interface {
                        continue;
                    }
                    for ep in alt.endpoint_descriptors() {
                        if ep.transfer_type() != wanted {
                            continue;
                        }
                        match ep.direction() {
                            rusb::Direction::In if endpoint_in.is_none() => {
                                endpoint_in = Some(ep.address());
                                packet_size = usize::from(ep.max_packet_size());
                            },
                            rusb::Direction::Out if endpoint_out.is_none() => {
                                endpoint_out = Some(ep.address());
                            },
                            _ => {},
                        }
                    }
                }
            }
        }

        let endpoint_in = endpoint_in.ok_or_else(|| {
            Error::Protocol(format!(
                "USB device {vid:04x}:{pid:04x} has no IN endpoint on interface {}",
                config.interface
            ))
        })?;
        if endpoint_out.is_none() && config.transfer == UsbTransfer::Bulk {
            return Err(Error::Protocol(format!(
                "USB device {vid:04x}:{pid:04x} has no OUT endpoint"
            )));
        }

        let handle = device.open()?;
        // Not every platform can detach kernel drivers; claiming reports the real failure.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            trace!("Kernel driver auto-detach unavailable: {e}");
        }
        if let Err(e) = handle.set_active_configuration(1) {
            trace!("Keeping current USB configuration: {e}");
        }
        handle.claim_interface(config.interface)?;

        Ok(Self {
            handle: Some(handle),
            name: format!(
                "usb:{:03}:{:03} ({vid:04x}:{pid:04x})",
                device.bus_number(),
                device.address()
            ),
            interface: config.interface,
            transfer: config.transfer,
            endpoint_out,
            endpoint_in,
            packet_size: packet_size.max(1),
            timeout: config.timeout,
            pending: Vec::new(),
        })
    }

    fn handle(&self) -> io::Result<&rusb::DeviceHandle<rusb::Context>> {
        self.handle
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "USB device closed"))
    }

    fn read_transfer(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let handle = self.handle()?;
        let result = match self.transfer {
            UsbTransfer::Bulk => handle.read_bulk(self.endpoint_in, buf, timeout),
            UsbTransfer::Interrupt => handle.read_interrupt(self.endpoint_in, buf, timeout),
        };
        result.map_err(usb_to_io)
    }
}

impl Port for UsbPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        0
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.pending
            .clear();
        let mut scratch = vec![0u8; self.packet_size];
        // A stale reply from an aborted run would otherwise answer our first command.
        for _ in 0..16 {
            match self.read_transfer(&mut scratch, Duration::from_millis(1)) {
                Ok(n) if n > 0 => trace!("Discarded {n} stale bytes"),
                _ => break,
            }
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self
            .pending
            .len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self
            .handle
            .take()
        {
            if let Err(e) = handle.release_interface(self.interface) {
                debug!("Failed to release USB interface: {e}");
            }
        }
        Ok(())
    }
}

impl Read for UsbPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self
            .pending
            .is_empty()
        {
            let mut packet = vec![0u8; self.packet_size];
            let n = self.read_transfer(&mut packet, self.timeout)?;
            packet.truncate(n);
            self.pending = packet;
        }
        let n = buf
            .len()
            .min(
                self.pending
                    .len(),
            );
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending
            .drain(..n);
        Ok(n)
    }
}

impl Write for UsbPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        let result = match (self.transfer, self.endpoint_out) {
            (UsbTransfer::Bulk, Some(ep)) => handle.write_bulk(ep, buf, self.timeout),
            (UsbTransfer::Interrupt, Some(ep)) => handle.write_interrupt(ep, buf, self.timeout),
            (_, None) => handle.write_control(
                rusb::request_type(
                    rusb::Direction::Out,
                    rusb::RequestType::Class,
                    rusb::Recipient::Interface,
                ),
                HID_SET_REPORT,
                HID_REPORT_OUTPUT,
                u16::from(self.interface),
                buf,
                self.timeout,
            ),
        };
        result.map_err(usb_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn usb_to_io(err: rusb::Error) -> io::Error {
    match err {
        rusb::Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
        rusb::Error::NoDevice => io::Error::new(io::ErrorKind::NotConnected, err),
        other => io::Error::other(other),
    }
}

/// A USB device present on the bus that looks like a supported bootloader.
#[derive(Debug, Clone)]
pub struct UsbBootloaderInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
}

/// List USB devices accepted by any of the given configurations.
pub fn list_bootloaders(configs: &[UsbConfig]) -> Result<Vec<UsbBootloaderInfo>> {
    let context = rusb::Context::new()?;
    let mut found = Vec::new();
    for device in context
        .devices()?
        .iter()
    {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        if configs
            .iter()
            .any(|c| c.accepts(vid, pid))
        {
            found.push(UsbBootloaderInfo {
                bus: device.bus_number(),
                address: device.address(),
                vid,
                pid,
            });
        }
    }
    Ok(found)
}
