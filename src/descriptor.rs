//! USB descriptors
//!
//! Descriptors are application-owned byte tables in the standard USB 2.0
//! layout. The stack never copies them; the accessors here read fields by
//! offset, little-endian where multi-byte.

use usb_device::{descriptor::descriptor_type, UsbDirection};

/// Endpoint transfer type, as encoded in `bmAttributes`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

pub const DEVICE_SIZE: usize = 18;
pub const CONFIGURATION_SIZE: usize = 9;
pub const INTERFACE_SIZE: usize = 9;
pub const ENDPOINT_SIZE: usize = 7;

/// Why a descriptor set was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    /// The device descriptor's length, type, or endpoint zero packet size is wrong
    Device,
    /// `bNumConfigurations` doesn't match the configurations supplied
    ConfigurationCount,
    /// A configuration's header is wrong, or its value is out of sequence
    ConfigurationHeader { configuration: u8 },
    /// A sub-descriptor has a zero length, or runs past `wTotalLength`
    Malformed { configuration: u8 },
    /// An interface descriptor has the wrong length, or uses alternate settings
    Interface { configuration: u8 },
    /// An endpoint descriptor has the wrong length or an address out of range
    Endpoint { configuration: u8, address: u8 },
    /// An endpoint address is used twice in the same direction
    EndpointReused { configuration: u8, address: u8 },
    /// Both directions of an endpoint number are used, but not both as interrupt
    EndpointShared { configuration: u8, address: u8 },
    /// Endpoint type is control or isochronous
    EndpointType { configuration: u8, address: u8 },
    /// `wMaxPacketSize` is zero, or too large for a full speed endpoint
    MaxPacketSize { configuration: u8, address: u8 },
    /// A device, configuration, or string descriptor inside a configuration
    Nested { configuration: u8 },
    /// A string descriptor has an odd length or the wrong type
    String { index: u8 },
}

/// A raw descriptor that's shorter than its length prefix, or has a zero length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Malformed;

/// Walks the sub-descriptors of a configuration, by their length prefixes
///
/// Yields each sub-descriptor, header excluded. Stops after the first
/// malformed descriptor.
pub struct SubDescriptors<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for SubDescriptors<'a> {
    type Item = Result<&'a [u8], Malformed>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let len = usize::from(self.rest[0]);
        if len < 2 || len > self.rest.len() {
            self.rest = &[];
            return Some(Err(Malformed));
        }
        let (desc, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Ok(desc))
    }
}

/// Endpoint descriptor accessors
#[derive(Clone, Copy)]
pub struct EndpointDescriptor<'a>(&'a [u8]);

impl<'a> EndpointDescriptor<'a> {
    /// Returns `None` if `raw` isn't a complete endpoint descriptor
    pub fn new(raw: &'a [u8]) -> Option<Self> {
        (raw.len() == ENDPOINT_SIZE
            && raw[0] as usize == ENDPOINT_SIZE
            && raw[1] == descriptor_type::ENDPOINT)
            .then_some(EndpointDescriptor(raw))
    }
    /// `bEndpointAddress`
    pub fn address(&self) -> u8 {
        self.0[2]
    }
    /// The endpoint number, without the direction bit
    pub fn number(&self) -> u8 {
        self.0[2] & 0x0F
    }
    pub fn direction(&self) -> UsbDirection {
        if self.0[2] & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }
    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.0[3])
    }
    /// `wMaxPacketSize`, packet size bits only
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]]) & 0x7FF
    }
}

/// Configuration descriptor accessors
///
/// Covers the header and everything up to `wTotalLength`.
#[derive(Clone, Copy)]
pub struct ConfigurationDescriptor<'a>(&'a [u8]);

impl<'a> ConfigurationDescriptor<'a> {
    /// Returns `None` if the header is incomplete, or if `wTotalLength`
    /// exceeds `raw`
    pub fn new(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < CONFIGURATION_SIZE {
            return None;
        }
        let total = usize::from(u16::from_le_bytes([raw[2], raw[3]]));
        (total >= CONFIGURATION_SIZE && total <= raw.len()).then(|| ConfigurationDescriptor(&raw[..total]))
    }
    /// Everything up to `wTotalLength`
    pub fn bytes(&self) -> &'a [u8] {
        self.0
    }
    /// `wTotalLength`
    pub fn total_length(&self) -> u16 {
        self.0.len() as u16
    }
    /// `bConfigurationValue`
    pub fn value(&self) -> u8 {
        self.0[5]
    }
    /// `bmAttributes` bit 6
    pub fn is_self_powered(&self) -> bool {
        self.0[7] & 0x40 != 0
    }
    /// The interface, endpoint, and class descriptors after the header
    pub fn sub_descriptors(&self) -> SubDescriptors<'a> {
        SubDescriptors {
            rest: &self.0[usize::from(self.0[0]).min(self.0.len())..],
        }
    }
}

/// A device's descriptor tables
///
/// Configurations are in order, starting with configuration value 1.
/// String zero, if present, lists the supported language ID.
#[derive(Clone, Copy)]
pub struct Descriptors<'a> {
    device: &'a [u8],
    configurations: &'a [&'a [u8]],
    strings: &'a [&'a [u8]],
}

impl<'a> Descriptors<'a> {
    pub const fn new(
        device: &'a [u8],
        configurations: &'a [&'a [u8]],
        strings: &'a [&'a [u8]],
    ) -> Self {
        Descriptors {
            device,
            configurations,
            strings,
        }
    }

    /// The device descriptor, trimmed to `bLength`
    pub fn device(&self) -> &'a [u8] {
        let len = self.device.first().map_or(0, |len| usize::from(*len));
        &self.device[..len.min(self.device.len())]
    }

    /// `bNumConfigurations`
    pub fn num_configurations(&self) -> u8 {
        self.device.get(17).copied().unwrap_or(0)
    }

    /// The configuration with `bConfigurationValue` of `value`
    pub fn configuration(&self, value: u8) -> Option<ConfigurationDescriptor<'a>> {
        let index = usize::from(value).checked_sub(1)?;
        self.configurations
            .get(index)
            .and_then(|raw| ConfigurationDescriptor::new(raw))
    }

    /// String descriptor `index`, trimmed to `bLength`
    pub fn string(&self, index: u8) -> Option<&'a [u8]> {
        let raw = *self.strings.get(usize::from(index))?;
        let len = usize::from(*raw.first()?);
        raw.get(..len)
    }

    /// The language ID from string zero
    pub fn language_id(&self) -> Option<u16> {
        let langs = self.string(0)?;
        (langs.len() >= 4).then(|| u16::from_le_bytes([langs[2], langs[3]]))
    }

    /// Check the descriptors against what the stack supports
    ///
    /// `ep0_size` is the endpoint zero max packet size the stack will use;
    /// the device descriptor must declare the same.
    pub fn validate(&self, ep0_size: u16) -> Result<(), DescriptorError> {
        let device = self.device;
        if device.len() < DEVICE_SIZE
            || device[0] as usize != DEVICE_SIZE
            || device[1] != descriptor_type::DEVICE
            || u16::from(device[7]) != ep0_size
        {
            warn!("Device descriptor error");
            return Err(DescriptorError::Device);
        }
        if usize::from(self.num_configurations()) != self.configurations.len()
            || self.configurations.is_empty()
        {
            warn!("Configuration count mismatch");
            return Err(DescriptorError::ConfigurationCount);
        }
        for (index, raw) in self.configurations.iter().enumerate() {
            validate_configuration(raw, index as u8 + 1)?;
        }
        for (index, raw) in self.strings.iter().enumerate() {
            let ok = raw.len() >= 2
                && usize::from(raw[0]) <= raw.len()
                && raw[0] >= 2
                && raw[0] & 1 == 0
                && raw[1] == descriptor_type::STRING
                && (index != 0 || raw[0] >= 4);
            if !ok {
                warn!("String descriptor {=usize} error", index);
                return Err(DescriptorError::String { index: index as u8 });
            }
        }
        Ok(())
    }
}

/// Which endpoints a configuration has claimed so far
#[derive(Default)]
struct Claimed {
    out: [Option<TransferType>; crate::NUM_ENDPOINTS],
    in_: [Option<TransferType>; crate::NUM_ENDPOINTS],
}

fn validate_configuration(raw: &[u8], configuration: u8) -> Result<(), DescriptorError> {
    let header = DescriptorError::ConfigurationHeader { configuration };
    let config = ConfigurationDescriptor::new(raw).ok_or(header)?;
    let bytes = config.bytes();
    if bytes[0] as usize != CONFIGURATION_SIZE
        || bytes[1] != descriptor_type::CONFIGURATION
        || config.value() != configuration
    {
        warn!("Configuration {=u8} header error", configuration);
        return Err(header);
    }

    let mut claimed = Claimed::default();
    for desc in config.sub_descriptors() {
        let desc = desc.map_err(|_| DescriptorError::Malformed { configuration })?;
        match desc[1] {
            descriptor_type::INTERFACE => {
                if desc.len() != INTERFACE_SIZE || desc[3] != 0 {
                    warn!("Configuration {=u8} interface error", configuration);
                    return Err(DescriptorError::Interface { configuration });
                }
            }
            descriptor_type::ENDPOINT => validate_endpoint(desc, configuration, &mut claimed)?,
            descriptor_type::DEVICE | descriptor_type::CONFIGURATION | descriptor_type::STRING => {
                warn!("Configuration {=u8} has a nested descriptor", configuration);
                return Err(DescriptorError::Nested { configuration });
            }
            _other => {
                // Class specific descriptors are passed through.
                debug!("Configuration {=u8} has descriptor type {=u8}", configuration, _other);
            }
        }
    }
    Ok(())
}

fn validate_endpoint(
    raw: &[u8],
    configuration: u8,
    claimed: &mut Claimed,
) -> Result<(), DescriptorError> {
    let address = raw.get(2).copied().unwrap_or(0);
    let ep = EndpointDescriptor::new(raw)
        .filter(|ep| ep.number() != 0 && usize::from(ep.number()) < crate::NUM_ENDPOINTS)
        .filter(|ep| ep.address() & 0x70 == 0)
        .ok_or(DescriptorError::Endpoint {
            configuration,
            address,
        })?;

    let kind = ep.transfer_type();
    if !matches!(kind, TransferType::Bulk | TransferType::Interrupt) {
        warn!("Endpoint {=u8} has an unsupported type", address);
        return Err(DescriptorError::EndpointType {
            configuration,
            address,
        });
    }
    let mps = ep.max_packet_size();
    if mps == 0 || mps > crate::MAX_PACKET_SIZE {
        warn!("Endpoint {=u8} max packet size {=u16}", address, mps);
        return Err(DescriptorError::MaxPacketSize {
            configuration,
            address,
        });
    }

    let number = usize::from(ep.number());
    let (this, other) = match ep.direction() {
        UsbDirection::In => (&mut claimed.in_[number], claimed.out[number]),
        UsbDirection::Out => (&mut claimed.out[number], claimed.in_[number]),
    };
    if this.is_some() {
        warn!("Endpoint {=u8} used twice", address);
        return Err(DescriptorError::EndpointReused {
            configuration,
            address,
        });
    }
    if let Some(other) = other {
        if other != TransferType::Interrupt || kind != TransferType::Interrupt {
            warn!("Endpoint {=u8} shared by non-interrupt endpoints", address);
            return Err(DescriptorError::EndpointShared {
                configuration,
                address,
            });
        }
    }
    *this = Some(kind);
    Ok(())
}
