//! Standard USB descriptors, decoded from the little-endian wire layout.

use num_enum::{FromPrimitive, IntoPrimitive};

/// USB Device Class Codes as defined by USB-IF
/// https://www.usb.org/defined-class-codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BaseClass {
    /// Use class information in the Interface Descriptors
    UseInterface = 0x00,
    Audio = 0x01,
    Communication = 0x02,
    /// HID (Human Interface Device)
    Hid = 0x03,
    Printer = 0x07,
    MassStorage = 0x08,
    Hub = 0x09,
    Video = 0x0E,
    Wireless = 0xE0,
    Miscellaneous = 0xEF,
    Application = 0xFE,
    Vendor = 0xFF,
    #[num_enum(catch_all)]
    Other(u8) = 0x10,
}

/// HID interface subclass advertising the boot protocol.
pub const HID_SUBCLASS_BOOT: u8 = 1;
pub const HID_PROTOCOL_KEYBOARD: u8 = 1;
pub const HID_PROTOCOL_MOUSE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    Hid = 0x21,
    #[num_enum(catch_all)]
    Unknown(u8),
}

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn header(buf: &[u8], ty: DescriptorType, min_len: usize) -> Option<()> {
    if buf.len() < min_len || (buf[0] as usize) < min_len {
        return None;
    }
    if DescriptorType::from(buf[1]) != ty {
        return None;
    }
    Some(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;
    /// Enough of the descriptor to learn the default pipe's packet size.
    pub const PROBE_LEN: usize = 8;

    /// Decodes a full descriptor, or its 8-byte prefix with the
    /// remaining fields left zero.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::PROBE_LEN || DescriptorType::from(buf[1]) != DescriptorType::Device {
            return None;
        }
        let mut desc = Self {
            usb_release: le16(buf, 2),
            class: buf[4],
            subclass: buf[5],
            protocol: buf[6],
            max_packet_size_0: buf[7],
            ..Default::default()
        };
        if buf.len() >= Self::LEN {
            desc.vendor_id = le16(buf, 8);
            desc.product_id = le16(buf, 10);
            desc.device_release = le16(buf, 12);
            desc.num_configurations = buf[17];
        }
        Some(desc)
    }

    /// bMaxPacketSize0 is an exponent for USB 3.x devices.
    pub fn ep0_max_packet_size(&self) -> u16 {
        if self.usb_release >= 0x0300 {
            1u16 << self.max_packet_size_0.min(15)
        } else {
            self.max_packet_size_0 as u16
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LEN: usize = 9;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        header(buf, DescriptorType::Configuration, Self::LEN)?;
        Some(Self {
            total_length: le16(buf, 2),
            num_interfaces: buf[4],
            configuration_value: buf[5],
            attributes: buf[7],
            max_power: buf[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        header(buf, DescriptorType::Interface, Self::LEN)?;
        Some(Self {
            interface_number: buf[2],
            alternate_setting: buf[3],
            num_endpoints: buf[4],
            interface_class: buf[5],
            interface_sub_class: buf[6],
            interface_protocol: buf[7],
        })
    }

    pub fn class(&self) -> BaseClass {
        BaseClass::from(self.interface_class)
    }

    pub fn is_boot_mouse(&self) -> bool {
        self.class() == BaseClass::Hid
            && self.interface_sub_class == HID_SUBCLASS_BOOT
            && self.interface_protocol == HID_PROTOCOL_MOUSE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        header(buf, DescriptorType::Endpoint, Self::LEN)?;
        Some(Self {
            endpoint_address: buf[2],
            attributes: buf[3],
            max_packet_size: le16(buf, 4),
            interval: buf[6],
        })
    }

    pub fn number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }

    pub fn transfer_type(&self) -> u8 {
        self.attributes & 0b11
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidDescriptor {
    pub hid_release: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
}

impl HidDescriptor {
    pub const LEN: usize = 6;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        header(buf, DescriptorType::Hid, Self::LEN)?;
        Some(Self {
            hid_release: le16(buf, 2),
            country_code: buf[4],
            num_descriptors: buf[5],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Configuration(ConfigurationDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    Hid(HidDescriptor),
    Other(DescriptorType),
}

/// Walks the descriptors packed in a configuration blob.
///
/// Iteration ends at the first entry whose length is shorter than a
/// header or runs past the end of the buffer.
pub struct DescriptorIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl Iterator for DescriptorIter<'_> {
    type Item = Descriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.pos..)?;
        if rest.len() < 2 {
            return None;
        }
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            return None;
        }
        let raw = &rest[..len];
        self.pos += len;

        let ty = DescriptorType::from(raw[1]);
        let desc = match ty {
            DescriptorType::Configuration => {
                ConfigurationDescriptor::parse(raw).map(Descriptor::Configuration)
            }
            DescriptorType::Interface => InterfaceDescriptor::parse(raw).map(Descriptor::Interface),
            DescriptorType::Endpoint => EndpointDescriptor::parse(raw).map(Descriptor::Endpoint),
            DescriptorType::Hid => HidDescriptor::parse(raw).map(Descriptor::Hid),
            _ => None,
        };
        Some(desc.unwrap_or(Descriptor::Other(ty)))
    }
}
