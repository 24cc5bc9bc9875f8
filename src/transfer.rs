use num_enum::{FromPrimitive, IntoPrimitive};

use crate::descriptor::{DescriptorType, EndpointDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    /// Class request, HID `SET_PROTOCOL`
    SetProtocol = 0x0B,
    #[num_enum(catch_all)]
    Other(u8),
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetupData {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    pub fn new(
        direction: Direction,
        ty: RequestType,
        recipient: Recipient,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        Self {
            request_type: dir | (u8::from(ty) << 5) | u8::from(recipient),
            request: request.into(),
            value,
            index,
            length,
        }
    }

    pub fn get_descriptor(ty: DescriptorType, index: u8, length: u16) -> Self {
        Self::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GetDescriptor,
            ((u8::from(ty) as u16) << 8) | index as u16,
            0,
            length,
        )
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetConfiguration,
            value as u16,
            0,
            0,
        )
    }

    /// `SET_PROTOCOL` to the boot protocol (wValue 0).
    pub fn set_boot_protocol(interface: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Class,
            Recipient::Interface,
            Request::SetProtocol,
            0,
            interface as u16,
            0,
        )
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn request(&self) -> Request {
        Request::from(self.request)
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::from((self.value >> 8) as u8)
    }
}

/// An endpoint named by its device context index (2 * number + IN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u8);

impl EndpointId {
    pub const DEFAULT_CONTROL_PIPE: EndpointId = EndpointId(1);

    pub fn from_dci(dci: u8) -> Self {
        Self(dci)
    }

    pub fn from_number_in(number: u8) -> Self {
        Self((number << 1) | 1)
    }

    pub fn from_number_out(number: u8) -> Self {
        Self((number << 1) | (number == 0) as u8)
    }

    pub fn dci(&self) -> u8 {
        self.0
    }

    pub fn number(&self) -> u8 {
        self.0 >> 1
    }

    pub fn is_in(&self) -> bool {
        self.0 & 1 == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    fn from_attributes(attr: u8) -> Self {
        match attr & 0b11 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    pub fn to_xhci(self, is_in: bool) -> xhci::context::EndpointType {
        use xhci::context::EndpointType as X;
        match (self, is_in) {
            (EndpointType::Control, _) => X::Control,
            (EndpointType::Isochronous, false) => X::IsochOut,
            (EndpointType::Isochronous, true) => X::IsochIn,
            (EndpointType::Bulk, false) => X::BulkOut,
            (EndpointType::Bulk, true) => X::BulkIn,
            (EndpointType::Interrupt, false) => X::InterruptOut,
            (EndpointType::Interrupt, true) => X::InterruptIn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub ep_id: EndpointId,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl From<&EndpointDescriptor> for EndpointConfig {
    fn from(desc: &EndpointDescriptor) -> Self {
        let ep_id = if desc.is_in() {
            EndpointId::from_number_in(desc.number())
        } else {
            EndpointId::from_number_out(desc.number())
        };
        Self {
            ep_id,
            ep_type: EndpointType::from_attributes(desc.attributes),
            max_packet_size: desc.max_packet_size & 0x7FF,
            interval: desc.interval,
        }
    }
}
