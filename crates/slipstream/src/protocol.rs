use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::event::Event;
use crate::gamestate::GameStateUpdate;
use crate::sqn::Sqn;
use crate::value::CodecError;

/// 4-byte identifier prefixed to every protocol datagram.
pub const PROTOCOL_ID: [u8; 4] = [0xff, 0xd0, 0xfa, 0xb9];

/// Hard cap on the serialized size of one datagram.
pub const MAX_PACKAGE_SIZE: usize = 2048;

/// Time after which a sent package is considered lost.
pub const PACKAGE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq)]
pub enum PackageError {
    #[error("datagram does not carry the protocol magic")]
    ProtocolIdMismatch,
    #[error("package exceeds the maximum size of {MAX_PACKAGE_SIZE} bytes")]
    Overflow,
    #[error("datagram ends in the middle of a record")]
    Truncated,
    #[error(transparent)]
    Codec(CodecError),
}

impl From<CodecError> for PackageError {
    fn from(err: CodecError) -> Self {
        PackageError::Codec(err)
    }
}

/// Selective acknowledgement for the 32 sequence numbers preceding an ack.
///
/// The most significant bit stands for `ack - 1`, the next for `ack - 2`,
/// down to the least significant bit for `ack - 32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBitfield(u32);

impl AckBitfield {
    pub const WIDTH: u16 = 32;

    pub const fn from_bits(bits: u32) -> Self {
        AckBitfield(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    fn mask(distance: u16) -> u32 {
        debug_assert!((1..=Self::WIDTH).contains(&distance));
        1 << (Self::WIDTH - distance)
    }

    /// Whether the sequence `ack - distance` is marked as received.
    pub fn get(self, distance: u16) -> bool {
        self.0 & Self::mask(distance) != 0
    }

    pub fn set(&mut self, distance: u16) {
        self.0 |= Self::mask(distance);
    }

    /// Account for the ack moving forward by `jump` sequence numbers: every
    /// recorded ack moves `jump` further into the past and the previous ack
    /// itself is recorded at distance `jump`.
    pub fn record_newer(&mut self, jump: u16) {
        self.0 = if jump >= Self::WIDTH {
            0
        } else {
            self.0 >> jump
        };
        if (1..=Self::WIDTH).contains(&jump) {
            self.set(jump);
        }
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        AckBitfield(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for AckBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032b}", self.0)
    }
}

/// Fixed 12-byte prefix of every datagram: protocol magic, the sender's
/// sequence number, the last remote sequence it received and the ack
/// bitfield covering the 32 sequences before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sequence: Sqn,
    pub ack: Sqn,
    pub ack_bitfield: AckBitfield,
}

impl Header {
    pub const SIZE: usize = 12;

    pub fn new(sequence: Sqn, ack: Sqn, ack_bitfield: AckBitfield) -> Self {
        Header {
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&PROTOCOL_ID);
        bytes[4..6].copy_from_slice(&self.sequence.to_bytes());
        bytes[6..8].copy_from_slice(&self.ack.to_bytes());
        bytes[8..12].copy_from_slice(&self.ack_bitfield.to_be_bytes());
        bytes
    }

    /// Split a datagram into its header and the remaining payload.
    pub fn deconstruct(datagram: &[u8]) -> Result<(Header, &[u8]), PackageError> {
        if datagram.len() < 4 || datagram[..4] != PROTOCOL_ID {
            return Err(PackageError::ProtocolIdMismatch);
        }
        if datagram.len() < Self::SIZE {
            return Err(PackageError::Truncated);
        }
        let sequence = Sqn::from_bytes([datagram[4], datagram[5]]);
        let ack = Sqn::from_bytes([datagram[6], datagram[7]]);
        let ack_bitfield = AckBitfield::from_be_bytes([
            datagram[8],
            datagram[9],
            datagram[10],
            datagram[11],
        ]);
        Ok((
            Header::new(sequence, ack, ack_bitfield),
            &datagram[Self::SIZE..],
        ))
    }
}

/// Which of the three package layouts a datagram uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Plain,
    Client,
    Server,
}

/// Role-dependent payload sitting between the header and the event block.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Events only.
    Plain,
    /// Client to server: the client's last known state `time_order`.
    Client { time_order: Sqn },
    /// Server to client: the delta bringing the client up to date.
    Server { update: GameStateUpdate },
}

impl Body {
    pub fn kind(&self) -> PackageKind {
        match self {
            Body::Plain => PackageKind::Plain,
            Body::Client { .. } => PackageKind::Client,
            Body::Server { .. } => PackageKind::Server,
        }
    }
}

/// The framed unit transported in one datagram: header, role-dependent body
/// and a block of length-prefixed events.
///
/// The serialized form is cached; adding an event to an already serialized
/// package appends to the cache instead of rebuilding the datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub header: Header,
    pub body: Body,
    events: Vec<Event>,
    datagram: Option<Vec<u8>>,
}

impl Package {
    pub fn new(header: Header, body: Body) -> Self {
        Package {
            header,
            body,
            events: Vec::new(),
            datagram: None,
        }
    }

    pub fn with_events(header: Header, body: Body, events: Vec<Event>) -> Self {
        Package {
            header,
            body,
            events,
            datagram: None,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Attach an event. Fails with [`PackageError::Overflow`] if the
    /// serialized package would exceed [`MAX_PACKAGE_SIZE`]; the package is
    /// left unchanged in that case.
    pub fn add_event(&mut self, event: Event) -> Result<(), PackageError> {
        if let Some(datagram) = &mut self.datagram {
            let bytes = event.to_bytes()?;
            if datagram.len() + bytes.len() + 2 > MAX_PACKAGE_SIZE {
                return Err(PackageError::Overflow);
            }
            datagram.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            datagram.extend_from_slice(&bytes);
        }
        self.events.push(event);
        Ok(())
    }

    pub fn byte_size(&mut self) -> Result<usize, PackageError> {
        Ok(self.to_datagram()?.len())
    }

    /// Serialize the package, reusing the cached datagram when present.
    pub fn to_datagram(&mut self) -> Result<&[u8], PackageError> {
        if self.datagram.is_none() {
            let mut datagram = self.header.to_bytes().to_vec();
            match &self.body {
                Body::Plain => {}
                Body::Client { time_order } => {
                    datagram.extend_from_slice(&time_order.to_bytes());
                }
                Body::Server { update } => {
                    let bytes = update.to_bytes()?;
                    if datagram.len() + bytes.len() + 2 > MAX_PACKAGE_SIZE {
                        return Err(PackageError::Overflow);
                    }
                    datagram.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    datagram.extend_from_slice(&bytes);
                }
            }
            for event in &self.events {
                let bytes = event.to_bytes()?;
                datagram.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                datagram.extend_from_slice(&bytes);
            }
            if datagram.len() > MAX_PACKAGE_SIZE {
                return Err(PackageError::Overflow);
            }
            self.datagram = Some(datagram);
        }
        Ok(self.datagram.as_deref().expect("datagram cache primed"))
    }

    /// Parse a datagram using the layout expected from the peer.
    pub fn from_datagram(datagram: &[u8], kind: PackageKind) -> Result<Package, PackageError> {
        let (header, payload) = Header::deconstruct(datagram)?;
        let (body, event_block) = match kind {
            PackageKind::Plain => (Body::Plain, payload),
            PackageKind::Client => {
                if payload.len() < 2 {
                    return Err(PackageError::Truncated);
                }
                let time_order = Sqn::from_bytes([payload[0], payload[1]]);
                (Body::Client { time_order }, &payload[2..])
            }
            PackageKind::Server => {
                if payload.len() < 2 {
                    return Err(PackageError::Truncated);
                }
                let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if payload.len() < 2 + len {
                    return Err(PackageError::Truncated);
                }
                let update = GameStateUpdate::from_bytes(&payload[2..2 + len])?;
                (Body::Server { update }, &payload[2 + len..])
            }
        };
        let events = read_event_block(event_block)?;
        Ok(Package {
            header,
            body,
            events,
            datagram: Some(datagram.to_vec()),
        })
    }
}

fn read_event_block(mut block: &[u8]) -> Result<Vec<Event>, PackageError> {
    let mut events = Vec::new();
    while !block.is_empty() {
        if block.len() < 2 {
            return Err(PackageError::Truncated);
        }
        let len = u16::from_be_bytes([block[0], block[1]]) as usize;
        if block.len() < 2 + len {
            return Err(PackageError::Truncated);
        }
        events.push(Event::from_bytes(&block[2..2 + len])?);
        block = &block[2 + len..];
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestate::GameStatus;
    use crate::value::Value;

    fn header(sequence: u16, ack: u16, bits: u32) -> Header {
        Header::new(
            Sqn::new(sequence),
            Sqn::new(ack),
            AckBitfield::from_bits(bits),
        )
    }

    #[test]
    fn header_roundtrip() {
        let h = header(4, 5, 0xAAAA_AAAA);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), Header::SIZE);
        let (parsed, rest) = Header::deconstruct(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert!(rest.is_empty());
    }

    #[test]
    fn header_rejects_missing_magic() {
        let h = header(1, 2, 0);
        let bytes = h.to_bytes();
        assert_eq!(
            Header::deconstruct(&bytes[1..]),
            Err(PackageError::ProtocolIdMismatch)
        );
        assert_eq!(
            Header::deconstruct(b"shutdown"),
            Err(PackageError::ProtocolIdMismatch)
        );
    }

    #[test]
    fn header_rejects_short_datagram() {
        let bytes = header(1, 2, 0).to_bytes();
        assert_eq!(
            Header::deconstruct(&bytes[..8]),
            Err(PackageError::Truncated)
        );
    }

    #[test]
    fn bitfield_display_is_msb_first() {
        let mut bits = AckBitfield::default();
        bits.set(1);
        assert_eq!(bits.to_string(), format!("1{}", "0".repeat(31)));
        bits.set(32);
        assert_eq!(bits.to_string(), format!("1{}1", "0".repeat(30)));
    }

    #[test]
    fn bitfield_record_newer_shifts_history() {
        let mut bits = AckBitfield::default();
        bits.record_newer(1);
        assert_eq!(bits.to_string(), format!("1{}", "0".repeat(31)));
        bits.record_newer(2);
        assert_eq!(bits.to_string(), format!("011{}", "0".repeat(29)));
        assert!(bits.get(2));
        assert!(bits.get(3));
        assert!(!bits.get(1));
    }

    #[test]
    fn bitfield_record_newer_large_jump_clears() {
        let mut bits = AckBitfield::from_bits(u32::MAX);
        bits.record_newer(40);
        assert_eq!(bits.bits(), 0);
    }

    #[test]
    fn plain_package_roundtrip() {
        let mut package = Package::new(header(4, 5, 0xF000_0001), Body::Plain);
        package
            .add_event(Event::new("TEST").arg("Foo").arg("Bar"))
            .unwrap();
        package.add_event(Event::new("OTHER").arg(1i64)).unwrap();
        let datagram = package.to_datagram().unwrap().to_vec();
        let parsed = Package::from_datagram(&datagram, PackageKind::Plain).unwrap();
        assert_eq!(parsed.header, package.header);
        assert_eq!(parsed.events(), package.events());
    }

    #[test]
    fn client_package_roundtrip() {
        let mut package = Package::new(
            header(9, 3, 0),
            Body::Client {
                time_order: Sqn::new(77),
            },
        );
        package.add_event(Event::new("MOVE").arg(0.5f32)).unwrap();
        let datagram = package.to_datagram().unwrap().to_vec();
        let parsed = Package::from_datagram(&datagram, PackageKind::Client).unwrap();
        assert_eq!(
            parsed.body,
            Body::Client {
                time_order: Sqn::new(77)
            }
        );
        assert_eq!(parsed.events(), package.events());
    }

    #[test]
    fn server_package_roundtrip() {
        let update = GameStateUpdate::with_status(Sqn::new(12), GameStatus::Active)
            .field("score", 3i64)
            .field("gone", Value::Delete);
        let mut package = Package::new(
            header(2, 1, 0x8000_0000),
            Body::Server {
                update: update.clone(),
            },
        );
        package.add_event(Event::new("CHAT").arg("hello")).unwrap();
        let datagram = package.to_datagram().unwrap().to_vec();
        let parsed = Package::from_datagram(&datagram, PackageKind::Server).unwrap();
        assert_eq!(parsed.body, Body::Server { update });
        assert_eq!(parsed.events(), package.events());
    }

    #[test]
    fn oversized_package_fails() {
        let mut package = Package::new(header(1, 4, 0), Body::Plain);
        package
            .add_event(Event::new("TEST").arg(Value::Bytes(vec![0; MAX_PACKAGE_SIZE])))
            .unwrap();
        assert_eq!(package.to_datagram().unwrap_err(), PackageError::Overflow);
    }

    #[test]
    fn add_event_appends_to_cached_datagram() {
        let mut package = Package::new(header(1, 2, 0), Body::Plain);
        package.add_event(Event::new("ONE").arg(1i64)).unwrap();
        let _ = package.to_datagram().unwrap();
        package.add_event(Event::new("TWO").arg(2i64)).unwrap();
        let cached = package.to_datagram().unwrap().to_vec();

        let mut rebuilt = Package::with_events(
            header(1, 2, 0),
            Body::Plain,
            vec![Event::new("ONE").arg(1i64), Event::new("TWO").arg(2i64)],
        );
        assert_eq!(rebuilt.to_datagram().unwrap(), cached.as_slice());
    }

    #[test]
    fn add_event_past_cap_leaves_cache_intact() {
        let mut package = Package::new(header(1, 2, 0), Body::Plain);
        let _ = package.to_datagram().unwrap();
        let before = package.to_datagram().unwrap().to_vec();
        let oversized = Event::new("BIG").arg(Value::Bytes(vec![0; MAX_PACKAGE_SIZE]));
        assert_eq!(package.add_event(oversized), Err(PackageError::Overflow));
        assert_eq!(package.to_datagram().unwrap(), before.as_slice());
        assert!(package.events().is_empty());
    }
}
