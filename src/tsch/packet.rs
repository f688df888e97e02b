//! Owned, `no_std` 802.15.4 frame representation used for TSCH data/command traffic.
//! Built on heapless's const-generic `Vec` rather than `typenum`-based `consts::U*` sizing.

use ieee802154::mac::command::Command;
use ieee802154::mac::*;

use heapless::Vec;

pub const MAX_PAYLOAD_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct Packet {
    pub header: Header,
    pub content: FrameContent,
    payload: Vec<u8, MAX_PAYLOAD_LEN>,
    pub footer: [u8; 2],
}

impl PartialEq for Packet {
    fn eq(&self, o: &Self) -> bool {
        self.header == o.header
            && self.content == o.content
            && self.payload() == o.payload()
            && self.footer == o.footer
    }
}

impl Packet {
    pub fn command(dest: Address, source: Address, seq: u8, command: Command) -> Packet {
        Packet {
            header: Header {
                frame_type: FrameType::MacCommand,
                frame_pending: false,
                security: Security::None,
                ack_request: true,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: dest,
                source,
                seq,
                seq_no_suppress: false,
                ie_present: false,
            },
            content: FrameContent::Command(command),
            payload: Vec::new(),
            footer: [0u8; 2],
        }
    }

    pub fn data(dest: Address, source: Address, seq: u8, data: &[u8], ack: bool) -> Packet {
        let payload = Vec::from_slice(data).unwrap_or_else(|_| Vec::new());

        Packet {
            header: Header {
                frame_type: FrameType::Data,
                frame_pending: false,
                security: Security::None,
                ack_request: ack,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: dest,
                source,
                seq,
                seq_no_suppress: false,
                ie_present: false,
            },
            content: FrameContent::Data,
            payload,
            footer: [0u8; 2],
        }
    }

    /// A non-sync ACK: the first three bytes of the wire format (§6), with no
    /// trailing IE. Used when the requesting frame came in on a cell with no
    /// time-keeping relationship to report.
    pub fn ack(request: &Packet) -> Packet {
        Packet {
            header: Header {
                frame_type: FrameType::Acknowledgement,
                frame_pending: false,
                security: Security::None,
                ack_request: false,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: request.header.source,
                source: request.header.destination,
                seq: request.header.seq,
                seq_no_suppress: false,
                ie_present: false,
            },
            content: FrameContent::Acknowledgement,
            payload: Vec::new(),
            footer: [0u8; 2],
        }
    }

    pub fn pan_id(&self) -> PanId {
        match self.header.destination {
            Address::Short(pan_id, _) => return pan_id,
            Address::Extended(pan_id, _) => return pan_id,
            _ => (),
        }
        match self.header.source {
            Address::Short(pan_id, _) => return pan_id,
            Address::Extended(pan_id, _) => return pan_id,
            _ => (),
        }
        PanId(0xFFFE)
    }

    pub fn is_ack_for(&self, original: &Packet) -> bool {
        self.header.frame_type == FrameType::Acknowledgement
            && self.header.seq == original.header.seq
            && self.content == FrameContent::Acknowledgement
    }

    pub fn encode(&self, buf: &mut [u8], write_footer: WriteFooter) -> usize {
        let mut len = 0;

        len += self.header.encode(&mut buf[len..]);
        len += self.content.encode(&mut buf[len..]);

        buf[len..len + self.payload.len()].copy_from_slice(&self.payload);
        len += self.payload.len();

        match write_footer {
            WriteFooter::No => (),
        }
        len
    }

    pub fn decode(buf: &[u8], contains_footer: bool) -> Result<Self, DecodeError> {
        let mut remaining = buf.len();

        let (header, header_len) = Header::decode(buf)?;
        remaining -= header_len;

        let mut footer = [0; 2];
        if contains_footer {
            if remaining < 2 {
                return Err(DecodeError::NotEnoughBytes);
            }
            let footer_pos = buf.len() - 2;
            footer.copy_from_slice(&buf[footer_pos..]);
            remaining -= 2;
        }

        let body = &buf[header_len..header_len + remaining];
        let (content, used) = FrameContent::decode(body, &header)?;
        remaining -= used;
        let _ = remaining;

        let payload = Vec::from_slice(&body[used..]).map_err(|_e| DecodeError::NotEnoughBytes)?;

        Ok(Packet { header, content, payload, footer })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), ()> {
        self.payload = Vec::from_slice(body)?;
        Ok(())
    }
}

#[cfg(feature = "std")]
impl Into<std::vec::Vec<u8>> for Packet {
    fn into(self) -> std::vec::Vec<u8> {
        let mut buff = [0u8; MAX_PAYLOAD_LEN + 32];
        let n = self.encode(&mut buff, WriteFooter::No);
        buff[..n].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ieee802154::mac::{PanId, ShortAddress};

    #[test]
    fn data_frame_round_trips_payload() {
        let dest = Address::Short(PanId(1), ShortAddress(2));
        let src = Address::Short(PanId(1), ShortAddress(1));
        let p = Packet::data(dest, src, 7, b"hello", true);
        assert_eq!(p.payload(), b"hello");
        assert!(p.header.ack_request);
    }

    #[test]
    fn ack_addresses_are_swapped() {
        let dest = Address::Short(PanId(1), ShortAddress(2));
        let src = Address::Short(PanId(1), ShortAddress(1));
        let req = Packet::data(dest, src, 9, b"x", true);
        let ack = Packet::ack(&req);
        assert_eq!(ack.header.source, dest);
        assert_eq!(ack.header.destination, src);
        assert_eq!(ack.header.seq, 9);
        assert!(ack.is_ack_for(&req));
    }
}
