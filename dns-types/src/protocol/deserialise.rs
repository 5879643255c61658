//! Deserialisation of DNS messages from the wire.  See the `types`
//! module for the layout of each piece.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let id = wire_header.header.id;

        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = QueryType::deserialise(id, buffer)?;
        let qclass = QueryClass::deserialise(id, buffer)?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::deserialise(id, buffer)?;
        let rclass = RecordClass::deserialise(id, buffer)?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_start = buffer.position();

        // Only class IN is interpreted; everything else (and every
        // record type this resolver does not cache) is carried as
        // opaque octets, but the cursor must still advance by exactly
        // `rdlength` so later records in the message can be parsed.
        let rtype_with_data = if !matches!(rclass, RecordClass::IN) {
            let octets = buffer
                .take(rdlength as usize)
                .ok_or(Error::ResourceRecordTooShort(id))?
                .to_vec();
            RecordTypeWithData::Unknown { tag: rtype, octets }
        } else {
            match rtype {
                RecordType::A => RecordTypeWithData::A {
                    address: Ipv4Addr::from(
                        buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                    ),
                },
                RecordType::NS => RecordTypeWithData::NS {
                    nsdname: DomainName::deserialise(id, buffer)?,
                },
                RecordType::AAAA => RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(u128::from_be_bytes(
                        buffer
                            .take(16)
                            .ok_or(Error::ResourceRecordTooShort(id))?
                            .try_into()
                            .unwrap(),
                    )),
                },
                RecordType::Unknown(_) => RecordTypeWithData::Unknown {
                    tag: rtype,
                    octets: buffer
                        .take(rdlength as usize)
                        .ok_or(Error::ResourceRecordTooShort(id))?
                        .to_vec(),
                },
            }
        };

        let rdata_stop = buffer.position();
        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut labels = Vec::<Vec<u8>>::with_capacity(5);
        let start = buffer.position();

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                octets.push(size);

                if size == 0 {
                    labels.push(Vec::new());
                    break;
                }

                let label = buffer
                    .take(size as usize)
                    .ok_or(Error::DomainTooShort(id))?
                    .to_vec();
                octets.extend_from_slice(&label);
                labels.push(label);

                if octets.len() > DOMAINNAME_MAX_LEN {
                    break;
                }
            } else if size >= 192 {
                // A pointer: the top two bits (already known to be
                // set, since `size > LABEL_MAX_LEN`) plus the next
                // octet give a 14 bit absolute offset into the whole
                // message.  Following it requires the entire buffer,
                // not just the remainder - that's what `at_offset`
                // gives us, a fresh cursor over the same octets.
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                // Must point strictly backwards, or a pointer chain
                // could loop forever (RFC 1035 section 4.1.4).
                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let mut pointee = DomainName::deserialise(id, &mut buffer.at_offset(ptr))?;
                octets.append(&mut pointee.octets);
                labels.append(&mut pointee.labels);
                break;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { octets, labels })
        } else {
            Err(Error::DomainTooLong(id))
        }
    }
}

impl QueryType {
    /// # Errors
    ///
    /// If the query type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl QueryClass {
    /// # Errors
    ///
    /// If the query class is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl RecordType {
    /// # Errors
    ///
    /// If the record type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl RecordClass {
    /// # Errors
    ///
    /// If the record class is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        Ok(Self::from(value))
    }
}

/// Errors encountered when parsing a datagram.  Every variant except
/// `CompletelyBusted` carries the message ID, so the caller can send
/// back a `FormatError` response linked to the right query.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't contain a
    /// valid ID.  No response can be linked to the query in this case.
    CompletelyBusted,
    /// The header is missing one or more required fields.
    HeaderTooShort(u16),
    /// A question ends with an incomplete field.
    QuestionTooShort(u16),
    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),
    /// A resource record's RDATA did not consume exactly `RDLENGTH` octets.
    ResourceRecordInvalid(u16),
    /// A domain name is incomplete.
    DomainTooShort(u16),
    /// A domain name is over 255 octets in size.
    DomainTooLong(u16),
    /// A domain name pointer points to or after the current record.
    DomainPointerInvalid(u16),
    /// A domain name label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to contain an ID"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid(_) => write!(f, "resource record RDATA length mismatch"),
            Error::DomainTooShort(_) => write!(f, "domain name too short"),
            Error::DomainTooLong(_) => write!(f, "domain name over 255 octets"),
            Error::DomainPointerInvalid(_) => write!(f, "domain name pointer points forward"),
            Error::DomainLabelInvalid(_) => write!(f, "domain name label length invalid"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which is consumed as a message is parsed.  Holds the
/// entire datagram (not just the unread remainder) so that
/// `at_offset` can create a second, independent cursor for following
/// a compression pointer without disturbing the caller's position.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        let a = *self.octets.get(self.position)?;
        self.position += 1;
        Some(a)
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let bytes = self.octets.get(self.position..self.position + 2)?;
        self.position += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let bytes = self.octets.get(self.position..self.position + 4)?;
        self.position += 4;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        let slice = self.octets.get(self.position..self.position + size)?;
        self.position += size;
        Some(slice)
    }

    /// A fresh cursor over the same underlying octets, repositioned to
    /// an absolute offset.  Reads through the returned cursor do not
    /// advance `self`.
    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn header_parse() {
        #[rustfmt::skip]
        let bytes = [
            0x30, 0x39, // ID = 12345
            0b1000_0001, // QR=1, opcode=0, AA=0, TC=0, RD=1
            0b1000_0000, // RA=1, Z=0, RCODE=0
            0, 1, // QDCOUNT
            0, 0, // ANCOUNT
            0, 0, // NSCOUNT
            0, 0, // ARCOUNT
        ];
        let header = WireHeader::deserialise(&mut ConsumableBuffer::new(&bytes)).unwrap();
        assert_eq!(header.header.id, 12345);
        assert!(header.header.is_response);
        assert_eq!(header.header.opcode, Opcode::Standard);
        assert!(!header.header.is_authoritative);
        assert!(header.header.recursion_desired);
        assert!(header.header.recursion_available);
        assert_eq!(header.header.rcode, Rcode::NoError);
        assert_eq!(header.qdcount, 1);
    }

    #[test]
    fn header_parse_concrete_scenario() {
        // Fixed transcript from a real response: ID, flags, and section
        // counts only, since this checks header parsing in isolation.
        let bytes = [0xe7, 0x26, 0x81, 0x80, 0x00, 0x01, 0x00, 0x04, 0x00, 0x03, 0x00, 0x04];
        let mut buffer = ConsumableBuffer::new(&bytes);
        let wire = WireHeader::deserialise(&mut buffer).unwrap();
        assert_eq!(wire.header.id, 0xe726);
        assert!(wire.header.is_response);
        assert_eq!(wire.header.opcode, Opcode::Standard);
        assert!(!wire.header.is_authoritative);
        assert!(!wire.header.is_truncated);
        assert!(wire.header.recursion_desired);
        assert!(wire.header.recursion_available);
        assert_eq!(wire.header.rcode, Rcode::NoError);
        assert_eq!(
            (wire.qdcount, wire.ancount, wire.nscount, wire.arcount),
            (1, 4, 3, 4)
        );
        assert_eq!(buffer.position(), 12);
    }

    #[test]
    fn name_with_pointer() {
        // message: [root label at 0..1] [www.example.com at 1..] then
        // a second name which is purely a pointer back to offset 1.
        #[rustfmt::skip]
        let bytes = [
            0, // offset 0: root
            3, b'w', b'w', b'w',
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
            3, b'c', b'o', b'm',
            0, // offset 16: end of "www.example.com."
            0b1100_0000, 1, // pointer to offset 1
        ];
        let mut buffer = ConsumableBuffer::new(&bytes);
        buffer.take(17).unwrap(); // skip past the root + literal name

        let name = DomainName::deserialise(0, &mut buffer).unwrap();
        assert_eq!(name.to_dotted_string(), "www.example.com.");
        // the pointer itself is 2 octets at the call site, regardless
        // of how many octets were traversed inside the pointee.
        assert_eq!(buffer.position(), 19);
    }

    #[test]
    fn name_pointer_must_point_backwards() {
        let bytes = [0b1100_0000, 0]; // pointer to offset 0, i.e. itself
        let mut buffer = ConsumableBuffer::new(&bytes);
        assert_eq!(
            DomainName::deserialise(0, &mut buffer),
            Err(Error::DomainPointerInvalid(0))
        );
    }

    #[test]
    fn unknown_rdata_is_preserved_and_cursor_advances() {
        #[rustfmt::skip]
        let bytes = [
            0, // root name
            0, 15, // TYPE = MX (15), not interpreted by this resolver
            0, 1, // CLASS = IN
            0, 0, 1, 44, // TTL = 300
            0, 4, // RDLENGTH = 4
            9, 9, 9, 9, // opaque RDATA
        ];
        let rr = ResourceRecord::deserialise(0, &mut ConsumableBuffer::new(&bytes)).unwrap();
        assert_eq!(
            rr.rtype_with_data,
            RecordTypeWithData::Unknown {
                tag: RecordType::from(15),
                octets: vec![9, 9, 9, 9],
            }
        );
    }

    #[test]
    fn a_record_roundtrips_rtype() {
        let rr = a_record("example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(rr.rtype_with_data.rtype(), RecordType::A);
    }
}
