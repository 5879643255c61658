//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for the layout of each piece.

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (some values, like record counts, do
    /// not fit the wire format's width).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long to fit in `RDLENGTH`.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below, once we know how much RDATA was written
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => buffer.write_octets(&nsdname.octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        }

        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Writes the name as literal labels.  Does not emit compression
    /// pointers: doing so would require tracking previously-written
    /// names and their offsets in `WritableBuffer`, which messages
    /// sent by this resolver are small enough not to need.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer written to during serialisation.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = a_record("www.example.com.", std::net::Ipv4Addr::new(93, 184, 216, 34));
        rr.serialise(&mut buf).unwrap();

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_0001, // A
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0000_0100, // 4 octets
                // RDATA
                93, 184, 216, 34,
            ],
            buf.octets,
        );
    }

    #[test]
    fn query_encode() {
        let msg = Message::from_question(
            0x1234,
            crate::protocol::types::Question {
                name: crate::protocol::types::test_util::domain("example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        let bytes = msg.into_octets().unwrap();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        assert_eq!(bytes[2], 0b0000_0001); // RD set, everything else clear
        assert_eq!(bytes[3], 0b0000_0000);
        assert_eq!(&bytes[4..6], &[0, 1]); // QDCOUNT
        assert_eq!(&bytes[6..12], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn create_query_matches_concrete_scenario() {
        // An upstream query has RD=0, unlike a client-facing one from
        // `Message::from_question` (see `recursive::query_one`, which clears
        // `recursion_desired` before sending).
        let message = Message {
            header: Header {
                id: 0xe726,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("yandex.ru."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };
        let bytes = message.into_octets().unwrap();
        assert_eq!(bytes.len(), 27);
        #[rustfmt::skip]
        assert_eq!(
            bytes,
            vec![
                0xe7, 0x26, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                6, b'y', b'a', b'n', b'd', b'e', b'x', 2, b'r', b'u', 0,
                0x00, 0x01, 0x00, 0x01,
            ]
        );
    }

    #[test]
    fn domainname_serialise_never_compresses() {
        let mut buf = WritableBuffer::default();
        domain("a.b.").serialise(&mut buf);
        assert_eq!(buf.octets, vec![1, b'a', 1, b'b', 0]);
    }
}
