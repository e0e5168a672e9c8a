//! Wire format: a 20 byte big-endian header followed by up to 64 bytes of
//! payload, one segment per datagram. The checksum is CRC-16-CCITT computed
//! over the whole segment with the checksum field zeroed.

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Largest payload a single segment may carry.
pub const MAX_PAYLOAD: usize = 64;

/// Largest datagram the protocol produces.
pub const MAX_SEGMENT: usize = HEADER_SIZE + MAX_PAYLOAD;

pub const SYN: u16 = 1 << 0;
pub const ACK: u16 = 1 << 1;
pub const FIN: u16 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("datagram is shorter than a segment header")]
    TooShort,

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("size field disagrees with the datagram length")]
    InconsistentSize,

    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u16,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    /// A payload-less segment, as used for SYN, ACK and FIN exchanges.
    pub fn control(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u16,
        window: u16,
    ) -> Self {
        Segment {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            flags,
            window,
            payload: Vec::new(),
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags & SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FIN != 0
    }

    /// Sequence space the segment occupies: its payload, plus one for SYN
    /// and FIN each.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.is_syn()) + u32::from(self.is_fin())
    }

    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(SegmentError::PayloadTooLarge);
        }

        Ok(self.to_datagram())
    }

    /// Serializes a segment whose payload is already known to fit.
    pub(crate) fn to_datagram(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.extend_from_slice(&self.ack_num.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        // Checksum is computed over the image with this field zeroed, then
        // written back.
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        let checksum = crc16(&buf);
        buf[14..16].copy_from_slice(&checksum.to_be_bytes());

        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Segment, SegmentError> {
        if datagram.len() < HEADER_SIZE {
            return Err(SegmentError::TooShort);
        }

        let src_port = u16::from_be_bytes([datagram[0], datagram[1]]);
        let dst_port = u16::from_be_bytes([datagram[2], datagram[3]]);
        let seq_num = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let ack_num = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let flags = u16::from_be_bytes([datagram[12], datagram[13]]);
        let checksum = u16::from_be_bytes([datagram[14], datagram[15]]);
        let window = u16::from_be_bytes([datagram[16], datagram[17]]);
        let size = u16::from_be_bytes([datagram[18], datagram[19]]) as usize;

        if size > MAX_PAYLOAD || datagram.len() != HEADER_SIZE + size {
            return Err(SegmentError::InconsistentSize);
        }

        let mut image = datagram.to_vec();
        image[14] = 0;
        image[15] = 0;
        if crc16(&image) != checksum {
            return Err(SegmentError::BadChecksum);
        }

        Ok(Segment {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            flags,
            window,
            payload: datagram[HEADER_SIZE..].to_vec(),
        })
    }
}

/// CRC-16-CCITT: polynomial 0x1021, initial value 0xFFFF, no reflection.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // The standard check value for CRC-16-CCITT with init 0xFFFF.
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn roundtrip() {
        let segment = Segment {
            src_port: 40000,
            dst_port: 9090,
            seq_num: 0x1234_5678,
            ack_num: 0x0BAD_CAFE,
            flags: ACK | FIN,
            window: 4096,
            payload: b"hello over datagrams".to_vec(),
        };

        let datagram = segment.encode().unwrap();
        assert_eq!(datagram.len(), HEADER_SIZE + segment.payload.len());
        assert_eq!(Segment::decode(&datagram).unwrap(), segment);
    }

    #[test]
    fn payload_bounds() {
        for len in [0, 1, MAX_PAYLOAD] {
            let segment = Segment {
                src_port: 1,
                dst_port: 2,
                seq_num: 3,
                ack_num: 4,
                flags: ACK,
                window: 100,
                payload: vec![0xAB; len],
            };
            let datagram = segment.encode().unwrap();
            assert_eq!(Segment::decode(&datagram).unwrap(), segment);
        }

        let oversized = Segment {
            src_port: 1,
            dst_port: 2,
            seq_num: 3,
            ack_num: 4,
            flags: ACK,
            window: 100,
            payload: vec![0xAB; MAX_PAYLOAD + 1],
        };
        assert_eq!(oversized.encode(), Err(SegmentError::PayloadTooLarge));
    }

    #[test]
    fn rejects_short_datagram() {
        assert_eq!(Segment::decode(&[0u8; 7]), Err(SegmentError::TooShort));
        assert_eq!(
            Segment::decode(&[0u8; HEADER_SIZE - 1]),
            Err(SegmentError::TooShort)
        );
    }

    #[test]
    fn rejects_inconsistent_size() {
        let segment = Segment::control(1, 2, 3, 4, SYN, 64);
        let mut datagram = segment.encode().unwrap();

        // Extra trailing byte the size field does not account for.
        datagram.push(0);
        assert_eq!(
            Segment::decode(&datagram),
            Err(SegmentError::InconsistentSize)
        );

        // Size field claiming more payload than the datagram carries.
        let mut truncated = segment.encode().unwrap();
        truncated[19] = 8;
        assert_eq!(
            Segment::decode(&truncated),
            Err(SegmentError::InconsistentSize)
        );
    }

    #[test]
    fn rejects_flipped_bit() {
        let segment = Segment {
            src_port: 7,
            dst_port: 8,
            seq_num: 100,
            ack_num: 0,
            flags: ACK,
            window: 512,
            payload: b"payload".to_vec(),
        };

        let datagram = segment.encode().unwrap();
        for index in [0, 5, 13, HEADER_SIZE + 2] {
            let mut corrupted = datagram.clone();
            corrupted[index] ^= 0x10;
            assert_eq!(
                Segment::decode(&corrupted),
                Err(SegmentError::BadChecksum),
                "corruption at byte {index} must not pass verification"
            );
        }

        // The untouched image still decodes.
        assert!(Segment::decode(&datagram).is_ok());
    }

    #[test]
    fn seq_len_counts_syn_and_fin() {
        let syn = Segment::control(1, 2, 100, 0, SYN, 64);
        assert_eq!(syn.seq_len(), 1);

        let fin = Segment::control(1, 2, 100, 0, FIN | ACK, 64);
        assert_eq!(fin.seq_len(), 1);

        let data = Segment {
            payload: vec![0; 10],
            ..Segment::control(1, 2, 100, 0, ACK, 64)
        };
        assert_eq!(data.seq_len(), 10);
    }
}
