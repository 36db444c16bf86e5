/// Bit-level CAN frame codec
///
/// Turns an (identifier, payload) pair into the exact sequence of bus bits a
/// transmitter drives, each labelled with the protocol field it belongs to.
/// Bit stuffing is applied over SOF..CRC and the CRC-15 check value is
/// computed over the unstuffed SOF..Data bits.
use crate::types::{BitPolarity, CanFrame, FrameField, MAX_PAYLOAD_LEN, MAX_STANDARD_ID};
use crc::{Crc, CRC_15_CAN};
use std::fmt;

/// CRC-15/CAN generator polynomial (x^15 implicit)
pub const CRC15_POLY: u16 = 0x4599;

const CAN_CRC: Crc<u16> = Crc::<u16>::new(&CRC_15_CAN);

/// Number of identical bits after which a stuff bit is inserted
pub const STUFF_RUN_LENGTH: usize = 5;

pub const EOF_LEN: usize = 7;
pub const INTERMISSION_LEN: usize = 3;

/// Stuffed bit sequence of one data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStream {
    bits: Vec<(BitPolarity, FrameField)>,
    crc: u16,
}

impl EncodedStream {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<(BitPolarity, FrameField)> {
        self.bits.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(BitPolarity, FrameField)> {
        self.bits.iter()
    }

    pub fn bits(&self) -> &[(BitPolarity, FrameField)] {
        &self.bits
    }

    /// Bus levels only, without field labels
    pub fn polarities(&self) -> Vec<BitPolarity> {
        self.bits.iter().map(|(b, _)| *b).collect()
    }

    /// CRC-15 value carried in the CRC field
    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Number of inserted stuff bits
    pub fn stuff_count(&self) -> usize {
        self.bits
            .iter()
            .filter(|(_, field)| *field == FrameField::Stuff)
            .count()
    }

    /// Length of the stuffed region (SOF through CRC, stuff bits included)
    pub fn stuffed_span_len(&self) -> usize {
        self.bits
            .iter()
            .position(|(_, field)| *field == FrameField::CrcDelimiter)
            .unwrap_or(self.bits.len())
    }

    /// Bits with stuff bits removed
    pub fn destuffed(&self) -> Vec<(BitPolarity, FrameField)> {
        self.bits
            .iter()
            .filter(|(_, field)| *field != FrameField::Stuff)
            .copied()
            .collect()
    }

    /// Render as a string of 0/1 logic levels
    pub fn render(&self) -> String {
        self.bits.iter().map(|(b, _)| b.to_string()).collect()
    }
}

/// Errors raised when reading a bit stream back into a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A mandatory field is absent or too short
    MissingField(FrameField),
    /// DLC above 8
    InvalidDlc(u8),
    /// Data bit count disagrees with the DLC
    DataLengthMismatch { expected: usize, actual: usize },
    /// Received CRC does not match the computed one
    CrcMismatch { received: u16, computed: u16 },
    /// Stuff bit labels disagree with the stuffing rule
    StuffViolation,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingField(field) => {
                write!(f, "Missing or truncated field {}", field.short_name())
            }
            DecodeError::InvalidDlc(dlc) => write!(f, "Invalid DLC {}", dlc),
            DecodeError::DataLengthMismatch { expected, actual } => write!(
                f,
                "Data length mismatch: expected {} bits, found {}",
                expected, actual
            ),
            DecodeError::CrcMismatch { received, computed } => write!(
                f,
                "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
                received, computed
            ),
            DecodeError::StuffViolation => write!(f, "Stuff bits do not follow the stuffing rule"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Compute the CRC-15/CAN value of a bit sequence
///
/// Bits are packed MSB-first and left-padded with zeros to a byte boundary;
/// leading zeros do not change a zero-initialised, unreflected CRC.
pub fn crc15<I>(bits: I) -> u16
where
    I: IntoIterator<Item = BitPolarity>,
{
    let bits: Vec<u8> = bits.into_iter().map(BitPolarity::as_bit).collect();
    let pad = (8 - bits.len() % 8) % 8;
    let bytes: Vec<u8> = std::iter::repeat(0u8)
        .take(pad)
        .chain(bits)
        .collect::<Vec<u8>>()
        .chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, bit| (acc << 1) | bit))
        .collect();
    CAN_CRC.checksum(&bytes)
}

fn push_bits(out: &mut Vec<(BitPolarity, FrameField)>, value: u32, width: u32, field: FrameField) {
    for i in (0..width).rev() {
        out.push((BitPolarity::from_bit((value >> i) & 1 == 1), field));
    }
}

/// Insert stuff bits into the SOF..CRC region
///
/// A run counter restarts after every inserted bit; the stuff bit itself is
/// not counted toward the following run.
fn stuff(raw: &[(BitPolarity, FrameField)]) -> Vec<(BitPolarity, FrameField)> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / STUFF_RUN_LENGTH);
    let mut run_value: Option<BitPolarity> = None;
    let mut run_length = 0usize;

    for &(bit, field) in raw {
        out.push((bit, field));

        if run_value == Some(bit) {
            run_length += 1;
        } else {
            run_value = Some(bit);
            run_length = 1;
        }

        if run_length == STUFF_RUN_LENGTH {
            out.push((bit.complement(), FrameField::Stuff));
            run_value = None;
            run_length = 0;
        }
    }

    out
}

/// Remove stuff bits from an unlabelled stuffed region
pub fn destuff_bits(bits: &[BitPolarity]) -> Vec<BitPolarity> {
    let mut out = Vec::with_capacity(bits.len());
    let mut run_value: Option<BitPolarity> = None;
    let mut run_length = 0usize;
    let mut skip_next = false;

    for &bit in bits {
        if skip_next {
            skip_next = false;
            continue;
        }

        out.push(bit);

        if run_value == Some(bit) {
            run_length += 1;
        } else {
            run_value = Some(bit);
            run_length = 1;
        }

        if run_length == STUFF_RUN_LENGTH {
            skip_next = true;
            run_value = None;
            run_length = 0;
        }
    }

    out
}

/// Encode a standard data frame into its stuffed bit stream
///
/// Identifiers are masked to 11 bits and payloads are truncated to 8 bytes.
pub fn encode(id: u16, payload: &[u8]) -> EncodedStream {
    let id = id & MAX_STANDARD_ID;
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
    let dlc = payload.len() as u32;

    let mut raw = Vec::with_capacity(19 + payload.len() * 8 + 15);
    raw.push((BitPolarity::Dominant, FrameField::Sof));
    push_bits(&mut raw, u32::from(id), 11, FrameField::Identifier);
    raw.push((BitPolarity::Dominant, FrameField::Rtr));
    raw.push((BitPolarity::Dominant, FrameField::Ide));
    raw.push((BitPolarity::Dominant, FrameField::Reserved0));
    push_bits(&mut raw, dlc, 4, FrameField::Dlc);
    for byte in payload {
        push_bits(&mut raw, u32::from(*byte), 8, FrameField::Data);
    }

    let crc = crc15(raw.iter().map(|(b, _)| *b));
    push_bits(&mut raw, u32::from(crc), 15, FrameField::Crc);

    let mut bits = stuff(&raw);
    bits.push((BitPolarity::Recessive, FrameField::CrcDelimiter));
    bits.push((BitPolarity::Recessive, FrameField::AckSlot));
    bits.push((BitPolarity::Recessive, FrameField::AckDelimiter));
    bits.extend(std::iter::repeat((BitPolarity::Recessive, FrameField::Eof)).take(EOF_LEN));
    bits.extend(
        std::iter::repeat((BitPolarity::Recessive, FrameField::Intermission))
            .take(INTERMISSION_LEN),
    );

    EncodedStream { bits, crc }
}

/// Encode a frame value
pub fn encode_frame(frame: &CanFrame) -> EncodedStream {
    encode(frame.id, &frame.data)
}

fn field_value(bits: &[(BitPolarity, FrameField)], field: FrameField) -> (u32, usize) {
    bits.iter()
        .filter(|(_, f)| *f == field)
        .fold((0u32, 0usize), |(value, count), (bit, _)| {
            ((value << 1) | u32::from(bit.as_bit()), count + 1)
        })
}

/// Read an encoded stream back into a frame
pub fn decode(stream: &EncodedStream) -> Result<CanFrame, DecodeError> {
    let span = &stream.bits()[..stream.stuffed_span_len()];
    let labelled: Vec<BitPolarity> = span
        .iter()
        .filter(|(_, f)| *f != FrameField::Stuff)
        .map(|(b, _)| *b)
        .collect();
    let levels: Vec<BitPolarity> = span.iter().map(|(b, _)| *b).collect();
    if destuff_bits(&levels) != labelled {
        return Err(DecodeError::StuffViolation);
    }

    let bits = stream.destuffed();

    let (_, sof_len) = field_value(&bits, FrameField::Sof);
    if sof_len != 1 {
        return Err(DecodeError::MissingField(FrameField::Sof));
    }

    let (id, id_len) = field_value(&bits, FrameField::Identifier);
    if id_len != 11 {
        return Err(DecodeError::MissingField(FrameField::Identifier));
    }

    let (dlc, dlc_len) = field_value(&bits, FrameField::Dlc);
    if dlc_len != 4 {
        return Err(DecodeError::MissingField(FrameField::Dlc));
    }
    if dlc as usize > MAX_PAYLOAD_LEN {
        return Err(DecodeError::InvalidDlc(dlc as u8));
    }

    let data_bits: Vec<BitPolarity> = bits
        .iter()
        .filter(|(_, f)| *f == FrameField::Data)
        .map(|(b, _)| *b)
        .collect();
    let expected = dlc as usize * 8;
    if data_bits.len() != expected {
        return Err(DecodeError::DataLengthMismatch {
            expected,
            actual: data_bits.len(),
        });
    }
    let data = data_bits
        .chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, b| (acc << 1) | b.as_bit()))
        .collect();

    let (received, crc_len) = field_value(&bits, FrameField::Crc);
    if crc_len != 15 {
        return Err(DecodeError::MissingField(FrameField::Crc));
    }
    let computed = crc15(
        bits.iter()
            .take_while(|(_, f)| *f != FrameField::Crc)
            .map(|(b, _)| *b),
    );
    if computed != received as u16 {
        return Err(DecodeError::CrcMismatch {
            received: received as u16,
            computed,
        });
    }

    Ok(CanFrame::new(id as u16, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_to_bits(bytes: &[u8]) -> Vec<BitPolarity> {
        bytes
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |i| BitPolarity::from_bit((byte >> i) & 1 == 1)))
            .collect()
    }

    fn bitwise_crc15(bits: &[BitPolarity]) -> u16 {
        let mut crc: u16 = 0;
        for bit in bits {
            let feedback = u16::from(bit.as_bit()) ^ ((crc >> 14) & 1);
            crc = (crc << 1) & 0x7FFF;
            if feedback == 1 {
                crc ^= CRC15_POLY;
            }
        }
        crc
    }

    #[test]
    fn test_crc15_unaligned_lengths_match_shift_register() {
        let pattern = bytes_to_bits(&[0xA5, 0x3C, 0xFF, 0x01, 0x80]);
        for len in 0..=pattern.len() {
            assert_eq!(
                crc15(pattern[..len].iter().copied()),
                bitwise_crc15(&pattern[..len]),
                "length {}",
                len
            );
        }
    }

    #[test]
    fn test_crc15_check_value() {
        // CRC-15/CAN catalogue check value over ASCII "123456789"
        assert_eq!(crc15(bytes_to_bits(b"123456789")), 0x059E);
    }

    #[test]
    fn test_crc_is_deterministic() {
        let a = encode(0x173, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let b = encode(0x173, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(a.crc(), b.crc());
        assert_eq!(a, b);
    }

    #[test]
    fn test_field_layout_of_empty_frame() {
        let stream = encode(0x555, &[]);
        let fields: Vec<FrameField> = stream.destuffed().iter().map(|(_, f)| *f).collect();

        let count = |field| fields.iter().filter(|f| **f == field).count();
        assert_eq!(count(FrameField::Sof), 1);
        assert_eq!(count(FrameField::Identifier), 11);
        assert_eq!(count(FrameField::Rtr), 1);
        assert_eq!(count(FrameField::Ide), 1);
        assert_eq!(count(FrameField::Reserved0), 1);
        assert_eq!(count(FrameField::Dlc), 4);
        assert_eq!(count(FrameField::Data), 0);
        assert_eq!(count(FrameField::Crc), 15);
        assert_eq!(count(FrameField::Eof), 7);
        assert_eq!(count(FrameField::Intermission), 3);
        assert_eq!(fields[0], FrameField::Sof);
        assert_eq!(*fields.last().unwrap(), FrameField::Intermission);
    }

    #[test]
    fn test_stuff_bit_after_five_dominant() {
        // SOF + id 0x000 gives a long dominant run
        let stream = encode(0x000, &[]);
        let first: Vec<(BitPolarity, FrameField)> = stream.bits()[..6].to_vec();
        assert!(first[..5].iter().all(|(b, _)| *b == BitPolarity::Dominant));
        assert_eq!(first[5], (BitPolarity::Recessive, FrameField::Stuff));
    }

    #[test]
    fn test_stuff_bit_does_not_seed_next_run() {
        // SOF + 0x03F: 0 00000 111111
        // stuffed:     00000 1 0 11111 0 1
        let stream = encode(0x03F, &[]);
        let rendered = stream.render();
        assert_eq!(&rendered[..6], "000001");
        assert_eq!(stream.get(5).unwrap().1, FrameField::Stuff);
        // the natural bit after the stuff bit starts a fresh run
        assert_eq!(stream.get(6).unwrap(), (BitPolarity::Dominant, FrameField::Identifier));
    }

    #[test]
    fn test_no_unstuffed_run_of_six() {
        for id in [0x000u16, 0x7FF, 0x3E0, 0x01F, 0x555] {
            for payload in [vec![], vec![0x00; 8], vec![0xFF; 8], vec![0x0F, 0xF0, 0x00]] {
                let stream = encode(id, &payload);
                let span = &stream.bits()[..stream.stuffed_span_len()];
                let mut run_value = None;
                let mut run_length = 0;
                for (bit, field) in span {
                    if *field == FrameField::Stuff {
                        run_value = None;
                        run_length = 0;
                        continue;
                    }
                    if run_value == Some(*bit) {
                        run_length += 1;
                    } else {
                        run_value = Some(*bit);
                        run_length = 1;
                    }
                    assert!(run_length <= STUFF_RUN_LENGTH, "id {:03X}", id);
                }
            }
        }
    }

    #[test]
    fn test_destuff_matches_labels() {
        let stream = encode(0x000, &[0x00, 0xFF, 0x00]);
        let span: Vec<BitPolarity> = stream.bits()[..stream.stuffed_span_len()]
            .iter()
            .map(|(b, _)| *b)
            .collect();
        let labelled: Vec<BitPolarity> = stream.bits()[..stream.stuffed_span_len()]
            .iter()
            .filter(|(_, f)| *f != FrameField::Stuff)
            .map(|(b, _)| *b)
            .collect();
        assert_eq!(destuff_bits(&span), labelled);
        assert!(stream.stuff_count() > 0);
    }

    #[test]
    fn test_decode_recovers_every_id_and_length() {
        let patterns: [fn(usize) -> u8; 4] = [
            |_| 0x00,
            |_| 0xFF,
            |i| if i % 2 == 0 { 0xAA } else { 0x55 },
            |i| (i as u8).wrapping_mul(37).wrapping_add(11),
        ];
        for id in 0..=MAX_STANDARD_ID {
            for len in 0..=MAX_PAYLOAD_LEN {
                for pattern in &patterns {
                    let payload: Vec<u8> = (0..len).map(pattern).collect();
                    let frame = decode(&encode(id, &payload)).unwrap();
                    assert_eq!(frame.id, id);
                    assert_eq!(frame.data, payload, "id {:03X} len {}", id, len);
                }
            }
        }
    }

    #[test]
    fn test_payload_truncated_to_eight_bytes() {
        let stream = encode(0x100, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let frame = decode(&stream).unwrap();
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.dlc(), 8);
    }

    #[test]
    fn test_identifier_masked() {
        let frame = decode(&encode(0x0FFF, &[0xAA])).unwrap();
        assert_eq!(frame.id, 0x7FF);
    }

    #[test]
    fn test_decode_rejects_flipped_data_bit() {
        let stream = encode(0x123, &[0x5A]);
        let mut bits = stream.bits().to_vec();
        let idx = bits.iter().position(|(_, f)| *f == FrameField::Data).unwrap();
        bits[idx].0 = bits[idx].0.complement();
        let corrupted = EncodedStream {
            bits,
            crc: stream.crc(),
        };
        assert!(decode(&corrupted).is_err());
    }
}
