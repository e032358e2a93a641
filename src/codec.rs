//! Line-level coding for the full-speed bus: NRZI, bit-stuffing and the two
//! USB CRCs.
//!
//! Everything in this module is a pure function over bit or byte streams.
//! Idle, sync and EOP *timing* belong to the bus driver; the sync pattern
//! itself is part of the encoded stream because the bit-stuffing run length
//! carries across it.

use crc::{Crc, CRC_16_USB};

use crate::{Result, UsbError};

/// Differential line state of the full-speed bus.
///
/// Full-speed idle is `J`. `Se0` (both lines driven low) occurs only in EOP
/// and reset signaling; observing it inside a packet body is a framing
/// violation.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Level {
    J,
    K,
    Se0,
}

/// The sync pattern as it appears in the pre-NRZI bit stream. Encoded from
/// idle it produces KJKJKJKK on the wire.
pub const SYNC_BITS: [bool; 8] = [false, false, false, false, false, false, false, true];

/// A stuff bit is inserted after this many consecutive one bits.
const STUFF_RUN: u32 = 6;

/// Expands bytes into bits, least significant bit first, as transmitted on
/// the wire.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for i in 0..8 {
            bits.push((byte >> i) & 1 != 0);
        }
    }
    bits
}

/// Packs bits (LSB first) back into bytes.
///
/// # Errors
///
/// * [`Framing`](crate::UsbError::Framing) - The stream does not divide into
///   whole bytes. On a real bus this is dribble from a transmitter that cut
///   its EOP short.
pub fn bits_to_bytes(bits: &[bool]) -> Result<Vec<u8>> {
    if bits.len() % 8 != 0 {
        return Err(UsbError::Framing);
    }

    let mut bytes = Vec::with_capacity(bits.len() / 8);
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, bit) in chunk.iter().enumerate() {
            if *bit {
                byte |= 1 << i;
            }
        }
        bytes.push(byte);
    }
    Ok(bytes)
}

/// Inserts a zero bit after every run of six consecutive ones, guaranteeing
/// the receiver sees a transition often enough to recover the bit clock.
pub fn stuff(bits: &[bool]) -> Vec<bool> {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / STUFF_RUN as usize);
    let mut ones = 0u32;

    for bit in bits {
        out.push(*bit);
        if *bit {
            ones += 1;
            if ones == STUFF_RUN {
                out.push(false);
                ones = 0;
            }
        } else {
            ones = 0;
        }
    }
    out
}

/// Removes stuff bits.
///
/// # Errors
///
/// * [`Framing`](crate::UsbError::Framing) - Seven or more consecutive ones,
///   or a stream truncated right after a run of six. Either means the
///   transmitter violated the stuffing rule mid-packet.
pub fn unstuff(bits: &[bool]) -> Result<Vec<bool>> {
    let mut out = Vec::with_capacity(bits.len());
    let mut ones = 0u32;
    let mut expect_stuff = false;

    for bit in bits {
        if expect_stuff {
            if *bit {
                return Err(UsbError::Framing);
            }
            expect_stuff = false;
            ones = 0;
            continue;
        }

        out.push(*bit);
        if *bit {
            ones += 1;
            if ones == STUFF_RUN {
                expect_stuff = true;
            }
        } else {
            ones = 0;
        }
    }

    if expect_stuff {
        return Err(UsbError::Framing);
    }
    Ok(out)
}

/// NRZI-encodes a bit stream starting from the idle `J` state: a zero bit
/// toggles the line, a one bit holds it.
pub fn nrzi_encode(bits: &[bool]) -> Vec<Level> {
    let mut levels = Vec::with_capacity(bits.len());
    let mut current = Level::J;

    for bit in bits {
        if !*bit {
            current = match current {
                Level::J => Level::K,
                Level::K => Level::J,
                Level::Se0 => Level::K,
            };
        }
        levels.push(current);
    }
    levels
}

/// Recovers the bit stream from NRZI levels, assuming the line was idle `J`
/// before the first sample.
///
/// # Errors
///
/// * [`Framing`](crate::UsbError::Framing) - An SE0 inside the stream. The
///   caller strips EOP before decoding, so any SE0 here is a truncated or
///   misframed packet.
pub fn nrzi_decode(levels: &[Level]) -> Result<Vec<bool>> {
    let mut bits = Vec::with_capacity(levels.len());
    let mut previous = Level::J;

    for level in levels {
        if *level == Level::Se0 {
            return Err(UsbError::Framing);
        }
        bits.push(*level == previous);
        previous = *level;
    }
    Ok(bits)
}

/// Encodes packet bytes into the wire-level stream: sync prepended, stuff
/// bits inserted, NRZI applied from idle. EOP is not included; the bus
/// driver appends it at the signal level.
pub fn encode(bytes: &[u8]) -> Vec<Level> {
    let mut bits = Vec::with_capacity(8 + bytes.len() * 8);
    bits.extend_from_slice(&SYNC_BITS);
    bits.extend(bytes_to_bits(bytes));
    nrzi_encode(&stuff(&bits))
}

/// Decodes a wire-level stream (sync included, EOP already stripped) back
/// into packet bytes.
///
/// # Errors
///
/// * [`Framing`](crate::UsbError::Framing) - Bad sync pattern, stuffing
///   violation, mid-stream SE0, or a bit count that does not divide into
///   bytes.
pub fn decode(levels: &[Level]) -> Result<Vec<u8>> {
    let bits = unstuff(&nrzi_decode(levels)?)?;

    if bits.len() < SYNC_BITS.len() || bits[..SYNC_BITS.len()] != SYNC_BITS {
        return Err(UsbError::Framing);
    }
    bits_to_bytes(&bits[SYNC_BITS.len()..])
}

/// CRC5 over the low `bits` of `value`, LSB first, per the USB token
/// polynomial x^5 + x^2 + 1 with the bit-reversed-and-inverted transmission
/// convention.
///
/// Hand-rolled rather than taken from the `crc` crate because token and SOF
/// fields are 11 bits, not a whole number of bytes.
pub fn crc5(value: u16, bits: u32) -> u8 {
    let mut input = value;
    let mut state = 0x1fu16;

    for _ in 0..bits {
        let invert = (input & 1) != (state & 1);
        input >>= 1;
        state >>= 1;
        if invert {
            state ^= 0x14;
        }
    }
    (state ^ 0x1f) as u8
}

/// CRC16 over a data payload, per the USB data polynomial
/// x^16 + x^15 + x^2 + 1 (reflected, initial and final value 0xFFFF).
pub fn crc16(bytes: &[u8]) -> u16 {
    const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);
    CRC16.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    // Reflected bit-at-a-time reference, independent of the crc crate.
    fn crc16_reference(bytes: &[u8]) -> u16 {
        let mut crc = 0xffffu16;
        for byte in bytes {
            crc ^= *byte as u16;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xa001 } else { crc >> 1 };
            }
        }
        !crc
    }

    #[test]
    fn crc5_known_tokens() {
        // SETUP to address 0, endpoint 0 is 2D 00 10 on the wire: CRC5 0x02.
        assert_eq!(crc5(0x000, 11), 0x02);
        // SOF with frame number 0x710, the USB-IF worked example.
        assert_eq!(crc5(0x710, 11), 0x05);
    }

    #[test]
    fn crc16_check_values() {
        assert_eq!(crc16(b"123456789"), 0xb4c8);
        // A zero-length data packet carries CRC16 0x0000.
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn crc16_matches_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let len = rng.gen_range(0..256);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            assert_eq!(crc16(&payload), crc16_reference(&payload));
        }
    }

    #[test]
    fn crc16_detects_single_bit_flips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        for _ in 0..128 {
            let len = rng.gen_range(1..=1024);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let crc = crc16(&payload);

            let mut corrupted = payload.clone();
            let bit = rng.gen_range(0..len * 8);
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert_ne!(crc, crc16(&corrupted), "flip of bit {} went undetected", bit);
        }
    }

    #[test]
    fn bits_round_trip() {
        let bytes = [0x2d, 0x00, 0x10, 0xff, 0x80];
        assert_eq!(bits_to_bytes(&bytes_to_bits(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn bits_to_bytes_rejects_dribble() {
        assert_eq!(bits_to_bytes(&[true; 7]), Err(UsbError::Framing));
    }

    #[test]
    fn stuffing_round_trip() {
        // 0xff 0xff maximizes stuff insertions.
        let bits = bytes_to_bits(&[0xff, 0xff, 0x00, 0x7e]);
        let stuffed = stuff(&bits);
        assert!(stuffed.len() > bits.len());
        assert_eq!(unstuff(&stuffed).unwrap(), bits);
    }

    #[test]
    fn stuffing_inserts_after_six_ones() {
        let stuffed = stuff(&[true; 6]);
        assert_eq!(stuffed, vec![true, true, true, true, true, true, false]);
    }

    #[test]
    fn unstuff_rejects_seven_ones() {
        assert_eq!(unstuff(&[true; 7]), Err(UsbError::Framing));
    }

    #[test]
    fn unstuff_rejects_truncated_run() {
        assert_eq!(unstuff(&[true; 6]), Err(UsbError::Framing));
    }

    #[test]
    fn nrzi_round_trip() {
        let bits = bytes_to_bits(&[0xa5, 0x0f, 0x00]);
        assert_eq!(nrzi_decode(&nrzi_encode(&bits)).unwrap(), bits);
    }

    #[test]
    fn nrzi_sync_produces_kjkjkjkk() {
        use Level::*;
        assert_eq!(nrzi_encode(&SYNC_BITS), vec![K, J, K, J, K, J, K, K]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let bytes = [0x2d, 0x00, 0x10];
        assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_bad_sync() {
        let mut levels = encode(&[0xc3, 0x01]);
        // Corrupt the first sync transition.
        levels[0] = Level::J;
        assert_eq!(decode(&levels), Err(UsbError::Framing));
    }

    #[test]
    fn decode_rejects_mid_packet_se0() {
        let mut levels = encode(&[0xc3, 0x01]);
        levels[10] = Level::Se0;
        assert_eq!(decode(&levels), Err(UsbError::Framing));
    }
}
