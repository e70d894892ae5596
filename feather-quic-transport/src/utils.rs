use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;
use std::time::Instant;

// https://www.rfc-editor.org/rfc/rfc9000.html#name-variable-length-integer-enc
pub(crate) const MAX_VARIABLE_LENGTH: u64 = (1 << 62) - 1;

pub(crate) fn get_variable_length(len: u64) -> Result<u8> {
    if len < (1 << 6) {
        Ok(1)
    } else if len < (1 << 14) {
        Ok(2)
    } else if len < (1 << 30) {
        Ok(4)
    } else if len <= MAX_VARIABLE_LENGTH {
        Ok(8)
    } else {
        Err(anyhow!("Length is so big more then 1<<62 {}", len))
    }
}

pub(crate) fn encode_variable_length<W>(writer: &mut W, len: u64) -> Result<u8>
where
    W: Write,
{
    // The two most significant bits of the first byte carry the
    // base-2 logarithm of the encoding length
    let written = get_variable_length(len)?;
    match written {
        1 => writer.write_u8(len as u8)?,
        2 => writer.write_u16::<BigEndian>(0x4000 | len as u16)?,
        4 => writer.write_u32::<BigEndian>(0x8000_0000 | len as u32)?,
        _ => writer.write_u64::<BigEndian>(0xc000_0000_0000_0000 | len)?,
    }

    Ok(written)
}

pub(crate) fn encode_variable_length_force_two_bytes<W>(writer: &mut W, len: u64) -> Result<u8>
where
    W: Write,
{
    if len >= 1 << 14 {
        return Err(anyhow!("Can not encode length {} with in two bytes", len));
    }

    writer.write_u16::<BigEndian>(0x4000 | len as u16)?;
    Ok(2)
}

/// Overwrites a two bytes varint placeholder at `pos`
pub(crate) fn patch_variable_length_two_bytes(buf: &mut [u8], pos: usize, len: u64) -> Result<()> {
    let mut encoded = Vec::with_capacity(2);
    encode_variable_length_force_two_bytes(&mut encoded, len)?;
    let buf_len = buf.len();
    let slot = buf
        .get_mut(pos..pos + 2)
        .ok_or_else(|| anyhow!("Length placeholder {} is out of range {}", pos, buf_len))?;
    slot.copy_from_slice(&encoded);
    Ok(())
}

pub(crate) fn format_instant(instant: Instant, current_ts: Instant) -> String {
    if instant == current_ts {
        return "now".to_string();
    }

    let duration = if instant > current_ts {
        instant.duration_since(current_ts)
    } else {
        current_ts.duration_since(instant)
    };

    let ms = duration.as_secs_f64() * 1000.0;
    if instant > current_ts {
        format!("+{ms:.3}ms")
    } else {
        format!("-{ms:.3}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_variable_length() {
        assert_eq!(get_variable_length(0x25).unwrap(), 1);
        assert_eq!(get_variable_length(0x3FFF).unwrap(), 2);
        assert_eq!(get_variable_length(0x3FFFFFFF).unwrap(), 4);
        assert_eq!(get_variable_length(0x3FFFFFFFFFFFFFFF).unwrap(), 8);
        assert!(get_variable_length(0x4000000000000000).is_err());
    }

    #[test]
    fn test_encode_variable_length() -> Result<()> {
        // Examples from RFC 9000 appendix A.1
        let test_cases = vec![
            (37u64, vec![0x25]),
            (15293, vec![0x7b, 0xbd]),
            (494878333, vec![0x9d, 0x7f, 0x3e, 0x7d]),
            (
                151288809941952652,
                vec![0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
            ),
        ];

        for (value, expected) in test_cases {
            let mut buf = vec![];
            let written = encode_variable_length(&mut buf, value)?;
            assert_eq!(written as usize, expected.len());
            assert_eq!(buf, expected);
        }
        Ok(())
    }

    #[test]
    fn test_force_two_bytes_and_patch() -> Result<()> {
        let mut buf = vec![0xaa];
        encode_variable_length_force_two_bytes(&mut buf, 0)?;
        assert_eq!(buf, vec![0xaa, 0x40, 0x00]);

        patch_variable_length_two_bytes(&mut buf, 1, 1200)?;
        assert_eq!(buf, vec![0xaa, 0x44, 0xb0]);

        assert!(encode_variable_length_force_two_bytes(&mut buf, 1 << 14).is_err());
        assert!(patch_variable_length_two_bytes(&mut buf, 2, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_format_instant() {
        let now = Instant::now();
        assert_eq!(format_instant(now, now), "now");
        assert_eq!(
            format_instant(now + Duration::from_millis(5), now),
            "+5.000ms"
        );
        assert_eq!(
            format_instant(now, now + Duration::from_millis(2)),
            "-2.000ms"
        );
    }
}
