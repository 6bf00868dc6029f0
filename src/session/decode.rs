use serde_json::Value;

use crate::registers::{Register, RegisterFormat};
use super::SessionError;

/// Turns the raw words of one register into its engineering value
pub fn decode(reg: &Register, words: &[u16]) -> Result<Value, SessionError> {
    if words.len() < reg.length as usize {
        return Err(SessionError::Decode {
            register: reg.name,
            reason: format!("expected {} words, got {}", reg.length, words.len()),
        });
    }

    let raw: i64 = match reg.format {
        RegisterFormat::Str => return Ok(Value::from(decode_text(&words[..reg.length as usize]))),
        RegisterFormat::U16 => words[0] as i64,
        RegisterFormat::I16 => words[0] as i16 as i64,
        RegisterFormat::U32 => join(words[0], words[1]) as i64,
        RegisterFormat::I32 => join(words[0], words[1]) as i32 as i64,
    };

    if !reg.mappings.is_empty() {
        if let Some((_, label)) = reg.mappings.iter().find(|(code, _)| *code as i64 == raw) {
            return Ok(Value::from(*label));
        }
    }

    if reg.gain == 1 {
        return Ok(Value::from(raw));
    }
    Ok(Value::from(raw as f64 / reg.gain as f64))
}

fn join(high: u16, low: u16) -> u32 {
    u32::from(high) << 16 | u32::from(low)
}

fn decode_text(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{self, DEVICE_STATUS, MODEL_NAME};

    fn words_of(text: &str, len: usize) -> Vec<u16> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(len * 2, 0);
        bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
    }

    #[test]
    fn test_decode_signed_32() {
        let active_power = registers::POWER[1];
        assert_eq!(decode(&active_power, &[0x0000, 0x05DC]).unwrap(), Value::from(1500));
        assert_eq!(decode(&active_power, &[0xFFFF, 0xFFFE]).unwrap(), Value::from(-2));
    }

    #[test]
    fn test_decode_with_gain() {
        let voltage = registers::VOLTAGE_CURRENT[3];
        assert_eq!(decode(&voltage, &[2301]).unwrap(), Value::from(230.1));

        let temperature = registers::TEMPERATURE[0];
        assert_eq!(decode(&temperature, &[0xFFF6]).unwrap(), Value::from(-1.0));
    }

    #[test]
    fn test_decode_text() {
        let words = words_of("SUN2000-100KTL-M1", 15);
        assert_eq!(decode(&MODEL_NAME, &words).unwrap(), Value::from("SUN2000-100KTL-M1"));
    }

    #[test]
    fn test_decode_mapped_status() {
        assert_eq!(decode(&DEVICE_STATUS, &[0x0200]).unwrap(), Value::from("On-grid"));
        /* Unknown codes stay numeric */
        assert_eq!(decode(&DEVICE_STATUS, &[0x1234]).unwrap(), Value::from(0x1234));
    }

    #[test]
    fn test_decode_short_input() {
        let active_power = registers::POWER[1];
        assert!(matches!(decode(&active_power, &[1]), Err(SessionError::Decode { register: "active_power", .. })));
    }
}
