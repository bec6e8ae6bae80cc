//! Victron "extra manufacturer data" codec
//!
//! Victron devices broadcast an AES-128-CTR encrypted payload. Frame
//! layout (after the little-endian manufacturer id at offset 0):
//!
//! - offset 2..4  product id (LE)
//! - offset 4     record type (selects the decoder)
//! - offset 5..7  16-bit nonce counter (LE) = the CTR IV
//! - offset 7     first byte of the device key, as an integrity check
//! - offset 8..   ciphertext
//!
//! Decrypted records are bit-packed LSB-first. A field whose raw bits are
//! all ones is "no reading" and decodes to `None`.

use aes::cipher::{KeyIvInit, StreamCipher};
use tracing::debug;

use super::{ParseError, ParseOptions, SensorParser};
use crate::types::{
    BatteryMonitorRecord, DcDcConverterRecord, InverterRecord, SensorRecord,
    SmartLithiumRecord, SolarChargerRecord,
};

type Aes128Ctr = ctr::Ctr128LE<aes::Aes128>;

/// Bluetooth SIG identifier for Victron Energy.
pub const VICTRON_MANUFACTURER_ID: u16 = 0x02e1;

/// Offset of the record-type byte.
const RECORD_TYPE_OFFSET: usize = 4;
/// Offset of the 16-bit nonce counter.
const COUNTER_OFFSET: usize = 5;
/// Offset of the key-check byte.
const KEY_CHECK_OFFSET: usize = 7;
/// First ciphertext byte.
const CIPHERTEXT_OFFSET: usize = 8;

mod record_type {
    pub const SOLAR_CHARGER: u8 = 0x01;
    pub const BATTERY_MONITOR: u8 = 0x02;
    pub const INVERTER: u8 = 0x03;
    pub const DCDC_CONVERTER: u8 = 0x04;
    pub const SMART_LITHIUM: u8 = 0x05;
}

// ============================================================================
// Bit Reader
// ============================================================================

/// LSB-first bit cursor over a decrypted record.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    /// Read `bits` (<= 32) LSB-first. Bits past the end of the buffer
    /// read as ones, which collapses a truncated tail field into the
    /// sentinel.
    fn read_raw(&mut self, bits: u32) -> u32 {
        let mut value: u32 = 0;
        for i in 0..bits {
            let pos = self.bit + i as usize;
            let bit = self
                .data
                .get(pos / 8)
                .map_or(1, |byte| (byte >> (pos % 8)) & 1);
            value |= u32::from(bit) << i;
        }
        self.bit += bits as usize;
        value
    }

    /// Unsigned field; all-ones is the "no reading" sentinel.
    fn unsigned(&mut self, bits: u32) -> Option<u32> {
        let raw = self.read_raw(bits);
        (raw != sentinel(bits)).then_some(raw)
    }

    /// Signed two's-complement field with the same sentinel rule.
    fn signed(&mut self, bits: u32) -> Option<i32> {
        let raw = self.read_raw(bits);
        if raw == sentinel(bits) {
            return None;
        }
        let sign_bit = 1u32 << (bits - 1);
        if raw & sign_bit != 0 {
            Some(raw as i32 - (1i64 << bits) as i32)
        } else {
            Some(raw as i32)
        }
    }
}

fn sentinel(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

fn scaled(raw: Option<impl Into<f64>>, scale: f64) -> Option<f64> {
    raw.map(|r| r.into() * scale)
}

// ============================================================================
// Parser
// ============================================================================

/// Parser for Victron encrypted advertisements.
#[derive(Default)]
pub struct VictronParser;

impl VictronParser {
    pub fn new() -> Self {
        Self
    }

    /// Decrypt the payload, or `None` when no key is configured or the
    /// key-check byte disagrees (wrong key for this device).
    fn decrypt(&self, data: &[u8], opts: &ParseOptions) -> Option<Vec<u8>> {
        let key = match opts.encryption_key.as_deref() {
            Some(key) if key.len() == 16 => key,
            Some(_) => {
                debug!("Victron encryption key is not 16 bytes - skipping decrypt");
                return None;
            }
            None => return None,
        };
        if data[KEY_CHECK_OFFSET] != key[0] {
            debug!("Victron key-check byte mismatch - wrong key for device");
            return None;
        }

        let mut iv = [0u8; 16];
        iv[0] = data[COUNTER_OFFSET];
        iv[1] = data[COUNTER_OFFSET + 1];

        let key_arr: [u8; 16] = key.try_into().ok()?;
        let mut cipher = Aes128Ctr::new(&key_arr.into(), &iv.into());
        let mut plaintext = data[CIPHERTEXT_OFFSET..].to_vec();
        cipher.apply_keystream(&mut plaintext);
        Some(plaintext)
    }
}

impl SensorParser for VictronParser {
    fn manufacturer_id(&self) -> u16 {
        VICTRON_MANUFACTURER_ID
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() > CIPHERTEXT_OFFSET
            && super::manufacturer_id(data) == Some(VICTRON_MANUFACTURER_ID)
    }

    fn parse(
        &self,
        data: &[u8],
        opts: &ParseOptions,
    ) -> Result<Option<SensorRecord>, ParseError> {
        if super::manufacturer_id(data) != Some(VICTRON_MANUFACTURER_ID) {
            return Err(ParseError::WrongManufacturer);
        }
        if data.len() <= CIPHERTEXT_OFFSET {
            return Err(ParseError::TooShort {
                needed: CIPHERTEXT_OFFSET + 1,
                got: data.len(),
            });
        }

        let Some(plaintext) = self.decrypt(data, opts) else {
            return Ok(None);
        };

        let record = match data[RECORD_TYPE_OFFSET] {
            record_type::SOLAR_CHARGER => decode_solar_charger(&plaintext),
            record_type::BATTERY_MONITOR => decode_battery_monitor(&plaintext),
            record_type::INVERTER => decode_inverter(&plaintext),
            record_type::DCDC_CONVERTER => decode_dcdc(&plaintext),
            record_type::SMART_LITHIUM => decode_smart_lithium(&plaintext),
            other => {
                debug!(record_type = other, "Unknown Victron record type");
                return Ok(None);
            }
        };
        Ok(Some(record))
    }
}

// ============================================================================
// Record Decoders
// ============================================================================

fn decode_battery_monitor(plaintext: &[u8]) -> SensorRecord {
    let mut bits = BitReader::new(plaintext);
    let remaining_mins = bits.unsigned(16).map(|v| v as u16);
    let voltage = scaled(bits.signed(16), 0.01);
    let alarm = bits.unsigned(16).map(|v| v as u16);
    let aux = bits.unsigned(16).map(|v| v as u16);
    let aux_mode = bits.read_raw(2) as u8;
    let current = scaled(bits.signed(22), 0.001);
    let consumed_ah = scaled(bits.unsigned(20), 0.1);
    let soc = scaled(bits.unsigned(10), 0.1);
    let power = match (voltage, current) {
        (Some(v), Some(a)) => Some(v * a),
        _ => None,
    };
    SensorRecord::BatteryMonitor(BatteryMonitorRecord {
        remaining_mins,
        voltage,
        alarm,
        aux,
        aux_mode,
        current,
        consumed_ah,
        soc,
        power,
    })
}

fn decode_solar_charger(plaintext: &[u8]) -> SensorRecord {
    let mut bits = BitReader::new(plaintext);
    SensorRecord::SolarCharger(SolarChargerRecord {
        device_state: bits.unsigned(8).map(|v| v as u8),
        charger_error: bits.unsigned(8).map(|v| v as u8),
        battery_voltage: scaled(bits.signed(16), 0.01),
        battery_current: scaled(bits.signed(16), 0.1),
        yield_today: scaled(bits.unsigned(16), 0.01),
        pv_power: scaled(bits.unsigned(16), 1.0),
        load_current: scaled(bits.unsigned(9), 0.1),
    })
}

fn decode_inverter(plaintext: &[u8]) -> SensorRecord {
    let mut bits = BitReader::new(plaintext);
    SensorRecord::Inverter(InverterRecord {
        device_state: bits.unsigned(8).map(|v| v as u8),
        alarm: bits.unsigned(16).map(|v| v as u16),
        battery_voltage: scaled(bits.signed(16), 0.01),
        ac_apparent_power: bits.unsigned(16).map(|v| v as u16),
        ac_voltage: scaled(bits.unsigned(15), 0.01),
        ac_current: scaled(bits.unsigned(11), 0.1),
    })
}

fn decode_dcdc(plaintext: &[u8]) -> SensorRecord {
    let mut bits = BitReader::new(plaintext);
    SensorRecord::DcDcConverter(DcDcConverterRecord {
        device_state: bits.unsigned(8).map(|v| v as u8),
        charger_error: bits.unsigned(8).map(|v| v as u8),
        input_voltage: scaled(bits.unsigned(16), 0.01),
        output_voltage: scaled(bits.signed(16), 0.01),
        off_reason: bits.unsigned(32),
    })
}

fn decode_smart_lithium(plaintext: &[u8]) -> SensorRecord {
    let mut bits = BitReader::new(plaintext);
    let bms_flags = bits.unsigned(32);
    let error = bits.unsigned(16).map(|v| v as u16);
    // Seven cells, 7 bits each: value = 2.60 V + raw * 0.01 V.
    let cell_voltages = (0..7)
        .map(|_| bits.unsigned(7).map(|raw| 2.60 + f64::from(raw) * 0.01))
        .collect();
    SensorRecord::SmartLithium(SmartLithiumRecord {
        bms_flags,
        error,
        cell_voltages,
        battery_voltage: scaled(bits.unsigned(12), 0.01),
        balancer_status: bits.unsigned(4).map(|v| v as u8),
        temperature: bits.unsigned(7).map(|raw| f64::from(raw) - 40.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x3f, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
        0xee, 0xff,
    ];

    /// Pack (value, bits) pairs LSB-first, the device's wire order.
    fn pack_bits(fields: &[(u32, u32)]) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let mut pos = 0usize;
        for &(value, bits) in fields {
            for i in 0..bits {
                let byte = pos / 8;
                if byte == out.len() {
                    out.push(0);
                }
                if (value >> i) & 1 == 1 {
                    out[byte] |= 1 << (pos % 8);
                }
                pos += 1;
            }
        }
        out
    }

    /// Build a full encrypted advertisement frame around a plaintext
    /// record. CTR is symmetric, so encrypting is one keystream pass.
    fn frame(record_type: u8, counter: u16, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        iv[..2].copy_from_slice(&counter.to_le_bytes());
        let mut cipher = Aes128Ctr::new(&KEY.into(), &iv.into());
        let mut ciphertext = plaintext.to_vec();
        cipher.apply_keystream(&mut ciphertext);

        let mut out = vec![0xe1, 0x02, 0xa1, 0x02, record_type];
        out.extend_from_slice(&counter.to_le_bytes());
        out.push(KEY[0]);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn opts() -> ParseOptions {
        ParseOptions {
            encryption_key: Some(KEY.to_vec()),
        }
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("expected a reading");
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn test_battery_monitor_decode() {
        // -1234 mA as a 22-bit two's-complement pattern.
        let current_raw = ((1i64 << 22) - 1234) as u32;
        let plaintext = pack_bits(&[
            (0xffff, 16),      // remainingMins: sentinel
            (1280, 16),        // voltage: 12.80 V
            (0, 16),           // alarm
            (0xffff, 16),      // aux: sentinel
            (3, 2),            // auxMode: disabled
            (current_raw, 22), // current: -1.234 A
            (0xfffff, 20),     // consumedAh: sentinel
            (755, 10),         // soc: 75.5 %
        ]);
        let data = frame(record_type::BATTERY_MONITOR, 0x1234, &plaintext);

        let parser = VictronParser::new();
        let record = parser.parse(&data, &opts()).unwrap().unwrap();
        let SensorRecord::BatteryMonitor(bm) = record else {
            panic!("expected battery monitor, got {record:?}");
        };
        assert_eq!(bm.remaining_mins, None);
        assert_close(bm.voltage, 12.80);
        assert_eq!(bm.alarm, Some(0));
        assert_eq!(bm.aux, None);
        assert_eq!(bm.aux_mode, 3);
        assert_close(bm.current, -1.234);
        assert_eq!(bm.consumed_ah, None);
        assert_close(bm.soc, 75.5);
        assert_close(bm.power, 12.80 * -1.234);
    }

    #[test]
    fn test_wrong_key_check_byte_yields_none() {
        let plaintext = pack_bits(&[(1280, 16)]);
        let mut data = frame(record_type::BATTERY_MONITOR, 7, &plaintext);
        data[KEY_CHECK_OFFSET] ^= 0xff;

        let parser = VictronParser::new();
        assert_eq!(parser.parse(&data, &opts()).unwrap(), None);
    }

    #[test]
    fn test_missing_key_yields_none() {
        let plaintext = pack_bits(&[(1280, 16)]);
        let data = frame(record_type::BATTERY_MONITOR, 7, &plaintext);

        let parser = VictronParser::new();
        let result = parser.parse(&data, &ParseOptions::default()).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_unknown_record_type_yields_none() {
        let data = frame(0x7f, 7, &[0u8; 8]);
        let parser = VictronParser::new();
        assert_eq!(parser.parse(&data, &opts()).unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let parser = VictronParser::new();
        let short = [0xe1, 0x02, 0xa1, 0x02, 0x02, 0x00];
        assert!(matches!(
            parser.parse(&short, &opts()),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn test_solar_charger_decode() {
        let plaintext = pack_bits(&[
            (4, 8),      // deviceState: absorption
            (0, 8),      // chargerError
            (1350, 16),  // batteryVoltage: 13.50 V
            (52, 16),    // batteryCurrent: 5.2 A
            (123, 16),   // yieldToday: 1.23 kWh
            (180, 16),   // pvPower: 180 W
            (0x1ff, 9),  // loadCurrent: sentinel
        ]);
        let data = frame(record_type::SOLAR_CHARGER, 99, &plaintext);
        let parser = VictronParser::new();
        let SensorRecord::SolarCharger(sc) = parser.parse(&data, &opts()).unwrap().unwrap()
        else {
            panic!("expected solar charger");
        };
        assert_eq!(sc.device_state, Some(4));
        assert_close(sc.battery_voltage, 13.50);
        assert_close(sc.battery_current, 5.2);
        assert_close(sc.yield_today, 1.23);
        assert_close(sc.pv_power, 180.0);
        assert_eq!(sc.load_current, None);
    }

    #[test]
    fn test_smart_lithium_cells_and_temperature() {
        let plaintext = pack_bits(&[
            (0, 32),    // bmsFlags
            (0, 16),    // error
            (72, 7),    // cell 1: 3.32 V
            (70, 7),    // cell 2: 3.30 V
            (0x7f, 7),  // cell 3: sentinel
            (0x7f, 7),
            (0x7f, 7),
            (0x7f, 7),
            (0x7f, 7),
            (1328, 12), // batteryVoltage: 13.28 V
            (0, 4),     // balancerStatus
            (65, 7),    // temperature: 25 C
        ]);
        let data = frame(record_type::SMART_LITHIUM, 3, &plaintext);
        let parser = VictronParser::new();
        let SensorRecord::SmartLithium(sl) = parser.parse(&data, &opts()).unwrap().unwrap()
        else {
            panic!("expected smart lithium");
        };
        assert_close(sl.cell_voltages[0], 3.32);
        assert_close(sl.cell_voltages[1], 3.30);
        assert_eq!(sl.cell_voltages[2], None);
        assert_close(sl.battery_voltage, 13.28);
        assert_close(sl.temperature, 25.0);
    }

    #[test]
    fn test_bit_reader_sentinels() {
        let data = [0xff, 0xff];
        let mut bits = BitReader::new(&data);
        assert_eq!(bits.unsigned(16), None);
        // Reads past the end also collapse to the sentinel.
        assert_eq!(bits.unsigned(8), None);
    }
}
