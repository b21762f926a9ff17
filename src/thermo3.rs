// Thermo 3 click — TI TMP102 digital temperature sensor, I2C.
//
// 12-bit format, 0.0625 °C/LSB, left-justified; extended mode stretches
// to 13 bits (up to +150 °C) and flags itself in bit 0 of the low byte,
// so decoding needs no mode state. The TMP102 has no identity register;
// the first config read doubles as the presence probe.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::error::Error;

mod reg {
    pub const TEMPERATURE: u8 = 0x00;
    pub const CONFIG: u8 = 0x01;
    pub const T_LOW: u8 = 0x02;
    pub const T_HIGH: u8 = 0x03;
}

// config word bits (big-endian register)
const CFG_OS: u16 = 1 << 15;
const CFG_FAULTS: u16 = 0b11 << 11;
const CFG_POL: u16 = 1 << 10;
const CFG_TM: u16 = 1 << 9;
const CFG_SD: u16 = 1 << 8;
const CFG_RATE: u16 = 0b11 << 6;
const CFG_AL: u16 = 1 << 5;
const CFG_EM: u16 = 1 << 4;

const ONE_SHOT_POLL_TRIES: u32 = 40;

const CELSIUS_PER_LSB: f32 = 0.0625;

/// Consecutive out-of-limit conversions before ALERT asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FaultQueue {
    One = 0b00,
    Two = 0b01,
    Four = 0b10,
    Six = 0b11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConversionRate {
    QuarterHz = 0b00,
    OneHz = 0b01,
    FourHz = 0b10,
    EightHz = 0b11,
}

/// Read-modify-write helper; only the masked field changes.
const fn apply(current: u16, mask: u16, bits: u16) -> u16 {
    (current & !mask) | (bits & mask)
}

/// Temperature register pair to °C; handles both 12- and 13-bit frames.
pub fn decode_temperature(msb: u8, lsb: u8) -> f32 {
    let raw = if lsb & 0x01 != 0 {
        // extended mode, 13 bits
        (((msb as i16) << 5) | ((lsb as i16) >> 3)) << 3 >> 3
    } else {
        (((msb as i16) << 4) | ((lsb as i16) >> 4)) << 4 >> 4
    };
    raw as f32 * CELSIUS_PER_LSB
}

fn encode_limit(celsius: f32) -> [u8; 2] {
    let raw = (celsius / CELSIUS_PER_LSB) as i16;
    let raw = raw.clamp(-2048, 2047);
    [(raw >> 4) as u8, (raw << 4) as u8]
}

pub struct Thermo3<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C, E> Thermo3<I2C>
where
    I2C: I2c<Error = E>,
{
    /// `address` is 0x48..=0x4B depending on the ADD0 strap.
    pub fn new(i2c: I2C, address: u8) -> Result<Self, Error<E>> {
        let mut dev = Self { i2c, address };
        dev.read_config()?; // presence probe
        Ok(dev)
    }

    pub fn free(self) -> I2C {
        self.i2c
    }

    fn read_word(&mut self, reg: u8) -> Result<u16, E> {
        let mut buf = [0u8; 2];
        self.i2c.write_read(self.address, &[reg], &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn write_word(&mut self, reg: u8, word: u16) -> Result<(), E> {
        let b = word.to_be_bytes();
        self.i2c.write(self.address, &[reg, b[0], b[1]])
    }

    pub fn read_config(&mut self) -> Result<u16, E> {
        self.read_word(reg::CONFIG)
    }

    fn update_config(&mut self, mask: u16, bits: u16) -> Result<(), E> {
        let cur = self.read_word(reg::CONFIG)?;
        self.write_word(reg::CONFIG, apply(cur, mask, bits))
    }

    pub fn read_temperature(&mut self) -> Result<f32, E> {
        let word = self.read_word(reg::TEMPERATURE)?;
        let [msb, lsb] = word.to_be_bytes();
        Ok(decode_temperature(msb, lsb))
    }

    /// ALERT pin state mirrored in the config word.
    pub fn alert_active(&mut self) -> Result<bool, E> {
        let cfg = self.read_config()?;
        let asserted_high = cfg & CFG_POL != 0;
        Ok((cfg & CFG_AL != 0) == asserted_high)
    }

    pub fn set_limits(&mut self, low: f32, high: f32) -> Result<(), Error<E>> {
        if low >= high {
            return Err(Error::InvalidParam);
        }
        let l = encode_limit(low);
        let h = encode_limit(high);
        self.i2c.write(self.address, &[reg::T_LOW, l[0], l[1]])?;
        self.i2c.write(self.address, &[reg::T_HIGH, h[0], h[1]])?;
        Ok(())
    }

    /// Comparator (thermostat) mode instead of interrupt mode.
    pub fn set_thermostat_mode(&mut self, on: bool) -> Result<(), E> {
        self.update_config(CFG_TM, if on { 0 } else { CFG_TM })
    }

    /// ALERT polarity: true = active high.
    pub fn set_alert_polarity(&mut self, active_high: bool) -> Result<(), E> {
        self.update_config(CFG_POL, if active_high { CFG_POL } else { 0 })
    }

    pub fn set_fault_queue(&mut self, faults: FaultQueue) -> Result<(), E> {
        self.update_config(CFG_FAULTS, (faults as u16) << 11)
    }

    pub fn set_conversion_rate(&mut self, rate: ConversionRate) -> Result<(), E> {
        self.update_config(CFG_RATE, (rate as u16) << 6)
    }

    /// ±150 °C range at 13 bits.
    pub fn set_extended_mode(&mut self, on: bool) -> Result<(), E> {
        self.update_config(CFG_EM, if on { CFG_EM } else { 0 })
    }

    pub fn set_shutdown(&mut self, on: bool) -> Result<(), E> {
        self.update_config(CFG_SD, if on { CFG_SD } else { 0 })
    }

    /// Single conversion from shutdown; blocks until OS reads back set.
    pub fn one_shot(&mut self, delay: &mut impl DelayNs) -> Result<f32, Error<E>> {
        self.update_config(CFG_OS, CFG_OS)?;
        for _ in 0..ONE_SHOT_POLL_TRIES {
            delay.delay_ms(1);
            if self.read_config()? & CFG_OS != 0 {
                return Ok(self.read_temperature()?);
            }
        }
        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    #[test]
    fn decode_12bit() {
        assert_eq!(decode_temperature(0x19, 0x00), 25.0);
        assert_eq!(decode_temperature(0xE7, 0x00), -25.0);
        assert_eq!(decode_temperature(0x00, 0x10), 0.0625);
    }

    #[test]
    fn decode_13bit_extended() {
        // +150 °C = 2400 LSB; EM flag in bit 0
        assert_eq!(decode_temperature(0x4B, 0x01), 150.0);
        assert_eq!(decode_temperature(0xFF, 0xC9), -0.4375);
    }

    #[test]
    fn limit_encoding() {
        assert_eq!(encode_limit(80.0), [0x50, 0x00]);
        assert_eq!(encode_limit(-25.0), [0xE7, 0x00]);
    }

    #[test]
    fn apply_preserves_bits_outside_mask() {
        let cur = 0b0110_0000_1010_0000;
        let next = apply(cur, CFG_POL, CFG_POL);
        assert_eq!(next & !CFG_POL, cur & !CFG_POL);
        let next = apply(next, CFG_FAULTS, (FaultQueue::Six as u16) << 11);
        assert_eq!(next & !CFG_FAULTS, cur | CFG_POL);
    }

    #[test]
    fn read_temperature_transaction() {
        let mut i2c = Mock::new(&[
            Transaction::write_read(0x48, vec![reg::CONFIG], vec![0x60, 0xA0]),
            Transaction::write_read(0x48, vec![reg::TEMPERATURE], vec![0x19, 0x00]),
        ]);
        let mut tmp = Thermo3::new(i2c.clone(), 0x48).unwrap();
        assert_eq!(tmp.read_temperature().unwrap(), 25.0);
        i2c.done();
    }

    #[test]
    fn limits_reject_inverted_range() {
        let mut i2c = Mock::new(&[Transaction::write_read(
            0x48,
            vec![reg::CONFIG],
            vec![0x60, 0xA0],
        )]);
        let mut tmp = Thermo3::new(i2c.clone(), 0x48).unwrap();
        assert!(matches!(
            tmp.set_limits(30.0, 20.0),
            Err(Error::InvalidParam)
        ));
        i2c.done();
    }
}
