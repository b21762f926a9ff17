// Thermo click — DS18B20 One-Wire digital thermometer.
//
// Scratchpad layout (9 bytes): temp LSB, temp MSB, TH, TL, config,
// 0xFF, reserved, 0x10, CRC. Temperature is a signed 16-bit value in
// 1/16 °C at 12-bit resolution; lower resolutions leave the bottom
// bits undefined and are masked off here.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use log::debug;

use crate::error::Error;
use crate::onewire::{self, OneWire, Rom, Search};

pub const FAMILY_CODE: u8 = 0x28;

// function commands
mod cmd {
    pub const CONVERT_T: u8 = 0x44;
    pub const WRITE_SCRATCHPAD: u8 = 0x4E;
    pub const READ_SCRATCHPAD: u8 = 0xBE;
    pub const COPY_SCRATCHPAD: u8 = 0x48;
    pub const RECALL_E2: u8 = 0xB8;
    pub const READ_POWER_SUPPLY: u8 = 0xB4;
}

// EEPROM write hold time after COPY SCRATCHPAD
const COPY_HOLD_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Resolution {
    Bits9 = 0b00,
    Bits10 = 0b01,
    Bits11 = 0b10,
    Bits12 = 0b11,
}

impl Resolution {
    pub const fn config_byte(self) -> u8 {
        ((self as u8) << 5) | 0x1F
    }

    pub const fn from_config(byte: u8) -> Resolution {
        match (byte >> 5) & 0b11 {
            0b00 => Resolution::Bits9,
            0b01 => Resolution::Bits10,
            0b10 => Resolution::Bits11,
            _ => Resolution::Bits12,
        }
    }

    /// Worst-case conversion time from the datasheet.
    pub const fn max_conversion_ms(self) -> u32 {
        match self {
            Resolution::Bits9 => 94,
            Resolution::Bits10 => 188,
            Resolution::Bits11 => 375,
            Resolution::Bits12 => 750,
        }
    }

    /// Undefined low bits at this resolution.
    const fn raw_mask(self) -> i16 {
        match self {
            Resolution::Bits9 => !0x07,
            Resolution::Bits10 => !0x03,
            Resolution::Bits11 => !0x01,
            Resolution::Bits12 => !0x00,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scratchpad {
    pub raw_temperature: i16,
    pub alarm_high: i8,
    pub alarm_low: i8,
    pub resolution: Resolution,
}

/// Raw register value to °C, with undefined bits masked.
pub fn raw_to_celsius(raw: i16, resolution: Resolution) -> f32 {
    (raw & resolution.raw_mask()) as f32 * 0.0625
}

/// `rom: None` addresses the bus with SKIP ROM, for a single-drop bus.
pub struct Ds18b20<P, D> {
    wire: OneWire<P, D>,
    rom: Option<Rom>,
    resolution: Resolution,
}

impl<P, D, E> Ds18b20<P, D>
where
    P: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayNs,
{
    pub fn new(wire: OneWire<P, D>, rom: Option<Rom>) -> Result<Self, Error<E>> {
        if let Some(rom) = &rom {
            if rom.family() != FAMILY_CODE {
                return Err(Error::ChipId {
                    expected: FAMILY_CODE,
                    found: rom.family(),
                });
            }
        }
        let mut dev = Self {
            wire,
            rom,
            resolution: Resolution::Bits12,
        };
        // presence check doubles as init probe; cache actual resolution
        let sp = dev.read_scratchpad()?;
        dev.resolution = sp.resolution;
        debug!("ds18b20: present, {:?}", sp.resolution);
        Ok(dev)
    }

    pub fn free(self) -> OneWire<P, D> {
        self.wire
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn address(&mut self) -> Result<(), Error<E>> {
        self.wire.reset()?;
        match &self.rom {
            Some(rom) => {
                let rom = *rom;
                self.wire.match_rom(&rom)?;
            }
            None => self.wire.skip_rom()?,
        }
        Ok(())
    }

    pub fn read_scratchpad(&mut self) -> Result<Scratchpad, Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::READ_SCRATCHPAD)?;
        let mut buf = [0u8; 9];
        self.wire.read_bytes(&mut buf)?;
        let computed = onewire::crc8(&buf[..8]);
        if computed != buf[8] {
            return Err(Error::Crc {
                computed,
                received: buf[8],
            });
        }
        Ok(Scratchpad {
            raw_temperature: i16::from_le_bytes([buf[0], buf[1]]),
            alarm_high: buf[2] as i8,
            alarm_low: buf[3] as i8,
            resolution: Resolution::from_config(buf[4]),
        })
    }

    /// Write TH/TL alarm thresholds and resolution to the scratchpad.
    pub fn write_scratchpad(
        &mut self,
        alarm_high: i8,
        alarm_low: i8,
        resolution: Resolution,
    ) -> Result<(), Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::WRITE_SCRATCHPAD)?;
        self.wire.write_bytes(&[
            alarm_high as u8,
            alarm_low as u8,
            resolution.config_byte(),
        ])?;
        self.resolution = resolution;
        Ok(())
    }

    /// Burn the scratchpad (TH/TL/config) into EEPROM.
    pub fn copy_scratchpad(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::COPY_SCRATCHPAD)?;
        delay.delay_ms(COPY_HOLD_MS);
        Ok(())
    }

    /// Reload TH/TL/config from EEPROM into the scratchpad.
    pub fn recall_eeprom(&mut self) -> Result<(), Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::RECALL_E2)?;
        // slaves answer 0 while the recall runs
        let mut guard = 0u16;
        while !self.wire.read_bit()? {
            guard += 1;
            if guard > 1000 {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// True when powered from VDD, false when parasite-powered.
    pub fn read_power_supply(&mut self) -> Result<bool, Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::READ_POWER_SUPPLY)?;
        Ok(self.wire.read_bit()?)
    }

    pub fn start_conversion(&mut self) -> Result<(), Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::CONVERT_T)?;
        Ok(())
    }

    /// Non-blocking completion check after `start_conversion`; the slave
    /// answers 0 on read slots while converting.
    pub fn try_temperature(&mut self) -> nb::Result<f32, Error<E>> {
        let busy = !self.wire.read_bit().map_err(Error::Bus)?;
        if busy {
            return Err(nb::Error::WouldBlock);
        }
        let sp = self.read_scratchpad()?;
        Ok(raw_to_celsius(sp.raw_temperature, sp.resolution))
    }

    /// Trigger a conversion and block for its worst-case duration.
    pub fn measure(&mut self, delay: &mut impl DelayNs) -> Result<f32, Error<E>> {
        self.start_conversion()?;
        delay.delay_ms(self.resolution.max_conversion_ms());
        let sp = self.read_scratchpad()?;
        Ok(raw_to_celsius(sp.raw_temperature, sp.resolution))
    }

    /// ROM codes of devices whose last conversion tripped TH/TL.
    pub fn find_alarmed(
        wire: &mut OneWire<P, D>,
        roms: &mut [Option<Rom>],
    ) -> Result<usize, Error<E>> {
        let mut search = Search::alarms();
        let mut n = 0;
        while n < roms.len() {
            match search.next_device(wire)? {
                Some(rom) => {
                    roms[n] = Some(rom);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powerup_scratchpad_is_85c() {
        let raw = i16::from_le_bytes([0x50, 0x05]);
        assert_eq!(raw_to_celsius(raw, Resolution::Bits12), 85.0);
    }

    #[test]
    fn negative_temperature() {
        // datasheet table: -10.125 °C = 0xFF5E
        let raw = i16::from_le_bytes([0x5E, 0xFF]);
        assert_eq!(raw_to_celsius(raw, Resolution::Bits12), -10.125);
    }

    #[test]
    fn low_resolution_masks_undefined_bits() {
        // +25.0625 °C = 0x0191; at 9 bits the bottom three bits are noise
        let raw = 0x0191;
        assert_eq!(raw_to_celsius(raw, Resolution::Bits12), 25.0625);
        assert_eq!(raw_to_celsius(raw, Resolution::Bits9), 25.0);
    }

    #[test]
    fn resolution_config_roundtrip() {
        for r in [
            Resolution::Bits9,
            Resolution::Bits10,
            Resolution::Bits11,
            Resolution::Bits12,
        ] {
            assert_eq!(Resolution::from_config(r.config_byte()), r);
        }
    }
}
