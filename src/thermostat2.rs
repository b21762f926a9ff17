// Thermostat 2 click — DS1825 One-Wire thermometer plus the board relay.
//
// The DS1825 speaks the same scratchpad protocol as the DS18B20; its
// config register low nibble carries a hardware location ID set by the
// AD0..AD3 address pins. The relay is a plain GPIO on the board.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::Error;
use crate::onewire::{self, OneWire, Rom};

pub const FAMILY_CODE: u8 = 0x3B;

mod cmd {
    pub const CONVERT_T: u8 = 0x44;
    pub const WRITE_SCRATCHPAD: u8 = 0x4E;
    pub const READ_SCRATCHPAD: u8 = 0xBE;
    pub const COPY_SCRATCHPAD: u8 = 0x48;
}

const CONVERSION_MS: u32 = 750;
const COPY_HOLD_MS: u32 = 10;

pub struct Thermostat2<P, D, RELAY> {
    wire: OneWire<P, D>,
    rom: Option<Rom>,
    relay: RELAY,
    relay_on: bool,
}

impl<P, D, RELAY, E> Thermostat2<P, D, RELAY>
where
    P: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayNs,
    RELAY: OutputPin<Error = E>,
{
    pub fn new(
        wire: OneWire<P, D>,
        rom: Option<Rom>,
        mut relay: RELAY,
    ) -> Result<Self, Error<E>> {
        if let Some(rom) = &rom {
            if rom.family() != FAMILY_CODE {
                return Err(Error::ChipId {
                    expected: FAMILY_CODE,
                    found: rom.family(),
                });
            }
        }
        // relay de-energized until asked otherwise
        relay.set_low()?;
        let mut dev = Self {
            wire,
            rom,
            relay,
            relay_on: false,
        };
        dev.read_scratchpad()?;
        Ok(dev)
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

    fn read_scratchpad(&mut self) -> Result<[u8; 9], Error<E>> {
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
        Ok(buf)
    }

    /// Hardware location ID from the AD0..AD3 strapping pins.
    pub fn location_id(&mut self) -> Result<u8, Error<E>> {
        let sp = self.read_scratchpad()?;
        Ok(sp[4] & 0x0F)
    }

    /// Set TH/TL alarm thresholds and burn them to EEPROM.
    pub fn set_thresholds(
        &mut self,
        high: i8,
        low: i8,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        let sp = self.read_scratchpad()?;
        self.address()?;
        self.wire.write_byte(cmd::WRITE_SCRATCHPAD)?;
        // keep the config byte (resolution + location bits) as-is
        self.wire.write_bytes(&[high as u8, low as u8, sp[4]])?;
        self.address()?;
        self.wire.write_byte(cmd::COPY_SCRATCHPAD)?;
        delay.delay_ms(COPY_HOLD_MS);
        Ok(())
    }

    pub fn measure(&mut self, delay: &mut impl DelayNs) -> Result<f32, Error<E>> {
        self.address()?;
        self.wire.write_byte(cmd::CONVERT_T)?;
        delay.delay_ms(CONVERSION_MS);
        let sp = self.read_scratchpad()?;
        let raw = i16::from_le_bytes([sp[0], sp[1]]);
        Ok(raw as f32 * 0.0625)
    }

    pub fn set_relay(&mut self, on: bool) -> Result<(), RELAY::Error> {
        if on {
            self.relay.set_high()?;
        } else {
            self.relay.set_low()?;
        }
        self.relay_on = on;
        Ok(())
    }

    pub fn relay_is_on(&self) -> bool {
        self.relay_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::MockError;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction as PinTransaction};
    use std::io::ErrorKind;

    #[test]
    fn relay_failure_at_construction_is_surfaced() {
        let mut wire_pin = PinMock::new(&[]);
        let mut relay = PinMock::new(&[
            PinTransaction::set(State::Low).with_error(MockError::Io(ErrorKind::NotConnected)),
        ]);
        let wire = OneWire::new(wire_pin.clone(), NoopDelay::new());
        assert!(matches!(
            Thermostat2::new(wire, None, relay.clone()),
            Err(Error::Bus(_))
        ));
        wire_pin.done();
        relay.done();
    }

    #[test]
    fn wrong_family_is_rejected_before_touching_the_relay() {
        let mut wire_pin = PinMock::new(&[]);
        let mut relay = PinMock::new(&[]);
        let wire = OneWire::new(wire_pin.clone(), NoopDelay::new());
        let rom = Rom([0x28, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            Thermostat2::new(wire, Some(rom), relay.clone()),
            Err(Error::ChipId { found: 0x28, .. })
        ));
        wire_pin.done();
        relay.done();
    }
}
