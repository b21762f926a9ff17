// Bit-banged One-Wire master over a single open-drain GPIO.
//
// The pin must be open-drain with an external pull-up: driving "high"
// releases the line, the resistor pulls it up. Slot timings are the
// Maxim standard-speed values. The ROM search walks the 64-bit address
// tree per app note 187; alarm search is the same walk behind 0xEC.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::Error;

// ROM commands
mod cmd {
    pub const SEARCH_ROM: u8 = 0xF0;
    pub const READ_ROM: u8 = 0x33;
    pub const MATCH_ROM: u8 = 0x55;
    pub const SKIP_ROM: u8 = 0xCC;
    pub const ALARM_SEARCH: u8 = 0xEC;
}

// standard-speed slot timings, microseconds
const RESET_LOW_US: u32 = 480;
const PRESENCE_WAIT_US: u32 = 70;
const RESET_TAIL_US: u32 = 410;
const WRITE1_LOW_US: u32 = 6;
const WRITE1_HIGH_US: u32 = 64;
const WRITE0_LOW_US: u32 = 60;
const WRITE0_HIGH_US: u32 = 10;
const READ_LOW_US: u32 = 6;
const READ_SAMPLE_US: u32 = 9;
const READ_TAIL_US: u32 = 55;

/// 64-bit ROM code: family, 48-bit serial, CRC8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rom(pub [u8; 8]);

impl Rom {
    pub fn family(&self) -> u8 {
        self.0[0]
    }

    /// CRC over the first seven bytes matches the stored check byte.
    pub fn is_valid(&self) -> bool {
        crc8(&self.0[..7]) == self.0[7]
    }
}

/// Dallas/Maxim CRC8, polynomial 0x31 reflected (0x8C), init 0.
pub fn crc8(data: &[u8]) -> u8 {
    crc8_partial(0, data)
}

pub fn crc8_partial(crc: u8, data: &[u8]) -> u8 {
    let mut crc = crc;
    for byte in data {
        let mut byte = *byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

pub struct OneWire<P, D> {
    pin: P,
    delay: D,
}

impl<P, D, E> OneWire<P, D>
where
    P: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayNs,
{
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub fn free(self) -> (P, D) {
        (self.pin, self.delay)
    }

    /// Reset pulse + presence detect. `Error::NoDevice` when nothing pulls
    /// the line low in the presence window.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.pin.set_low()?;
        self.delay.delay_us(RESET_LOW_US);
        self.pin.set_high()?;
        self.delay.delay_us(PRESENCE_WAIT_US);
        let present = self.pin.is_low()?;
        self.delay.delay_us(RESET_TAIL_US);
        if present { Ok(()) } else { Err(Error::NoDevice) }
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<(), E> {
        self.pin.set_low()?;
        self.delay
            .delay_us(if bit { WRITE1_LOW_US } else { WRITE0_LOW_US });
        self.pin.set_high()?;
        self.delay
            .delay_us(if bit { WRITE1_HIGH_US } else { WRITE0_HIGH_US });
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool, E> {
        self.pin.set_low()?;
        self.delay.delay_us(READ_LOW_US);
        self.pin.set_high()?;
        self.delay.delay_us(READ_SAMPLE_US);
        let bit = self.pin.is_high()?;
        self.delay.delay_us(READ_TAIL_US);
        Ok(bit)
    }

    /// LSB first, like every One-Wire slave expects.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), E> {
        for i in 0..8 {
            self.write_bit(byte & (1 << i) != 0)?;
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, E> {
        let mut byte = 0u8;
        for i in 0..8 {
            if self.read_bit()? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), E> {
        for b in bytes {
            self.write_byte(*b)?;
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), E> {
        for b in buf.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    /// Address every slave at once. Only safe with a single device on the
    /// bus for anything that reads back.
    pub fn skip_rom(&mut self) -> Result<(), E> {
        self.write_byte(cmd::SKIP_ROM)
    }

    pub fn match_rom(&mut self, rom: &Rom) -> Result<(), E> {
        self.write_byte(cmd::MATCH_ROM)?;
        self.write_bytes(&rom.0)
    }

    /// Read the ROM of the single device on the bus, CRC verified.
    pub fn read_rom(&mut self) -> Result<Rom, Error<E>> {
        self.reset()?;
        self.write_byte(cmd::READ_ROM)?;
        let mut rom = [0u8; 8];
        self.read_bytes(&mut rom)?;
        let computed = crc8(&rom[..7]);
        if computed != rom[7] {
            return Err(Error::Crc {
                computed,
                received: rom[7],
            });
        }
        Ok(Rom(rom))
    }
}

/// Resumable walk of the ROM address tree. Call `next_device` until it
/// returns `None`; `reset()` to start over.
pub struct Search {
    rom: [u8; 8],
    last_discrepancy: u8,
    done: bool,
    alarm_only: bool,
}

impl Search {
    pub fn new() -> Self {
        Self::with_command(false)
    }

    /// Only devices whose alarm flag is set answer the walk.
    pub fn alarms() -> Self {
        Self::with_command(true)
    }

    fn with_command(alarm_only: bool) -> Self {
        Self {
            rom: [0; 8],
            last_discrepancy: 0,
            done: false,
            alarm_only,
        }
    }

    pub fn reset(&mut self) {
        self.rom = [0; 8];
        self.last_discrepancy = 0;
        self.done = false;
    }

    pub fn next_device<P, D, E>(
        &mut self,
        wire: &mut OneWire<P, D>,
    ) -> Result<Option<Rom>, Error<E>>
    where
        P: OutputPin<Error = E> + InputPin<Error = E>,
        D: DelayNs,
    {
        if self.done {
            return Ok(None);
        }
        match wire.reset() {
            Ok(()) => {}
            Err(Error::NoDevice) => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        wire.write_byte(if self.alarm_only {
            cmd::ALARM_SEARCH
        } else {
            cmd::SEARCH_ROM
        })?;

        let mut last_zero: u8 = 0;
        for bit_index in 1..=64u8 {
            let bit = wire.read_bit()?;
            let complement = wire.read_bit()?;

            let direction = match (bit, complement) {
                // no device answered this slot
                (true, true) => {
                    self.done = true;
                    return Ok(None);
                }
                (true, false) => true,
                (false, true) => false,
                (false, false) => {
                    // discrepancy: both polarities present
                    let dir = if bit_index < self.last_discrepancy {
                        self.rom_bit(bit_index)
                    } else {
                        bit_index == self.last_discrepancy
                    };
                    if !dir {
                        last_zero = bit_index;
                    }
                    dir
                }
            };
            self.set_rom_bit(bit_index, direction);
            wire.write_bit(direction)?;
        }

        self.last_discrepancy = last_zero;
        if self.last_discrepancy == 0 {
            self.done = true;
        }

        let rom = Rom(self.rom);
        let computed = crc8(&rom.0[..7]);
        if computed != rom.0[7] {
            return Err(Error::Crc {
                computed,
                received: rom.0[7],
            });
        }
        Ok(Some(rom))
    }

    fn rom_bit(&self, index: u8) -> bool {
        let i = (index - 1) as usize;
        self.rom[i / 8] & (1 << (i % 8)) != 0
    }

    fn set_rom_bit(&mut self, index: u8, value: bool) {
        let i = (index - 1) as usize;
        if value {
            self.rom[i / 8] |= 1 << (i % 8);
        } else {
            self.rom[i / 8] &= !(1 << (i % 8));
        }
    }
}

impl Default for Search {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction as PinTransaction};

    fn rom_bit_of(rom: &[u8; 8], index: u8) -> bool {
        let i = (index - 1) as usize;
        rom[i / 8] & (1 << (i % 8)) != 0
    }

    // Pin-level script for a full search over a simulated bus. Write
    // slots look identical on the pin regardless of the bit value (the
    // value lives in the timing), so only read slots carry data: the
    // line reads as the wired-AND of the still-selected devices, and a
    // device deselects once the master writes a bit that is not its own.
    fn search_script(roms: &[[u8; 8]]) -> Vec<PinTransaction> {
        let mut script = Vec::new();
        let write_slot = [
            PinTransaction::set(State::Low),
            PinTransaction::set(State::High),
        ];
        let read_slot = |v: &mut Vec<PinTransaction>, bit: bool| {
            v.push(PinTransaction::set(State::Low));
            v.push(PinTransaction::set(State::High));
            v.push(PinTransaction::get(if bit { State::High } else { State::Low }));
        };

        let mut master = [0u8; 8];
        let mut last_discrepancy = 0u8;
        loop {
            // reset + presence, then the SEARCH ROM command byte
            script.push(PinTransaction::set(State::Low));
            script.push(PinTransaction::set(State::High));
            script.push(PinTransaction::get(State::Low));
            for _ in 0..8 {
                script.extend_from_slice(&write_slot);
            }

            let mut active = [true; 8];
            let mut last_zero = 0u8;
            for index in 1..=64u8 {
                let selected = || {
                    roms.iter()
                        .zip(&active)
                        .filter(|(_, a)| **a)
                        .map(|(r, _)| rom_bit_of(r, index))
                };
                let bit = selected().all(|b| b);
                let complement = selected().all(|b| !b);
                read_slot(&mut script, bit);
                read_slot(&mut script, complement);

                let direction = match (bit, complement) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => {
                        let d = if index < last_discrepancy {
                            rom_bit_of(&master, index)
                        } else {
                            index == last_discrepancy
                        };
                        if !d {
                            last_zero = index;
                        }
                        d
                    }
                };
                let i = (index - 1) as usize;
                if direction {
                    master[i / 8] |= 1 << (i % 8);
                } else {
                    master[i / 8] &= !(1 << (i % 8));
                }
                for (j, rom) in roms.iter().enumerate() {
                    if active[j] && rom_bit_of(rom, index) != direction {
                        active[j] = false;
                    }
                }
                script.extend_from_slice(&write_slot);
            }
            last_discrepancy = last_zero;
            if last_discrepancy == 0 {
                return script;
            }
        }
    }

    #[test]
    fn search_walks_a_two_device_bus() {
        // two DS18B20 ROMs differing in the serial, both CRC-valid
        let rom_a = [0x28, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x56];
        let rom_b = [0x28, 0x12, 0x22, 0x33, 0x44, 0x55, 0x66, 0x0F];
        let mut pin = PinMock::new(&search_script(&[rom_a, rom_b]));
        let mut wire = OneWire::new(pin.clone(), NoopDelay::new());

        let mut search = Search::new();
        let first = search.next_device(&mut wire).unwrap().unwrap();
        let second = search.next_device(&mut wire).unwrap().unwrap();
        // exhausted: no further bus traffic
        assert_eq!(search.next_device(&mut wire).unwrap(), None);

        assert!(first.is_valid() && second.is_valid());
        let mut found = [first.0, second.0];
        found.sort();
        let mut expected = [rom_a, rom_b];
        expected.sort();
        assert_eq!(found, expected);
        pin.done();
    }

    #[test]
    fn crc8_of_powerup_scratchpad() {
        // DS18B20 power-up scratchpad, check byte 0x1C
        let scratchpad = [0x50, 0x05, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10];
        assert_eq!(crc8(&scratchpad), 0x1C);
    }

    #[test]
    fn crc8_partial_matches_whole() {
        let data = [0x28, 0xFF, 0x4B, 0x46, 0x7F, 0xFF, 0x0A];
        let split = crc8_partial(crc8(&data[..3]), &data[3..]);
        assert_eq!(split, crc8(&data));
        assert_eq!(split, 0x77);
    }

    #[test]
    fn rom_validity() {
        let mut bytes = [0x28, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0x00];
        bytes[7] = crc8(&bytes[..7]);
        assert!(Rom(bytes).is_valid());
        bytes[3] ^= 0x01;
        assert!(!Rom(bytes).is_valid());
    }
}
