// EEPROM click — 24C08 serial EEPROM, 1 KiB in 16-byte pages.
//
// The two high address bits ride in the I2C device address (0x50..=
// 0x53), so reads split at 256-byte block boundaries and writes split
// at page boundaries. A self-timed write cycle follows every page
// write; the chip does not ack until it finishes, so completion is
// detected by ack polling.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::trace;

use crate::error::Error;

pub const SIZE: usize = 1024;
pub const PAGE_SIZE: usize = 16;
const BLOCK_SIZE: usize = 256;
const DEVICE_BASE: u8 = 0x50;
const ACK_POLL_TRIES: u32 = 10;

const fn device_address(addr: u16) -> u8 {
    DEVICE_BASE | ((addr >> 8) as u8 & 0x03)
}

pub struct Eeprom<I2C> {
    i2c: I2C,
}

impl<I2C, E> Eeprom<I2C>
where
    I2C: I2c<Error = E>,
{
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    pub fn free(self) -> I2C {
        self.i2c
    }

    /// Current-address read: one byte from wherever the chip's internal
    /// pointer sits, block 0.
    pub fn read_current(&mut self) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.i2c.read(DEVICE_BASE, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_byte(&mut self, addr: u16) -> Result<u8, Error<E>> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Sequential read; crosses page boundaries freely but restarts at
    /// each 256-byte block because of the address bits in the device
    /// address.
    pub fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error<E>> {
        check_range(addr, buf.len())?;
        let mut addr = addr as usize;
        let mut buf = buf;
        while !buf.is_empty() {
            let chunk = buf.len().min(BLOCK_SIZE - addr % BLOCK_SIZE);
            let (head, rest) = buf.split_at_mut(chunk);
            self.i2c
                .write_read(device_address(addr as u16), &[addr as u8], head)?;
            addr += chunk;
            buf = rest;
        }
        Ok(())
    }

    pub fn write_byte(
        &mut self,
        addr: u16,
        value: u8,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        self.write(addr, &[value], delay)
    }

    /// Page-split write with ack polling after each page.
    pub fn write(
        &mut self,
        addr: u16,
        data: &[u8],
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        check_range(addr, data.len())?;
        let mut addr = addr as usize;
        let mut data = data;
        while !data.is_empty() {
            let chunk = data.len().min(PAGE_SIZE - addr % PAGE_SIZE);
            let (head, rest) = data.split_at(chunk);
            let mut frame = [0u8; 1 + PAGE_SIZE];
            frame[0] = addr as u8;
            frame[1..1 + chunk].copy_from_slice(head);
            let dev = device_address(addr as u16);
            self.i2c.write(dev, &frame[..1 + chunk])?;
            trace!("24c08: wrote {chunk} bytes at 0x{addr:03X}");
            self.ack_poll(dev, delay)?;
            addr += chunk;
            data = rest;
        }
        Ok(())
    }

    /// Probe with empty writes until the write cycle completes.
    fn ack_poll(&mut self, dev: u8, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        for _ in 0..ACK_POLL_TRIES {
            delay.delay_ms(1);
            if self.i2c.write(dev, &[]).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }
}

fn check_range<E>(addr: u16, len: usize) -> Result<(), Error<E>> {
    if (addr as usize).saturating_add(len) > SIZE {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal::i2c::ErrorKind;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    #[test]
    fn device_address_carries_high_bits() {
        assert_eq!(device_address(0x000), 0x50);
        assert_eq!(device_address(0x0FF), 0x50);
        assert_eq!(device_address(0x100), 0x51);
        assert_eq!(device_address(0x3FF), 0x53);
    }

    #[test]
    fn bounds_enforced() {
        let mut i2c = Mock::new(&[]);
        let mut ee = Eeprom::new(i2c.clone());
        let mut buf = [0u8; 2];
        assert!(matches!(ee.read(1023, &mut buf), Err(Error::InvalidParam)));
        assert!(matches!(
            ee.write(1024, &[0], &mut NoopDelay::new()),
            Err(Error::InvalidParam)
        ));
        i2c.done();
    }

    #[test]
    fn write_splits_at_page_boundary() {
        // 4 bytes starting at 0x1E cross the page edge at 0x20
        let mut i2c = Mock::new(&[
            Transaction::write(0x50, vec![0x1E, 1, 2]),
            Transaction::write(0x50, vec![]),
            Transaction::write(0x50, vec![0x20, 3, 4]),
            Transaction::write(0x50, vec![]),
        ]);
        let mut ee = Eeprom::new(i2c.clone());
        ee.write(0x1E, &[1, 2, 3, 4], &mut NoopDelay::new()).unwrap();
        i2c.done();
    }

    #[test]
    fn read_splits_at_block_boundary() {
        let mut i2c = Mock::new(&[
            Transaction::write_read(0x50, vec![0xFE], vec![0xAA, 0xBB]),
            Transaction::write_read(0x51, vec![0x00], vec![0xCC]),
        ]);
        let mut ee = Eeprom::new(i2c.clone());
        let mut buf = [0u8; 3];
        ee.read(0x0FE, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC]);
        i2c.done();
    }

    #[test]
    fn ack_poll_retries_until_ready() {
        let mut i2c = Mock::new(&[
            Transaction::write(0x50, vec![0x00, 0x5A]),
            Transaction::write(0x50, vec![]).with_error(ErrorKind::Other),
            Transaction::write(0x50, vec![]),
        ]);
        let mut ee = Eeprom::new(i2c.clone());
        ee.write_byte(0, 0x5A, &mut NoopDelay::new()).unwrap();
        i2c.done();
    }
}
