// I2C MUX click — TI TCA9548A eight-channel I2C switch.
//
// One control register, write selects the downstream channel set, read
// returns it. Any combination of channels may be enabled at once;
// overlapping downstream addresses then collide, which is the caller's
// problem. The RST line drops all channels without a bus transaction.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;
use log::debug;

use crate::error::Error;

pub const ADDRESS_BASE: u8 = 0x70;
pub const CHANNELS: u8 = 8;
const RESET_PULSE_US: u32 = 1;

pub struct I2cMux<I2C, RST> {
    i2c: I2C,
    address: u8,
    reset: Option<RST>,
}

impl<I2C, RST, E, PE> I2cMux<I2C, RST>
where
    I2C: I2c<Error = E>,
    RST: OutputPin<Error = PE>,
{
    /// `address` is 0x70..=0x77 per the A0..A2 straps; `reset` is the
    /// active-low RST line if wired.
    pub fn new(i2c: I2C, address: u8, reset: Option<RST>) -> Result<Self, Error<E>> {
        if !(ADDRESS_BASE..ADDRESS_BASE + CHANNELS).contains(&address) {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            i2c,
            address,
            reset,
        })
    }

    pub fn free(self) -> (I2C, Option<RST>) {
        (self.i2c, self.reset)
    }

    /// Route exactly one channel, 0..=7.
    pub fn select(&mut self, channel: u8) -> Result<(), Error<E>> {
        if channel >= CHANNELS {
            return Err(Error::InvalidParam);
        }
        self.select_mask(1 << channel)
    }

    /// Route any channel combination, bit n = channel n.
    pub fn select_mask(&mut self, mask: u8) -> Result<(), Error<E>> {
        self.i2c.write(self.address, &[mask])?;
        debug!("tca9548a: control 0x{mask:02X}");
        Ok(())
    }

    /// Disconnect all downstream segments.
    pub fn disable_all(&mut self) -> Result<(), E> {
        self.i2c.write(self.address, &[0])
    }

    /// Current control register contents.
    pub fn read_control(&mut self) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.i2c.read(self.address, &mut buf)?;
        Ok(buf[0])
    }

    /// Pulse RST low; clears the control register in hardware. No-op
    /// when the pin is not wired.
    pub fn hard_reset(&mut self, delay: &mut impl DelayNs) -> Result<(), PE> {
        if let Some(pin) = self.reset.as_mut() {
            pin.set_low()?;
            delay.delay_us(RESET_PULSE_US);
            pin.set_high()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::Mock as PinMock;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    type Mux = I2cMux<Mock, embedded_hal_mock::eh1::digital::Mock>;

    #[test]
    fn address_range_enforced() {
        let mut i2c = Mock::new(&[]);
        assert!(matches!(
            Mux::new(i2c.clone(), 0x6F, None),
            Err(Error::InvalidParam)
        ));
        assert!(matches!(
            Mux::new(i2c.clone(), 0x78, None),
            Err(Error::InvalidParam)
        ));
        i2c.done();
    }

    #[test]
    fn select_and_read_back() {
        let mut i2c = Mock::new(&[
            Transaction::write(0x70, vec![0b0000_0100]),
            Transaction::read(0x70, vec![0b0000_0100]),
            Transaction::write(0x70, vec![0]),
        ]);
        let mut mux = Mux::new(i2c.clone(), 0x70, None).unwrap();
        mux.select(2).unwrap();
        assert_eq!(mux.read_control().unwrap(), 0b0000_0100);
        mux.disable_all().unwrap();
        assert!(matches!(mux.select(8), Err(Error::InvalidParam)));
        i2c.done();
    }

    #[test]
    fn reset_pulses_pin() {
        use embedded_hal_mock::eh1::digital::{State, Transaction as PinTransaction};
        use embedded_hal_mock::eh1::delay::NoopDelay;

        let mut i2c = Mock::new(&[]);
        let mut pin = PinMock::new(&[
            PinTransaction::set(State::Low),
            PinTransaction::set(State::High),
        ]);
        let mut mux = Mux::new(i2c.clone(), 0x71, Some(pin.clone())).unwrap();
        mux.hard_reset(&mut NoopDelay::new()).unwrap();
        i2c.done();
        pin.done();
    }
}
