// BarGraph click — 10-segment LED bar behind two daisy-chained 74HC595
// shift registers, brightness on the OE line via PWM.
//
// Segment 0 is the bottom LED. The two data bytes go out high byte
// first so the last bit shifted lands on segment 9.

use embedded_hal::pwm::SetDutyCycle;
use embedded_hal::spi::SpiDevice;

use crate::error::Error;

pub const SEGMENTS: u8 = 10;
const SEGMENT_MASK: u16 = (1 << SEGMENTS) - 1;

/// Bar level to segment mask: `level` lit segments from the bottom.
pub const fn level_mask(level: u8) -> u16 {
    (1u16 << level) - 1
}

pub struct BarGraph<SPI, PWM> {
    spi: SPI,
    pwm: PWM,
}

impl<SPI, PWM, E> BarGraph<SPI, PWM>
where
    SPI: SpiDevice<Error = E>,
    PWM: SetDutyCycle,
{
    pub fn new(spi: SPI, pwm: PWM) -> Self {
        Self { spi, pwm }
    }

    pub fn free(self) -> (SPI, PWM) {
        (self.spi, self.pwm)
    }

    /// Light the bottom `level` segments, 0..=10.
    pub fn set_level(&mut self, level: u8) -> Result<(), Error<E>> {
        if level > SEGMENTS {
            return Err(Error::InvalidParam);
        }
        self.write_mask(level_mask(level))
    }

    /// Arbitrary segment pattern, bit 0 = bottom segment.
    pub fn set_mask(&mut self, mask: u16) -> Result<(), Error<E>> {
        if mask & !SEGMENT_MASK != 0 {
            return Err(Error::InvalidParam);
        }
        self.write_mask(mask)
    }

    pub fn clear(&mut self) -> Result<(), Error<E>> {
        self.write_mask(0)
    }

    fn write_mask(&mut self, mask: u16) -> Result<(), Error<E>> {
        let [hi, lo] = mask.to_be_bytes();
        self.spi.write(&[hi, lo])?;
        Ok(())
    }

    /// Brightness 0..=100 on the output-enable PWM; higher values clamp.
    pub fn set_brightness(&mut self, percent: u8) -> Result<(), PWM::Error> {
        self.pwm.set_duty_cycle_percent(percent.min(100))
    }
}
