// Current click — 4-20 mA receiver on an MCP3204 12-bit SPI ADC.
//
// The loop current develops across a 100 Ω sense resistor into the ADC
// (2.048 V reference), so full scale is 20.48 mA at 4096 counts: one
// count per 5 µA. Loop health is classified from the current itself;
// below the live-zero region means a broken loop.

use embedded_hal::spi::{Operation, SpiDevice};

use crate::error::Error;

pub const CHANNELS: u8 = 4;
const ADC_COUNTS_PER_MA: f32 = 200.0;

const LOOP_MIN_MA: f32 = 4.0;
const LOOP_MAX_MA: f32 = 20.0;
// NAMUR NE 43 style fault bands
const OPEN_BELOW_MA: f32 = 3.8;
const OVERRANGE_ABOVE_MA: f32 = 20.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// In-band measurement as a fraction 0.0..=1.0 of span.
    Value(f32),
    /// Loop current below the live zero; broken wire or dead sender.
    Open,
    /// Loop current above the upper fault band.
    OverRange,
}

/// 12-bit ADC counts to loop milliamps.
pub fn milliamps(raw: u16) -> f32 {
    raw as f32 / ADC_COUNTS_PER_MA
}

/// Classify a loop current against the 4-20 mA span.
pub fn classify(ma: f32) -> Reading {
    if ma < OPEN_BELOW_MA {
        Reading::Open
    } else if ma > OVERRANGE_ABOVE_MA {
        Reading::OverRange
    } else {
        let fraction = (ma - LOOP_MIN_MA) / (LOOP_MAX_MA - LOOP_MIN_MA);
        Reading::Value(fraction.clamp(0.0, 1.0))
    }
}

pub struct Current<SPI> {
    spi: SPI,
}

impl<SPI, E> Current<SPI>
where
    SPI: SpiDevice<Error = E>,
{
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn free(self) -> SPI {
        self.spi
    }

    /// Raw single-ended conversion, channel 0..=3.
    pub fn read_channel(&mut self, channel: u8) -> Result<u16, Error<E>> {
        if channel >= CHANNELS {
            return Err(Error::InvalidParam);
        }
        // start bit, single-ended, D2; then D1:D0 in the top bits
        let tx = [0x06 | (channel >> 2), (channel & 0x03) << 6, 0x00];
        let mut rx = [0u8; 3];
        self.spi
            .transaction(&mut [Operation::Transfer(&mut rx, &tx)])?;
        Ok((((rx[1] & 0x0F) as u16) << 8) | rx[2] as u16)
    }

    /// Loop current on a channel, in mA.
    pub fn read_milliamps(&mut self, channel: u8) -> Result<f32, Error<E>> {
        Ok(milliamps(self.read_channel(channel)?))
    }

    /// Classified process reading on a channel.
    pub fn read(&mut self, channel: u8) -> Result<Reading, Error<E>> {
        Ok(classify(self.read_milliamps(channel)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::spi::{Mock, Transaction};

    #[test]
    fn counts_to_milliamps() {
        assert_eq!(milliamps(0), 0.0);
        assert_eq!(milliamps(800), 4.0);
        assert_eq!(milliamps(4000), 20.0);
    }

    #[test]
    fn classification_bands() {
        assert_eq!(classify(0.0), Reading::Open);
        assert_eq!(classify(3.7), Reading::Open);
        assert_eq!(classify(21.0), Reading::OverRange);
        assert_eq!(classify(4.0), Reading::Value(0.0));
        assert_eq!(classify(12.0), Reading::Value(0.5));
        assert_eq!(classify(20.0), Reading::Value(1.0));
    }

    #[test]
    fn fault_band_clamps_to_span() {
        // 3.9 mA is valid but below the span floor
        assert_eq!(classify(3.9), Reading::Value(0.0));
        assert_eq!(classify(20.3), Reading::Value(1.0));
    }

    #[test]
    fn adc_frame_layout() {
        let mut spi = Mock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer(vec![0x06, 0xC0, 0x00], vec![0x00, 0x0A, 0xBC]),
            Transaction::transaction_end(),
        ]);
        let mut adc = Current::new(spi.clone());
        assert_eq!(adc.read_channel(3).unwrap(), 0xABC);
        assert!(matches!(adc.read_channel(4), Err(Error::InvalidParam)));
        spi.done();
    }
}
