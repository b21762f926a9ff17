// Pressure 4 click — Bosch BMP280 barometer, 4-wire SPI.
//
// Control byte: register address with bit 7 set for reads, cleared for
// writes; the chip auto-increments for burst access. Compensation is
// the same Bosch integer scheme the BME280 uses, minus humidity.
// Readiness comes from the status register, not from comparing
// successive samples (the original driver's comparison was dead code).

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use log::debug;

use crate::error::Error;
pub use crate::weather::{Config, CtrlMeas, Filter, Mode, Oversampling, Standby};

pub const CHIP_ID: u8 = 0x58;
const RESET_MAGIC: u8 = 0xB6;
const RESET_SETTLE_MS: u32 = 2;
const FORCED_POLL_TRIES: u32 = 50;

const SPI_READ: u8 = 0x80;
const SPI_WRITE_MASK: u8 = 0x7F;

mod reg {
    pub const CALIB_00: u8 = 0x88; // 24 bytes
    pub const ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
    pub const STATUS: u8 = 0xF3;
    pub const CTRL_MEAS: u8 = 0xF4;
    pub const CONFIG: u8 = 0xF5;
    pub const PRESS_MSB: u8 = 0xF7; // 6-byte burst through TEMP_XLSB
}

const STATUS_MEASURING: u8 = 1 << 3;

#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
}

impl Calibration {
    fn from_regs(buf: &[u8; 24]) -> Self {
        Calibration {
            t1: u16::from_le_bytes([buf[0], buf[1]]),
            t2: i16::from_le_bytes([buf[2], buf[3]]),
            t3: i16::from_le_bytes([buf[4], buf[5]]),
            p1: u16::from_le_bytes([buf[6], buf[7]]),
            p2: i16::from_le_bytes([buf[8], buf[9]]),
            p3: i16::from_le_bytes([buf[10], buf[11]]),
            p4: i16::from_le_bytes([buf[12], buf[13]]),
            p5: i16::from_le_bytes([buf[14], buf[15]]),
            p6: i16::from_le_bytes([buf[16], buf[17]]),
            p7: i16::from_le_bytes([buf[18], buf[19]]),
            p8: i16::from_le_bytes([buf[20], buf[21]]),
            p9: i16::from_le_bytes([buf[22], buf[23]]),
        }
    }

    /// Datasheet int32 temperature compensation. Returns (t_fine, °C).
    pub fn compensate_temperature(&self, raw: i32) -> (i32, f32) {
        let var1 = (((raw >> 3) - ((self.t1 as i32) << 1)) * (self.t2 as i32)) >> 11;
        let var2 = (((((raw >> 4) - (self.t1 as i32)) * ((raw >> 4) - (self.t1 as i32))) >> 12)
            * (self.t3 as i32))
            >> 14;
        let t_fine = var1 + var2;
        (t_fine, ((t_fine * 5 + 128) >> 8) as f32 / 100.0)
    }

    /// Datasheet int64 pressure compensation, result in Pa.
    pub fn compensate_pressure(&self, raw: i32, t_fine: i32) -> f32 {
        let var1 = (t_fine as i64) - 128000;
        let var2 = var1 * var1 * (self.p6 as i64);
        let var2 = var2 + ((var1 * (self.p5 as i64)) << 17);
        let var2 = var2 + ((self.p4 as i64) << 35);
        let var1 = ((var1 * var1 * (self.p3 as i64)) >> 8) + ((var1 * (self.p2 as i64)) << 12);
        let var1 = ((1i64 << 47) + var1) * (self.p1 as i64) >> 33;
        if var1 == 0 {
            return 0.0;
        }
        let p = 1048576 - (raw as i64);
        let p = (((p << 31) - var2) * 3125) / var1;
        let var1 = ((self.p9 as i64) * (p >> 13) * (p >> 13)) >> 25;
        let var2 = ((self.p8 as i64) * p) >> 19;
        let p = ((p + var1 + var2) >> 8) + ((self.p7 as i64) << 4);
        p as f32 / 256.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// °C
    pub temperature: f32,
    /// Pa
    pub pressure: f32,
}

/// Pressure altitude against a sea-level reference, meters.
///
/// Series expansion of 44330·(1 − (p/p0)^(1/5.255)) — no powf in
/// no_std. Within a metre of the exact formula below ~2000 m, a few
/// metres out at 3000 m.
pub fn altitude(pressure_pa: f32, sea_level_pa: f32) -> f32 {
    let u = 1.0 - pressure_pa / sea_level_pa;
    44330.0 * (0.19029 * u + 0.07706 * u * u + 0.04647 * u * u * u)
}

pub struct Pressure4<SPI> {
    spi: SPI,
    cal: Option<Calibration>,
    ctrl_meas: CtrlMeas,
}

impl<SPI, E> Pressure4<SPI>
where
    SPI: SpiDevice<Error = E>,
{
    pub fn new(spi: SPI) -> Self {
        Self {
            spi,
            cal: None,
            ctrl_meas: CtrlMeas::new(),
        }
    }

    pub fn free(self) -> SPI {
        self.spi
    }

    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), E> {
        self.spi.transaction(&mut [
            Operation::Write(&[reg | SPI_READ]),
            Operation::Read(buf),
        ])
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.read_regs(reg, &mut buf)?;
        Ok(buf[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), E> {
        self.spi.write(&[reg & SPI_WRITE_MASK, value])
    }

    pub fn chip_id(&mut self) -> Result<u8, E> {
        self.read_reg(reg::ID)
    }

    pub fn init(
        &mut self,
        ctrl_meas: CtrlMeas,
        config: Config,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        let id = self.chip_id()?;
        if id != CHIP_ID {
            return Err(Error::ChipId {
                expected: CHIP_ID,
                found: id,
            });
        }
        self.write_reg(reg::RESET, RESET_MAGIC)?;
        delay.delay_ms(RESET_SETTLE_MS);

        let mut buf = [0u8; 24];
        self.read_regs(reg::CALIB_00, &mut buf)?;
        self.cal = Some(Calibration::from_regs(&buf));

        self.write_reg(reg::CONFIG, config.bits())?;
        self.write_reg(reg::CTRL_MEAS, ctrl_meas.bits())?;
        self.ctrl_meas = ctrl_meas;
        debug!("bmp280: init ok");
        Ok(())
    }

    pub fn is_measuring(&mut self) -> Result<bool, E> {
        Ok(self.read_reg(reg::STATUS)? & STATUS_MEASURING != 0)
    }

    pub fn sample(&mut self) -> Result<Measurement, Error<E>> {
        let cal = self.cal.ok_or(Error::NotInitialized)?;
        let mut buf = [0u8; 6];
        self.read_regs(reg::PRESS_MSB, &mut buf)?;
        let p = (((buf[0] as u32) << 12) | ((buf[1] as u32) << 4) | ((buf[2] as u32) >> 4)) as i32;
        let t = (((buf[3] as u32) << 12) | ((buf[4] as u32) << 4) | ((buf[5] as u32) >> 4)) as i32;
        let (t_fine, temperature) = cal.compensate_temperature(t);
        Ok(Measurement {
            temperature,
            pressure: cal.compensate_pressure(p, t_fine),
        })
    }

    /// Forced one-shot conversion; waits on the status register.
    pub fn sample_forced(&mut self, delay: &mut impl DelayNs) -> Result<Measurement, Error<E>> {
        self.write_reg(reg::CTRL_MEAS, self.ctrl_meas.mode(Mode::Forced).bits())?;
        for _ in 0..FORCED_POLL_TRIES {
            delay.delay_ms(2);
            if !self.is_measuring()? {
                return self.sample();
            }
        }
        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::spi::{Mock, Transaction};

    fn datasheet_cal() -> Calibration {
        Calibration {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
        }
    }

    #[test]
    fn datasheet_worked_example() {
        let cal = datasheet_cal();
        let (t_fine, temp) = cal.compensate_temperature(519888);
        assert_eq!(t_fine, 128422);
        assert!((temp - 25.08).abs() < 0.005);
        let p = cal.compensate_pressure(415148, t_fine);
        assert!((p - 100653.25).abs() < 0.5);
    }

    #[test]
    fn altitude_at_sea_level_is_zero() {
        assert_eq!(altitude(101325.0, 101325.0), 0.0);
    }

    #[test]
    fn altitude_approximation() {
        // exact formula gives 879.9 m for 91193 Pa vs standard sea level
        let alt = altitude(91193.0, 101325.0);
        assert!((alt - 880.0).abs() < 2.0);
    }

    #[test]
    fn chip_id_read_sets_read_bit() {
        let mut spi = Mock::new(&[
            Transaction::transaction_start(),
            Transaction::write_vec(vec![reg::ID | SPI_READ]),
            Transaction::read_vec(vec![CHIP_ID]),
            Transaction::transaction_end(),
        ]);
        let mut bmp = Pressure4::new(spi.clone());
        assert_eq!(bmp.chip_id().unwrap(), CHIP_ID);
        spi.done();
    }

    #[test]
    fn sample_before_init_is_rejected() {
        let mut spi = Mock::new(&[]);
        let mut bmp = Pressure4::new(spi.clone());
        assert!(matches!(bmp.sample(), Err(Error::NotInitialized)));
        spi.done();
    }
}
