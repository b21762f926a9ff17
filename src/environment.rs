// Environment click — Bosch BME680 gas / temperature / pressure / humidity.
//
// Compensation is the Bosch floating-point reference chain; the gas
// range lookup tables and the res_heat / gas_wait encodings are straight
// from the reference code. Oversampling and filter fields share the
// BME280 encoding, so those enums are reused from `weather`.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, warn};

use crate::error::Error;
pub use crate::weather::{Address, Filter, Oversampling};

pub const CHIP_ID: u8 = 0x61;
const RESET_MAGIC: u8 = 0xB6;
const RESET_SETTLE_MS: u32 = 5;
const MEAS_POLL_TRIES: u32 = 100;
const MEAS_POLL_MS: u32 = 10;

mod reg {
    pub const RES_HEAT_VAL: u8 = 0x00;
    pub const RES_HEAT_RANGE: u8 = 0x02;
    pub const RANGE_SW_ERR: u8 = 0x04;
    pub const MEAS_STATUS_0: u8 = 0x1D; // 15-byte burst through GAS_R_LSB
    pub const RES_HEAT_0: u8 = 0x5A;
    pub const GAS_WAIT_0: u8 = 0x64;
    pub const CTRL_GAS_1: u8 = 0x71;
    pub const CTRL_HUM: u8 = 0x72;
    pub const CTRL_MEAS: u8 = 0x74;
    pub const CONFIG: u8 = 0x75;
    pub const COEFF_1: u8 = 0x89; // 25 bytes
    pub const COEFF_2: u8 = 0xE1; // 16 bytes
    pub const ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
}

const NEW_DATA: u8 = 1 << 7;
const RUN_GAS: u8 = 1 << 4;
const MODE_FORCED: u8 = 0b01;

const GAS_VALID: u8 = 1 << 5;
const HEAT_STAB: u8 = 1 << 4;

// gas range correction tables from the Bosch reference code
#[rustfmt::skip]
const GAS_K1: [f32; 16] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 0.99, 1.0, 0.992,
    1.0, 1.0, 0.998, 0.995, 1.0, 0.99, 1.0, 1.0,
];
#[rustfmt::skip]
const GAS_K2: [f32; 16] = [
    8_000_000.0, 4_000_000.0, 2_000_000.0, 1_000_000.0,
    499_500.499_5, 248_262.164_8, 125_000.0, 63_004.032_26,
    31_281.281_28, 15_625.0, 7_812.5, 3_906.25,
    1_953.125, 976.562_5, 488.281_25, 244.140_625,
];

/// Heater setpoint for profile slot 0.
#[derive(Debug, Clone, Copy)]
pub struct HeaterProfile {
    /// Plate target, °C. The chip tops out around 400 °C.
    pub target_celsius: u16,
    /// Heat-up time before the gas measurement, ms.
    pub duration_ms: u16,
    /// Ambient estimate used by the res_heat formula, °C.
    pub ambient_celsius: i8,
}

impl Default for HeaterProfile {
    fn default() -> Self {
        Self {
            target_celsius: 300,
            duration_ms: 100,
            ambient_celsius: 25,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub osrs_t: Oversampling,
    pub osrs_p: Oversampling,
    pub osrs_h: Oversampling,
    pub filter: Filter,
    /// `None` leaves the heater off and skips gas measurements.
    pub heater: Option<HeaterProfile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            osrs_t: Oversampling::X2,
            osrs_p: Oversampling::X16,
            osrs_h: Oversampling::X1,
            filter: Filter::Off,
            heater: Some(HeaterProfile::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i8,
    p1: u16,
    p2: i16,
    p3: i8,
    p4: i16,
    p5: i16,
    p6: i8,
    p7: i8,
    p8: i16,
    p9: i16,
    p10: u8,
    h1: u16,
    h2: u16,
    h3: i8,
    h4: i8,
    h5: i8,
    h6: u8,
    h7: i8,
    g1: i8,
    g2: i16,
    g3: i8,
    res_heat_range: u8,
    res_heat_val: i8,
    range_sw_err: i8,
}

impl Calibration {
    fn from_regs(c1: &[u8; 25], c2: &[u8; 16], heat: [u8; 3]) -> Self {
        // c1 holds coeff[0..24], c2 holds coeff[25..40]
        Calibration {
            t2: i16::from_le_bytes([c1[1], c1[2]]),
            t3: c1[3] as i8,
            p1: u16::from_le_bytes([c1[5], c1[6]]),
            p2: i16::from_le_bytes([c1[7], c1[8]]),
            p3: c1[9] as i8,
            p4: i16::from_le_bytes([c1[11], c1[12]]),
            p5: i16::from_le_bytes([c1[13], c1[14]]),
            p7: c1[15] as i8,
            p6: c1[16] as i8,
            p8: i16::from_le_bytes([c1[19], c1[20]]),
            p9: i16::from_le_bytes([c1[21], c1[22]]),
            p10: c1[23],
            // H1/H2 share a nibble-packed register
            h2: ((c2[0] as u16) << 4) | ((c2[1] as u16) >> 4),
            h1: ((c2[2] as u16) << 4) | ((c2[1] as u16) & 0x0F),
            h3: c2[3] as i8,
            h4: c2[4] as i8,
            h5: c2[5] as i8,
            h6: c2[6],
            h7: c2[7] as i8,
            t1: u16::from_le_bytes([c2[8], c2[9]]),
            g2: i16::from_le_bytes([c2[10], c2[11]]),
            g1: c2[12] as i8,
            g3: c2[13] as i8,
            res_heat_val: heat[0] as i8,
            res_heat_range: (heat[1] >> 4) & 0x03,
            range_sw_err: (heat[2] as i8) / 16,
        }
    }

    /// Returns (t_fine, °C).
    pub fn compensate_temperature(&self, raw: u32) -> (f32, f32) {
        let raw = raw as f32;
        let var1 = (raw / 16384.0 - (self.t1 as f32) / 1024.0) * (self.t2 as f32);
        let d = raw / 131072.0 - (self.t1 as f32) / 8192.0;
        let var2 = d * d * (self.t3 as f32) * 16.0;
        let t_fine = var1 + var2;
        (t_fine, t_fine / 5120.0)
    }

    /// Pa.
    pub fn compensate_pressure(&self, raw: u32, t_fine: f32) -> f32 {
        let var1 = t_fine / 2.0 - 64000.0;
        let var2 = var1 * var1 * (self.p6 as f32) / 131072.0;
        let var2 = var2 + var1 * (self.p5 as f32) * 2.0;
        let var2 = var2 / 4.0 + (self.p4 as f32) * 65536.0;
        let var1 = ((self.p3 as f32) * var1 * var1 / 16384.0 + (self.p2 as f32) * var1) / 524288.0;
        let var1 = (1.0 + var1 / 32768.0) * (self.p1 as f32);
        if var1 == 0.0 {
            return 0.0;
        }
        let p = 1048576.0 - raw as f32;
        let p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = (self.p9 as f32) * p * p / 2147483648.0;
        let var2 = p * (self.p8 as f32) / 32768.0;
        let q = p / 256.0;
        let var3 = q * q * q * (self.p10 as f32) / 131072.0;
        p + (var1 + var2 + var3 + (self.p7 as f32) * 128.0) / 16.0
    }

    /// %RH, clamped to 0..=100.
    pub fn compensate_humidity(&self, raw: u16, t_fine: f32) -> f32 {
        let temp = t_fine / 5120.0;
        let var1 = raw as f32 - ((self.h1 as f32) * 16.0 + (self.h3 as f32) / 2.0 * temp);
        let var2 = var1
            * ((self.h2 as f32) / 262144.0
                * (1.0
                    + (self.h4 as f32) / 16384.0 * temp
                    + (self.h5 as f32) / 1048576.0 * temp * temp));
        let var3 = (self.h6 as f32) / 16384.0;
        let var4 = (self.h7 as f32) / 2097152.0;
        (var2 + (var3 + var4 * temp) * var2 * var2).clamp(0.0, 100.0)
    }

    /// Ohms, from the 10-bit gas ADC and its range code.
    pub fn gas_resistance(&self, gas_adc: u16, gas_range: u8) -> f32 {
        let range = (gas_range & 0x0F) as usize;
        let var1 = (1340.0 + 5.0 * self.range_sw_err as f32) * GAS_K1[range];
        var1 * GAS_K2[range] / (gas_adc as f32 - 512.0 + var1)
    }

    /// res_heat register encoding for a heater setpoint.
    pub fn res_heat(&self, target_celsius: u16, ambient_celsius: i8) -> u8 {
        let target = target_celsius.min(400) as f32;
        let var1 = (self.g1 as f32) / 16.0 + 49.0;
        let var2 = (self.g2 as f32) / 32768.0 * 0.0005 + 0.00235;
        let var3 = (self.g3 as f32) / 1024.0;
        let var4 = var1 * (1.0 + var2 * target);
        let var5 = var4 + var3 * ambient_celsius as f32;
        let res = 3.4
            * (var5 * (4.0 / (4.0 + self.res_heat_range as f32))
                * (1.0 / (1.0 + self.res_heat_val as f32 * 0.002))
                - 25.0);
        res.clamp(0.0, 255.0) as u8
    }
}

/// gas_wait register: 6-bit base with a x1/x4/x16/x64 multiplier.
/// `None` above the 4032 ms the encoding can reach.
pub fn encode_gas_wait(ms: u16) -> Option<u8> {
    let mut ms = ms;
    let mut mult = 0u8;
    while ms > 0x3F {
        if mult == 3 {
            return None;
        }
        ms /= 4;
        mult += 1;
    }
    Some((mult << 6) | ms as u8)
}

#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// °C
    pub temperature: f32,
    /// Pa
    pub pressure: f32,
    /// %RH
    pub humidity: f32,
    /// Ohms; `None` when the chip flagged the gas conversion invalid
    /// or the heater never reached its setpoint.
    pub gas_resistance: Option<f32>,
}

pub struct Environment<I2C> {
    i2c: I2C,
    address: u8,
    cal: Option<Calibration>,
    ctrl_meas: u8,
}

impl<I2C, E> Environment<I2C>
where
    I2C: I2c<Error = E>,
{
    pub fn new(i2c: I2C, address: Address) -> Self {
        Self {
            i2c,
            address: address as u8,
            cal: None,
            ctrl_meas: 0,
        }
    }

    pub fn free(self) -> I2C {
        self.i2c
    }

    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), E> {
        self.i2c.write_read(self.address, &[reg], buf)
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.read_regs(reg, &mut buf)?;
        Ok(buf[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), E> {
        self.i2c.write(self.address, &[reg, value])
    }

    pub fn init(&mut self, settings: &Settings, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        let id = self.read_reg(reg::ID)?;
        if id != CHIP_ID {
            return Err(Error::ChipId {
                expected: CHIP_ID,
                found: id,
            });
        }
        self.write_reg(reg::RESET, RESET_MAGIC)?;
        delay.delay_ms(RESET_SETTLE_MS);

        let mut c1 = [0u8; 25];
        let mut c2 = [0u8; 16];
        self.read_regs(reg::COEFF_1, &mut c1)?;
        self.read_regs(reg::COEFF_2, &mut c2)?;
        let heat = [
            self.read_reg(reg::RES_HEAT_VAL)?,
            self.read_reg(reg::RES_HEAT_RANGE)?,
            self.read_reg(reg::RANGE_SW_ERR)?,
        ];
        let cal = Calibration::from_regs(&c1, &c2, heat);

        self.write_reg(reg::CTRL_HUM, settings.osrs_h as u8)?;
        self.ctrl_meas = ((settings.osrs_t as u8) << 5) | ((settings.osrs_p as u8) << 2);
        self.write_reg(reg::CTRL_MEAS, self.ctrl_meas)?;
        self.write_reg(reg::CONFIG, (settings.filter as u8) << 2)?;

        if let Some(heater) = &settings.heater {
            let wait = encode_gas_wait(heater.duration_ms).ok_or(Error::InvalidParam)?;
            self.write_reg(reg::GAS_WAIT_0, wait)?;
            self.write_reg(
                reg::RES_HEAT_0,
                cal.res_heat(heater.target_celsius, heater.ambient_celsius),
            )?;
            self.write_reg(reg::CTRL_GAS_1, RUN_GAS)?; // heater profile 0
        } else {
            self.write_reg(reg::CTRL_GAS_1, 0)?;
        }

        self.cal = Some(cal);
        debug!("bme680: init ok, heater {}", settings.heater.is_some());
        Ok(())
    }

    /// Forced-mode one-shot: trigger, wait for new_data, compensate.
    pub fn measure(&mut self, delay: &mut impl DelayNs) -> Result<Measurement, Error<E>> {
        let cal = self.cal.ok_or(Error::NotInitialized)?;
        self.write_reg(reg::CTRL_MEAS, self.ctrl_meas | MODE_FORCED)?;

        let mut buf = [0u8; 15];
        let mut tries = 0;
        loop {
            delay.delay_ms(MEAS_POLL_MS);
            self.read_regs(reg::MEAS_STATUS_0, &mut buf)?;
            if buf[0] & NEW_DATA != 0 {
                break;
            }
            tries += 1;
            if tries >= MEAS_POLL_TRIES {
                return Err(Error::Timeout);
            }
        }

        let raw_p = ((buf[2] as u32) << 12) | ((buf[3] as u32) << 4) | ((buf[4] as u32) >> 4);
        let raw_t = ((buf[5] as u32) << 12) | ((buf[6] as u32) << 4) | ((buf[7] as u32) >> 4);
        let raw_h = ((buf[8] as u16) << 8) | buf[9] as u16;
        let gas_adc = ((buf[13] as u16) << 2) | ((buf[14] as u16) >> 6);
        let gas_lsb = buf[14];

        let (t_fine, temperature) = cal.compensate_temperature(raw_t);
        let gas_resistance = if gas_lsb & GAS_VALID != 0 && gas_lsb & HEAT_STAB != 0 {
            Some(cal.gas_resistance(gas_adc, gas_lsb & 0x0F))
        } else {
            if gas_lsb & GAS_VALID != 0 {
                warn!("bme680: heater unstable, dropping gas reading");
            }
            None
        };

        Ok(Measurement {
            temperature,
            pressure: cal.compensate_pressure(raw_p, t_fine),
            humidity: cal.compensate_humidity(raw_h, t_fine),
            gas_resistance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // plausible trim set; reference outputs computed with the Bosch
    // float chain at double precision
    fn cal() -> Calibration {
        Calibration {
            t1: 26136,
            t2: 26591,
            t3: 3,
            p1: 36266,
            p2: -10165,
            p3: 88,
            p4: 7627,
            p5: -30,
            p6: 30,
            p7: 27,
            p8: -250,
            p9: -3414,
            p10: 30,
            h1: 757,
            h2: 1029,
            h3: 0,
            h4: 45,
            h5: 20,
            h6: 120,
            h7: -100,
            g1: -29,
            g2: -5969,
            g3: 18,
            res_heat_range: 1,
            res_heat_val: 47,
            range_sw_err: 0,
        }
    }

    #[test]
    fn temperature_reference() {
        let (t_fine, t) = cal().compensate_temperature(499900);
        assert!((t_fine - 132655.55).abs() < 1.0);
        assert!((t - 25.9093).abs() < 0.001);
    }

    #[test]
    fn pressure_reference() {
        let c = cal();
        let (t_fine, _) = c.compensate_temperature(499900);
        let p = c.compensate_pressure(413000, t_fine);
        assert!((p - 88613.23).abs() < 2.0);
    }

    #[test]
    fn humidity_reference() {
        let c = cal();
        let (t_fine, _) = c.compensate_temperature(499900);
        let h = c.compensate_humidity(21000, t_fine);
        assert!((h - 46.5257).abs() < 0.01);
    }

    #[test]
    fn gas_resistance_reference() {
        let g = cal().gas_resistance(600, 6);
        assert!((g - 117296.9).abs() / 117296.9 < 0.001);
    }

    #[test]
    fn res_heat_reference() {
        assert_eq!(cal().res_heat(300, 25), 112);
    }

    #[test]
    fn gas_wait_encoding() {
        assert_eq!(encode_gas_wait(25), Some(25));
        // 100 ms = 25 x4
        assert_eq!(encode_gas_wait(100), Some(0x59));
        assert_eq!(encode_gas_wait(4032), Some(0xFF));
        assert_eq!(encode_gas_wait(4096), None);
    }
}
