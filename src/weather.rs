// Weather click — Bosch BME280 temperature / pressure / humidity, I2C.
//
// Compensation is the Bosch integer reference code: int32 temperature,
// int64 pressure (Q24.8 Pa), int32 humidity (Q22.10 %RH). The magic
// shifts and constants come straight from the datasheet.
//
// Async variants (init_async, sample_async) mirror the blocking path
// over embedded_hal_async::i2c::I2c for callers running an executor.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use embedded_hal_async::i2c::I2c as AsyncI2c;
use log::debug;

use crate::error::Error;

pub const CHIP_ID: u8 = 0x60;
const RESET_MAGIC: u8 = 0xB6;
const RESET_SETTLE_MS: u32 = 2;
const FORCED_POLL_TRIES: u32 = 50;

mod reg {
    pub const ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
    pub const CALIB_00: u8 = 0x88; // 26 bytes through 0xA1
    pub const CALIB_26: u8 = 0xE1; // 7 bytes through 0xE7
    pub const CTRL_HUM: u8 = 0xF2;
    pub const STATUS: u8 = 0xF3;
    pub const CTRL_MEAS: u8 = 0xF4;
    pub const CONFIG: u8 = 0xF5;
    pub const PRESS_MSB: u8 = 0xF7; // 8-byte burst through HUM_LSB
}

const STATUS_MEASURING: u8 = 1 << 3;

/// I2C address, set by the SDO strap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Address {
    SdoGnd = 0x76,
    SdoVddio = 0x77,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Oversampling {
    /// Measurement skipped, output forced to 0x80000.
    #[default]
    Skip = 0b000,
    X1 = 0b001,
    X2 = 0b010,
    X4 = 0b011,
    X8 = 0b100,
    X16 = 0b101,
}

impl Oversampling {
    const fn from_bits(bits: u8) -> Oversampling {
        match bits & 0b111 {
            0b000 => Oversampling::Skip,
            0b001 => Oversampling::X1,
            0b010 => Oversampling::X2,
            0b011 => Oversampling::X4,
            0b100 => Oversampling::X8,
            _ => Oversampling::X16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Mode {
    #[default]
    Sleep = 0b00,
    Forced = 0b01,
    Normal = 0b11,
}

impl Mode {
    const fn from_bits(bits: u8) -> Mode {
        match bits & 0b11 {
            0b00 => Mode::Sleep,
            0b11 => Mode::Normal,
            _ => Mode::Forced,
        }
    }
}

/// Inactive time between normal-mode measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Standby {
    #[default]
    Micros500 = 0b000,
    Micros62500 = 0b001,
    Millis125 = 0b010,
    Millis250 = 0b011,
    Millis500 = 0b100,
    Millis1000 = 0b101,
    Millis10 = 0b110,
    Millis20 = 0b111,
}

impl Standby {
    const fn from_bits(bits: u8) -> Standby {
        match bits & 0b111 {
            0b000 => Standby::Micros500,
            0b001 => Standby::Micros62500,
            0b010 => Standby::Millis125,
            0b011 => Standby::Millis250,
            0b100 => Standby::Millis500,
            0b101 => Standby::Millis1000,
            0b110 => Standby::Millis10,
            _ => Standby::Millis20,
        }
    }
}

/// IIR filter coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Filter {
    #[default]
    Off = 0b000,
    X2 = 0b001,
    X4 = 0b010,
    X8 = 0b011,
    X16 = 0b100,
}

impl Filter {
    const fn from_bits(bits: u8) -> Filter {
        match bits & 0b111 {
            0b000 => Filter::Off,
            0b001 => Filter::X2,
            0b010 => Filter::X4,
            0b011 => Filter::X8,
            _ => Filter::X16,
        }
    }
}

/// `config` register builder; setters only touch their own field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config(u8);

impl Config {
    pub const fn new() -> Self {
        Config(0)
    }

    #[must_use]
    pub const fn standby(self, s: Standby) -> Self {
        Config((self.0 & 0x1F) | ((s as u8) << 5))
    }

    pub const fn get_standby(self) -> Standby {
        Standby::from_bits(self.0 >> 5)
    }

    #[must_use]
    pub const fn filter(self, f: Filter) -> Self {
        Config((self.0 & 0b1110_0011) | ((f as u8) << 2))
    }

    pub const fn get_filter(self) -> Filter {
        Filter::from_bits(self.0 >> 2)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// `ctrl_meas` register builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtrlMeas(u8);

impl CtrlMeas {
    pub const fn new() -> Self {
        CtrlMeas(0)
    }

    #[must_use]
    pub const fn osrs_t(self, os: Oversampling) -> Self {
        CtrlMeas((self.0 & 0b0001_1111) | ((os as u8) << 5))
    }

    pub const fn get_osrs_t(self) -> Oversampling {
        Oversampling::from_bits(self.0 >> 5)
    }

    #[must_use]
    pub const fn osrs_p(self, os: Oversampling) -> Self {
        CtrlMeas((self.0 & 0b1110_0011) | ((os as u8) << 2))
    }

    pub const fn get_osrs_p(self) -> Oversampling {
        Oversampling::from_bits(self.0 >> 2)
    }

    #[must_use]
    pub const fn mode(self, m: Mode) -> Self {
        CtrlMeas((self.0 & 0b1111_1100) | (m as u8))
    }

    pub const fn get_mode(self) -> Mode {
        Mode::from_bits(self.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub config: Config,
    pub ctrl_meas: CtrlMeas,
    pub ctrl_hum: Oversampling,
}

/// Factory trim read from 0x88..0xA1 and 0xE1..0xE7 at init.
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
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

impl Calibration {
    fn from_regs(low: &[u8; 26], high: &[u8; 7]) -> Self {
        Calibration {
            t1: u16::from_le_bytes([low[0], low[1]]),
            t2: i16::from_le_bytes([low[2], low[3]]),
            t3: i16::from_le_bytes([low[4], low[5]]),
            p1: u16::from_le_bytes([low[6], low[7]]),
            p2: i16::from_le_bytes([low[8], low[9]]),
            p3: i16::from_le_bytes([low[10], low[11]]),
            p4: i16::from_le_bytes([low[12], low[13]]),
            p5: i16::from_le_bytes([low[14], low[15]]),
            p6: i16::from_le_bytes([low[16], low[17]]),
            p7: i16::from_le_bytes([low[18], low[19]]),
            p8: i16::from_le_bytes([low[20], low[21]]),
            p9: i16::from_le_bytes([low[22], low[23]]),
            // low[24] is a one-byte gap in the map
            h1: low[25],
            h2: i16::from_le_bytes([high[0], high[1]]),
            h3: high[2],
            // H4/H5 share a nibble-packed register pair; E4/E6 are the
            // signed top eight bits and must sign-extend
            h4: (((high[3] as i8) as i16) << 4) | ((high[4] as i16) & 0x0F),
            h5: (((high[5] as i8) as i16) << 4) | (((high[4] as i16) >> 4) & 0x0F),
            h6: high[6] as i8,
        }
    }

    /// Datasheet int32 temperature compensation. Returns (t_fine, °C).
    pub fn compensate_temperature(&self, raw: i32) -> (i32, f32) {
        let var1 = (((raw >> 3) - ((self.t1 as i32) << 1)) * (self.t2 as i32)) >> 11;
        let var2 = (((((raw >> 4) - (self.t1 as i32)) * ((raw >> 4) - (self.t1 as i32))) >> 12)
            * (self.t3 as i32))
            >> 14;
        let t_fine = var1 + var2;
        let centi = (t_fine * 5 + 128) >> 8;
        (t_fine, centi as f32 / 100.0)
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
            return 0.0; // avoid division by zero when p1 trim is blank
        }
        let p = 1048576 - (raw as i64);
        let p = (((p << 31) - var2) * 3125) / var1;
        let var1 = ((self.p9 as i64) * (p >> 13) * (p >> 13)) >> 25;
        let var2 = ((self.p8 as i64) * p) >> 19;
        let p = ((p + var1 + var2) >> 8) + ((self.p7 as i64) << 4);
        p as f32 / 256.0
    }

    /// Datasheet int32 humidity compensation, result in %RH.
    pub fn compensate_humidity(&self, raw: i32, t_fine: i32) -> f32 {
        let v = t_fine - 76800;
        let v = ((((raw << 14) - ((self.h4 as i32) << 20) - ((self.h5 as i32) * v)) + 16384)
            >> 15)
            * (((((((v * (self.h6 as i32)) >> 10)
                * (((v * (self.h3 as i32)) >> 11) + 32768))
                >> 10)
                + 2097152)
                * (self.h2 as i32)
                + 8192)
                >> 14);
        let v = v - (((((v >> 15) * (v >> 15)) >> 7) * (self.h1 as i32)) >> 4);
        let v = v.clamp(0, 419430400);
        (v >> 12) as f32 / 1024.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// °C
    pub temperature: f32,
    /// Pa
    pub pressure: f32,
    /// %RH
    pub humidity: f32,
}

fn split_raw(buf: &[u8; 8]) -> (i32, i32, i32) {
    let p = ((buf[0] as u32) << 12) | ((buf[1] as u32) << 4) | ((buf[2] as u32) >> 4);
    let t = ((buf[3] as u32) << 12) | ((buf[4] as u32) << 4) | ((buf[5] as u32) >> 4);
    let h = ((buf[6] as u32) << 8) | (buf[7] as u32);
    (t as i32, p as i32, h as i32)
}

pub struct Weather<I2C> {
    i2c: I2C,
    address: u8,
    cal: Option<Calibration>,
    ctrl_meas: CtrlMeas,
}

impl<I2C> Weather<I2C> {
    pub fn new(i2c: I2C, address: Address) -> Self {
        Self {
            i2c,
            address: address as u8,
            cal: None,
            ctrl_meas: CtrlMeas::new(),
        }
    }

    pub fn free(self) -> I2C {
        self.i2c
    }
}

impl<I2C, E> Weather<I2C>
where
    I2C: I2c<Error = E>,
{
    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), E> {
        self.i2c.write_read(self.address, &[reg], buf)
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), E> {
        self.i2c.write(self.address, &[reg, value])
    }

    pub fn chip_id(&mut self) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.read_regs(reg::ID, &mut buf)?;
        Ok(buf[0])
    }

    /// Probe identity, soft-reset, load trim, apply settings.
    pub fn init(&mut self, settings: &Settings, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        let id = self.chip_id()?;
        if id != CHIP_ID {
            return Err(Error::ChipId {
                expected: CHIP_ID,
                found: id,
            });
        }
        self.write_reg(reg::RESET, RESET_MAGIC)?;
        delay.delay_ms(RESET_SETTLE_MS);

        let mut low = [0u8; 26];
        let mut high = [0u8; 7];
        self.read_regs(reg::CALIB_00, &mut low)?;
        self.read_regs(reg::CALIB_26, &mut high)?;
        self.cal = Some(Calibration::from_regs(&low, &high));

        // ctrl_hum only latches after a ctrl_meas write
        self.write_reg(reg::CTRL_HUM, settings.ctrl_hum as u8)?;
        self.write_reg(reg::CTRL_MEAS, settings.ctrl_meas.bits())?;
        self.write_reg(reg::CONFIG, settings.config.bits())?;
        self.ctrl_meas = settings.ctrl_meas;
        debug!("bme280: init ok, ctrl_meas {:#04x}", settings.ctrl_meas.bits());
        Ok(())
    }

    /// Burst-read the measurement registers and compensate.
    pub fn sample(&mut self) -> Result<Measurement, Error<E>> {
        let mut buf = [0u8; 8];
        self.read_regs(reg::PRESS_MSB, &mut buf)?;
        let cal = self.cal.ok_or(Error::NotInitialized)?;
        let (t, p, h) = split_raw(&buf);
        let (t_fine, temperature) = cal.compensate_temperature(t);
        Ok(Measurement {
            temperature,
            pressure: cal.compensate_pressure(p, t_fine),
            humidity: cal.compensate_humidity(h, t_fine),
        })
    }

    /// One-shot: kick a forced conversion, wait for it to finish, sample.
    pub fn sample_forced(&mut self, delay: &mut impl DelayNs) -> Result<Measurement, Error<E>> {
        let ctrl = self.ctrl_meas.mode(Mode::Forced);
        self.write_reg(reg::CTRL_MEAS, ctrl.bits())?;
        let mut status = [0u8; 1];
        for _ in 0..FORCED_POLL_TRIES {
            delay.delay_ms(2);
            self.read_regs(reg::STATUS, &mut status)?;
            if status[0] & STATUS_MEASURING == 0 {
                return self.sample();
            }
        }
        Err(Error::Timeout)
    }
}

// ── Async variants ──────────────────────────────────────────────────────

impl<I2C, E> Weather<I2C>
where
    I2C: AsyncI2c<Error = E>,
{
    async fn read_regs_async(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), E> {
        self.i2c.write_read(self.address, &[reg], buf).await
    }

    async fn write_reg_async(&mut self, reg: u8, value: u8) -> Result<(), E> {
        self.i2c.write(self.address, &[reg, value]).await
    }

    pub async fn init_async(
        &mut self,
        settings: &Settings,
        delay: &mut impl embedded_hal_async::delay::DelayNs,
    ) -> Result<(), Error<E>> {
        let mut id = [0u8; 1];
        self.read_regs_async(reg::ID, &mut id).await?;
        if id[0] != CHIP_ID {
            return Err(Error::ChipId {
                expected: CHIP_ID,
                found: id[0],
            });
        }
        self.write_reg_async(reg::RESET, RESET_MAGIC).await?;
        delay.delay_ms(RESET_SETTLE_MS).await;

        let mut low = [0u8; 26];
        let mut high = [0u8; 7];
        self.read_regs_async(reg::CALIB_00, &mut low).await?;
        self.read_regs_async(reg::CALIB_26, &mut high).await?;
        self.cal = Some(Calibration::from_regs(&low, &high));

        self.write_reg_async(reg::CTRL_HUM, settings.ctrl_hum as u8).await?;
        self.write_reg_async(reg::CTRL_MEAS, settings.ctrl_meas.bits()).await?;
        self.write_reg_async(reg::CONFIG, settings.config.bits()).await?;
        self.ctrl_meas = settings.ctrl_meas;
        Ok(())
    }

    pub async fn sample_async(&mut self) -> Result<Measurement, Error<E>> {
        let mut buf = [0u8; 8];
        self.read_regs_async(reg::PRESS_MSB, &mut buf).await?;
        let cal = self.cal.ok_or(Error::NotInitialized)?;
        let (t, p, h) = split_raw(&buf);
        let (t_fine, temperature) = cal.compensate_temperature(t);
        Ok(Measurement {
            temperature,
            pressure: cal.compensate_pressure(p, t_fine),
            humidity: cal.compensate_humidity(h, t_fine),
        })
    }
}
