// CAN SPI click — Microchip MCP2515 standalone CAN controller.
//
// All access goes through the chip's SPI instruction set; registers are
// read/written sequentially from a start address. After reset the chip
// sits in configuration mode, which doubles as the presence check.
// Received frames are drained by poll_receive from thread context; an
// INT edge should only flag that a poll is due, never touch the bus.

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use log::debug;

use crate::error::Error;

mod cmd {
    pub const RESET: u8 = 0xC0;
    pub const READ: u8 = 0x03;
    pub const WRITE: u8 = 0x02;
    pub const RTS: u8 = 0x80; // | tx buffer bit
    pub const READ_STATUS: u8 = 0xA0;
    pub const BIT_MODIFY: u8 = 0x05;
}

mod reg {
    pub const RXF_SIDH: [u8; 6] = [0x00, 0x04, 0x08, 0x10, 0x14, 0x18];
    pub const RXM_SIDH: [u8; 2] = [0x20, 0x24];
    pub const CANSTAT: u8 = 0x0E;
    pub const CANCTRL: u8 = 0x0F;
    pub const CNF3: u8 = 0x28;
    pub const CANINTE: u8 = 0x2B;
    pub const CANINTF: u8 = 0x2C;
    pub const EFLG: u8 = 0x2D;
    pub const TXB_CTRL: [u8; 3] = [0x30, 0x40, 0x50];
    pub const RXB0CTRL: u8 = 0x60;
    pub const RXB1CTRL: u8 = 0x70;
    pub const RXB_SIDH: [u8; 2] = [0x61, 0x71];
}

const MODE_MASK: u8 = 0xE0;
const TXREQ: u8 = 1 << 3;
const DLC_RTR: u8 = 1 << 6;
const SIDL_IDE: u8 = 1 << 3;
const SIDL_SRR: u8 = 1 << 4;
const RXB_RXM_ANY: u8 = 0x60; // mask/filters off
const RX0IF: u8 = 1 << 0;
const RX1IF: u8 = 1 << 1;

const MODE_CHANGE_TRIES: u32 = 100;
const STD_ID_MAX: u16 = 0x7FF;
const EXT_ID_MAX: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMode {
    Normal = 0x00,
    Sleep = 0x20,
    Loopback = 0x40,
    ListenOnly = 0x60,
    Config = 0x80,
}

/// CNF1..CNF3 presets for the click's 8 MHz crystal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    Kbps125,
    Kbps250,
    Kbps500,
}

impl Bitrate {
    /// (CNF1, CNF2, CNF3)
    pub const fn cnf(self) -> (u8, u8, u8) {
        match self {
            Bitrate::Kbps125 => (0x01, 0xB1, 0x85),
            Bitrate::Kbps250 => (0x00, 0xB1, 0x85),
            Bitrate::Kbps500 => (0x00, 0x90, 0x02),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Id {
    Standard(u16),
    Extended(u32),
}

impl Id {
    /// SIDH/SIDL/EID8/EID0 image.
    fn to_regs(self) -> [u8; 4] {
        match self {
            Id::Standard(id) => [(id >> 3) as u8, ((id & 0x07) as u8) << 5, 0, 0],
            Id::Extended(id) => [
                (id >> 21) as u8,
                ((((id >> 18) & 0x07) as u8) << 5) | SIDL_IDE | (((id >> 16) & 0x03) as u8),
                (id >> 8) as u8,
                id as u8,
            ],
        }
    }

    fn from_regs(r: &[u8; 4]) -> Id {
        if r[1] & SIDL_IDE != 0 {
            Id::Extended(
                (((r[0] as u32) << 3) | ((r[1] as u32) >> 5)) << 18
                    | (((r[1] & 0x03) as u32) << 16)
                    | ((r[2] as u32) << 8)
                    | r[3] as u32,
            )
        } else {
            Id::Standard(((r[0] as u16) << 3) | ((r[1] as u16) >> 5))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: Id,
    pub rtr: bool,
    dlc: u8,
    data: [u8; 8],
}

impl Frame {
    /// `None` when the id is out of range or the payload exceeds 8 bytes.
    pub fn new(id: Id, data: &[u8]) -> Option<Frame> {
        if data.len() > 8 || !id_in_range(id) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Frame {
            id,
            rtr: false,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// Remote frame requesting `dlc` bytes.
    pub fn new_remote(id: Id, dlc: u8) -> Option<Frame> {
        if dlc > 8 || !id_in_range(id) {
            return None;
        }
        Some(Frame {
            id,
            rtr: true,
            dlc,
            data: [0; 8],
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }
}

fn id_in_range(id: Id) -> bool {
    match id {
        Id::Standard(v) => v <= STD_ID_MAX,
        Id::Extended(v) => v <= EXT_ID_MAX,
    }
}

pub struct CanSpi<SPI, D> {
    spi: SPI,
    delay: D,
}

impl<SPI, D, E> CanSpi<SPI, D>
where
    SPI: SpiDevice<Error = E>,
    D: DelayNs,
{
    pub fn new(spi: SPI, delay: D) -> Self {
        Self { spi, delay }
    }

    pub fn free(self) -> (SPI, D) {
        (self.spi, self.delay)
    }

    fn read_regs(&mut self, start: u8, buf: &mut [u8]) -> Result<(), E> {
        self.spi.transaction(&mut [
            Operation::Write(&[cmd::READ, start]),
            Operation::Read(buf),
        ])
    }

    fn read_reg(&mut self, addr: u8) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.read_regs(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn write_regs(&mut self, start: u8, data: &[u8]) -> Result<(), E> {
        self.spi.transaction(&mut [
            Operation::Write(&[cmd::WRITE, start]),
            Operation::Write(data),
        ])
    }

    fn write_reg(&mut self, addr: u8, value: u8) -> Result<(), E> {
        self.write_regs(addr, &[value])
    }

    fn bit_modify(&mut self, addr: u8, mask: u8, bits: u8) -> Result<(), E> {
        self.spi.write(&[cmd::BIT_MODIFY, addr, mask, bits])
    }

    pub fn reset(&mut self) -> Result<(), E> {
        self.spi.write(&[cmd::RESET])?;
        self.delay.delay_ms(10);
        Ok(())
    }

    /// TXREQ/RXIF summary via the READ STATUS instruction.
    pub fn read_status(&mut self) -> Result<u8, E> {
        let mut buf = [0u8; 1];
        self.spi.transaction(&mut [
            Operation::Write(&[cmd::READ_STATUS]),
            Operation::Read(&mut buf),
        ])?;
        Ok(buf[0])
    }

    pub fn set_mode(&mut self, mode: OpMode) -> Result<(), Error<E>> {
        self.set_mode_bits(mode as u8)
    }

    fn set_mode_bits(&mut self, bits: u8) -> Result<(), Error<E>> {
        self.bit_modify(reg::CANCTRL, MODE_MASK, bits)?;
        for _ in 0..MODE_CHANGE_TRIES {
            if self.read_reg(reg::CANSTAT)? & MODE_MASK == bits {
                return Ok(());
            }
            self.delay.delay_ms(1);
        }
        Err(Error::Timeout)
    }

    /// Reset, verify config mode, program bit timing, accept-all RX,
    /// enter normal mode.
    pub fn init(&mut self, bitrate: Bitrate) -> Result<(), Error<E>> {
        self.reset()?;
        let canstat = self.read_reg(reg::CANSTAT)?;
        if canstat & MODE_MASK != OpMode::Config as u8 {
            return Err(Error::ChipId {
                expected: OpMode::Config as u8,
                found: canstat & MODE_MASK,
            });
        }

        let (cnf1, cnf2, cnf3) = bitrate.cnf();
        // CNF3..CNF1 are contiguous upward from 0x28
        self.write_regs(reg::CNF3, &[cnf3, cnf2, cnf1])?;

        self.bit_modify(reg::RXB0CTRL, RXB_RXM_ANY, RXB_RXM_ANY)?;
        self.bit_modify(reg::RXB1CTRL, RXB_RXM_ANY, RXB_RXM_ANY)?;
        self.write_reg(reg::CANINTE, RX0IF | RX1IF)?;
        self.write_reg(reg::CANINTF, 0)?;

        self.set_mode(OpMode::Normal)?;
        debug!("mcp2515: up at {:?}", bitrate);
        Ok(())
    }

    /// Acceptance filter 0..=5. Takes effect through config mode.
    pub fn set_filter(&mut self, index: usize, id: Id) -> Result<(), Error<E>> {
        let addr = *reg::RXF_SIDH.get(index).ok_or(Error::InvalidParam)?;
        self.with_config_mode(|dev| dev.write_regs(addr, &id.to_regs()))
    }

    /// Acceptance mask 0 (RXB0) or 1 (RXB1).
    pub fn set_mask(&mut self, index: usize, id: Id) -> Result<(), Error<E>> {
        let addr = *reg::RXM_SIDH.get(index).ok_or(Error::InvalidParam)?;
        self.with_config_mode(|dev| dev.write_regs(addr, &id.to_regs()))
    }

    /// Run `f` in config mode, then restore the previous mode whether or
    /// not `f` succeeded; both transitions go through the verify loop.
    fn with_config_mode(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), E>,
    ) -> Result<(), Error<E>> {
        let previous = self.read_reg(reg::CANSTAT)? & MODE_MASK;
        self.set_mode(OpMode::Config)?;
        let result = f(self).map_err(Error::Bus);
        self.set_mode_bits(previous)?;
        result
    }

    /// Load the frame into a free TX buffer and request transmission.
    /// `WouldBlock` while all three buffers are pending.
    pub fn transmit(&mut self, frame: &Frame) -> nb::Result<(), Error<E>> {
        let mut slot = None;
        for (i, ctrl) in reg::TXB_CTRL.iter().enumerate() {
            let status = self.read_reg(*ctrl).map_err(Error::Bus)?;
            if status & TXREQ == 0 {
                slot = Some((i, *ctrl));
                break;
            }
        }
        let Some((index, ctrl)) = slot else {
            return Err(nb::Error::WouldBlock);
        };

        let id = frame.id.to_regs();
        let mut dlc = frame.dlc;
        if frame.rtr {
            dlc |= DLC_RTR;
        }
        let mut payload = [0u8; 13];
        payload[..4].copy_from_slice(&id);
        payload[4] = dlc;
        payload[5..5 + frame.dlc as usize].copy_from_slice(frame.data());
        self.write_regs(ctrl + 1, &payload[..5 + frame.dlc as usize])
            .map_err(Error::Bus)?;

        // request-to-send for this buffer
        self.spi
            .write(&[cmd::RTS | (1 << index)])
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// True once no TX buffer is pending.
    pub fn transmit_idle(&mut self) -> Result<bool, E> {
        for ctrl in reg::TXB_CTRL {
            if self.read_reg(ctrl)? & TXREQ != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drain one pending RX buffer, if any. Call until it returns `None`.
    pub fn poll_receive(&mut self) -> Result<Option<Frame>, Error<E>> {
        let intf = self.read_reg(reg::CANINTF)?;
        let (buffer, flag) = if intf & RX0IF != 0 {
            (0, RX0IF)
        } else if intf & RX1IF != 0 {
            (1, RX1IF)
        } else {
            return Ok(None);
        };

        let mut raw = [0u8; 13];
        self.read_regs(reg::RXB_SIDH[buffer], &mut raw)?;
        self.bit_modify(reg::CANINTF, flag, 0)?;

        let id_regs = [raw[0], raw[1], raw[2], raw[3]];
        let id = Id::from_regs(&id_regs);
        let extended = raw[1] & SIDL_IDE != 0;
        let rtr = if extended {
            raw[4] & DLC_RTR != 0
        } else {
            raw[1] & SIDL_SRR != 0
        };
        let dlc = (raw[4] & 0x0F).min(8);
        let mut data = [0u8; 8];
        data[..dlc as usize].copy_from_slice(&raw[5..5 + dlc as usize]);
        Ok(Some(Frame {
            id,
            rtr,
            dlc,
            data,
        }))
    }

    /// EFLG register: overflow and error-passive/bus-off state.
    pub fn error_flags(&mut self) -> Result<u8, E> {
        self.read_reg(reg::EFLG)
    }
}
