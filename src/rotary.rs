// Rotary click — quadrature encoder with push button and a 16-LED ring
// behind two daisy-chained 74HC595 shift registers.
//
// The encoder is decoded in software from caller-sampled A/B levels; a
// detent is four valid quarter steps in the same direction. Sampling
// must be driven from a timer tick or a pin-change event, never from
// the decode itself.

use embedded_hal::digital::InputPin;
use embedded_hal::spi::SpiDevice;

use crate::error::Error;

pub const LEDS: u8 = 16;
const DEBOUNCE_MS: u32 = 30;
const QUARTERS_PER_DETENT: i8 = 4;

/// Quarter-step delta per (previous<<2)|current A/B state. Zero rows
/// are either no movement or an invalid two-bit jump.
const STEP_TABLE: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

/// Pure quadrature state machine, one detent per four quarter steps.
#[derive(Debug, Default)]
pub struct Decoder {
    prev: u8,
    quarters: i8,
    position: i32,
    glitches: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one A/B sample; returns a detent when one completes.
    pub fn update(&mut self, a: bool, b: bool) -> Option<Direction> {
        let state = ((a as u8) << 1) | b as u8;
        let index = (self.prev << 2) | state;
        if state != self.prev && STEP_TABLE[index as usize] == 0 {
            // both channels flipped in one sample
            self.glitches = self.glitches.wrapping_add(1);
        }
        self.prev = state;
        self.quarters += STEP_TABLE[index as usize];
        if self.quarters >= QUARTERS_PER_DETENT {
            self.quarters = 0;
            self.position = self.position.wrapping_add(1);
            Some(Direction::Clockwise)
        } else if self.quarters <= -QUARTERS_PER_DETENT {
            self.quarters = 0;
            self.position = self.position.wrapping_sub(1);
            Some(Direction::CounterClockwise)
        } else {
            None
        }
    }

    /// Net detents since construction, clockwise positive.
    pub fn position(&self) -> i32 {
        self.position
    }

    /// Invalid transitions seen; nonzero means sampling is too slow.
    pub fn glitches(&self) -> u32 {
        self.glitches
    }
}

pub struct Rotary<SPI, A, B, SW> {
    spi: SPI,
    pin_a: A,
    pin_b: B,
    switch: SW,
    decoder: Decoder,
    ring: u16,
    sw_stable: bool,
    sw_candidate: bool,
    sw_since_ms: u32,
}

impl<SPI, A, B, SW, E, PE> Rotary<SPI, A, B, SW>
where
    SPI: SpiDevice<Error = E>,
    A: InputPin<Error = PE>,
    B: InputPin<Error = PE>,
    SW: InputPin<Error = PE>,
{
    pub fn new(spi: SPI, pin_a: A, pin_b: B, switch: SW) -> Self {
        Self {
            spi,
            pin_a,
            pin_b,
            switch,
            decoder: Decoder::new(),
            ring: 0,
            sw_stable: false,
            sw_candidate: false,
            sw_since_ms: 0,
        }
    }

    pub fn free(self) -> (SPI, A, B, SW) {
        (self.spi, self.pin_a, self.pin_b, self.switch)
    }

    /// Sample the encoder pins once. Call at a few kHz or on any edge.
    pub fn poll(&mut self) -> Result<Option<Direction>, PE> {
        let a = self.pin_a.is_high()?;
        let b = self.pin_b.is_high()?;
        Ok(self.decoder.update(a, b))
    }

    pub fn position(&self) -> i32 {
        self.decoder.position()
    }

    /// Debounced button state; `now_ms` is any monotonic millisecond
    /// counter. Active-low switch.
    pub fn button_pressed(&mut self, now_ms: u32) -> Result<bool, PE> {
        let raw = self.switch.is_low()?;
        if raw != self.sw_candidate {
            self.sw_candidate = raw;
            self.sw_since_ms = now_ms;
        } else if raw != self.sw_stable && now_ms.wrapping_sub(self.sw_since_ms) >= DEBOUNCE_MS {
            self.sw_stable = raw;
        }
        Ok(self.sw_stable)
    }

    /// Arbitrary ring pattern, bit 0 = LED at the top, counting
    /// clockwise.
    pub fn write_ring(&mut self, mask: u16) -> Result<(), E> {
        let [hi, lo] = mask.to_be_bytes();
        self.spi.write(&[hi, lo])?;
        self.ring = mask;
        Ok(())
    }

    /// Light a single LED, 0..=15.
    pub fn set_led(&mut self, index: u8) -> Result<(), Error<E>> {
        if index >= LEDS {
            return Err(Error::InvalidParam);
        }
        self.write_ring(1 << index)?;
        Ok(())
    }

    pub fn ring(&self) -> u16 {
        self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // one full clockwise detent: 00 -> 10 -> 11 -> 01 -> 00 (A leads B)
    const CW_CYCLE: [(bool, bool); 4] = [(true, false), (true, true), (false, true), (false, false)];

    #[test]
    fn clockwise_detent() {
        let mut dec = Decoder::new();
        let mut out = None;
        for (a, b) in CW_CYCLE {
            out = dec.update(a, b);
        }
        assert_eq!(out, Some(Direction::Clockwise));
        assert_eq!(dec.position(), 1);
        assert_eq!(dec.glitches(), 0);
    }

    #[test]
    fn counter_clockwise_detent() {
        let mut dec = Decoder::new();
        let seq = [(false, true), (true, true), (true, false), (false, false)];
        let mut out = None;
        for (a, b) in seq {
            out = dec.update(a, b);
        }
        assert_eq!(out, Some(Direction::CounterClockwise));
        assert_eq!(dec.position(), -1);
    }

    #[test]
    fn partial_cycle_does_not_count() {
        let mut dec = Decoder::new();
        assert_eq!(dec.update(true, false), None);
        assert_eq!(dec.update(true, true), None);
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn bounce_cancels_out() {
        let mut dec = Decoder::new();
        dec.update(true, false);
        dec.update(false, false); // back off
        for (a, b) in CW_CYCLE {
            dec.update(a, b);
        }
        assert_eq!(dec.position(), 1);
        assert_eq!(dec.glitches(), 0);
    }

    #[test]
    fn double_transition_counts_as_glitch() {
        let mut dec = Decoder::new();
        dec.update(true, true); // 00 -> 11, both channels at once
        assert_eq!(dec.glitches(), 1);
        assert_eq!(dec.position(), 0);
    }
}
