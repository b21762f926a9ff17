// mikroBUS Click board drivers — chip-level, board-independent.
//
// Every driver is generic over the embedded-hal 1.0 traits and owns the
// bus handle it is constructed with; pin assignments and bus sharing are
// the caller's concern. Construction and every bus transaction return
// Result. Event sources (CAN RX, rotary detents, keypad) are drained by
// caller-driven poll methods; nothing here spawns threads or touches the
// bus from interrupt context.

#![cfg_attr(not(test), no_std)]

pub mod bargraph;
pub mod canspi;
pub mod current;
pub mod ds18b20;
pub mod eeprom;
pub mod environment;
pub mod error;
pub mod gnss;
pub mod i2cmux;
pub mod keypad;
pub mod onewire;
pub mod pressure4;
pub mod rotary;
pub mod thermo3;
pub mod thermostat2;
pub mod weather;

pub use error::Error;
