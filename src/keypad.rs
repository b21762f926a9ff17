// Keypad click — 4x3 matrix, rows driven low one at a time, columns
// read through pull-ups.
//
// The scanner is caller-ticked: call poll from a timer loop with a
// monotonic millisecond counter and drain events from the queue. One
// key at a time; with two keys down the scan reports the first hit,
// which is all the original hardware supports without diodes.

use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::Error;

pub const ROWS: usize = 4;
pub const COLS: usize = 3;

const DEBOUNCE_MS: u32 = 30;
const LONG_PRESS_MS: u32 = 1000;
const REPEAT_MS: u32 = 150;
const QUEUE_LEN: usize = 4;

const KEYMAP: [[char; COLS]; ROWS] = [
    ['1', '2', '3'],
    ['4', '5', '6'],
    ['7', '8', '9'],
    ['*', '0', '#'],
];

/// A matrix position. Only the scanner constructs these, so `row` and
/// `col` are always in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    row: u8,
    col: u8,
}

impl Key {
    pub fn row(self) -> u8 {
        self.row
    }

    pub fn col(self) -> u8 {
        self.col
    }

    pub fn label(self) -> char {
        KEYMAP[self.row as usize][self.col as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Press(Key),
    LongPress(Key),
    Repeat(Key),
    Release(Key),
}

/// Fixed-size FIFO; newest event is dropped on overflow.
#[derive(Debug, Default)]
struct EventQueue {
    slots: [Option<Event>; QUEUE_LEN],
    head: usize,
    len: usize,
}

impl EventQueue {
    fn push(&mut self, event: Event) {
        if self.len == QUEUE_LEN {
            return;
        }
        self.slots[(self.head + self.len) % QUEUE_LEN] = Some(event);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Event> {
        if self.len == 0 {
            return None;
        }
        let event = self.slots[self.head].take();
        self.head = (self.head + 1) % QUEUE_LEN;
        self.len -= 1;
        event
    }
}

/// Debounce and hold tracking, independent of pin I/O.
#[derive(Debug, Default)]
struct ScanState {
    stable: Option<Key>,
    candidate: Option<Key>,
    candidate_since: u32,
    pressed_at: u32,
    long_sent: bool,
    last_repeat: u32,
}

impl ScanState {
    fn update(&mut self, sample: Option<Key>, now_ms: u32, queue: &mut EventQueue) {
        if sample != self.candidate {
            self.candidate = sample;
            self.candidate_since = now_ms;
        } else if sample != self.stable
            && now_ms.wrapping_sub(self.candidate_since) >= DEBOUNCE_MS
        {
            if let Some(key) = self.stable {
                queue.push(Event::Release(key));
            }
            if let Some(key) = sample {
                queue.push(Event::Press(key));
                self.pressed_at = now_ms;
                self.long_sent = false;
                self.last_repeat = now_ms;
            }
            self.stable = sample;
        }

        if let Some(key) = self.stable {
            let held = now_ms.wrapping_sub(self.pressed_at);
            if !self.long_sent && held >= LONG_PRESS_MS {
                queue.push(Event::LongPress(key));
                self.long_sent = true;
                self.last_repeat = now_ms;
            } else if self.long_sent && now_ms.wrapping_sub(self.last_repeat) >= REPEAT_MS {
                queue.push(Event::Repeat(key));
                self.last_repeat = now_ms;
            }
        }
    }
}

pub struct Keypad<R, C> {
    rows: [R; ROWS],
    cols: [C; COLS],
    state: ScanState,
    queue: EventQueue,
}

impl<R, C, E> Keypad<R, C>
where
    R: OutputPin<Error = E>,
    C: InputPin<Error = E>,
{
    pub fn new(rows: [R; ROWS], cols: [C; COLS]) -> Self {
        Self {
            rows,
            cols,
            state: ScanState::default(),
            queue: EventQueue::default(),
        }
    }

    pub fn free(self) -> ([R; ROWS], [C; COLS]) {
        (self.rows, self.cols)
    }

    /// One matrix scan; first pressed key wins.
    fn scan(&mut self) -> Result<Option<Key>, E> {
        let mut hit = None;
        for row in 0..ROWS {
            self.rows[row].set_low()?;
            for col in 0..COLS {
                if hit.is_none() && self.cols[col].is_low()? {
                    hit = Some(Key {
                        row: row as u8,
                        col: col as u8,
                    });
                }
            }
            self.rows[row].set_high()?;
        }
        Ok(hit)
    }

    /// Scan once and advance the debounce machinery. Call every few
    /// milliseconds with a monotonic counter.
    pub fn poll(&mut self, now_ms: u32) -> Result<(), Error<E>> {
        let sample = self.scan()?;
        self.state.update(sample, now_ms, &mut self.queue);
        Ok(())
    }

    /// Oldest undelivered event, if any.
    pub fn next_event(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Currently held key after debouncing.
    pub fn current(&self) -> Option<Key> {
        self.state.stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_5: Key = Key { row: 1, col: 1 };

    fn drive(state: &mut ScanState, queue: &mut EventQueue, sample: Option<Key>, times: u32, t: &mut u32) {
        for _ in 0..times {
            state.update(sample, *t, queue);
            *t += 5;
        }
    }

    #[test]
    fn keymap_labels() {
        assert_eq!(KEY_5.label(), '5');
        assert_eq!((KEY_5.row(), KEY_5.col()), (1, 1));
        assert_eq!(Key { row: 3, col: 0 }.label(), '*');
        assert_eq!(Key { row: 3, col: 2 }.label(), '#');
    }

    #[test]
    fn press_needs_stable_samples() {
        let mut state = ScanState::default();
        let mut queue = EventQueue::default();
        let mut t = 0;
        drive(&mut state, &mut queue, Some(KEY_5), 2, &mut t); // 10 ms, too short
        assert_eq!(queue.pop(), None);
        drive(&mut state, &mut queue, Some(KEY_5), 6, &mut t);
        assert_eq!(queue.pop(), Some(Event::Press(KEY_5)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn glitch_does_not_register() {
        let mut state = ScanState::default();
        let mut queue = EventQueue::default();
        let mut t = 0;
        drive(&mut state, &mut queue, Some(KEY_5), 3, &mut t);
        drive(&mut state, &mut queue, None, 10, &mut t);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn release_follows_press() {
        let mut state = ScanState::default();
        let mut queue = EventQueue::default();
        let mut t = 0;
        drive(&mut state, &mut queue, Some(KEY_5), 10, &mut t);
        drive(&mut state, &mut queue, None, 10, &mut t);
        assert_eq!(queue.pop(), Some(Event::Press(KEY_5)));
        assert_eq!(queue.pop(), Some(Event::Release(KEY_5)));
    }

    #[test]
    fn long_press_then_repeats() {
        let mut state = ScanState::default();
        let mut queue = EventQueue::default();
        let mut t = 0;
        drive(&mut state, &mut queue, Some(KEY_5), 250, &mut t); // 1250 ms held
        assert_eq!(queue.pop(), Some(Event::Press(KEY_5)));
        assert_eq!(queue.pop(), Some(Event::LongPress(KEY_5)));
        assert_eq!(queue.pop(), Some(Event::Repeat(KEY_5)));
    }

    #[test]
    fn queue_drops_overflow() {
        let mut queue = EventQueue::default();
        for _ in 0..6 {
            queue.push(Event::Press(KEY_5));
        }
        let mut n = 0;
        while queue.pop().is_some() {
            n += 1;
        }
        assert_eq!(n, QUEUE_LEN);
    }
}
