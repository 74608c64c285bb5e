//! Optical wheel encoder.
//!
//! Optical slot encoders only see edges, never direction, so the owning
//! wheel tells the encoder which way it is driving the motor. Edges arrive
//! from an interrupt handler (or a tight poll through [`EdgeDetector`]) and
//! may preempt the control loop at any point.
//!
//! The edge side only ever touches a buffered delta. The committed
//! `count`/`ticks` pair is folded from that buffer with atomic swap + add,
//! either by the edge side when no read is in progress or by the reader
//! itself while it holds the read-in-progress mark. Interrupts are never
//! masked and no edge is lost under any interleaving.

use crate::hal::{before, DigitalInput};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI8, AtomicU32, AtomicU8, Ordering};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    Reverse,
    #[default]
    Stopped,
    Forward,
}

impl Direction {
    /// Signed contribution of one edge.
    pub fn step(self) -> i8 {
        match self {
            Direction::Reverse => -1,
            Direction::Stopped => 0,
            Direction::Forward => 1,
        }
    }

    pub fn from_step(step: i8) -> Self {
        match step.signum() {
            1 => Direction::Forward,
            -1 => Direction::Reverse,
            _ => Direction::Stopped,
        }
    }

    /// Direction implied by a signed speed or distance.
    pub fn of(value: f32) -> Self {
        if value > 0.0 {
            Direction::Forward
        } else if value < 0.0 {
            Direction::Reverse
        } else {
            Direction::Stopped
        }
    }

    pub fn is_moving(self) -> bool {
        self != Direction::Stopped
    }
}

#[derive(Debug)]
pub struct Encoder {
    attached: AtomicBool,
    direction: AtomicI8,

    // Coast-down window
    settle_direction: AtomicI8,
    settle_until_ms: AtomicU32,

    // Hand-off between edge side and reader
    reading: AtomicU8,
    pending_count: AtomicI32,
    pending_ticks: AtomicU32,

    count: AtomicI32,
    ticks: AtomicU32,
}

assert_impl_all!(Encoder: Send, Sync);

impl Encoder {
    pub const fn new() -> Self {
        Self {
            attached: AtomicBool::new(false),
            direction: AtomicI8::new(0),
            settle_direction: AtomicI8::new(0),
            settle_until_ms: AtomicU32::new(0),
            reading: AtomicU8::new(0),
            pending_count: AtomicI32::new(0),
            pending_ticks: AtomicU32::new(0),
            count: AtomicI32::new(0),
            ticks: AtomicU32::new(0),
        }
    }

    /// Start observing edges from zero.
    pub fn attach(&self) {
        self.reset();
        self.attached.store(true, Ordering::Release);
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.pending_count.store(0, Ordering::Relaxed);
        self.pending_ticks.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Release);
    }

    pub fn set_direction(&self, direction: Direction) {
        self.direction.store(direction.step(), Ordering::Release);
    }

    pub fn direction(&self) -> Direction {
        Direction::from_step(self.direction.load(Ordering::Acquire))
    }

    /// Keep integrating edges in the current moving direction for
    /// `window_ms` after the direction drops to stopped.
    pub fn settle(&self, now_ms: u32, window_ms: u32) {
        let direction = self.direction.load(Ordering::Acquire);
        if direction != 0 {
            self.settle_direction.store(direction, Ordering::Release);
        }
        self.settle_until_ms
            .store(now_ms.wrapping_add(window_ms), Ordering::Release);
    }

    /// Disarm the coast window once `now_ms` is past its end, so a deadline
    /// that wraps around later can never re-open it. Called from the reader
    /// side, the same context that arms it.
    pub fn expire_settle(&self, now_ms: u32) {
        if self.settle_direction.load(Ordering::Acquire) == 0 {
            return;
        }
        if !before(now_ms, self.settle_until_ms.load(Ordering::Acquire)) {
            self.settle_direction.store(0, Ordering::Release);
        }
    }

    /// Record one edge. Called from the interrupt or edge-poll context.
    pub fn encode(&self, now_ms: u32) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }

        let mut step = self.direction.load(Ordering::Acquire);
        if step == 0 && before(now_ms, self.settle_until_ms.load(Ordering::Acquire)) {
            step = self.settle_direction.load(Ordering::Acquire);
        }

        self.pending_ticks.fetch_add(1, Ordering::AcqRel);
        if step != 0 {
            self.pending_count.fetch_add(i32::from(step), Ordering::AcqRel);
        }

        if self.reading.load(Ordering::Acquire) == 0 {
            self.fold();
        }
    }

    /// Signed, direction-weighted edge count.
    pub fn count(&self) -> i32 {
        if !self.is_attached() {
            return 0;
        }
        self.begin_read();
        let count = self.count.load(Ordering::Acquire);
        self.end_read();
        count
    }

    /// Direction-agnostic edge count.
    pub fn ticks(&self) -> u32 {
        if !self.is_attached() {
            return 0;
        }
        self.begin_read();
        let ticks = self.ticks.load(Ordering::Acquire);
        self.end_read();
        ticks
    }

    fn begin_read(&self) {
        self.reading.fetch_add(1, Ordering::AcqRel);
        self.fold();
    }

    fn end_read(&self) {
        self.reading.fetch_sub(1, Ordering::AcqRel);
    }

    fn fold(&self) {
        let ticks = self.pending_ticks.swap(0, Ordering::AcqRel);
        if ticks != 0 {
            self.ticks.fetch_add(ticks, Ordering::AcqRel);
        }
        let count = self.pending_count.swap(0, Ordering::AcqRel);
        if count != 0 {
            self.count.fetch_add(count, Ordering::AcqRel);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll-driven edge source for boards without a spare interrupt line.
pub struct EdgeDetector<P: DigitalInput> {
    pin: P,
    encoder: Arc<Encoder>,
    last_level: bool,
    attached: bool,
}

impl<P: DigitalInput> EdgeDetector<P> {
    pub fn new(pin: P, encoder: Arc<Encoder>) -> Self {
        Self {
            pin,
            encoder,
            last_level: false,
            attached: false,
        }
    }

    pub fn attach(&mut self) {
        self.pin.attach();
        self.last_level = self.pin.read();
        self.encoder.attach();
        self.attached = true;
    }

    pub fn detach(&mut self) {
        self.encoder.detach();
        self.pin.detach();
        self.attached = false;
    }

    /// Sample the pin and encode on any level change.
    pub fn poll(&mut self, now_ms: u32) -> bool {
        if !self.attached {
            return false;
        }
        let level = self.pin.read();
        if level == self.last_level {
            return false;
        }
        self.last_level = level;
        self.encoder.encode(now_ms);
        true
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }
}
