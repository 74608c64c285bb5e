use crate::behavior::{GoalAction, GoalState};
use crate::bus::{MessageKind, Publisher, Specifier, Subscriber};
use crate::command::CommandStats;
use crate::rover::{Pose2D, PoseVelocity2D};
use crate::wheel::WheelTelemetry;
use arrayvec::ArrayVec;
use core::cell::{Cell, RefCell};
use core::fmt::Write;
use heapless::Deque;
use serde::{Deserialize, Serialize};

pub const TELEMETRY_EVENT_CAPACITY: usize = 32;
const CSV_LINE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub sequence: u32,
    pub timestamp_ms: u32,
    pub publisher: Publisher,
    pub kind: MessageKind,
    pub specifier: Specifier,
}

/// Bus subscriber keeping the most recent events, oldest evicted first.
pub struct TelemetryRecorder {
    events: RefCell<Deque<TelemetryEvent, TELEMETRY_EVENT_CAPACITY>>,
    counts: [Cell<u32>; MessageKind::COUNT],
    sequence: Cell<u32>,
    dropped: Cell<u32>,
    now_ms: Cell<u32>,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Deque::new()),
            counts: core::array::from_fn(|_| Cell::new(0)),
            sequence: Cell::new(0),
            dropped: Cell::new(0),
            now_ms: Cell::new(0),
        }
    }

    /// Timestamp applied to events recorded from now on.
    pub fn set_time(&self, now_ms: u32) {
        self.now_ms.set(now_ms);
    }

    pub fn count(&self, kind: MessageKind) -> u32 {
        self.counts[kind.index()].get()
    }

    pub fn total(&self) -> u32 {
        self.sequence.get()
    }

    /// Events evicted before anyone drained them.
    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn latest(&self) -> Option<TelemetryEvent> {
        self.events.borrow().back().copied()
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&self) -> ArrayVec<TelemetryEvent, TELEMETRY_EVENT_CAPACITY> {
        let mut events = self.events.borrow_mut();
        let mut drained = ArrayVec::new();
        while let Some(event) = events.pop_front() {
            drained.push(event);
        }
        drained
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
        for count in &self.counts {
            count.set(0);
        }
        self.sequence.set(0);
        self.dropped.set(0);
    }
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber for TelemetryRecorder {
    fn on_message(&self, publisher: Publisher, kind: MessageKind, specifier: Specifier) {
        let counter = &self.counts[kind.index()];
        counter.set(counter.get().wrapping_add(1));

        let sequence = self.sequence.get().wrapping_add(1);
        self.sequence.set(sequence);

        let mut events = self.events.borrow_mut();
        if events.is_full() {
            events.pop_front();
            self.dropped.set(self.dropped.get().wrapping_add(1));
        }
        // Cannot fail: a slot was just freed
        let _ = events.push_back(TelemetryEvent {
            sequence,
            timestamp_ms: self.now_ms.get(),
            publisher,
            kind,
            specifier,
        });
    }
}

/// Snapshot of the whole rover, pulled through accessors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub sequence_number: u32,
    pub timestamp_ms: u32,
    pub pose: Pose2D,
    pub velocity: PoseVelocity2D,
    pub left: WheelTelemetry,
    pub right: WheelTelemetry,
    pub goal_state: GoalState,
    pub goal_action: GoalAction,
    pub queued_commands: usize,
    pub commands: CommandStats,
}

impl TelemetryFrame {
    pub fn csv_header() -> &'static str {
        "timestamp_ms,sequence,x,y,angle,vx,vy,omega,\
         left_duty,left_target,left_speed,left_ticks,\
         right_duty,right_target,right_speed,right_ticks,\
         goal_state,queued"
    }

    pub fn to_csv(&self) -> Result<heapless::String<CSV_LINE_CAPACITY>, core::fmt::Error> {
        let mut line = heapless::String::new();
        write!(
            line,
            "{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{:.3},{:.3},{},{},{:.3},{:.3},{},{:?},{}",
            self.timestamp_ms,
            self.sequence_number,
            self.pose.x,
            self.pose.y,
            self.pose.angle,
            self.velocity.x,
            self.velocity.y,
            self.velocity.angular,
            self.left.duty,
            self.left.target_speed,
            self.left.speed,
            self.left.ticks,
            self.right.duty,
            self.right.target_speed,
            self.right.speed,
            self.right.ticks,
            self.goal_state,
            self.queued_commands,
        )?;
        Ok(line)
    }
}
