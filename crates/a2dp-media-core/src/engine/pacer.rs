//! Frame pacing
//!
//! Converts wall-clock time between TX ticks into a frame budget. PCM
//! bytes owed accumulate in a rolling counter; each tick spends whole
//! frames from it and carries the remainder.

/// Frames to produce on one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickBudget {
    pub frames_per_iteration: usize,
    pub iterations: usize,
    /// Frames owed before clamping
    pub projected: usize,
    /// Whether the congestion guard clamped the projection
    pub limited: bool,
}

impl TickBudget {
    pub fn total_frames(&self) -> usize {
        self.frames_per_iteration * self.iterations
    }
}

/// Rolling PCM byte counter driven by tick timestamps
#[derive(Debug, Clone)]
pub struct FramePacer {
    tick_us: u64,
    bytes_per_tick: u64,
    max_frames_per_tick: usize,
    max_iterations_per_tick: usize,
    counter: u64,
    last_tick_us: Option<u64>,
}

impl FramePacer {
    pub fn new(tick_ms: u64, max_frames_per_tick: usize, max_iterations_per_tick: usize) -> Self {
        Self {
            tick_us: tick_ms.max(1) * 1000,
            bytes_per_tick: 0,
            max_frames_per_tick: max_frames_per_tick.max(1),
            max_iterations_per_tick: max_iterations_per_tick.max(1),
            counter: 0,
            last_tick_us: None,
        }
    }

    /// Clears the counter and sets the PCM byte rate for a new stream
    pub fn reset(&mut self, bytes_per_tick: u64) {
        self.bytes_per_tick = bytes_per_tick;
        self.counter = 0;
        self.last_tick_us = None;
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn bytes_per_tick(&self) -> u64 {
        self.bytes_per_tick
    }

    /// Returns bytes for frames that could not be produced
    pub fn recredit(&mut self, bytes: u64) {
        self.counter += bytes;
    }

    /// Accounts for time since the previous tick and spends whole frames
    ///
    /// `max_frames_per_packet` of zero means no packet limit is known.
    pub fn on_tick(
        &mut self,
        now_us: u64,
        bytes_per_frame: usize,
        max_frames_per_packet: u8,
        edr: bool,
    ) -> TickBudget {
        let elapsed = match self.last_tick_us {
            Some(last) => now_us.saturating_sub(last),
            None => self.tick_us,
        };
        self.last_tick_us = Some(now_us);

        self.counter += self.bytes_per_tick * elapsed / self.tick_us;

        let bpf = bytes_per_frame.max(1) as u64;
        let projected = (self.counter / bpf) as usize;
        let mut frames = projected;
        let limited = frames > self.max_frames_per_tick;
        if limited {
            tracing::warn!(
                projected,
                limit = self.max_frames_per_tick,
                "Too many frames owed, limiting"
            );
            frames = self.max_frames_per_tick;
        }

        let (nof, noi) = if edr {
            let mut nof = max_frames_per_packet as usize;
            if nof == 0 {
                nof = frames;
            }
            if nof > 0 && nof < frames {
                let mut noi = frames / nof;
                if noi > self.max_iterations_per_tick {
                    noi = self.max_iterations_per_tick;
                    tracing::warn!(iterations = noi, "Limiting packetization iterations");
                    // Frames beyond the iteration cap stay owed for the next tick
                    self.counter = frames as u64 * bpf + self.counter % bpf;
                }
                (nof, noi)
            } else {
                (frames, 1)
            }
        } else {
            (frames, 1)
        };

        self.counter = self.counter.saturating_sub((nof * noi) as u64 * bpf);
        tracing::trace!(
            frames = nof,
            iterations = noi,
            counter = self.counter,
            "Tick budget"
        );

        TickBudget {
            frames_per_iteration: nof,
            iterations: noi,
            projected,
            limited,
        }
    }
}
