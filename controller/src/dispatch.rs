use common::command::{CommandEncoder, SpeedScale};
use common::touch::{TouchSnapshot, TouchTracker};
use link::CarConnection;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{trace, warn};

/// Where encoded frames go
pub trait FrameSink {
    fn send_frame(&mut self, frame: &[u8]);
}

impl FrameSink for Arc<CarConnection> {
    fn send_frame(&mut self, frame: &[u8]) {
        self.send_bytes(frame);
    }
}

/// Sends one frame to the car for every touch snapshot
pub struct CommandSender<K, S = common::command::Scaling> {
    encoder: CommandEncoder<S>,
    sink: Option<K>,
}

impl<K, S: Debug> Debug for CommandSender<K, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("encoder", &self.encoder)
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

impl<K: FrameSink, S: SpeedScale> CommandSender<K, S> {
    /// Starts detached, nothing is sent until a sink is attached
    pub fn new(encoder: CommandEncoder<S>) -> Self {
        Self {
            encoder,
            sink: None,
        }
    }

    pub fn attach(&mut self, sink: K) {
        self.sink = Some(sink);
    }

    pub fn detach(&mut self) -> Option<K> {
        self.sink.take()
    }

    pub fn on_snapshot(&mut self, snapshot: &TouchSnapshot) {
        let Some(sink) = &mut self.sink else {
            trace!("No car attached, dropping snapshot");
            return;
        };

        if snapshot.height == 0 {
            warn!("Touch surface has no height, not sending");
            return;
        }

        let command = self.encoder.command_for(snapshot);
        trace!(?command, "Dispatching");
        sink.send_frame(&command.encode(self.encoder.format()));
    }
}

impl<K: FrameSink + 'static, S: SpeedScale + 'static> CommandSender<K, S> {
    /// Hands the sender to `tracker` as an observer
    pub fn observe(mut self, tracker: &mut TouchTracker) {
        tracker.add_observer(move |snapshot| self.on_snapshot(snapshot));
    }
}
