// src/channel.rs

//! The two lock-free queues between the control thread and the audio thread.

use crate::audio_engine::command::{AudioCommand, CaptureCommand, CaptureReply};
use crate::error::LooperError;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Control-thread end.
pub struct EngineHandle {
    command_producer: HeapProducer<AudioCommand>,
    reply_consumer: HeapConsumer<CaptureReply>,
    dropped_replies: Arc<AtomicUsize>,
    reported_drops: usize,
}

/// Audio-thread end, consumed by `AudioEngine::new`.
pub struct EngineEndpoint {
    pub command_consumer: HeapConsumer<AudioCommand>,
    pub reply_producer: HeapProducer<CaptureReply>,
    pub dropped_replies: Arc<AtomicUsize>,
}

pub fn engine_channel(capacity: usize) -> (EngineHandle, EngineEndpoint) {
    let (command_producer, command_consumer) = HeapRb::<AudioCommand>::new(capacity).split();
    let (reply_producer, reply_consumer) = HeapRb::<CaptureReply>::new(capacity).split();
    let dropped_replies = Arc::new(AtomicUsize::new(0));
    (
        EngineHandle {
            command_producer,
            reply_consumer,
            dropped_replies: dropped_replies.clone(),
            reported_drops: 0,
        },
        EngineEndpoint {
            command_consumer,
            reply_producer,
            dropped_replies,
        },
    )
}

impl EngineHandle {
    pub fn send(&mut self, command: AudioCommand) -> Result<(), LooperError> {
        self.command_producer
            .push(command)
            .map_err(|_| LooperError::CommandQueueFull)
    }

    pub fn capture(&mut self, command: CaptureCommand) -> Result<(), LooperError> {
        self.send(AudioCommand::Capture(command))
    }

    pub fn try_recv(&mut self) -> Option<CaptureReply> {
        self.reply_consumer.pop()
    }

    /// Replies lost to a full reply queue since the last call.
    pub fn take_dropped_replies(&mut self) -> usize {
        let total = self.dropped_replies.load(Ordering::Relaxed);
        let fresh = total - self.reported_drops;
        self.reported_drops = total;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_is_reported() {
        let (mut handle, _endpoint) = engine_channel(2);
        handle.send(AudioCommand::StopLoop(0)).unwrap();
        handle.send(AudioCommand::StopLoop(1)).unwrap();
        assert!(matches!(
            handle.send(AudioCommand::StopLoop(2)),
            Err(LooperError::CommandQueueFull)
        ));
    }

    #[test]
    fn test_replies_flow_in_order() {
        let (mut handle, mut endpoint) = engine_channel(8);
        endpoint
            .reply_producer
            .push(CaptureReply::Cleared { track: 1 })
            .unwrap();
        endpoint
            .reply_producer
            .push(CaptureReply::Cleared { track: 2 })
            .unwrap();
        assert!(matches!(handle.try_recv(), Some(CaptureReply::Cleared { track: 1 })));
        assert!(matches!(handle.try_recv(), Some(CaptureReply::Cleared { track: 2 })));
        assert!(handle.try_recv().is_none());

        endpoint.dropped_replies.fetch_add(3, Ordering::Relaxed);
        assert_eq!(handle.take_dropped_replies(), 3);
        assert_eq!(handle.take_dropped_replies(), 0);
    }
}
