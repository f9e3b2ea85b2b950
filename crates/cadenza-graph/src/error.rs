use core::error::Error;

use thiserror::Error;

use cadenza_core::ProcessorId;

/// An error when inserting into or removing from the processor table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    #[error("the processor table is full ({capacity} slots)")]
    TableFull { capacity: usize },
    #[error("processor {0} does not exist")]
    DeadSlot(ProcessorId),
}

/// An error when routing an edge between two processors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    #[error("source processor {0} does not exist")]
    DeadSource(ProcessorId),
    #[error("destination processor {0} does not exist")]
    DeadDestination(ProcessorId),
    #[error("processor {0} cannot be routed to itself")]
    SelfLoop(ProcessorId),
    #[error("routing {src} -> {dst} would create a cycle")]
    WouldCycle { src: ProcessorId, dst: ProcessorId },
}

/// An error when starting an audio stream.
#[derive(Debug, Error)]
pub enum StartStreamError<E: Error> {
    #[error("the audio stream is already started")]
    AlreadyStarted,
    #[error("backend error: {0}")]
    Backend(E),
}

/// An error when stopping an audio stream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StopStreamError {
    #[error("the audio stream is not started")]
    NotStarted,
}
