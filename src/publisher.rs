//! Downstream interface of the engine.

use crate::err::PublishError;
use crate::event::{Discontinuity, Event};

use log::warn;
use serde::Serialize;

use std::io::Write;

/// Receives events in record order.
///
/// A batch is either accepted as a whole or rejected; after a rejection the engine redelivers
/// from its last checkpoint, so a publisher may see some events twice.
pub trait Publisher {
    fn publish(&mut self, events: Vec<Event>) -> Result<(), PublishError>;

    /// Called before the first event that follows a discontinuity in a log.
    fn discontinuity(&mut self, marker: &Discontinuity) -> Result<(), PublishError> {
        warn!("{marker}");
        Ok(())
    }
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn publish(&mut self, events: Vec<Event>) -> Result<(), PublishError> {
        (**self).publish(events)
    }

    fn discontinuity(&mut self, marker: &Discontinuity) -> Result<(), PublishError> {
        (**self).discontinuity(marker)
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Event(&'a Event),
    Discontinuity(&'a Discontinuity),
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesPublisher<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesPublisher { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<(), PublishError> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> Publisher for JsonLinesPublisher<W> {
    fn publish(&mut self, events: Vec<Event>) -> Result<(), PublishError> {
        for event in &events {
            self.write_line(&Line::Event(event))?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn discontinuity(&mut self, marker: &Discontinuity) -> Result<(), PublishError> {
        self.write_line(&Line::Discontinuity(marker))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps everything it receives, for tests and embedding.
#[derive(Debug, Default)]
pub struct CollectingPublisher {
    pub events: Vec<Event>,
    pub discontinuities: Vec<Discontinuity>,
}

impl Publisher for CollectingPublisher {
    fn publish(&mut self, events: Vec<Event>) -> Result<(), PublishError> {
        self.events.extend(events);
        Ok(())
    }

    fn discontinuity(&mut self, marker: &Discontinuity) -> Result<(), PublishError> {
        self.discontinuities.push(marker.clone());
        Ok(())
    }
}
