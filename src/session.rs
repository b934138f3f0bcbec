use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;

use crate::store::{Note, NoteType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceTicket {
    pub generation: u64,
    pub resource_id: String,
}

impl ResourceTicket {
    pub fn to_attr(&self) -> String {
        format!("{}:{}", self.generation, self.resource_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceRequest {
    pub ticket: ResourceTicket,
    pub note_id: String,
    pub kind: NoteType,
    pub path: Option<PathBuf>,
}

/// Collects resource loads requested while rendering one generation.
#[derive(Debug)]
pub struct ResourceSink {
    generation: u64,
    requests: RefCell<Vec<ResourceRequest>>,
}

impl ResourceSink {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self, note: &Note) -> ResourceTicket {
        let mut requests = self.requests.borrow_mut();
        let ticket = ResourceTicket {
            generation: self.generation,
            resource_id: format!("res-{}", requests.len()),
        };
        requests.push(ResourceRequest {
            ticket: ticket.clone(),
            note_id: note.id.clone(),
            kind: note.kind,
            path: note.path.clone(),
        });
        ticket
    }

    /// Forgets every request, for a render pass that is being retried.
    pub fn discard(&self) {
        self.requests.borrow_mut().clear();
    }

    pub fn into_requests(self) -> Vec<ResourceRequest> {
        self.requests.into_inner()
    }
}

#[derive(Debug, Clone)]
pub struct Settled<T> {
    pub ticket: ResourceTicket,
    pub value: T,
}

#[derive(Debug, Default)]
pub struct RenderSession {
    generation: u64,
}

impl RenderSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new render, invalidating every outstanding ticket.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn current(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, ticket: &ResourceTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Returns the settled value only if it belongs to the current render.
    pub fn accept<T>(&self, settled: Settled<T>) -> Option<T> {
        if self.is_current(&settled.ticket) {
            Some(settled.value)
        } else {
            tracing::debug!(
                stale = settled.ticket.generation,
                current = self.generation,
                resource = %settled.ticket.resource_id,
                "dropping stale resource"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_results_are_dropped() {
        let mut session = RenderSession::new();
        let first = session.begin();
        let sink = ResourceSink::new(first);
        let note = Note::new("pic.png", NoteType::Image, None);
        let ticket = sink.request(&note);
        assert_eq!(ticket.to_attr(), "1:res-0");

        let second = session.begin();
        assert_eq!(second, 2);
        let late = Settled {
            ticket,
            value: "bytes",
        };
        assert_eq!(session.accept(late), None);

        let fresh = ResourceSink::new(second);
        let ticket = fresh.request(&note);
        assert_eq!(session.accept(Settled { ticket, value: 7 }), Some(7));
        assert_eq!(fresh.into_requests().len(), 1);
    }
}
